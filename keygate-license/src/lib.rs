//! Cloud license validation client for keygate.
//!
//! This crate handles:
//! - Sessions with card-key, user and trial login
//! - Machine binding with a per-period unbind allowance
//! - Entitlement (expiry and point balance) and recharge bookkeeping
//! - Online presence of other clients under the same credential
//! - Global policy flags that short-circuit forbidden actions
//! - An offline cache of the last signed entitlement
//!
//! # Design Principles
//!
//! - **Authority owns the state**: bindings, entitlements and connections live
//!   at the authority; the client only holds snapshots it was handed.
//! - **Structured outcomes**: every failure carries an [`ErrorCode`] that says
//!   whether retrying can help.
//! - **Bounded calls**: every authority call runs under the session's timeout
//!   and is never retried behind the caller's back.
//!
//! # Entitlement Token Format
//!
//! Tokens are formatted as: `base64url(payload).base64url(signature)`
//! The payload is a JSON object signed with Ed25519 by the authority.

mod authority;
mod binding;
mod cache;
mod config;
mod device;
mod error;
mod ledger;
mod policy;
mod presence;
mod session;
mod token;
mod validator;
pub mod wire;

pub use authority::{
    AccountLimits, Authority, CardSpec, Handshake, LoginGrant, MemoryAuthority,
    RechargeCodeSpec, Seed, SignedEntitlement, TrialSpec, UserSpec,
};
pub use binding::{BindingSetView, MachineBindingRecord, UnbindAllowance};
pub use cache::{
    CachedEntitlement, EntitlementCache, Freshness, OfflineEntitlement, CLOCK_SKEW_TOLERANCE,
};
pub use config::{ClientConfig, ConnectionConfig, DEFAULT_OFFLINE_GRACE};
pub use device::{HostFacts, MachineFingerprint, MachineInfo};
pub use error::{AuthReason, CapacityResource, ErrorCode, LicenseError, LicenseResult};
pub use ledger::{
    Entitlement, EntitlementStatus, RechargeTransaction, RechargeValue, GRACE_PERIOD_SECS,
};
pub use policy::{PolicyFlag, PolicyFlags, PolicyGate};
pub use presence::{other_devices, OnlineSessionRecord};
pub use session::{Client, LoginOutcome, Session, SessionState};
pub use token::{sign_claims, EntitlementClaims, EntitlementToken};
pub use validator::{CredentialValidator, Identity, LoginMethod, Validation};

#[cfg(feature = "online")]
pub use authority::HttpAuthority;

pub use keygate_types::{
    Clock, ConnectionId, ManualClock, SessionId, SessionToken, SystemClock, UnixTimestamp,
};
