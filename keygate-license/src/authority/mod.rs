//! The seam between the client and the validation authority.
//!
//! The authority owns every piece of binding and entitlement state. The
//! client only sees snapshots returned from these calls.

mod memory;
#[cfg(feature = "online")]
mod http;

pub use memory::{
    AccountLimits, CardSpec, MemoryAuthority, RechargeCodeSpec, Seed, TrialSpec, UserSpec,
};
#[cfg(feature = "online")]
pub use http::HttpAuthority;

use crate::binding::BindingSetView;
use crate::config::ConnectionConfig;
use crate::device::{MachineFingerprint, MachineInfo};
use crate::error::{LicenseError, LicenseResult};
use crate::ledger::{Entitlement, RechargeTransaction};
use crate::policy::PolicyFlags;
use crate::presence::OnlineSessionRecord;
use crate::validator::Identity;
use async_trait::async_trait;
use keygate_types::{ConnectionId, SessionToken, UnixTimestamp};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Answer to the handshake performed when a session is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub policy: PolicyFlags,
    pub server_time: UnixTimestamp,
    /// Highest protocol version the authority speaks.
    pub protocol_version: u32,
}

/// What the authority hands back on a successful login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginGrant {
    pub token: SessionToken,
    pub connection_id: ConnectionId,
    pub entitlement: Entitlement,
    /// Whether the logging-in machine is in the credential's binding set.
    pub machine_bound: bool,
    pub policy: PolicyFlags,
}

/// An entitlement snapshot, optionally vouched for by a signed token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEntitlement {
    pub entitlement: Entitlement,
    #[serde(default)]
    pub token: Option<String>,
}

/// A remote licensing authority.
///
/// Expected rejections (bad credential, exhausted quota) come back as
/// `Err(LicenseError)` values carrying their code.
#[async_trait]
pub trait Authority: Send + Sync {
    /// Probes the authority and fetches the global policy.
    async fn handshake(&self) -> LicenseResult<Handshake>;

    /// Fetches the current global policy.
    async fn policy(&self, conn: &ConnectionConfig) -> LicenseResult<PolicyFlags>;

    /// Checks a credential without logging in.
    async fn verify(&self, conn: &ConnectionConfig, identity: &Identity) -> LicenseResult<()>;

    /// Logs in, registering an online connection for `machine`.
    async fn login(
        &self,
        conn: &ConnectionConfig,
        identity: &Identity,
        machine: &MachineInfo,
    ) -> LicenseResult<LoginGrant>;

    /// Creates a user account funded by an unused card.
    async fn register(
        &self,
        conn: &ConnectionConfig,
        username: &str,
        password: &str,
        card_key: &str,
    ) -> LicenseResult<()>;

    /// Ends the online connection behind `token`. Unknown tokens are ignored.
    async fn logout(&self, conn: &ConnectionConfig, token: &SessionToken) -> LicenseResult<()>;

    async fn entitlement(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
    ) -> LicenseResult<SignedEntitlement>;

    /// Redeems every code in `codes`, all or nothing.
    async fn recharge(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        codes: &[String],
    ) -> LicenseResult<RechargeTransaction>;

    async fn bindings(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
    ) -> LicenseResult<BindingSetView>;

    async fn bind(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        machine: &MachineInfo,
    ) -> LicenseResult<BindingSetView>;

    async fn unbind(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        fingerprint: &MachineFingerprint,
    ) -> LicenseResult<BindingSetView>;

    /// Replaces the binding of `old` with `machine` in one step.
    async fn rebind(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        old: &MachineFingerprint,
        machine: &MachineInfo,
    ) -> LicenseResult<BindingSetView>;

    async fn set_remark(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        fingerprint: &MachineFingerprint,
        remark: &str,
    ) -> LicenseResult<BindingSetView>;

    /// Lists clients online under the token's credential, most recent first.
    async fn online(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
    ) -> LicenseResult<Vec<OnlineSessionRecord>>;
}

/// Bounds an authority call by the connection's timeout.
///
/// An elapsed timeout is reported as [`LicenseError::NetworkTimeout`] and
/// the call is not retried.
pub(crate) async fn with_timeout<T>(
    conn: &ConnectionConfig,
    call: impl Future<Output = LicenseResult<T>>,
) -> LicenseResult<T> {
    bounded(conn.timeout, call).await
}

pub(crate) async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = LicenseResult<T>>,
) -> LicenseResult<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(LicenseError::NetworkTimeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}
