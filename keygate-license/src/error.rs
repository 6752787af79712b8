//! Error types for the licensing client.
//!
//! Every failure carries a [`ErrorCode`] from a closed enumeration so callers
//! can branch on the kind (retry a timeout, give up on a ban) instead of on a
//! bare success flag.

use crate::policy::PolicyFlag;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closed enumeration of outcome codes shared by the client and the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    InvalidCredential = 1001,
    Expired = 1002,
    Banned = 1003,
    NotAuthenticated = 1004,
    NetworkTimeout = 2001,
    NetworkUnavailable = 2002,
    RateLimited = 2003,
    PolicyForbidden = 3001,
    Capacity = 4001,
    LimitExceeded = 4002,
    BindingNotFound = 4003,
    AlreadyRedeemed = 5001,
    InvalidCode = 5002,
    AlreadyExists = 5003,
    ProtocolMisuse = 9001,
    Allocation = 9002,
    Cancelled = 9003,
    Protocol = 9004,
    Storage = 9005,
    Internal = 9999,
}

impl ErrorCode {
    const ALL: [ErrorCode; 21] = [
        Self::Ok,
        Self::InvalidCredential,
        Self::Expired,
        Self::Banned,
        Self::NotAuthenticated,
        Self::NetworkTimeout,
        Self::NetworkUnavailable,
        Self::RateLimited,
        Self::PolicyForbidden,
        Self::Capacity,
        Self::LimitExceeded,
        Self::BindingNotFound,
        Self::AlreadyRedeemed,
        Self::InvalidCode,
        Self::AlreadyExists,
        Self::ProtocolMisuse,
        Self::Allocation,
        Self::Cancelled,
        Self::Protocol,
        Self::Storage,
        Self::Internal,
    ];

    /// Returns the numeric wire value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Looks up a code by its numeric wire value.
    #[must_use]
    pub fn from_i32(value: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_i32() == value)
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Returns true if the same call may succeed later without new input.
    ///
    /// Network failures want backoff; capacity and unbind limits clear once
    /// the authority's period refreshes.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NetworkTimeout
                | Self::NetworkUnavailable
                | Self::RateLimited
                | Self::Capacity
                | Self::LimitExceeded
        )
    }

    /// Returns true if the failure ends the session.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Banned)
    }

    /// Short stable name, used in logs and the wire envelope.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::InvalidCredential => "invalid_credential",
            Self::Expired => "expired",
            Self::Banned => "banned",
            Self::NotAuthenticated => "not_authenticated",
            Self::NetworkTimeout => "network_timeout",
            Self::NetworkUnavailable => "network_unavailable",
            Self::RateLimited => "rate_limited",
            Self::PolicyForbidden => "policy_forbidden",
            Self::Capacity => "capacity",
            Self::LimitExceeded => "limit_exceeded",
            Self::BindingNotFound => "binding_not_found",
            Self::AlreadyRedeemed => "already_redeemed",
            Self::InvalidCode => "invalid_code",
            Self::AlreadyExists => "already_exists",
            Self::ProtocolMisuse => "protocol_misuse",
            Self::Allocation => "allocation",
            Self::Cancelled => "cancelled",
            Self::Protocol => "protocol",
            Self::Storage => "storage",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_i32())
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.as_i32()
    }
}

impl TryFrom<i32> for ErrorCode {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::from_i32(value).ok_or_else(|| format!("unknown error code {value}"))
    }
}

/// Why the authority rejected a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthReason {
    /// Unknown card, unknown user, or wrong password.
    InvalidCredential,
    /// The credential's entitlement has run out.
    Expired,
    /// The credential was banned by the vendor.
    Banned,
    /// The operation needs an authenticated session.
    NotAuthenticated,
}

impl AuthReason {
    #[must_use]
    pub const fn code(self) -> ErrorCode {
        match self {
            Self::InvalidCredential => ErrorCode::InvalidCredential,
            Self::Expired => ErrorCode::Expired,
            Self::Banned => ErrorCode::Banned,
            Self::NotAuthenticated => ErrorCode::NotAuthenticated,
        }
    }
}

impl fmt::Display for AuthReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InvalidCredential => "credential is not valid",
            Self::Expired => "credential has expired",
            Self::Banned => "credential has been banned",
            Self::NotAuthenticated => "no authenticated session",
        })
    }
}

/// Which cap a [`LicenseError::Capacity`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityResource {
    /// Machines bound to the credential.
    Bindings,
    /// Clients online under the credential at the same time.
    OnlineSessions,
}

impl fmt::Display for CapacityResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bindings => "machine bindings",
            Self::OnlineSessions => "online sessions",
        })
    }
}

/// Licensing client errors.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// The caller violated the session state machine.
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),

    /// The authority rejected the credential, or none is established.
    #[error("authentication rejected: {0}")]
    Auth(AuthReason),

    /// The session could not be created because the authority was unreachable.
    #[error("session allocation failed: {0}")]
    Allocation(String),

    /// The authority did not answer within the configured timeout.
    #[error("network timeout after {timeout_ms} ms")]
    NetworkTimeout { timeout_ms: u64 },

    /// The authority could not be reached.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The authority throttled the caller.
    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// A policy flag forbids the action.
    #[error("forbidden by policy: {0}")]
    PolicyForbidden(PolicyFlag),

    /// A cap on bindings or online sessions is reached.
    #[error("capacity reached: {resource} limited to {limit}")]
    Capacity { resource: CapacityResource, limit: u32 },

    /// No unbinds left in the current period.
    #[error("unbind limit of {unbind_limit} reached, refreshes in {countdown_secs}s")]
    LimitExceeded { unbind_limit: u32, countdown_secs: u64 },

    /// The fingerprint is not bound to the credential.
    #[error("machine not bound: {0}")]
    BindingNotFound(String),

    /// The recharge code has already been consumed.
    #[error("recharge code already redeemed: {0}")]
    AlreadyRedeemed(String),

    /// The recharge code does not exist.
    #[error("invalid recharge code: {0}")]
    InvalidCode(String),

    /// The account to create already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The session closed while the operation waited for its turn.
    #[error("operation cancelled")]
    Cancelled,

    /// Malformed or unexpected authority response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Entitlement token format is invalid.
    #[error("invalid entitlement token: {0}")]
    InvalidToken(String),

    /// Ed25519 signature verification failed.
    #[error("entitlement token signature invalid")]
    InvalidSignature,

    /// Local cache error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authority-side failure with no better classification.
    #[error("internal authority error: {0}")]
    Internal(String),
}

impl LicenseError {
    /// Returns the classified code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ProtocolMisuse(_) => ErrorCode::ProtocolMisuse,
            Self::Auth(reason) => reason.code(),
            Self::Allocation(_) => ErrorCode::Allocation,
            Self::NetworkTimeout { .. } => ErrorCode::NetworkTimeout,
            Self::NetworkUnavailable(_) => ErrorCode::NetworkUnavailable,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::PolicyForbidden(_) => ErrorCode::PolicyForbidden,
            Self::Capacity { .. } => ErrorCode::Capacity,
            Self::LimitExceeded { .. } => ErrorCode::LimitExceeded,
            Self::BindingNotFound(_) => ErrorCode::BindingNotFound,
            Self::AlreadyRedeemed(_) => ErrorCode::AlreadyRedeemed,
            Self::InvalidCode(_) => ErrorCode::InvalidCode,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Protocol(_) | Self::InvalidToken(_) | Self::InvalidSignature => {
                ErrorCode::Protocol
            }
            Self::Storage(_) | Self::Serialization(_) => ErrorCode::Storage,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Returns true if retrying the same call later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Returns true if the failure ends the session.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.code().is_fatal()
    }

    /// Returns the retry-after duration if this is a rate-limit or period error.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Self::RateLimited { retry_after_secs } => {
                Some(std::time::Duration::from_secs(*retry_after_secs))
            }
            Self::LimitExceeded { countdown_secs, .. } => {
                Some(std::time::Duration::from_secs(*countdown_secs))
            }
            _ => None,
        }
    }

    pub(crate) fn not_authenticated() -> Self {
        Self::Auth(AuthReason::NotAuthenticated)
    }
}

/// Result type for license operations.
pub type LicenseResult<T> = Result<T, LicenseError>;

/// Masks a secret (card key, recharge code) for logs and error messages.
///
/// Keeps the first four characters so support can still correlate reports.
pub(crate) fn mask(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{visible}****")
    }
}
