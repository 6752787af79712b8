//! JSON wire format spoken between the HTTP authority client and the
//! reference authority server.
//!
//! Every operation is `POST /api/v1/<op>`. Requests carry the caller's
//! [`ConnectionConfig`] next to the operation body; responses are wrapped in
//! an [`Envelope`] whose `code` is the numeric [`ErrorCode`].

use crate::config::ConnectionConfig;
use crate::device::{MachineFingerprint, MachineInfo};
use crate::error::{AuthReason, CapacityResource, ErrorCode, LicenseError, LicenseResult};
use crate::policy::PolicyFlag;
use crate::validator::Identity;
use keygate_types::SessionToken;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Highest protocol version this crate speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Operation names, one per authority call.
pub mod ops {
    pub const HANDSHAKE: &str = "handshake";
    pub const POLICY: &str = "policy";
    pub const VERIFY: &str = "verify";
    pub const LOGIN: &str = "login";
    pub const REGISTER: &str = "register";
    pub const LOGOUT: &str = "logout";
    pub const ENTITLEMENT: &str = "entitlement";
    pub const RECHARGE: &str = "recharge";
    pub const BINDINGS: &str = "bindings";
    pub const BIND: &str = "bind";
    pub const UNBIND: &str = "unbind";
    pub const REBIND: &str = "rebind";
    pub const REMARK: &str = "remark";
    pub const ONLINE: &str = "online";
}

/// URL path of an operation.
#[must_use]
pub fn path(op: &str) -> String {
    format!("/api/v1/{op}")
}

/// Response wrapper for every operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub ok: bool,
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<ErrorDetail>,
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            code: ErrorCode::Ok,
            message: String::new(),
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(err: &LicenseError) -> Self {
        Self {
            ok: false,
            code: err.code(),
            message: err.to_string(),
            data: None,
            error: Some(ErrorDetail::from(err)),
        }
    }

    pub fn from_result(result: LicenseResult<T>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => Self::failure(&e),
        }
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Unwraps the envelope back into a result.
    ///
    /// A success with no `data` decodes as JSON `null`, which is how unit
    /// results travel.
    pub fn into_result(self) -> LicenseResult<T> {
        if self.ok {
            return match self.data {
                Some(data) => Ok(data),
                None => serde_json::from_value(serde_json::Value::Null).map_err(|_| {
                    LicenseError::Protocol("success envelope without data".into())
                }),
            };
        }
        if self.code.is_success() {
            return Err(LicenseError::Protocol(
                "failure envelope carries success code".into(),
            ));
        }
        Err(self.error.unwrap_or_default().into_error(self.code, self.message))
    }
}

/// Structured payload of a failed operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flag: Option<PolicyFlag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<CapacityResource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unbind_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countdown_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl From<&LicenseError> for ErrorDetail {
    fn from(err: &LicenseError) -> Self {
        let mut detail = Self::default();
        match err {
            LicenseError::ProtocolMisuse(v)
            | LicenseError::Allocation(v)
            | LicenseError::NetworkUnavailable(v)
            | LicenseError::BindingNotFound(v)
            | LicenseError::AlreadyRedeemed(v)
            | LicenseError::InvalidCode(v)
            | LicenseError::AlreadyExists(v)
            | LicenseError::Protocol(v)
            | LicenseError::InvalidToken(v)
            | LicenseError::Storage(v)
            | LicenseError::Internal(v) => detail.value = Some(v.clone()),
            LicenseError::NetworkTimeout { timeout_ms } => detail.timeout_ms = Some(*timeout_ms),
            LicenseError::RateLimited { retry_after_secs } => {
                detail.retry_after_secs = Some(*retry_after_secs);
            }
            LicenseError::PolicyForbidden(flag) => detail.flag = Some(*flag),
            LicenseError::Capacity { resource, limit } => {
                detail.resource = Some(*resource);
                detail.limit = Some(*limit);
            }
            LicenseError::LimitExceeded {
                unbind_limit,
                countdown_secs,
            } => {
                detail.unbind_limit = Some(*unbind_limit);
                detail.countdown_secs = Some(*countdown_secs);
            }
            LicenseError::Serialization(e) => detail.value = Some(e.to_string()),
            LicenseError::Auth(_) | LicenseError::Cancelled | LicenseError::InvalidSignature => {}
        }
        detail
    }
}

impl ErrorDetail {
    /// Rebuilds the error a peer reported with `code`.
    pub fn into_error(self, code: ErrorCode, message: String) -> LicenseError {
        let value = self.value.unwrap_or(message);
        match code {
            ErrorCode::InvalidCredential => LicenseError::Auth(AuthReason::InvalidCredential),
            ErrorCode::Expired => LicenseError::Auth(AuthReason::Expired),
            ErrorCode::Banned => LicenseError::Auth(AuthReason::Banned),
            ErrorCode::NotAuthenticated => LicenseError::Auth(AuthReason::NotAuthenticated),
            ErrorCode::NetworkTimeout => LicenseError::NetworkTimeout {
                timeout_ms: self.timeout_ms.unwrap_or_default(),
            },
            ErrorCode::NetworkUnavailable => LicenseError::NetworkUnavailable(value),
            ErrorCode::RateLimited => LicenseError::RateLimited {
                retry_after_secs: self.retry_after_secs.unwrap_or_default(),
            },
            ErrorCode::PolicyForbidden => match self.flag {
                Some(flag) => LicenseError::PolicyForbidden(flag),
                None => LicenseError::Protocol("policy rejection without a flag".into()),
            },
            ErrorCode::Capacity => LicenseError::Capacity {
                resource: self.resource.unwrap_or(CapacityResource::Bindings),
                limit: self.limit.unwrap_or_default(),
            },
            ErrorCode::LimitExceeded => LicenseError::LimitExceeded {
                unbind_limit: self.unbind_limit.unwrap_or_default(),
                countdown_secs: self.countdown_secs.unwrap_or_default(),
            },
            ErrorCode::BindingNotFound => LicenseError::BindingNotFound(value),
            ErrorCode::AlreadyRedeemed => LicenseError::AlreadyRedeemed(value),
            ErrorCode::InvalidCode => LicenseError::InvalidCode(value),
            ErrorCode::AlreadyExists => LicenseError::AlreadyExists(value),
            ErrorCode::ProtocolMisuse => LicenseError::ProtocolMisuse(value),
            ErrorCode::Allocation => LicenseError::Allocation(value),
            ErrorCode::Cancelled => LicenseError::Cancelled,
            ErrorCode::Storage => LicenseError::Storage(value),
            ErrorCode::Protocol | ErrorCode::Ok => LicenseError::Protocol(value),
            ErrorCode::Internal => LicenseError::Internal(value),
        }
    }
}

// ── Requests ─────────────────────────────────────────────────────

/// A request: the caller's connection plus the operation body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request<B> {
    pub conn: ConnectionConfig,
    #[serde(flatten)]
    pub body: B,
}

impl<B> Request<B> {
    pub fn new(conn: &ConnectionConfig, body: B) -> Self {
        Self {
            conn: conn.clone(),
            body,
        }
    }
}

/// Body of operations that need nothing beyond the connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoBody {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyBody {
    pub identity: Identity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginBody {
    pub identity: Identity,
    pub machine: MachineInfo,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RegisterBody {
    pub username: String,
    pub password: String,
    pub card_key: String,
}

impl std::fmt::Debug for RegisterBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterBody")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBody {
    pub token: SessionToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RechargeBody {
    pub token: SessionToken,
    pub codes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindBody {
    pub token: SessionToken,
    pub machine: MachineInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnbindBody {
    pub token: SessionToken,
    pub fingerprint: MachineFingerprint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebindBody {
    pub token: SessionToken,
    pub old: MachineFingerprint,
    pub machine: MachineInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemarkBody {
    pub token: SessionToken,
    pub fingerprint: MachineFingerprint,
    pub remark: String,
}
