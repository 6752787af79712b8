//! Credential validation against the authority.

use crate::authority::{with_timeout, Authority, LoginGrant};
use crate::config::ConnectionConfig;
use crate::device::{MachineFingerprint, MachineInfo};
use crate::error::{mask, AuthReason, ErrorCode, LicenseError, LicenseResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// How a session authenticates. A session may use only one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginMethod {
    Card,
    User,
    Trial,
}

/// A credential presented to the authority.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    /// A card key.
    Card { card_key: String },
    /// A registered user account.
    User { username: String, password: String },
    /// A machine-scoped trial.
    Trial { fingerprint: MachineFingerprint },
}

impl Identity {
    pub fn card(card_key: impl Into<String>) -> Self {
        Self::Card {
            card_key: card_key.into(),
        }
    }

    pub fn user(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::User {
            username: username.into(),
            password: password.into(),
        }
    }

    #[must_use]
    pub fn trial(fingerprint: MachineFingerprint) -> Self {
        Self::Trial { fingerprint }
    }

    #[must_use]
    pub fn method(&self) -> LoginMethod {
        match self {
            Self::Card { .. } => LoginMethod::Card,
            Self::User { .. } => LoginMethod::User,
            Self::Trial { .. } => LoginMethod::Trial,
        }
    }

    /// The account this credential names, without any secret beyond it.
    #[must_use]
    pub fn subject(&self) -> String {
        match self {
            Self::Card { card_key } => format!("card:{}", card_key.trim()),
            Self::User { username, .. } => format!("user:{}", username.trim()),
            Self::Trial { fingerprint } => format!("trial:{fingerprint}"),
        }
    }

    /// Hex SHA-256 of [`Self::subject`]; used in tokens and cache file names.
    #[must_use]
    pub fn subject_hash(&self) -> String {
        hash_subject(&self.subject())
    }

    /// Rejects credentials that cannot possibly be valid.
    fn check_shape(&self) -> LicenseResult<()> {
        let empty = match self {
            Self::Card { card_key } => card_key.trim().is_empty(),
            Self::User { username, password } => username.trim().is_empty() || password.is_empty(),
            Self::Trial { fingerprint } => fingerprint.as_str().is_empty(),
        };
        if empty {
            Err(LicenseError::Auth(AuthReason::InvalidCredential))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Card { card_key } => f
                .debug_struct("Card")
                .field("card_key", &mask(card_key))
                .finish(),
            Self::User { username, .. } => f
                .debug_struct("User")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Trial { fingerprint } => f
                .debug_struct("Trial")
                .field("fingerprint", fingerprint)
                .finish(),
        }
    }
}

/// Hex SHA-256 of an account subject such as `card:ABCD-1234`.
pub(crate) fn hash_subject(subject: &str) -> String {
    hex::encode(Sha256::digest(subject.as_bytes()))
}

/// Outcome of a validation: the success flag together with its code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub success: bool,
    pub code: ErrorCode,
}

impl Validation {
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            success: true,
            code: ErrorCode::Ok,
        }
    }

    #[must_use]
    pub const fn rejected(code: ErrorCode) -> Self {
        Self {
            success: false,
            code,
        }
    }

    /// Flattens any operation result into a validation.
    #[must_use]
    pub fn from_result<T>(result: &LicenseResult<T>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(e) => Self::rejected(e.code()),
        }
    }

    /// Returns true if the same validation may succeed on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !self.success && self.code.is_retryable()
    }
}

/// Validates credentials against an [`Authority`].
#[derive(Clone)]
pub struct CredentialValidator {
    authority: Arc<dyn Authority>,
}

impl CredentialValidator {
    pub fn new(authority: Arc<dyn Authority>) -> Self {
        Self { authority }
    }

    /// Checks a credential without establishing a login.
    pub async fn validate(&self, conn: &ConnectionConfig, identity: &Identity) -> Validation {
        let result = self.verify(conn, identity).await;
        let validation = Validation::from_result(&result);
        debug!(method = ?identity.method(), code = %validation.code, "credential validated");
        validation
    }

    async fn verify(&self, conn: &ConnectionConfig, identity: &Identity) -> LicenseResult<()> {
        identity.check_shape()?;
        with_timeout(conn, self.authority.verify(conn, identity)).await
    }

    /// Logs in and returns the authority's grant.
    pub(crate) async fn login(
        &self,
        conn: &ConnectionConfig,
        identity: &Identity,
        machine: &MachineInfo,
    ) -> LicenseResult<LoginGrant> {
        identity.check_shape()?;
        with_timeout(conn, self.authority.login(conn, identity, machine)).await
    }
}

impl fmt::Debug for CredentialValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialValidator").finish_non_exhaustive()
    }
}
