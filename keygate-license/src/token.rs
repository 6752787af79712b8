//! Signed entitlement tokens.
//!
//! Tokens use the format: `base64url(payload).base64url(signature)`
//!
//! The payload is a JSON object containing:
//! - `sub`: hashed credential subject (see [`crate::Identity::subject_hash`])
//! - `sw`: software id
//! - `exp`: entitlement expiry (seconds since epoch)
//! - `bal`: point balance
//! - `iat`: issued-at timestamp (seconds since epoch)
//!
//! The signature covers `payload_b64.as_bytes()` (the base64url-encoded
//! payload string, not the decoded JSON).

use crate::error::{LicenseError, LicenseResult};
use crate::ledger::Entitlement;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use keygate_types::UnixTimestamp;
use serde::{Deserialize, Serialize};

/// The decoded token payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementClaims {
    pub sub: String,
    pub sw: String,
    pub exp: u64,
    pub bal: u64,
    pub iat: u64,
}

impl EntitlementClaims {
    /// Builds claims for `entitlement` issued at `issued_at`.
    pub fn new(
        subject: impl Into<String>,
        software_id: impl Into<String>,
        entitlement: Entitlement,
        issued_at: UnixTimestamp,
    ) -> Self {
        Self {
            sub: subject.into(),
            sw: software_id.into(),
            exp: entitlement.expiry_timestamp.as_secs(),
            bal: entitlement.balance,
            iat: issued_at.as_secs(),
        }
    }

    /// The entitlement these claims vouch for.
    #[must_use]
    pub fn entitlement(&self) -> Entitlement {
        Entitlement {
            expiry_timestamp: UnixTimestamp::from_secs(self.exp),
            balance: self.bal,
        }
    }
}

/// Signs `claims` and returns the encoded token.
pub fn sign_claims(signing_key: &SigningKey, claims: &EntitlementClaims) -> LicenseResult<String> {
    let payload_json = serde_json::to_vec(claims)?;
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload_json);
    let signature = signing_key.sign(payload_b64.as_bytes());
    let sig_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());
    Ok(format!("{payload_b64}.{sig_b64}"))
}

/// A parsed and verified entitlement token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementToken {
    raw: String,
    claims: EntitlementClaims,
}

impl EntitlementToken {
    /// Parses and verifies a token against the authority's public key.
    ///
    /// # Errors
    ///
    /// Returns an error if the format is invalid or signature verification fails.
    pub fn parse_with_key(token: &str, pub_key_bytes: &[u8; 32]) -> LicenseResult<Self> {
        let token = token.trim();

        let Some((payload_b64, signature_b64)) = token.split_once('.') else {
            return Err(LicenseError::InvalidToken(
                "token must have exactly two parts separated by a dot".to_string(),
            ));
        };
        if signature_b64.contains('.') {
            return Err(LicenseError::InvalidToken(
                "token must have exactly two parts separated by a dot".to_string(),
            ));
        }

        let sig_bytes = URL_SAFE_NO_PAD.decode(signature_b64).map_err(|e| {
            LicenseError::InvalidToken(format!("invalid signature base64: {e}"))
        })?;

        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|_| LicenseError::InvalidToken("invalid signature length".to_string()))?;

        let verifying_key = VerifyingKey::from_bytes(pub_key_bytes)
            .map_err(|_| LicenseError::InvalidToken("invalid public key".to_string()))?;

        verifying_key
            .verify(payload_b64.as_bytes(), &signature)
            .map_err(|_| LicenseError::InvalidSignature)?;

        let payload_json = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|e| {
            LicenseError::InvalidToken(format!("invalid payload base64: {e}"))
        })?;

        let claims: EntitlementClaims = serde_json::from_slice(&payload_json).map_err(|e| {
            LicenseError::InvalidToken(format!("invalid payload JSON: {e}"))
        })?;

        Ok(Self {
            raw: token.to_string(),
            claims,
        })
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn claims(&self) -> &EntitlementClaims {
        &self.claims
    }

    /// Returns true if the token was issued for this subject and software.
    #[must_use]
    pub fn is_for(&self, subject: &str, software_id: &str) -> bool {
        self.claims.sub == subject && self.claims.sw == software_id
    }
}
