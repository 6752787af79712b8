//! Client and connection configuration.

use crate::device::MachineInfo;
use crate::error::{LicenseError, LicenseResult};
use crate::wire::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default offline grace: a cached entitlement older than this is stale (7 days).
pub const DEFAULT_OFFLINE_GRACE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Where and how a session talks to the authority.
///
/// The timeout is mandatory: every authority call made by the session is
/// bounded by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Identifier of the licensed software at the authority.
    pub software_id: String,
    pub host: String,
    pub port: u16,
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    pub protocol_version: u32,
    /// Whether the embedding application may show interactive prompts
    /// (e.g. an update notice) on the authority's request.
    #[serde(default)]
    pub interactive_prompt: bool,
}

impl ConnectionConfig {
    /// Creates a config with the current protocol version and prompts disabled.
    pub fn new(
        software_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        timeout: Duration,
    ) -> Self {
        Self {
            software_id: software_id.into(),
            host: host.into(),
            port,
            timeout,
            protocol_version: PROTOCOL_VERSION,
            interactive_prompt: false,
        }
    }

    #[must_use]
    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    #[must_use]
    pub fn with_interactive_prompt(mut self, enabled: bool) -> Self {
        self.interactive_prompt = enabled;
        self
    }

    /// `host:port`.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Timeout in whole milliseconds, as reported in errors.
    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Rejects configs no authority call could succeed with.
    pub fn validate(&self) -> LicenseResult<()> {
        if self.software_id.trim().is_empty() {
            return Err(LicenseError::ProtocolMisuse("software id is empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(LicenseError::ProtocolMisuse("host is empty".into()));
        }
        if self.port == 0 {
            return Err(LicenseError::ProtocolMisuse("port must be non-zero".into()));
        }
        if self.timeout.is_zero() {
            return Err(LicenseError::ProtocolMisuse("timeout must be non-zero".into()));
        }
        if self.protocol_version == 0 {
            return Err(LicenseError::ProtocolMisuse(
                "protocol version must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Process-wide settings shared by every session a [`crate::Client`] creates.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on the handshake performed when a session is created.
    pub handshake_timeout: Duration,
    /// Directory for the entitlement cache; `None` disables caching.
    pub cache_dir: Option<PathBuf>,
    /// Authority Ed25519 public key used to verify cached entitlement tokens.
    pub authority_public_key: Option<[u8; 32]>,
    /// Age after which a cached entitlement is reported stale.
    pub offline_grace: Duration,
    /// Overrides the collected machine identity.
    pub machine: Option<MachineInfo>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            cache_dir: default_cache_dir(),
            authority_public_key: None,
            offline_grace: DEFAULT_OFFLINE_GRACE,
            machine: None,
        }
    }
}

impl ClientConfig {
    /// A config with caching disabled; handy for tests and short-lived tools.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self {
            cache_dir: None,
            ..Self::default()
        }
    }
}

/// `<local data dir>/keygate`, if the platform has one.
fn default_cache_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("keygate"))
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
