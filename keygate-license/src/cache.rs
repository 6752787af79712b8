//! On-disk entitlement cache for offline use.
//!
//! Each credential gets one JSON file at
//! `<cache dir>/<software id>/<subject hash>.json`. The file keeps the last
//! entitlement the authority reported, its signed token if any, and when it
//! was fetched.

use crate::error::{LicenseError, LicenseResult};
use crate::ledger::{Entitlement, EntitlementStatus};
use crate::token::EntitlementToken;
use crate::validator::Identity;
use keygate_types::UnixTimestamp;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// What is stored per credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEntitlement {
    pub entitlement: Entitlement,
    #[serde(default)]
    pub token: Option<String>,
    pub fetched_at: UnixTimestamp,
}

/// How old a cached entitlement is relative to the offline grace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    /// Older than the offline grace.
    Stale { age_secs: u64 },
    /// Issued later than now by more than [`CLOCK_SKEW_TOLERANCE`]: the local
    /// clock was set back or the entry was edited.
    Ahead { ahead_secs: u64 },
}

/// How far an entry's issue time may lie in the future before it is refused.
pub const CLOCK_SKEW_TOLERANCE: Duration = Duration::from_secs(5 * 60);

impl Freshness {
    /// Freshness of something issued at `issued_at`, evaluated at `now`.
    #[must_use]
    pub fn at(issued_at: UnixTimestamp, offline_grace: Duration, now: UnixTimestamp) -> Self {
        let ahead_secs = issued_at.secs_since(now);
        if ahead_secs > CLOCK_SKEW_TOLERANCE.as_secs() {
            return Self::Ahead { ahead_secs };
        }
        let age_secs = issued_at.secs_until(now);
        if age_secs > offline_grace.as_secs() {
            Self::Stale { age_secs }
        } else {
            Self::Fresh
        }
    }
}

/// A cached entitlement evaluated at some point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineEntitlement {
    pub entitlement: Entitlement,
    /// Signed issue time when verified, otherwise the stored fetch time.
    pub fetched_at: UnixTimestamp,
    pub freshness: Freshness,
    /// Status of the entitlement at evaluation time.
    pub status: EntitlementStatus,
    /// Whether the entitlement was checked against a signed token.
    pub verified: bool,
}

impl OfflineEntitlement {
    /// Returns true if the entitlement may be honoured offline: usable and not stale.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.status.is_usable() && self.freshness == Freshness::Fresh
    }
}

/// Per-software entitlement cache.
#[derive(Debug, Clone)]
pub struct EntitlementCache {
    dir: PathBuf,
    software_id: String,
}

impl EntitlementCache {
    /// Cache under `root/<software_id>`. The directory is created on first write.
    pub fn new(root: &Path, software_id: &str) -> Self {
        Self {
            dir: root.join(sanitize(software_id)),
            software_id: software_id.to_string(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `identity`'s entitlement.
    #[must_use]
    pub fn path_for(&self, identity: &Identity) -> PathBuf {
        self.dir.join(format!("{}.json", identity.subject_hash()))
    }

    /// Writes `entry`, replacing any previous one.
    pub fn store(&self, identity: &Identity, entry: &CachedEntitlement) -> LicenseResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| storage_error(&self.dir, &e))?;
        let path = self.path_for(identity);
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(entry)?;
        fs::write(&tmp, contents).map_err(|e| storage_error(&tmp, &e))?;
        fs::rename(&tmp, &path).map_err(|e| storage_error(&path, &e))?;
        debug!(path = %path.display(), "entitlement cached");
        Ok(())
    }

    /// Reads `identity`'s entry, or `None` if nothing is cached.
    pub fn load(&self, identity: &Identity) -> LicenseResult<Option<CachedEntitlement>> {
        let path = self.path_for(identity);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error(&path, &e)),
        }
    }

    /// Removes `identity`'s entry if present.
    pub fn clear(&self, identity: &Identity) -> LicenseResult<()> {
        let path = self.path_for(identity);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(&path, &e)),
        }
    }

    /// Loads and evaluates `identity`'s entry at `now`.
    ///
    /// With a public key, the entry must carry a token signed by it for this
    /// credential and software. The token's claims then win over the stored
    /// entitlement, and its signed issue time over the plaintext `fetched_at`.
    pub fn evaluate(
        &self,
        identity: &Identity,
        public_key: Option<&[u8; 32]>,
        offline_grace: Duration,
        now: UnixTimestamp,
    ) -> LicenseResult<Option<OfflineEntitlement>> {
        let Some(entry) = self.load(identity)? else {
            return Ok(None);
        };

        let (entitlement, issued_at, verified) = match public_key {
            Some(key) => {
                let raw = entry.token.as_deref().ok_or_else(|| {
                    LicenseError::InvalidToken("cached entitlement is unsigned".into())
                })?;
                let token = EntitlementToken::parse_with_key(raw, key)?;
                if !token.is_for(&identity.subject_hash(), &self.software_id) {
                    warn!("cached token belongs to another credential");
                    return Err(LicenseError::InvalidToken(
                        "token subject does not match".into(),
                    ));
                }
                let claims = token.claims();
                (
                    claims.entitlement(),
                    UnixTimestamp::from_secs(claims.iat),
                    true,
                )
            }
            None => (entry.entitlement, entry.fetched_at, false),
        };

        let freshness = Freshness::at(issued_at, offline_grace, now);
        if let Freshness::Ahead { ahead_secs } = freshness {
            warn!(ahead_secs, "cached entitlement is dated in the future");
        }

        Ok(Some(OfflineEntitlement {
            entitlement,
            fetched_at: issued_at,
            freshness,
            status: entitlement.status_at(now),
            verified,
        }))
    }
}

fn storage_error(path: &Path, err: &std::io::Error) -> LicenseError {
    LicenseError::Storage(format!("{}: {err}", path.display()))
}

/// Keeps software ids usable as a single path component.
fn sanitize(software_id: &str) -> String {
    software_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
