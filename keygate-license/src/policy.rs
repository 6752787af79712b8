//! Global feature toggles published by the authority.
//!
//! The gate keeps a local snapshot of the flags so a forbidden action fails
//! before any authority round-trip.

use crate::error::{LicenseError, LicenseResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// One toggle in [`PolicyFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyFlag {
    ForbidTrial,
    ForbidLogin,
    ForbidRegister,
    ForbidRecharge,
    ForbidCloudCountQuery,
}

impl fmt::Display for PolicyFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ForbidTrial => "trial is disabled",
            Self::ForbidLogin => "login is disabled",
            Self::ForbidRegister => "registration is disabled",
            Self::ForbidRecharge => "recharge is disabled",
            Self::ForbidCloudCountQuery => "online queries are disabled",
        })
    }
}

/// The five global toggles. `true` forbids the action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyFlags {
    pub forbid_trial: bool,
    pub forbid_login: bool,
    pub forbid_register: bool,
    pub forbid_recharge: bool,
    pub forbid_cloud_count_query: bool,
}

impl PolicyFlags {
    /// Returns true if `flag` is set (the action is forbidden).
    #[must_use]
    pub fn is_set(&self, flag: PolicyFlag) -> bool {
        match flag {
            PolicyFlag::ForbidTrial => self.forbid_trial,
            PolicyFlag::ForbidLogin => self.forbid_login,
            PolicyFlag::ForbidRegister => self.forbid_register,
            PolicyFlag::ForbidRecharge => self.forbid_recharge,
            PolicyFlag::ForbidCloudCountQuery => self.forbid_cloud_count_query,
        }
    }

    /// Returns a copy with `flag` set to `value`.
    #[must_use]
    pub fn with(mut self, flag: PolicyFlag, value: bool) -> Self {
        let slot = match flag {
            PolicyFlag::ForbidTrial => &mut self.forbid_trial,
            PolicyFlag::ForbidLogin => &mut self.forbid_login,
            PolicyFlag::ForbidRegister => &mut self.forbid_register,
            PolicyFlag::ForbidRecharge => &mut self.forbid_recharge,
            PolicyFlag::ForbidCloudCountQuery => &mut self.forbid_cloud_count_query,
        };
        *slot = value;
        self
    }
}

/// Shared, refreshable snapshot of the authority's [`PolicyFlags`].
///
/// Clones share the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct PolicyGate {
    flags: Arc<RwLock<PolicyFlags>>,
}

impl PolicyGate {
    #[must_use]
    pub fn new(flags: PolicyFlags) -> Self {
        Self {
            flags: Arc::new(RwLock::new(flags)),
        }
    }

    /// Returns true if the action guarded by `flag` is allowed.
    #[must_use]
    pub fn check(&self, flag: PolicyFlag) -> bool {
        !self.snapshot().is_set(flag)
    }

    /// Fails with [`LicenseError::PolicyForbidden`] if `flag` is set.
    pub fn require(&self, flag: PolicyFlag) -> LicenseResult<()> {
        if self.check(flag) {
            Ok(())
        } else {
            debug!(?flag, "action short-circuited by policy");
            Err(LicenseError::PolicyForbidden(flag))
        }
    }

    /// Returns the current flags.
    #[must_use]
    pub fn snapshot(&self) -> PolicyFlags {
        *self.flags.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the snapshot with flags freshly published by the authority.
    pub fn update(&self, flags: PolicyFlags) {
        *self.flags.write().unwrap_or_else(PoisonError::into_inner) = flags;
    }
}
