//! Machine binding records and the per-period unbind allowance.

use crate::device::{MachineFingerprint, MachineInfo};
use crate::error::{LicenseError, LicenseResult};
use keygate_types::UnixTimestamp;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One machine bound to a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineBindingRecord {
    pub bind_timestamp: UnixTimestamp,
    pub os_version: String,
    #[serde(default)]
    pub remark: String,
    pub computer_name: String,
    pub fingerprint: MachineFingerprint,
    pub last_login_timestamp: UnixTimestamp,
}

impl MachineBindingRecord {
    /// Creates a record for a machine bound at `at`.
    #[must_use]
    pub fn new(machine: &MachineInfo, at: UnixTimestamp) -> Self {
        Self {
            bind_timestamp: at,
            os_version: machine.os_version.clone(),
            remark: String::new(),
            computer_name: machine.computer_name.clone(),
            fingerprint: machine.fingerprint.clone(),
            last_login_timestamp: at,
        }
    }
}

/// Snapshot of every machine bound to a credential plus the unbind budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSetView {
    pub records: Vec<MachineBindingRecord>,
    pub ip_binding_enabled: bool,
    pub remaining_unbind_count_this_period: u32,
    pub countdown_seconds_until_refresh: u64,
    pub unbind_limit: u32,
    /// Maximum number of bound machines.
    pub limit: u32,
}

impl BindingSetView {
    /// Number of bound machines; always `records.len()`.
    #[must_use]
    pub fn count(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count() >= self.limit as usize
    }

    #[must_use]
    pub fn find(&self, fingerprint: &MachineFingerprint) -> Option<&MachineBindingRecord> {
        self.records.iter().find(|r| &r.fingerprint == fingerprint)
    }

    #[must_use]
    pub fn contains(&self, fingerprint: &MachineFingerprint) -> bool {
        self.find(fingerprint).is_some()
    }
}

/// How many unbinds a credential may perform per period.
///
/// The period restarts lazily: the first query after it ends resets the
/// counter and starts a new period at that moment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbindAllowance {
    unbind_limit: u32,
    used: u32,
    period_secs: u64,
    period_start: UnixTimestamp,
}

impl UnbindAllowance {
    #[must_use]
    pub fn new(unbind_limit: u32, period: Duration, start: UnixTimestamp) -> Self {
        Self {
            unbind_limit,
            used: 0,
            period_secs: period.as_secs(),
            period_start: start,
        }
    }

    #[must_use]
    pub fn unbind_limit(&self) -> u32 {
        self.unbind_limit
    }

    fn period_end(&self) -> UnixTimestamp {
        self.period_start
            .saturating_add(Duration::from_secs(self.period_secs))
    }

    /// Starts a new period if the current one has elapsed.
    pub fn refresh(&mut self, now: UnixTimestamp) {
        if now >= self.period_end() {
            self.used = 0;
            self.period_start = now;
        }
    }

    /// Unbinds left in the current period.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.unbind_limit.saturating_sub(self.used)
    }

    /// Seconds until the period refreshes.
    #[must_use]
    pub fn countdown(&self, now: UnixTimestamp) -> u64 {
        now.secs_until(self.period_end())
    }

    /// Consumes one unbind, or fails with [`LicenseError::LimitExceeded`].
    pub fn consume(&mut self, now: UnixTimestamp) -> LicenseResult<()> {
        self.refresh(now);
        if self.remaining() == 0 {
            return Err(LicenseError::LimitExceeded {
                unbind_limit: self.unbind_limit,
                countdown_secs: self.countdown(now),
            });
        }
        self.used += 1;
        Ok(())
    }
}
