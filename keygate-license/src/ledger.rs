//! Entitlement ledger: expiry and point balance, and recharge bookkeeping.

use keygate_types::UnixTimestamp;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Grace period after expiry during which the credential still works (3 days).
pub const GRACE_PERIOD_SECS: u64 = 3 * 24 * 60 * 60;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Expiry and point balance of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub expiry_timestamp: UnixTimestamp,
    pub balance: u64,
}

impl Entitlement {
    /// Returns the status of this entitlement at `now`.
    #[must_use]
    pub fn status_at(&self, now: UnixTimestamp) -> EntitlementStatus {
        if now < self.expiry_timestamp {
            return EntitlementStatus::Active;
        }
        let secs_past_expiry = self.expiry_timestamp.secs_until(now);
        if secs_past_expiry < GRACE_PERIOD_SECS {
            let days_remaining = (GRACE_PERIOD_SECS - secs_past_expiry) / DAY_SECS;
            EntitlementStatus::Grace {
                days_remaining: u32::try_from(days_remaining).unwrap_or(u32::MAX),
            }
        } else {
            EntitlementStatus::Expired
        }
    }

    /// Returns the status of this entitlement now.
    #[must_use]
    pub fn status(&self) -> EntitlementStatus {
        self.status_at(UnixTimestamp::now())
    }

    /// Applies the value of redeemed codes and returns the new entitlement.
    ///
    /// Time is added on top of the current expiry, or on top of `now` if the
    /// entitlement has already lapsed.
    #[must_use]
    pub fn credited(&self, value: RechargeValue, now: UnixTimestamp) -> Self {
        let base = self.expiry_timestamp.max(now);
        Self {
            expiry_timestamp: base.saturating_add(Duration::from_secs(value.duration_secs)),
            balance: self.balance.saturating_add(value.points),
        }
    }
}

/// The current status of an entitlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitlementStatus {
    /// Not yet expired.
    Active,
    /// Expired, but still inside the grace period.
    Grace {
        /// Whole days left in the grace period.
        days_remaining: u32,
    },
    /// Past the grace period.
    Expired,
}

impl EntitlementStatus {
    /// Returns true if the credential may still be used (Active or Grace).
    #[must_use]
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Active | Self::Grace { .. })
    }
}

/// What one or more recharge codes are worth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RechargeValue {
    pub duration_secs: u64,
    pub points: u64,
}

impl RechargeValue {
    /// Sums two values.
    #[must_use]
    pub fn plus(self, other: Self) -> Self {
        Self {
            duration_secs: self.duration_secs.saturating_add(other.duration_secs),
            points: self.points.saturating_add(other.points),
        }
    }
}

/// Ledger entry for one applied recharge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RechargeTransaction {
    pub old_expiry: UnixTimestamp,
    pub new_expiry: UnixTimestamp,
    pub old_balance: u64,
    pub new_balance: u64,
    /// Number of codes consumed by this recharge.
    pub units_redeemed: u32,
}

impl RechargeTransaction {
    /// Builds the transaction for moving from `old` to `new`.
    #[must_use]
    pub fn between(old: Entitlement, new: Entitlement, units_redeemed: u32) -> Self {
        Self {
            old_expiry: old.expiry_timestamp,
            new_expiry: new.expiry_timestamp,
            old_balance: old.balance,
            new_balance: new.balance,
            units_redeemed,
        }
    }

    /// The entitlement after this recharge.
    #[must_use]
    pub fn resulting_entitlement(&self) -> Entitlement {
        Entitlement {
            expiry_timestamp: self.new_expiry,
            balance: self.new_balance,
        }
    }

    /// Seconds of validity added.
    #[must_use]
    pub fn extended_by_secs(&self) -> u64 {
        self.old_expiry.secs_until(self.new_expiry)
    }

    /// Points credited.
    #[must_use]
    pub fn points_credited(&self) -> u64 {
        self.new_balance.saturating_sub(self.old_balance)
    }
}
