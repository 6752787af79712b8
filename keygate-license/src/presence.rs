//! Online presence records.

use keygate_types::{ConnectionId, UnixTimestamp};
use serde::{Deserialize, Serialize};

/// One client currently connected under a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineSessionRecord {
    pub connection_id: ConnectionId,
    pub computer_name: String,
    pub os_version: String,
    pub cloud_init_timestamp: UnixTimestamp,
}

/// Returns the records that belong to other clients than `own`.
pub fn other_devices(
    records: &[OnlineSessionRecord],
    own: ConnectionId,
) -> impl Iterator<Item = &OnlineSessionRecord> {
    records.iter().filter(move |r| r.connection_id != own)
}
