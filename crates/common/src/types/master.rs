use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One controller replica's heartbeat row.
///
/// Invariant: at most one replica is flagged active while also within the
/// election timeout.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MasterRecord {
    pub master_id: String,
    /// None when the stored timestamp was absent or malformed; treated as
    /// "unknown age = expired" during elections.
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub is_active: bool,
}
