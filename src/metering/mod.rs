pub mod accounting;
pub mod quota;
pub mod reader;
pub mod report;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod usage;
pub mod writer;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use accounting::{reconcile, ReconcileSummary};
pub use quota::{EnforcementReport, QuotaAction, QuotaConfig, QuotaEnforcer, QuotaEvent};
pub use reader::UsageReader;
pub use snapshot::{parse_dump, PeerCounterSnapshot};
pub use store::{AlertRecord, CounterStore, CumulativeCounter, DailyRollup};
pub use usage::{month_end, month_key, month_start, usage_in_month, DailyRollups};
pub use writer::MeterWriter;

/// Stable identifier of a peer: its WireGuard public key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerKey(String);

impl PeerKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A peer key paired with the user it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerIdentity {
    pub key: PeerKey,
    pub user: String,
}

/// SQLite stores integers as i64; byte counters are u64 on our side.
pub(crate) fn to_sql_bytes(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn from_sql_bytes(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
