use super::store::{
    counter_from_row, query_latest_rollup_before, query_rollups_between, CumulativeCounter,
    DailyRollup,
};
use super::usage::{usage_in_month, DailyRollups};
use super::{PeerIdentity, PeerKey};
use crate::error::Result;
use chrono::{Days, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;

/// A read-only view of the metering database for reporting paths.
///
/// Opens a separate read-only SQLite connection so that concurrent reads
/// don't interfere with the writer thread (WAL mode allows this).
pub struct UsageReader {
    conn: Connection,
}

/// Current-month and lifetime traffic of one mapped peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerUsage {
    pub peer: PeerKey,
    pub user: String,
    pub month_usage: u64,
    pub lifetime_rx: u64,
    pub lifetime_tx: u64,
}

/// Bytes a peer moved on one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayTraffic {
    pub date: NaiveDate,
    pub peer: PeerKey,
    pub user: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl UsageReader {
    /// Open a read-only connection to the metering database.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    pub fn counter(&self, peer: &PeerKey) -> Result<Option<CumulativeCounter>> {
        let counter = self
            .conn
            .query_row(
                "SELECT peer_key, baseline_rx, baseline_tx, last_seen_rx, last_seen_tx
                 FROM peer_counters WHERE peer_key = ?1",
                params![peer.as_str()],
                counter_from_row,
            )
            .optional()?;
        Ok(counter)
    }

    /// Month-to-date usage for each mapped peer, as of `reference`.
    pub fn monthly_usage(
        &self,
        peers: &[PeerIdentity],
        reference: NaiveDate,
    ) -> Result<Vec<PeerUsage>> {
        let mut results = Vec::with_capacity(peers.len());
        for identity in peers {
            let month_usage = usage_in_month(self, &identity.key, reference)?;
            let counter = self
                .counter(&identity.key)?
                .unwrap_or_else(|| CumulativeCounter::empty(identity.key.clone()));
            results.push(PeerUsage {
                peer: identity.key.clone(),
                user: identity.user.clone(),
                month_usage,
                lifetime_rx: counter.total_rx(),
                lifetime_tx: counter.total_tx(),
            });
        }
        Ok(results)
    }

    /// Per-day traffic of each mapped peer over the `days` days ending at
    /// `today`. A day's traffic is the growth of the lifetime total since the
    /// previous recorded day; the first day ever recorded counts as zero.
    pub fn traffic_history(
        &self,
        peers: &[PeerIdentity],
        today: NaiveDate,
        days: u32,
    ) -> Result<Vec<DayTraffic>> {
        let span = u64::from(days.max(1) - 1);
        let from = today.checked_sub_days(Days::new(span)).unwrap_or(NaiveDate::MIN);

        let mut results = Vec::new();
        for identity in peers {
            let mut previous = self.latest_rollup_before(&identity.key, from)?;
            for row in self.rollups_between(&identity.key, from, today)? {
                let (rx_bytes, tx_bytes) = match &previous {
                    Some(prev) => (
                        row.rx_bytes.saturating_sub(prev.rx_bytes),
                        row.tx_bytes.saturating_sub(prev.tx_bytes),
                    ),
                    None => (0, 0),
                };
                results.push(DayTraffic {
                    date: row.date,
                    peer: identity.key.clone(),
                    user: identity.user.clone(),
                    rx_bytes,
                    tx_bytes,
                });
                previous = Some(row);
            }
        }
        results.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.user.cmp(&b.user)));
        Ok(results)
    }
}

impl DailyRollups for UsageReader {
    fn rollups_between(
        &self,
        peer: &PeerKey,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyRollup>> {
        query_rollups_between(&self.conn, peer, from, to)
    }

    fn latest_rollup_before(
        &self,
        peer: &PeerKey,
        before: NaiveDate,
    ) -> Result<Option<DailyRollup>> {
        query_latest_rollup_before(&self.conn, peer, before)
    }
}
