use super::usage::DailyRollups;
use super::{from_sql_bytes, schema, to_sql_bytes, PeerKey};
use crate::error::Result;
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Reset-tolerant lifetime counter for one peer.
///
/// `baseline + last_seen` is the lifetime total as of the latest snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CumulativeCounter {
    pub peer_key: PeerKey,
    pub baseline_rx: u64,
    pub baseline_tx: u64,
    pub last_seen_rx: u64,
    pub last_seen_tx: u64,
}

impl CumulativeCounter {
    pub fn empty(peer_key: PeerKey) -> Self {
        Self {
            peer_key,
            ..Self::default()
        }
    }

    pub fn total_rx(&self) -> u64 {
        self.baseline_rx.saturating_add(self.last_seen_rx)
    }

    pub fn total_tx(&self) -> u64 {
        self.baseline_tx.saturating_add(self.last_seen_tx)
    }
}

/// Lifetime totals of a peer as of the end of `date`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyRollup {
    pub peer_key: PeerKey,
    pub date: NaiveDate,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl DailyRollup {
    pub fn total(&self) -> u64 {
        self.rx_bytes.saturating_add(self.tx_bytes)
    }
}

/// Dedup marker: `threshold` was already announced for `peer_key` in `month`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertRecord {
    pub peer_key: PeerKey,
    pub month: String,
    pub threshold: u32,
    pub alerted_at: String,
}

/// Read-write handle on the metering database.
///
/// Only the writer thread holds one of these in production; tests use it
/// directly.
pub struct CounterStore {
    conn: Connection,
}

impl CounterStore {
    /// Open (or create) the database at `db_path` and apply the schema.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(schema::PRAGMAS)?;
        conn.execute_batch(schema::PEER_COUNTERS_DDL)?;
        conn.execute_batch(schema::DAILY_ROLLUPS_DDL)?;
        conn.execute_batch(schema::QUOTA_ALERTS_DDL)?;
        conn.execute_batch(schema::MONTHLY_RESETS_DDL)?;
        Ok(Self { conn })
    }

    /// Run `f` inside one transaction; any error rolls back every write.
    pub fn in_transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    tracing::error!("metering ROLLBACK failed: {rollback}");
                }
                Err(e)
            }
        }
    }

    pub fn load_counter(&self, peer: &PeerKey) -> Result<Option<CumulativeCounter>> {
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

    pub fn save_counter(&self, counter: &CumulativeCounter, updated_at: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO peer_counters
                (peer_key, baseline_rx, baseline_tx, last_seen_rx, last_seen_tx, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(peer_key) DO UPDATE SET
                baseline_rx  = excluded.baseline_rx,
                baseline_tx  = excluded.baseline_tx,
                last_seen_rx = excluded.last_seen_rx,
                last_seen_tx = excluded.last_seen_tx,
                updated_at   = excluded.updated_at",
            params![
                counter.peer_key.as_str(),
                to_sql_bytes(counter.baseline_rx),
                to_sql_bytes(counter.baseline_tx),
                to_sql_bytes(counter.last_seen_rx),
                to_sql_bytes(counter.last_seen_tx),
                updated_at,
            ],
        )?;
        Ok(())
    }

    /// Insert or overwrite the rollup for `(peer, date)`.
    pub fn upsert_daily(&self, rollup: &DailyRollup) -> Result<()> {
        self.conn.execute(
            "INSERT INTO daily_rollups (peer_key, date, rx_bytes, tx_bytes)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(peer_key, date) DO UPDATE SET
                rx_bytes = excluded.rx_bytes,
                tx_bytes = excluded.tx_bytes",
            params![
                rollup.peer_key.as_str(),
                date_to_sql(rollup.date),
                to_sql_bytes(rollup.rx_bytes),
                to_sql_bytes(rollup.tx_bytes),
            ],
        )?;
        Ok(())
    }

    /// Record an alert. Returns `false` when the same
    /// `(peer, month, threshold)` was already recorded.
    pub fn insert_alert(&self, alert: &AlertRecord) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO quota_alerts (peer_key, month, threshold, alerted_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                alert.peer_key.as_str(),
                alert.month,
                alert.threshold,
                alert.alerted_at,
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Delete alert markers of months strictly before `month` (`YYYY-MM`).
    pub fn prune_alerts_before(&self, month: &str) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM quota_alerts WHERE month < ?1", params![month])?;
        Ok(removed)
    }

    /// Whether the monthly reset for `month` (`YYYY-MM`) already completed.
    pub fn reset_completed(&self, month: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM monthly_resets WHERE month = ?1",
                params![month],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Mark the reset for `month` done and drop alert markers of earlier
    /// months, atomically. Returns the number of pruned alerts.
    pub fn complete_reset(&self, month: &str, reset_at: &str) -> Result<usize> {
        self.in_transaction(|store| {
            store.conn.execute(
                "INSERT OR IGNORE INTO monthly_resets (month, reset_at) VALUES (?1, ?2)",
                params![month, reset_at],
            )?;
            store.prune_alerts_before(month)
        })
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl DailyRollups for CounterStore {
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

pub(crate) fn query_rollups_between(
    conn: &Connection,
    peer: &PeerKey,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<DailyRollup>> {
    let mut stmt = conn.prepare_cached(
        "SELECT peer_key, date, rx_bytes, tx_bytes
         FROM daily_rollups
         WHERE peer_key = ?1 AND date >= ?2 AND date <= ?3
         ORDER BY date ASC",
    )?;
    let rows = stmt.query_map(
        params![peer.as_str(), date_to_sql(from), date_to_sql(to)],
        rollup_from_row,
    )?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

pub(crate) fn query_latest_rollup_before(
    conn: &Connection,
    peer: &PeerKey,
    before: NaiveDate,
) -> Result<Option<DailyRollup>> {
    let rollup = conn
        .query_row(
            "SELECT peer_key, date, rx_bytes, tx_bytes
             FROM daily_rollups
             WHERE peer_key = ?1 AND date < ?2
             ORDER BY date DESC
             LIMIT 1",
            params![peer.as_str(), date_to_sql(before)],
            rollup_from_row,
        )
        .optional()?;
    Ok(rollup)
}

pub(crate) fn counter_from_row(row: &Row<'_>) -> rusqlite::Result<CumulativeCounter> {
    Ok(CumulativeCounter {
        peer_key: PeerKey::new(row.get::<_, String>(0)?),
        baseline_rx: from_sql_bytes(row.get(1)?),
        baseline_tx: from_sql_bytes(row.get(2)?),
        last_seen_rx: from_sql_bytes(row.get(3)?),
        last_seen_tx: from_sql_bytes(row.get(4)?),
    })
}

fn rollup_from_row(row: &Row<'_>) -> rusqlite::Result<DailyRollup> {
    let raw_date: String = row.get(1)?;
    let date = NaiveDate::parse_from_str(&raw_date, DATE_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(DailyRollup {
        peer_key: PeerKey::new(row.get::<_, String>(0)?),
        date,
        rx_bytes: from_sql_bytes(row.get(2)?),
        tx_bytes: from_sql_bytes(row.get(3)?),
    })
}

fn date_to_sql(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    fn alert(peer: &str, month: &str, threshold: u32) -> AlertRecord {
        AlertRecord {
            peer_key: PeerKey::new(peer),
            month: month.into(),
            threshold,
            alerted_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn store_open_creates_db_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("traffic.db");
        let _store = CounterStore::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn counter_round_trips_and_upserts() {
        let store = CounterStore::open_in_memory().unwrap();
        let peer = PeerKey::new("peerA=");
        assert!(store.load_counter(&peer).unwrap().is_none());

        let mut counter = CumulativeCounter::empty(peer.clone());
        counter.last_seen_rx = 10;
        store.save_counter(&counter, "t0").unwrap();
        counter.baseline_rx = 10;
        counter.last_seen_rx = 3;
        store.save_counter(&counter, "t1").unwrap();

        let loaded = store.load_counter(&peer).unwrap().unwrap();
        assert_eq!(loaded, counter);
        assert_eq!(loaded.total_rx(), 13);
    }

    #[test]
    fn daily_rollup_overwrites_same_day() {
        let store = CounterStore::open_in_memory().unwrap();
        let peer = PeerKey::new("p");
        for rx in [100, 150] {
            store
                .upsert_daily(&DailyRollup {
                    peer_key: peer.clone(),
                    date: day(5),
                    rx_bytes: rx,
                    tx_bytes: 0,
                })
                .unwrap();
        }
        let rows = store.rollups_between(&peer, day(1), day(31)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rx_bytes, 150);
    }

    #[test]
    fn latest_before_picks_most_recent() {
        let store = CounterStore::open_in_memory().unwrap();
        let peer = PeerKey::new("p");
        for (d, rx) in [(2, 10), (9, 20), (20, 30)] {
            store
                .upsert_daily(&DailyRollup {
                    peer_key: peer.clone(),
                    date: day(d),
                    rx_bytes: rx,
                    tx_bytes: 0,
                })
                .unwrap();
        }
        let latest = store.latest_rollup_before(&peer, day(15)).unwrap().unwrap();
        assert_eq!(latest.date, day(9));
        assert!(store.latest_rollup_before(&peer, day(2)).unwrap().is_none());
    }

    #[test]
    fn duplicate_alert_is_a_no_op() {
        let store = CounterStore::open_in_memory().unwrap();
        assert!(store.insert_alert(&alert("p", "2026-01", 80)).unwrap());
        assert!(!store.insert_alert(&alert("p", "2026-01", 80)).unwrap());
        assert!(store.insert_alert(&alert("p", "2026-02", 80)).unwrap());
        assert!(store.insert_alert(&alert("p", "2026-01", 100)).unwrap());
    }

    #[test]
    fn prune_keeps_current_month() {
        let store = CounterStore::open_in_memory().unwrap();
        store.insert_alert(&alert("p", "2025-12", 80)).unwrap();
        store.insert_alert(&alert("p", "2026-01", 80)).unwrap();
        assert_eq!(store.prune_alerts_before("2026-01").unwrap(), 1);
        assert!(!store.insert_alert(&alert("p", "2026-01", 80)).unwrap());
        assert!(store.insert_alert(&alert("p", "2025-12", 80)).unwrap());
    }

    #[test]
    fn completed_reset_is_remembered_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("traffic.db");
        {
            let store = CounterStore::open(&path).unwrap();
            store.insert_alert(&alert("p", "2026-01", 100)).unwrap();
            store.insert_alert(&alert("p", "2026-02", 80)).unwrap();
            assert!(!store.reset_completed("2026-02").unwrap());
            assert_eq!(store.complete_reset("2026-02", "t").unwrap(), 1);
        }
        let store = CounterStore::open(&path).unwrap();
        assert!(store.reset_completed("2026-02").unwrap());
        assert!(!store.reset_completed("2026-03").unwrap());
        assert_eq!(store.complete_reset("2026-02", "t2").unwrap(), 0);
        assert!(!store.insert_alert(&alert("p", "2026-02", 80)).unwrap());
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let store = CounterStore::open_in_memory().unwrap();
        let peer = PeerKey::new("p");
        let result: Result<()> = store.in_transaction(|s| {
            s.save_counter(&CumulativeCounter::empty(peer.clone()), "t")?;
            Err(crate::error::MeterError::Config("boom".into()))
        });
        assert!(result.is_err());
        assert!(store.load_counter(&peer).unwrap().is_none());
    }
}
