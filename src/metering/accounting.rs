//! Turns volatile interface counters into monotonic lifetime totals.

use super::snapshot::PeerCounterSnapshot;
use super::store::{CounterStore, CumulativeCounter, DailyRollup};
use crate::error::Result;
use chrono::NaiveDate;

/// What one `reconcile` pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub peers: usize,
    /// Peers whose counters went backwards since the previous snapshot.
    pub resets: usize,
}

/// Apply a snapshot to a stored counter, folding the previous reading into
/// the baseline when the device counters were reset. Returns whether a
/// reset was detected.
pub fn apply_reading(counter: &mut CumulativeCounter, rx: u64, tx: u64) -> bool {
    let reset = rx < counter.last_seen_rx || tx < counter.last_seen_tx;
    if reset {
        counter.baseline_rx = counter.baseline_rx.saturating_add(counter.last_seen_rx);
        counter.baseline_tx = counter.baseline_tx.saturating_add(counter.last_seen_tx);
    }
    counter.last_seen_rx = rx;
    counter.last_seen_tx = tx;
    reset
}

/// Reconcile a fresh snapshot against the stored baselines and record
/// today's lifetime totals. All writes happen in one transaction.
pub fn reconcile(
    store: &CounterStore,
    snapshots: &[PeerCounterSnapshot],
    today: NaiveDate,
) -> Result<ReconcileSummary> {
    let updated_at = chrono::Utc::now().to_rfc3339();

    store.in_transaction(|store| {
        let mut summary = ReconcileSummary::default();
        for snapshot in snapshots {
            let mut counter = store
                .load_counter(&snapshot.peer_key)?
                .unwrap_or_else(|| CumulativeCounter::empty(snapshot.peer_key.clone()));

            if apply_reading(&mut counter, snapshot.rx_bytes, snapshot.tx_bytes) {
                tracing::warn!(
                    peer = %snapshot.peer_key,
                    baseline_rx = counter.baseline_rx,
                    baseline_tx = counter.baseline_tx,
                    "counter reset detected, folded previous reading into baseline"
                );
                summary.resets += 1;
            }

            store.save_counter(&counter, &updated_at)?;
            store.upsert_daily(&DailyRollup {
                peer_key: snapshot.peer_key.clone(),
                date: today,
                rx_bytes: counter.total_rx(),
                tx_bytes: counter.total_tx(),
            })?;
            summary.peers += 1;
        }
        Ok(summary)
    })
}
