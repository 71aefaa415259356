//! Monthly quota evaluation with deduplicated alerts.

use super::store::{AlertRecord, CounterStore};
use super::usage::{month_key, usage_in_month};
use super::writer::MeterWriter;
use super::{PeerIdentity, PeerKey};
use crate::error::{MeterError, Result};
use crate::wireguard::gate::PeerGate;
use crate::wireguard::identity::IdentityMap;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Threshold at or above which a crossing blocks the peer.
pub const BLOCK_THRESHOLD: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Monthly byte limit per peer. `0` disables enforcement.
    pub limit_bytes: u64,
    /// Percentages of `limit_bytes` that trigger an alert, ascending.
    pub thresholds: Vec<u32>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit_bytes: 0,
            thresholds: vec![80, 100],
        }
    }
}

impl QuotaConfig {
    pub fn is_enabled(&self) -> bool {
        self.limit_bytes > 0 && !self.thresholds.is_empty()
    }

    /// Sort thresholds ascending and drop duplicates.
    pub fn normalize(&mut self) {
        self.thresholds.sort_unstable();
        self.thresholds.dedup();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaAction {
    Warn,
    Blocked,
}

impl QuotaAction {
    pub fn for_threshold(threshold: u32) -> Self {
        if threshold >= BLOCK_THRESHOLD {
            Self::Blocked
        } else {
            Self::Warn
        }
    }
}

impl fmt::Display for QuotaAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warn => f.write_str("warn"),
            Self::Blocked => f.write_str("blocked"),
        }
    }
}

/// A threshold crossing announced for the first time this month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaEvent {
    pub peer: PeerKey,
    pub user: String,
    pub usage: u64,
    pub limit: u64,
    /// The threshold that was crossed, in percent.
    pub pct: u32,
    pub action: QuotaAction,
}

/// Result of one enforcement pass.
#[derive(Debug, Default)]
pub struct EnforcementReport {
    pub events: Vec<QuotaEvent>,
    /// Blocks that were recorded but the gate refused to carry out.
    pub gate_failures: Vec<(PeerKey, MeterError)>,
}

fn usage_pct(usage: u64, limit: u64) -> f64 {
    usage as f64 / limit as f64 * 100.0
}

/// Evaluate every mapped peer against the quota and record new alerts.
///
/// Thresholds are walked as a prefix: evaluation stops at the first one the
/// usage does not reach. Only crossings without an existing alert row for
/// the current month produce events.
pub fn evaluate(
    store: &CounterStore,
    peers: &[PeerIdentity],
    config: &QuotaConfig,
    reference: NaiveDate,
) -> Result<Vec<QuotaEvent>> {
    if !config.is_enabled() {
        return Ok(Vec::new());
    }
    let month = month_key(reference);
    let alerted_at = chrono::Utc::now().to_rfc3339();
    let mut events = Vec::new();

    for identity in peers {
        let usage = usage_in_month(store, &identity.key, reference)?;
        let pct = usage_pct(usage, config.limit_bytes);

        for &threshold in &config.thresholds {
            if pct < f64::from(threshold) {
                break;
            }
            let inserted = store.insert_alert(&AlertRecord {
                peer_key: identity.key.clone(),
                month: month.clone(),
                threshold,
                alerted_at: alerted_at.clone(),
            })?;
            if !inserted {
                continue;
            }
            events.push(QuotaEvent {
                peer: identity.key.clone(),
                user: identity.user.clone(),
                usage,
                limit: config.limit_bytes,
                pct: threshold,
                action: QuotaAction::for_threshold(threshold),
            });
        }
    }
    Ok(events)
}

/// Drives quota evaluation through the store writer and applies blocks
/// through the peer gate.
pub struct QuotaEnforcer {
    config: QuotaConfig,
    writer: Arc<MeterWriter>,
    gate: Arc<dyn PeerGate>,
    identities: Arc<dyn IdentityMap>,
}

impl QuotaEnforcer {
    pub fn new(
        config: QuotaConfig,
        writer: Arc<MeterWriter>,
        gate: Arc<dyn PeerGate>,
        identities: Arc<dyn IdentityMap>,
    ) -> Self {
        Self {
            config,
            writer,
            gate,
            identities,
        }
    }

    /// Evaluate all mapped peers for the month containing `reference`.
    ///
    /// Alerts are recorded before the gate is called, so a failed block is
    /// reported in `gate_failures` and not retried on later cycles.
    pub async fn check_limits(&self, reference: NaiveDate) -> Result<EnforcementReport> {
        if !self.config.is_enabled() {
            return Ok(EnforcementReport::default());
        }
        let peers = self.identities.peers()?;
        let events = self
            .writer
            .evaluate_quota(peers, self.config.clone(), reference)
            .await?;

        let mut report = EnforcementReport::default();
        for event in &events {
            match event.action {
                QuotaAction::Warn => {
                    tracing::info!(
                        user = %event.user,
                        usage = event.usage,
                        limit = event.limit,
                        pct = event.pct,
                        "traffic quota warning"
                    );
                }
                QuotaAction::Blocked => {
                    tracing::warn!(
                        user = %event.user,
                        usage = event.usage,
                        limit = event.limit,
                        "traffic quota exceeded, removing peer"
                    );
                    if let Err(e) = self.gate.remove(&event.peer).await {
                        tracing::error!(user = %event.user, "failed to block peer: {e}");
                        report.gate_failures.push((event.peer.clone(), e));
                    }
                }
            }
        }
        report.events = events;
        Ok(report)
    }
}
