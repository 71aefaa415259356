//! Process-wide handle passed explicitly to every scheduled job.

use crate::config::Config;
use crate::error::Result;
use crate::metering::quota::{EnforcementReport, QuotaEnforcer};
use crate::metering::report;
use crate::metering::{
    month_key, parse_dump, MeterWriter, PeerIdentity, ReconcileSummary, UsageReader,
};
use crate::wireguard::{
    ClientDirIdentities, CounterSource, IdentityMap, LayeredIdentities, PeerGate, StaticIdentities,
    WgDumpSource, WgPeerGate,
};
use chrono::{Datelike, NaiveDate};
use std::sync::Arc;

/// Outcome of one metering cycle.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub reconcile: ReconcileSummary,
    pub enforcement: EnforcementReport,
}

/// Everything a job needs: configuration, the store writer and the external
/// collaborators. Built once at startup and shut down once at exit.
pub struct MeterContext {
    config: Config,
    writer: Arc<MeterWriter>,
    source: Arc<dyn CounterSource>,
    gate: Arc<dyn PeerGate>,
    identities: Arc<dyn IdentityMap>,
    enforcer: QuotaEnforcer,
}

impl MeterContext {
    pub fn new(
        config: Config,
        writer: Arc<MeterWriter>,
        source: Arc<dyn CounterSource>,
        gate: Arc<dyn PeerGate>,
        identities: Arc<dyn IdentityMap>,
    ) -> Self {
        let enforcer = QuotaEnforcer::new(
            config.quota.clone(),
            writer.clone(),
            gate.clone(),
            identities.clone(),
        );
        Self {
            config,
            writer,
            source,
            gate,
            identities,
            enforcer,
        }
    }

    /// Wire up the local `wg` tools, the clients directory and the on-disk store.
    pub fn from_config(config: Config) -> Result<Self> {
        let db_path = config.storage.resolved_db_path()?;
        let writer = Arc::new(MeterWriter::open(&db_path, config.storage.writer_queue)?);
        let timeout = config.wireguard.command_timeout();
        let source = Arc::new(WgDumpSource::new(&config.wireguard.interface, timeout));
        let gate = Arc::new(WgPeerGate::new(&config.wireguard.interface, timeout));
        let identities = Arc::new(LayeredIdentities::new(
            StaticIdentities::new(config.static_identities()),
            ClientDirIdentities::new(&config.wireguard.clients_dir),
        ));
        Ok(Self::new(config, writer, source, gate, identities))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identities(&self) -> &dyn IdentityMap {
        self.identities.as_ref()
    }

    /// A fresh read-only connection for reporting paths.
    pub fn reader(&self) -> Result<UsageReader> {
        UsageReader::open(self.writer.db_path())
    }

    /// Fetch counters, fold them into the ledger, then enforce quotas.
    ///
    /// A failed fetch returns `SourceUnavailable` before anything is written.
    pub async fn run_metering_cycle(&self, today: NaiveDate) -> Result<CycleOutcome> {
        let dump = self.source.fetch_dump().await?;
        let snapshots = parse_dump(&dump);
        let reconcile = self.writer.reconcile(snapshots, today).await?;
        let enforcement = self.enforcer.check_limits(today).await?;

        tracing::info!(
            peers = reconcile.peers,
            resets = reconcile.resets,
            events = enforcement.events.len(),
            gate_failures = enforcement.gate_failures.len(),
            "metering cycle complete"
        );
        Ok(CycleOutcome {
            reconcile,
            enforcement,
        })
    }

    /// On the 1st of a month, re-admit every configured peer and drop alert
    /// markers of earlier months. Returns whether the reset ran.
    ///
    /// Completion is recorded in the store, so a restart later on the 1st
    /// does not re-admit peers blocked since the reset.
    pub async fn run_monthly_reset(&self, today: NaiveDate) -> Result<bool> {
        if today.day() != 1 {
            return Ok(false);
        }
        let month = month_key(today);
        if self.writer.reset_completed(month.clone()).await? {
            tracing::debug!(month = %month, "monthly reset already done");
            return Ok(false);
        }
        self.gate.resync_all().await?;
        let pruned = self.writer.complete_reset(month.clone()).await?;
        tracing::info!(month = %month, pruned, "monthly reset: all peers re-enabled");
        Ok(true)
    }

    /// Mapped peers currently missing from the live interface.
    pub async fn blocked_peers(&self) -> Result<Vec<PeerIdentity>> {
        let snapshots = parse_dump(&self.source.fetch_dump().await?);
        let identities = self.identities.peers()?;
        Ok(report::blocked_peers(&snapshots, &identities)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Operator block of one user's peer.
    pub async fn block_user(&self, user: &str) -> Result<PeerIdentity> {
        let identity = self.identities.find_user(user)?;
        self.gate.remove(&identity.key).await?;
        tracing::info!(user, "peer blocked by operator");
        Ok(identity)
    }

    /// Re-admit every configured peer. There is no per-peer unblock, so this
    /// also lifts every other quota block for the rest of the month.
    pub async fn unblock_all(&self) -> Result<()> {
        self.gate.resync_all().await?;
        tracing::warn!("all peers re-admitted; quota blocks for this month are lifted");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.writer.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeterError;
    use crate::metering::PeerKey;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    struct FailingSource;

    #[async_trait]
    impl CounterSource for FailingSource {
        async fn fetch_dump(&self) -> Result<String> {
            Err(MeterError::SourceUnavailable("wg: timed out".into()))
        }
    }

    #[derive(Default)]
    struct RecordingGate {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerGate for RecordingGate {
        async fn remove(&self, peer: &PeerKey) -> Result<()> {
            self.calls.lock().push(format!("remove {peer}"));
            Ok(())
        }

        async fn resync_all(&self) -> Result<()> {
            self.calls.lock().push("resync".into());
            Ok(())
        }
    }

    fn context(tmp: &TempDir, gate: Arc<RecordingGate>) -> MeterContext {
        let writer = Arc::new(MeterWriter::open(&tmp.path().join("traffic.db"), 8).unwrap());
        let identities = Arc::new(StaticIdentities::new([(
            PeerKey::new("keyA="),
            "alice".to_string(),
        )]));
        MeterContext::new(
            Config::default(),
            writer,
            Arc::new(FailingSource),
            gate,
            identities,
        )
    }

    fn day(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, m, d).unwrap()
    }

    #[tokio::test]
    async fn unavailable_source_aborts_cycle_without_writes() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp, Arc::new(RecordingGate::default()));
        let err = ctx.run_metering_cycle(day(1, 5)).await.unwrap_err();
        assert!(matches!(err, MeterError::SourceUnavailable(_)));
        let reader = ctx.reader().unwrap();
        assert!(reader.counter(&PeerKey::new("keyA=")).unwrap().is_none());
    }

    #[tokio::test]
    async fn monthly_reset_only_runs_on_the_first() {
        let tmp = TempDir::new().unwrap();
        let gate = Arc::new(RecordingGate::default());
        let ctx = context(&tmp, gate.clone());
        assert!(!ctx.run_monthly_reset(day(3, 2)).await.unwrap());
        assert!(gate.calls.lock().is_empty());
        assert!(ctx.run_monthly_reset(day(3, 1)).await.unwrap());
        assert_eq!(*gate.calls.lock(), vec!["resync".to_string()]);
        assert!(!ctx.run_monthly_reset(day(3, 1)).await.unwrap());
        assert_eq!(gate.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_resync_leaves_reset_pending() {
        struct BrokenGate;

        #[async_trait]
        impl PeerGate for BrokenGate {
            async fn remove(&self, _peer: &PeerKey) -> Result<()> {
                Ok(())
            }

            async fn resync_all(&self) -> Result<()> {
                Err(MeterError::GateFailed {
                    op: "resync_all",
                    message: "wg-quick: not found".into(),
                })
            }
        }

        let tmp = TempDir::new().unwrap();
        let writer = Arc::new(MeterWriter::open(&tmp.path().join("traffic.db"), 8).unwrap());
        let ctx = MeterContext::new(
            Config::default(),
            writer.clone(),
            Arc::new(FailingSource),
            Arc::new(BrokenGate),
            Arc::new(StaticIdentities::default()),
        );
        assert!(ctx.run_monthly_reset(day(4, 1)).await.is_err());
        assert!(!writer.reset_completed("2026-04".into()).await.unwrap());
    }

    #[tokio::test]
    async fn block_user_resolves_identity() {
        let tmp = TempDir::new().unwrap();
        let gate = Arc::new(RecordingGate::default());
        let ctx = context(&tmp, gate.clone());
        ctx.block_user("alice").await.unwrap();
        assert_eq!(*gate.calls.lock(), vec!["remove keyA=".to_string()]);
        assert!(matches!(
            ctx.block_user("mallory").await,
            Err(MeterError::PeerNotFound(_))
        ));
    }
}
