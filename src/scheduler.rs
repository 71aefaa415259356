use crate::context::MeterContext;
use crate::metering::month_key;
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

/// Decides when the monthly reset is due: on the 1st, at or after the
/// configured hour. Avoids re-asking the store within one process; the
/// durable once-per-month record lives in `monthly_resets`.
#[derive(Debug, Default)]
pub struct ResetTracker {
    last_month: Option<String>,
}

impl ResetTracker {
    pub fn is_due(&self, now: DateTime<Utc>, reset_hour: u32) -> bool {
        now.day() == 1
            && now.hour() >= reset_hour
            && self.last_month.as_deref() != Some(month_key(now.date_naive()).as_str())
    }

    pub fn mark_done(&mut self, now: DateTime<Utc>) {
        self.last_month = Some(month_key(now.date_naive()));
    }
}

/// Run the metering and monthly-reset jobs until `shutdown` resolves.
///
/// Both jobs run on this single task, so a reset never overlaps a metering
/// cycle. Failures are logged and retried on the next tick.
pub async fn run_scheduler(ctx: Arc<MeterContext>, shutdown: impl Future<Output = ()>) {
    let schedule = ctx.config().schedule.clone();
    let mut snapshot_tick = interval_at(
        Instant::now() + schedule.first_delay(),
        schedule.snapshot_interval(),
    );
    snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reset_tick = interval(schedule.reset_check_interval());
    reset_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut resets = ResetTracker::default();

    tracing::info!(
        interval_secs = schedule.snapshot_interval_secs,
        first_delay_secs = schedule.first_delay_secs,
        "traffic snapshot scheduled"
    );

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => {
                tracing::info!("scheduler stopping");
                break;
            }
            _ = snapshot_tick.tick() => {
                let today = Utc::now().date_naive();
                if let Err(e) = ctx.run_metering_cycle(today).await {
                    tracing::warn!("metering cycle skipped: {e}");
                }
            }
            _ = reset_tick.tick() => {
                let now = Utc::now();
                if !resets.is_due(now, schedule.reset_hour_utc) {
                    continue;
                }
                match ctx.run_monthly_reset(now.date_naive()).await {
                    Ok(_) => resets.mark_done(now),
                    Err(e) => tracing::error!("monthly reset failed: {e}"),
                }
            }
        }
    }
}
