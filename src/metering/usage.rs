//! Calendar-month usage derived from daily lifetime totals.

use super::store::DailyRollup;
use super::PeerKey;
use crate::error::Result;
use chrono::{Datelike, Months, NaiveDate};

/// Read access to the daily rollup history of a peer.
pub trait DailyRollups {
    /// Rows for `peer` with `from <= date <= to`, ascending by date.
    fn rollups_between(&self, peer: &PeerKey, from: NaiveDate, to: NaiveDate)
        -> Result<Vec<DailyRollup>>;

    /// The latest row for `peer` with `date < before`, if any.
    fn latest_rollup_before(&self, peer: &PeerKey, before: NaiveDate)
        -> Result<Option<DailyRollup>>;
}

/// First day of the month containing `date`.
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Last day of the month containing `date`.
pub fn month_end(date: NaiveDate) -> NaiveDate {
    let start = month_start(date);
    start
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(NaiveDate::MAX)
}

/// `YYYY-MM` key used by the alert ledger.
pub fn month_key(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

/// Bytes (rx + tx) a peer moved in the calendar month containing `reference`.
///
/// With no history before the month, the first in-month row is the zero
/// point unless it is the only row, in which case its whole lifetime total
/// counts.
pub fn usage_in_month<R>(rollups: &R, peer: &PeerKey, reference: NaiveDate) -> Result<u64>
where
    R: DailyRollups + ?Sized,
{
    let start = month_start(reference);
    let rows = rollups.rollups_between(peer, start, month_end(reference))?;
    let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
        return Ok(0);
    };
    let pre_month = rollups.latest_rollup_before(peer, start)?;

    let usage = match (&pre_month, rows.len()) {
        (Some(base), _) => last.total().saturating_sub(base.total()),
        (None, 1) => last.total(),
        (None, _) => last.total().saturating_sub(first.total()),
    };
    Ok(usage)
}
