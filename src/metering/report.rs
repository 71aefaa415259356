//! Plain-text renderings of usage data for operators.

use super::reader::{DayTraffic, PeerUsage};
use super::snapshot::PeerCounterSnapshot;
use super::PeerIdentity;
use std::collections::{BTreeMap, HashSet};

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Human-readable byte count with a 1024 base, e.g. `1.50 GB`.
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// One line per user: month-to-date usage, share of the limit, lifetime totals.
pub fn format_usage_report(usages: &[PeerUsage], limit_bytes: u64) -> String {
    if usages.is_empty() {
        return "No traffic data\n".to_string();
    }
    let mut out = String::new();
    out.push_str(&format!(
        "{:<20} {:>12} {:>7} {:>12} {:>12}\n",
        "USER", "MONTH", "LIMIT%", "RX TOTAL", "TX TOTAL"
    ));
    for usage in usages {
        let pct = if limit_bytes > 0 {
            format!("{:.0}%", usage.month_usage as f64 / limit_bytes as f64 * 100.0)
        } else {
            "-".to_string()
        };
        out.push_str(&format!(
            "{:<20} {:>12} {:>7} {:>12} {:>12}\n",
            usage.user,
            format_bytes(usage.month_usage),
            pct,
            format_bytes(usage.lifetime_rx),
            format_bytes(usage.lifetime_tx),
        ));
    }
    out
}

/// Daily totals followed by the per-user breakdown of each day.
pub fn format_history(history: &[DayTraffic]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let mut by_day: BTreeMap<_, Vec<&DayTraffic>> = BTreeMap::new();
    for entry in history {
        by_day.entry(entry.date).or_default().push(entry);
    }

    let mut out = String::new();
    for (date, entries) in by_day {
        let total: u64 = entries
            .iter()
            .map(|e| e.rx_bytes.saturating_add(e.tx_bytes))
            .sum();
        out.push_str(&format!("{date}  {}\n", format_bytes(total)));
        for entry in entries {
            out.push_str(&format!(
                "  {:<18} rx {:>10}  tx {:>10}\n",
                entry.user,
                format_bytes(entry.rx_bytes),
                format_bytes(entry.tx_bytes),
            ));
        }
    }
    out
}

/// Mapped peers missing from the live interface, i.e. removed by the gate.
pub fn blocked_peers<'a>(
    snapshots: &[PeerCounterSnapshot],
    identities: &'a [PeerIdentity],
) -> Vec<&'a PeerIdentity> {
    let live: HashSet<_> = snapshots.iter().map(|s| &s.peer_key).collect();
    identities
        .iter()
        .filter(|identity| !live.contains(&identity.key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering::PeerKey;
    use chrono::NaiveDate;

    #[test]
    fn bytes_are_scaled() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GB");
    }

    #[test]
    fn usage_report_shows_percentage() {
        let usages = [PeerUsage {
            peer: PeerKey::new("a"),
            user: "alice".into(),
            month_usage: 512,
            lifetime_rx: 2048,
            lifetime_tx: 0,
        }];
        let report = format_usage_report(&usages, 1024);
        assert!(report.contains("alice"));
        assert!(report.contains("50%"));
        assert!(format_usage_report(&usages, 0).contains(" - "));
    }

    #[test]
    fn usage_report_has_one_line_per_user() {
        let usages: Vec<PeerUsage> = ["alice", "bob"]
            .iter()
            .map(|user| PeerUsage {
                peer: PeerKey::new(format!("{user}=")),
                user: (*user).into(),
                month_usage: 0,
                lifetime_rx: 0,
                lifetime_tx: 0,
            })
            .collect();
        let report = format_usage_report(&usages, 1024);
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("USER"));
        assert!(lines[2].starts_with("bob"));
        assert!(report.ends_with('\n'));
    }

    #[test]
    fn history_groups_by_day() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();
        let history = [
            DayTraffic {
                date,
                peer: PeerKey::new("a"),
                user: "alice".into(),
                rx_bytes: 1024,
                tx_bytes: 0,
            },
            DayTraffic {
                date,
                peer: PeerKey::new("b"),
                user: "bob".into(),
                rx_bytes: 1024,
                tx_bytes: 0,
            },
        ];
        let text = format_history(&history);
        assert!(text.starts_with("2026-01-02  2.00 KB"));
        assert!(text.contains("bob"));
    }

    #[test]
    fn peers_absent_from_dump_are_blocked() {
        let identities = vec![
            PeerIdentity {
                key: PeerKey::new("a"),
                user: "alice".into(),
            },
            PeerIdentity {
                key: PeerKey::new("b"),
                user: "bob".into(),
            },
        ];
        let live = [PeerCounterSnapshot {
            peer_key: PeerKey::new("a"),
            endpoint: String::new(),
            allowed_ips: String::new(),
            last_handshake_epoch: 0,
            rx_bytes: 0,
            tx_bytes: 0,
        }];
        let blocked = blocked_peers(&live, &identities);
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].user, "bob");
    }
}
