//! Parser for `wg show <iface> dump` output.
//!
//! The first line describes the interface itself and is skipped. Every other
//! line is one peer:
//!
//! ```text
//! public-key  preshared-key  endpoint  allowed-ips  latest-handshake  rx  tx  keepalive
//! ```

use super::PeerKey;

const MIN_FIELDS: usize = 8;
const NO_ENDPOINT: &str = "(none)";

/// Counters for one peer as read from the live interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCounterSnapshot {
    pub peer_key: PeerKey,
    pub endpoint: String,
    pub allowed_ips: String,
    pub last_handshake_epoch: i64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Outcome of parsing a single dump line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Peer(PeerCounterSnapshot),
    Skip(&'static str),
}

/// Parse one peer line. Never fails: bad input yields `ParsedLine::Skip`.
pub fn parse_line(line: &str) -> ParsedLine {
    if line.trim().is_empty() {
        return ParsedLine::Skip("blank line");
    }
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < MIN_FIELDS {
        return ParsedLine::Skip("too few fields");
    }

    let Ok(last_handshake_epoch) = fields[4].trim().parse::<i64>() else {
        return ParsedLine::Skip("bad handshake timestamp");
    };
    let Ok(rx_bytes) = fields[5].trim().parse::<u64>() else {
        return ParsedLine::Skip("bad rx counter");
    };
    let Ok(tx_bytes) = fields[6].trim().parse::<u64>() else {
        return ParsedLine::Skip("bad tx counter");
    };

    let endpoint = match fields[2] {
        NO_ENDPOINT => String::new(),
        other => other.to_string(),
    };

    ParsedLine::Peer(PeerCounterSnapshot {
        peer_key: PeerKey::new(fields[0]),
        endpoint,
        allowed_ips: fields[3].to_string(),
        last_handshake_epoch,
        rx_bytes,
        tx_bytes,
    })
}

/// Parse a full dump, dropping the header and any malformed lines.
pub fn parse_dump(dump: &str) -> Vec<PeerCounterSnapshot> {
    dump.lines()
        .skip(1)
        .filter_map(|line| match parse_line(line) {
            ParsedLine::Peer(snapshot) => Some(snapshot),
            ParsedLine::Skip(reason) => {
                tracing::debug!(reason, "skipping dump line");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "cHJpdmF0ZQ==\tcHVibGlj\t51820\toff";

    #[test]
    fn parses_well_formed_peer_line() {
        let line = "peerA=\t(none)\t203.0.113.5:51820\t10.20.30.11/32\t1767225600\t1024\t2048\t25";
        match parse_line(line) {
            ParsedLine::Peer(s) => {
                assert_eq!(s.peer_key.as_str(), "peerA=");
                assert_eq!(s.endpoint, "203.0.113.5:51820");
                assert_eq!(s.allowed_ips, "10.20.30.11/32");
                assert_eq!(s.last_handshake_epoch, 1_767_225_600);
                assert_eq!(s.rx_bytes, 1024);
                assert_eq!(s.tx_bytes, 2048);
            }
            ParsedLine::Skip(reason) => panic!("unexpected skip: {reason}"),
        }
    }

    #[test]
    fn none_endpoint_becomes_empty() {
        let line = "peerB=\t(none)\t(none)\t10.20.30.12/32\t0\t0\t0\toff";
        let ParsedLine::Peer(s) = parse_line(line) else {
            panic!("expected peer");
        };
        assert!(s.endpoint.is_empty());
    }

    #[test]
    fn short_line_is_dropped_and_batch_continues() {
        let dump = format!(
            "{HEADER}\n\
             peerA=\t(none)\t198.51.100.1:4000\t10.20.30.11/32\t1700000000\t500\t600\t25\n\
             peerB=\t(none)\t(none)\t10.20.30.12/32\t0\n"
        );
        let parsed = parse_dump(&dump);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].peer_key.as_str(), "peerA=");
    }

    #[test]
    fn header_is_never_parsed_as_peer() {
        let dump = "a\tb\tc\td\t1\t2\t3\t4\n";
        assert!(parse_dump(dump).is_empty());
    }

    #[test]
    fn non_numeric_counters_are_skipped() {
        let line = "peerC=\t(none)\t(none)\t10.0.0.3/32\t0\tlots\t0\toff";
        assert_eq!(parse_line(line), ParsedLine::Skip("bad rx counter"));
    }

    #[test]
    fn extra_fields_are_ignored() {
        let line = "peerD=\t(none)\t(none)\t10.0.0.4/32\t0\t7\t9\toff\textra\tmore";
        let ParsedLine::Peer(s) = parse_line(line) else {
            panic!("expected peer");
        };
        assert_eq!((s.rx_bytes, s.tx_bytes), (7, 9));
    }
}
