// DDL constants for the traffic metering database.

pub const PEER_COUNTERS_DDL: &str = "\
CREATE TABLE IF NOT EXISTS peer_counters (
    peer_key      TEXT    PRIMARY KEY,
    baseline_rx   INTEGER NOT NULL DEFAULT 0,
    baseline_tx   INTEGER NOT NULL DEFAULT 0,
    last_seen_rx  INTEGER NOT NULL DEFAULT 0,
    last_seen_tx  INTEGER NOT NULL DEFAULT 0,
    updated_at    TEXT    NOT NULL
);
";

pub const DAILY_ROLLUPS_DDL: &str = "\
CREATE TABLE IF NOT EXISTS daily_rollups (
    peer_key  TEXT    NOT NULL,
    date      TEXT    NOT NULL,
    rx_bytes  INTEGER NOT NULL,
    tx_bytes  INTEGER NOT NULL,
    PRIMARY KEY (peer_key, date)
);
CREATE INDEX IF NOT EXISTS idx_dr_date ON daily_rollups(date);
";

pub const QUOTA_ALERTS_DDL: &str = "\
CREATE TABLE IF NOT EXISTS quota_alerts (
    peer_key    TEXT    NOT NULL,
    month       TEXT    NOT NULL,
    threshold   INTEGER NOT NULL,
    alerted_at  TEXT    NOT NULL,
    PRIMARY KEY (peer_key, month, threshold)
);
";

pub const MONTHLY_RESETS_DDL: &str = "\
CREATE TABLE IF NOT EXISTS monthly_resets (
    month     TEXT PRIMARY KEY,
    reset_at  TEXT NOT NULL
);
";

pub const PRAGMAS: &str = "\
PRAGMA journal_mode = WAL;
PRAGMA synchronous  = NORMAL;
PRAGMA busy_timeout = 5000;
PRAGMA temp_store   = MEMORY;
";
