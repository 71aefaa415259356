//! Reset-tolerant per-peer WireGuard traffic metering with monthly quotas.
//!
//! Interface counters drop to zero whenever the interface is recreated.
//! [`metering`] folds them into a durable lifetime ledger, derives
//! calendar-month usage, and enforces quotas through a [`wireguard::PeerGate`].

pub mod config;
pub mod context;
pub mod error;
pub mod metering;
pub mod scheduler;
pub mod wireguard;

pub use config::Config;
pub use context::{CycleOutcome, MeterContext};
pub use error::{MeterError, Result};
