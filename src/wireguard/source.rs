use super::command;
use crate::error::{MeterError, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Where raw per-peer counter dumps come from.
#[async_trait]
pub trait CounterSource: Send + Sync {
    /// Fetch the full dump text. Any failure is `MeterError::SourceUnavailable`.
    async fn fetch_dump(&self) -> Result<String>;
}

/// Reads counters from the local interface with `wg show <iface> dump`.
pub struct WgDumpSource {
    interface: String,
    timeout: Duration,
}

impl WgDumpSource {
    pub fn new(interface: impl Into<String>, timeout: Duration) -> Self {
        Self {
            interface: interface.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CounterSource for WgDumpSource {
    async fn fetch_dump(&self) -> Result<String> {
        command::run("wg", &["show", &self.interface, "dump"], self.timeout)
            .await
            .map_err(MeterError::SourceUnavailable)
    }
}
