use super::command;
use crate::error::{MeterError, Result};
use crate::metering::PeerKey;
use async_trait::async_trait;
use std::time::Duration;

/// Admission control on the live interface.
///
/// There is no per-peer re-admit: `resync_all` restores every peer from the
/// persisted interface configuration.
#[async_trait]
pub trait PeerGate: Send + Sync {
    /// Remove one peer from the live interface. Persisted config is untouched.
    async fn remove(&self, peer: &PeerKey) -> Result<()>;

    /// Re-admit every peer present in the persisted configuration.
    async fn resync_all(&self) -> Result<()>;
}

/// Gate backed by the `wg` / `wg-quick` tools on the local host.
pub struct WgPeerGate {
    interface: String,
    timeout: Duration,
}

impl WgPeerGate {
    pub fn new(interface: impl Into<String>, timeout: Duration) -> Self {
        Self {
            interface: interface.into(),
            timeout,
        }
    }
}

#[async_trait]
impl PeerGate for WgPeerGate {
    async fn remove(&self, peer: &PeerKey) -> Result<()> {
        command::run(
            "wg",
            &["set", &self.interface, "peer", peer.as_str(), "remove"],
            self.timeout,
        )
        .await
        .map(|_| ())
        .map_err(|message| MeterError::GateFailed {
            op: "remove",
            message,
        })
    }

    async fn resync_all(&self) -> Result<()> {
        let script = format!(
            "wg syncconf {iface} <(wg-quick strip {iface})",
            iface = self.interface
        );
        command::run("bash", &["-c", &script], self.timeout)
            .await
            .map(|_| ())
            .map_err(|message| MeterError::GateFailed {
                op: "resync_all",
                message,
            })
    }
}
