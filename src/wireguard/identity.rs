use crate::error::{MeterError, Result};
use crate::metering::{PeerIdentity, PeerKey};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Maps peer keys to the users they were provisioned for.
///
/// Peers without a mapping are infrastructure and stay out of quota checks
/// and user-facing reports.
pub trait IdentityMap: Send + Sync {
    /// Every mapped peer, ordered by user name.
    fn peers(&self) -> Result<Vec<PeerIdentity>>;

    fn lookup(&self, key: &PeerKey) -> Result<Option<String>> {
        Ok(self
            .peers()?
            .into_iter()
            .find(|identity| &identity.key == key)
            .map(|identity| identity.user))
    }

    fn find_user(&self, user: &str) -> Result<PeerIdentity> {
        self.peers()?
            .into_iter()
            .find(|identity| identity.user == user)
            .ok_or_else(|| MeterError::PeerNotFound(user.to_string()))
    }
}

/// Fixed key → user table, typically from the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentities {
    by_key: BTreeMap<PeerKey, String>,
}

impl StaticIdentities {
    pub fn new(entries: impl IntoIterator<Item = (PeerKey, String)>) -> Self {
        Self {
            by_key: entries.into_iter().collect(),
        }
    }
}

impl IdentityMap for StaticIdentities {
    fn peers(&self) -> Result<Vec<PeerIdentity>> {
        let mut peers: Vec<PeerIdentity> = self
            .by_key
            .iter()
            .map(|(key, user)| PeerIdentity {
                key: key.clone(),
                user: user.clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.user.cmp(&b.user));
        Ok(peers)
    }

    fn lookup(&self, key: &PeerKey) -> Result<Option<String>> {
        Ok(self.by_key.get(key).cloned())
    }
}

/// Reads `<clients_dir>/<user>/publickey` as laid out by provisioning.
#[derive(Debug, Clone)]
pub struct ClientDirIdentities {
    dir: PathBuf,
}

impl ClientDirIdentities {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl IdentityMap for ClientDirIdentities {
    fn peers(&self) -> Result<Vec<PeerIdentity>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut peers = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let key_file = entry.path().join("publickey");
            let key = match std::fs::read_to_string(&key_file) {
                Ok(contents) => contents.trim().to_string(),
                Err(e) => {
                    tracing::debug!(path = %key_file.display(), "no public key: {e}");
                    continue;
                }
            };
            if key.is_empty() {
                continue;
            }
            peers.push(PeerIdentity {
                key: PeerKey::new(key),
                user: entry.file_name().to_string_lossy().into_owned(),
            });
        }
        peers.sort_by(|a, b| a.user.cmp(&b.user));
        Ok(peers)
    }
}

/// Static entries layered over a clients directory; static names win.
pub struct LayeredIdentities {
    overrides: StaticIdentities,
    base: ClientDirIdentities,
}

impl LayeredIdentities {
    pub fn new(overrides: StaticIdentities, base: ClientDirIdentities) -> Self {
        Self { overrides, base }
    }
}

impl IdentityMap for LayeredIdentities {
    fn peers(&self) -> Result<Vec<PeerIdentity>> {
        let mut merged: BTreeMap<PeerKey, String> = self
            .base
            .peers()?
            .into_iter()
            .map(|identity| (identity.key, identity.user))
            .collect();
        for identity in self.overrides.peers()? {
            merged.insert(identity.key, identity.user);
        }
        StaticIdentities::new(merged).peers()
    }
}
