//! Roster of known identities, their stake and their network addresses.
//!
//! The relay only reads the roster. `RosterMembership` is the shipped
//! adapter: it holds an immutable snapshot that can be swapped out
//! wholesale, either directly or by reloading a TOML roster file.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use vrelay_crypto::{Identity, IdentityError, SignerSet};

use crate::maintenance::PeriodicTask;

/// A peer validator reachable for gossip.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub identity: Identity,
    pub address: Option<SocketAddr>,
}

impl Peer {
    /// The address, unless it is missing, unspecified or port 0.
    pub fn usable_address(&self) -> Option<SocketAddr> {
        self.address
            .filter(|addr| !addr.ip().is_unspecified() && addr.port() != 0)
    }
}

/// Point-in-time view of the network membership.
///
/// Implementations may refresh underneath; each call returns whatever is
/// current at that moment.
pub trait MembershipSnapshot: Send + Sync {
    /// Every known identity with its stake weight.
    fn list_identities(&self) -> HashMap<Identity, f64>;

    /// The identity this node signs with.
    fn self_identity(&self) -> Identity;

    /// Identities exempt from rate limiting and allowed to gossip.
    fn is_privileged(&self, identity: &Identity) -> bool;

    /// Validators this node relays accepted submissions to.
    fn peers(&self) -> Vec<Peer>;

    fn stake_of(&self, identity: &Identity) -> Option<f64> {
        self.list_identities().get(identity).copied()
    }

    fn contains(&self, identity: &Identity) -> bool {
        self.stake_of(identity).is_some()
    }
}

impl<'a> SignerSet for dyn MembershipSnapshot + 'a {
    fn contains_signer(&self, identity: &Identity) -> bool {
        self.contains(identity)
    }
}

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid identity {identity:?}: {source}")]
    InvalidIdentity {
        identity: String,
        source: IdentityError,
    },
    #[error("invalid address {address:?} for {identity}")]
    InvalidAddress { identity: String, address: String },
}

/// Roster file entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    pub identity: String,
    #[serde(default)]
    pub stake: f64,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RosterFile {
    #[serde(default)]
    pub members: Vec<RosterEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub stake: f64,
    pub privileged: bool,
    pub address: Option<SocketAddr>,
}

/// Validated roster keyed by identity.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    members: HashMap<Identity, Member>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identity: Identity, member: Member) {
        self.members.insert(identity, member);
    }

    pub fn with_member(mut self, identity: Identity, member: Member) -> Self {
        self.insert(identity, member);
        self
    }

    pub fn get(&self, identity: &Identity) -> Option<&Member> {
        self.members.get(identity)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn from_file_contents(file: RosterFile) -> Result<Self, RosterError> {
        let mut roster = Self::new();
        for entry in file.members {
            let identity =
                Identity::parse(&entry.identity).map_err(|source| RosterError::InvalidIdentity {
                    identity: entry.identity.clone(),
                    source,
                })?;
            let address = entry
                .address
                .as_deref()
                .map(|a| {
                    a.parse::<SocketAddr>()
                        .map_err(|_| RosterError::InvalidAddress {
                            identity: entry.identity.clone(),
                            address: a.to_string(),
                        })
                })
                .transpose()?;
            roster.insert(
                identity,
                Member {
                    stake: entry.stake,
                    privileged: entry.privileged,
                    address,
                },
            );
        }
        Ok(roster)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, RosterError> {
        Self::from_file_contents(toml::from_str(content)?)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, RosterError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }
}

/// In-memory membership snapshot over a swappable roster.
pub struct RosterMembership {
    self_identity: Identity,
    roster: RwLock<Arc<Roster>>,
}

impl RosterMembership {
    pub fn new(self_identity: Identity, roster: Roster) -> Self {
        Self {
            self_identity,
            roster: RwLock::new(Arc::new(roster)),
        }
    }

    /// Swap in a new roster. Readers holding the old snapshot keep it.
    pub fn replace(&self, roster: Roster) {
        *self.roster.write() = Arc::new(roster);
    }

    pub fn snapshot(&self) -> Arc<Roster> {
        self.roster.read().clone()
    }

    /// Read `path` and swap it in. On error the current roster is kept.
    pub async fn reload(&self, path: &Path) -> Result<usize, RosterError> {
        let content = tokio::fs::read_to_string(path).await?;
        let roster = Roster::from_toml_str(&content)?;
        let members = roster.len();
        self.replace(roster);
        Ok(members)
    }

    /// Reload `path` every `period`. A failed reload keeps the previous roster.
    pub fn spawn_refresh(self: &Arc<Self>, path: PathBuf, period: Duration) -> PeriodicTask {
        let membership = Arc::clone(self);
        PeriodicTask::spawn("roster-refresh", period, move || {
            let membership = Arc::clone(&membership);
            let path = path.clone();
            async move {
                match membership.reload(&path).await {
                    Ok(members) => info!("Roster refreshed: {} members", members),
                    Err(e) => warn!("Roster refresh from {} failed: {}", path.display(), e),
                }
            }
        })
    }
}

impl MembershipSnapshot for RosterMembership {
    fn list_identities(&self) -> HashMap<Identity, f64> {
        self.snapshot()
            .members
            .iter()
            .map(|(id, m)| (id.clone(), m.stake))
            .collect()
    }

    fn self_identity(&self) -> Identity {
        self.self_identity.clone()
    }

    fn is_privileged(&self, identity: &Identity) -> bool {
        self.snapshot()
            .get(identity)
            .is_some_and(|m| m.privileged)
    }

    fn peers(&self) -> Vec<Peer> {
        self.snapshot()
            .members
            .iter()
            .filter(|(_, m)| m.privileged)
            .map(|(id, m)| Peer {
                identity: id.clone(),
                address: m.address,
            })
            .collect()
    }

    fn stake_of(&self, identity: &Identity) -> Option<f64> {
        self.snapshot().get(identity).map(|m| m.stake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vrelay_crypto::Keypair;

    fn member(stake: f64, privileged: bool, address: Option<&str>) -> Member {
        Member {
            stake,
            privileged,
            address: address.map(|a| a.parse().unwrap()),
        }
    }

    #[test]
    fn test_peer_usable_address() {
        let id = Keypair::generate().identity().clone();
        let peer = |addr: Option<&str>| Peer {
            identity: id.clone(),
            address: addr.map(|a| a.parse().unwrap()),
        };
        assert!(peer(Some("10.0.0.2:8091")).usable_address().is_some());
        assert!(peer(Some("0.0.0.0:8091")).usable_address().is_none());
        assert!(peer(Some("10.0.0.2:0")).usable_address().is_none());
        assert!(peer(None).usable_address().is_none());
    }

    #[test]
    fn test_snapshot_queries() {
        let me = Keypair::generate().identity().clone();
        let validator = Keypair::generate().identity().clone();
        let miner = Keypair::generate().identity().clone();
        let roster = Roster::new()
            .with_member(me.clone(), member(5000.0, true, Some("10.0.0.1:8091")))
            .with_member(validator.clone(), member(9000.0, true, Some("10.0.0.2:8091")))
            .with_member(miner.clone(), member(12.5, false, None));
        let membership = RosterMembership::new(me.clone(), roster);

        assert_eq!(membership.self_identity(), me);
        assert_eq!(membership.stake_of(&miner), Some(12.5));
        assert!(membership.contains(&validator));
        assert!(membership.is_privileged(&validator));
        assert!(!membership.is_privileged(&miner));
        assert_eq!(membership.list_identities().len(), 3);

        // peers are validator-class members; self is filtered by the broadcaster
        let mut peers: Vec<_> = membership.peers().into_iter().map(|p| p.identity).collect();
        peers.sort();
        let mut expected = vec![me, validator];
        expected.sort();
        assert_eq!(peers, expected);
    }

    #[test]
    fn test_replace_swaps_snapshot() {
        let me = Keypair::generate().identity().clone();
        let miner = Keypair::generate().identity().clone();
        let membership = RosterMembership::new(me, Roster::new());
        assert!(!membership.contains(&miner));

        membership.replace(Roster::new().with_member(miner.clone(), member(1.0, false, None)));
        assert!(membership.contains(&miner));
    }

    #[test]
    fn test_roster_from_toml_file() {
        let a = Keypair::generate().identity().clone();
        let b = Keypair::generate().identity().clone();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[members]]
identity = "{a}"
stake = 1500.0
privileged = true
address = "10.0.0.7:8091"

[[members]]
identity = "{b}"
"#
        )
        .unwrap();

        let roster = Roster::from_toml_file(file.path()).unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.get(&a), Some(&member(1500.0, true, Some("10.0.0.7:8091"))));
        assert_eq!(roster.get(&b), Some(&member(0.0, false, None)));
    }

    #[test]
    fn test_roster_rejects_bad_entries() {
        let bad_identity = "[[members]]\nidentity = \"nothex\"\n";
        assert!(matches!(
            Roster::from_toml_str(bad_identity),
            Err(RosterError::InvalidIdentity { .. })
        ));

        let id = Keypair::generate().identity().clone();
        let bad_address = format!("[[members]]\nidentity = \"{id}\"\naddress = \"nowhere\"\n");
        assert!(matches!(
            Roster::from_toml_str(&bad_address),
            Err(RosterError::InvalidAddress { .. })
        ));
    }

    fn roster_toml(members: &[&Identity]) -> String {
        members
            .iter()
            .map(|id| format!("[[members]]\nidentity = \"{id}\"\nstake = 10.0\n\n"))
            .collect()
    }

    #[tokio::test]
    async fn test_reload_keeps_roster_on_error() {
        let me = Keypair::generate().identity().clone();
        let miner = Keypair::generate().identity().clone();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.toml");
        let membership = RosterMembership::new(me.clone(), Roster::new());

        std::fs::write(&path, roster_toml(&[&me, &miner])).unwrap();
        assert_eq!(membership.reload(&path).await.unwrap(), 2);
        assert!(membership.contains(&miner));

        std::fs::write(&path, "[[members]\nidentity = ").unwrap();
        assert!(matches!(membership.reload(&path).await, Err(RosterError::Toml(_))));
        assert!(matches!(
            membership.reload(&dir.path().join("gone.toml")).await,
            Err(RosterError::Io(_))
        ));
        assert_eq!(membership.snapshot().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_task_follows_file_and_survives_corruption() {
        let me = Keypair::generate().identity().clone();
        let miner = Keypair::generate().identity().clone();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.toml");
        std::fs::write(&path, roster_toml(&[&me])).unwrap();

        let period = Duration::from_secs(60);
        let membership = Arc::new(RosterMembership::new(me.clone(), Roster::new()));
        let task = membership.spawn_refresh(path.clone(), period);

        std::fs::write(&path, roster_toml(&[&me, &miner])).unwrap();
        for _ in 0..20 {
            if membership.contains(&miner) {
                break;
            }
            tokio::time::sleep(period).await;
        }
        assert!(membership.contains(&miner));

        std::fs::write(&path, "not a roster [").unwrap();
        tokio::time::sleep(period * 3).await;
        assert_eq!(membership.snapshot().len(), 2);
        assert!(membership.contains(&miner));

        task.stop().await;
    }

    #[test]
    fn test_snapshot_as_signer_set() {
        let me = Keypair::generate().identity().clone();
        let miner = Keypair::generate().identity().clone();
        let membership: Arc<dyn MembershipSnapshot> = Arc::new(RosterMembership::new(
            me.clone(),
            Roster::new().with_member(miner.clone(), member(0.0, false, None)),
        ));
        assert!(membership.contains_signer(&miner));
        assert!(!membership.contains_signer(&me));
    }
}
