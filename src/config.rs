//! Startup parameters for a watcher and the engine it (re)builds.
use std::path::{Path, PathBuf};
use std::time::Duration;

use bitcoin::{BlockHash, Network};

use crate::checkpoints;

/// Well-known mainnet peers serving compact filters.
pub const MAINNET_PEERS: &[&str] = &[
    "btcd-mainnet.lightning.computer",
    "faucet.lightning.community",
    "mainnet1-btcd.zaphq.io",
    "mainnet2-btcd.zaphq.io",
    "mainnet3-btcd.zaphq.io",
    "mainnet4-btcd.zaphq.io",
];

/// Well-known testnet3 peers serving compact filters.
pub const TESTNET3_PEERS: &[&str] = &[
    "btcd-testnet.lightning.computer",
    "faucet.lightning.community",
    "testnet1-btcd.zaphq.io",
    "testnet2-btcd.zaphq.io",
    "testnet3-btcd.zaphq.io",
    "testnet4-btcd.zaphq.io",
];

/// File name of the key-value store inside the working directory.
pub const STORE_FILE: &str = "wallet.db";
/// Engine-owned subdirectory inside the working directory.
pub const DATA_DIR: &str = "data";

/// SOCKS proxy used to dial peers and resolve their names (e.g. a local Tor daemon).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyConfig {
    /// `host:port` of the SOCKS5 endpoint.
    pub socks: String,
    /// Use a fresh circuit per connection.
    pub stream_isolation: bool,
}

impl ProxyConfig {
    /// Tor-style proxy with stream isolation enabled.
    pub fn tor(socks: impl Into<String>) -> Self {
        Self {
            socks: socks.into(),
            stream_isolation: true,
        }
    }
}

/// When `wait_for_sync` treats a flat best height as a wedged engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StallPolicy {
    /// Rebuild the engine when sync stops making progress.
    pub enabled: bool,
    /// Consecutive polls with an unchanged best height before the first rebuild.
    /// Doubles after every stall rebuild.
    pub polls: u32,
    /// Upper bound on stall rebuilds over the watcher's lifetime.
    pub max_restarts: u32,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            polls: 1,
            max_restarts: 3,
        }
    }
}

impl StallPolicy {
    /// Never rebuild on stagnation.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Unchanged polls required before stall rebuild number `done + 1`.
    pub(crate) fn threshold(&self, done: u32) -> u32 {
        self.polls.max(1).saturating_mul(1u32 << done.min(16))
    }
}

/// Immutable startup parameters. Reused verbatim on every internal rebuild.
#[derive(Clone, Debug)]
pub struct WatcherConfig {
    /// Peers to connect to (host or host:port).
    pub peers: Vec<String>,
    /// Optional SOCKS proxy for dialing and name resolution.
    pub proxy: Option<ProxyConfig>,
    /// Network selector; addresses are decoded against it.
    pub network: Network,
    /// Working directory holding the store file and engine data.
    pub dir: PathBuf,
    /// Period of the `wait_for_sync` poll.
    pub poll_interval: Duration,
    /// Period of the engine's header / cfheader refresh.
    pub sync_interval: Duration,
    /// Idle poll and retry delay of a rescan session.
    pub rescan_interval: Duration,
    /// Stagnation handling in `wait_for_sync`.
    pub stall: StallPolicy,
    /// Rolling cfheader checkpoints `(height, rolling_cfheader)`.
    pub checkpoints: Vec<(u32, BlockHash)>,
}

impl WatcherConfig {
    /// Defaults for `network`, rooted at `dir`, using the built-in peer list.
    pub fn new(network: Network, dir: impl Into<PathBuf>) -> Self {
        Self {
            peers: Self::default_peers(network),
            proxy: None,
            network,
            dir: dir.into(),
            poll_interval: Duration::from_secs(10),
            sync_interval: Duration::from_secs(10),
            rescan_interval: Duration::from_secs(1),
            stall: StallPolicy::default(),
            checkpoints: checkpoints::for_network(network),
        }
    }

    /// Built-in peers for `network` (empty for regtest/signet).
    pub fn default_peers(network: Network) -> Vec<String> {
        let peers = match network {
            Network::Bitcoin => MAINNET_PEERS,
            Network::Testnet => TESTNET3_PEERS,
            _ => &[],
        };
        peers.iter().map(|p| p.to_string()).collect()
    }

    /// Replace the peer list.
    pub fn with_peers<I, P>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.peers = peers.into_iter().map(Into::into).collect();
        self
    }

    /// Dial through a SOCKS proxy.
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Set the `wait_for_sync` poll period.
    pub fn with_poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    /// Set the engine refresh period.
    pub fn with_sync_interval(mut self, d: Duration) -> Self {
        self.sync_interval = d;
        self
    }

    /// Set the rescan idle/retry period.
    pub fn with_rescan_interval(mut self, d: Duration) -> Self {
        self.rescan_interval = d;
        self
    }

    /// Set the stagnation policy.
    pub fn with_stall_policy(mut self, stall: StallPolicy) -> Self {
        self.stall = stall;
        self
    }

    /// Provide compact-filter header checkpoints.
    pub fn with_checkpoints(mut self, v: Vec<(u32, BlockHash)>) -> Self {
        self.checkpoints = v;
        self
    }

    /// Path of the key-value store file.
    pub fn store_path(&self) -> PathBuf {
        store_path(&self.dir)
    }

    /// Path of the engine data directory.
    pub fn data_dir(&self) -> PathBuf {
        data_dir(&self.dir)
    }

    /// Engine view of these parameters.
    pub fn chain_config(&self) -> ChainConfig {
        ChainConfig {
            network: self.network,
            peers: self.peers.clone(),
            proxy: self.proxy.clone(),
            data_dir: self.data_dir(),
            sync_interval: self.sync_interval,
            rescan_interval: self.rescan_interval,
            checkpoints: self.checkpoints.clone(),
        }
    }
}

/// What a [`ChainBackend`](crate::chain::ChainBackend) needs to build an engine.
#[derive(Clone, Debug)]
pub struct ChainConfig {
    /// Network selector.
    pub network: Network,
    /// Peers to connect to.
    pub peers: Vec<String>,
    /// Optional SOCKS proxy.
    pub proxy: Option<ProxyConfig>,
    /// Engine-owned data directory.
    pub data_dir: PathBuf,
    /// Header / cfheader refresh period.
    pub sync_interval: Duration,
    /// Rescan idle/retry period.
    pub rescan_interval: Duration,
    /// Rolling cfheader checkpoints.
    pub checkpoints: Vec<(u32, BlockHash)>,
}

pub(crate) fn store_path(dir: &Path) -> PathBuf {
    dir.join(STORE_FILE)
}

pub(crate) fn data_dir(dir: &Path) -> PathBuf {
    dir.join(DATA_DIR)
}
