//! Abstractions for fetching compact filter data from the network (HTTP or P2P),
//! and for connecting to peers from the watcher's startup parameters.
use async_trait::async_trait;
use bitcoin::BlockHash;

use crate::{config::ChainConfig, headers::HeaderSource};

/// A batch of per-block filter hashes returned by the source.
pub struct CfHeadersBatch {
    /// Height of the first entry in `headers`.
    pub start_height: u32,
    /// Consecutive filter hashes (32 bytes each), one per height.
    pub headers: Vec<[u8; 32]>,
}

/// Network provider for compact-filter sync.
#[async_trait]
pub trait FilterSource: Send + Sync {
    /// Fetch filter hashes starting at `start_h` and ending at the block `stop_hash`.
    async fn get_cfheaders(
        &self,
        start_h: u32,
        stop_hash: BlockHash,
    ) -> anyhow::Result<CfHeadersBatch>;

    /// Fetch the raw BIP-158 filter bytes for a given `block` hash.
    async fn get_cfilter(&self, block: BlockHash) -> anyhow::Result<Vec<u8>>;

    /// Fetch the raw consensus-encoded block bytes for `block`.
    async fn get_block(&self, block: BlockHash) -> anyhow::Result<Vec<u8>>;
}

/// Dials peers and hands back fresh sources. Called once per engine build,
/// so a rebuilt engine never inherits the connections of the one it replaces.
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    /// Filter/block provider.
    type Filters: FilterSource + 'static;
    /// Header provider.
    type Headers: HeaderSource + 'static;

    /// Connect using `cfg.peers`, dialing through `cfg.proxy` when set.
    async fn connect(&self, cfg: &ChainConfig) -> anyhow::Result<(Self::Filters, Self::Headers)>;
}
