//! Capability interface the watcher consumes from a chain sync engine.
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{Address, Block, BlockHash};
use tokio::sync::mpsc;

use crate::{config::ChainConfig, hooks::BlockHandler, store::SqliteStore};

/// Error-message fragments of the filter retrieval defect. A session error
/// carrying one of these leaves the local filter index unusable; only a full
/// rebuild of the engine state recovers from it.
pub const FILTER_DEFECT_SIGNATURES: &[&str] =
    &["unable to fetch cfilter", "failed to fetch compact filter"];

/// Whether `err` (or anything in its cause chain) is the filter retrieval defect.
pub fn is_filter_defect(err: &anyhow::Error) -> bool {
    let rendered = format!("{err:#}");
    FILTER_DEFECT_SIGNATURES
        .iter()
        .any(|sig| rendered.contains(sig))
}

/// A point on the best chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockStamp {
    /// Block height.
    pub height: u32,
    /// Block hash.
    pub hash: BlockHash,
}

/// Asynchronous error stream of a running rescan. Closed when the session ends.
pub type RescanErrors = mpsc::UnboundedReceiver<anyhow::Error>;

/// Light client maintaining a local best-chain view.
#[async_trait]
pub trait ChainService: Send + Sync + 'static {
    /// Session type produced by [`ChainService::new_rescan`].
    type Rescan: RescanSession;

    /// Begin syncing in the background.
    async fn start(&self) -> anyhow::Result<()>;

    /// Halt background work and wait for it.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Whether the local view has caught up with the peers.
    async fn is_current(&self) -> bool;

    /// Best block of the local view.
    async fn best_block(&self) -> anyhow::Result<BlockStamp>;

    /// Hash of the best-chain block at `height`.
    async fn block_hash(&self, height: u32) -> anyhow::Result<BlockHash>;

    /// Full block by hash.
    async fn block(&self, hash: BlockHash) -> anyhow::Result<Block>;

    /// Build (but do not start) a session matching `addresses` from `start_height`.
    fn new_rescan(
        &self,
        start_height: u32,
        addresses: Vec<Address>,
        handler: Arc<dyn BlockHandler>,
    ) -> Self::Rescan;
}

/// Live subscription matching an address set against historical and new blocks.
#[async_trait]
pub trait RescanSession: Send + Sync + 'static {
    /// Start matching. Returns the session's error stream. Fails if already started.
    fn start(&self) -> anyhow::Result<RescanErrors>;

    /// Add addresses to the watched set.
    async fn update(&self, addresses: Vec<Address>) -> anyhow::Result<()>;

    /// Signal the session to quit.
    fn stop(&self);

    /// Wait until the session has fully drained.
    async fn wait_for_shutdown(&self);
}

/// Builds engines. Used for the first construction and for every rebuild.
#[async_trait]
pub trait ChainBackend: Send + Sync + 'static {
    /// Engine type.
    type Chain: ChainService;

    /// Build a stopped engine over `store` rooted at `cfg.data_dir`.
    async fn build(&self, cfg: &ChainConfig, store: SqliteStore) -> anyhow::Result<Self::Chain>;
}
