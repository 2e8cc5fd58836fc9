use async_trait::async_trait;
use bitcoin::BlockHash;

/// Header-chain view provided by the transport (height → hash).
#[async_trait]
pub trait HeaderSource: Send + Sync {
    /// Best header height known to the peers.
    async fn tip_height(&self) -> anyhow::Result<u32>;

    /// Block hash at an exact height on the best chain.
    async fn hash_at_height(&self, height: u32) -> anyhow::Result<BlockHash>;
}
