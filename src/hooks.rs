//! Caller glue: receive matched blocks from a rescan session.
use async_trait::async_trait;
use bitcoin::{block::Header, BlockHash, Transaction};

/// Per-block notifications delivered by a rescan session.
///
/// Callbacks run on the session's task, concurrently with caller code.
/// Errors are logged by the session and do not stop matching.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    /// A block at `height` contained `txs` paying at least one watched address.
    async fn on_filtered_block(
        &self,
        height: u32,
        header: &Header,
        txs: Vec<Transaction>,
    ) -> anyhow::Result<()>;

    /// Every scanned block, matched or not.
    async fn on_block_connected(&self, _height: u32, _hash: BlockHash) -> anyhow::Result<()> {
        Ok(())
    }
}
