//! Persistence interfaces and implementations used by the chain engine
//! (the verified cfheaders tip).
use async_trait::async_trait;
use bitcoin::BlockHash;

/// Minimal persistence interface. No secrets, just progress markers.
#[async_trait]
pub trait Store: Send + Sync {
    /// Latest verified cfheaders rolling tip `(height, rolling_header_hash)`.
    async fn load_cf_tip(&self) -> anyhow::Result<Option<(u32, BlockHash)>>;

    /// Save latest verified cfheaders rolling tip.
    async fn save_cf_tip(&self, height: u32, cfheader: BlockHash) -> anyhow::Result<()>;

    /// Release the backing resources. Later calls fail.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// submodules / concrete stores live here
pub mod sqlite_store;
pub use sqlite_store::SqliteStore;
