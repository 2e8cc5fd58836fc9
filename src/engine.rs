//! Compact-filter chain engine:
//! 1) follow the header tip and verify cfheaders against optional checkpoints,
//! 2) serve best-block / block queries,
//! 3) hand out rescan sessions that match filters against watched addresses.
use std::{
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bitcoin::{consensus, constants::genesis_block, Address, Block, BlockHash, Network};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    cfheaders::CfHeaderChain,
    chain::{BlockStamp, ChainBackend, ChainService},
    config::ChainConfig,
    filter_source::{FilterSource, PeerConnector},
    headers::HeaderSource,
    hooks::BlockHandler,
    rescan::FilterRescan,
    store::{SqliteStore, Store},
};

/// How many cfheaders to advance per request window.
const CFHEADERS_BATCH: u32 = 2_000;

/// Suffix source for in-flight cache writes.
static CACHE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Tunables of a [`FilterChain`].
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Network the engine follows.
    pub network: Network,
    /// Rolling cfheader checkpoints `(height, rolling_cfheader)`.
    pub checkpoints: Vec<(u32, BlockHash)>,
    /// Where raw filters are cached; `None` disables the cache.
    pub cache_dir: Option<PathBuf>,
    /// Header / cfheader refresh period.
    pub sync_interval: Duration,
    /// Rescan idle poll and retry delay.
    pub rescan_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            checkpoints: vec![],
            cache_dir: None,
            sync_interval: Duration::from_secs(10),
            rescan_interval: Duration::from_secs(1),
        }
    }
}

impl EngineOptions {
    /// Options for an engine rooted at `cfg.data_dir`.
    pub fn from_config(cfg: &ChainConfig) -> Self {
        Self {
            network: cfg.network,
            checkpoints: cfg.checkpoints.clone(),
            cache_dir: Some(cfg.data_dir.join("filters")),
            sync_interval: cfg.sync_interval,
            rescan_interval: cfg.rescan_interval,
        }
    }
}

/// State shared by the engine, its sync loop and its rescan sessions.
pub(crate) struct Shared<F, H, S> {
    pub(crate) source: F,
    pub(crate) headers: H,
    store: S,
    pub(crate) opts: EngineOptions,
    tip: watch::Sender<CfHeaderChain>,
}

impl<F, H, S> Shared<F, H, S>
where
    F: FilterSource,
    H: HeaderSource,
    S: Store,
{
    /// Verified cfheader tip.
    pub(crate) fn verified_height(&self) -> u32 {
        self.tip.borrow().tip_height
    }

    /// Advance the verified cfheader chain to the current header tip.
    async fn advance(&self) -> anyhow::Result<()> {
        let chain_tip = self.headers.tip_height().await.context("header tip")?;
        let mut cfchain = *self.tip.borrow();

        while cfchain.next_height() <= chain_tip {
            let next = cfchain.next_height();
            let stop_h = (next + CFHEADERS_BATCH - 1).min(chain_tip);
            let stop_hash = self.headers.hash_at_height(stop_h).await?;

            let batch = self
                .source
                .get_cfheaders(next, stop_hash)
                .await
                .with_context(|| format!("get_cfheaders(start={next}, stop_h={stop_h})"))?;
            if batch.headers.is_empty() {
                bail!("empty cfheaders batch for {next}..={stop_h}");
            }

            cfchain
                .apply_batch(batch.start_height, &batch.headers, &self.opts.checkpoints)
                .with_context(|| format!("apply cfheaders batch @{}", batch.start_height))?;

            self.store
                .save_cf_tip(cfchain.tip_height, cfchain.tip_hash)
                .await?;
            self.tip.send_replace(cfchain);
            debug!(height = cfchain.tip_height, "cfheaders advanced");
        }

        Ok(())
    }

    fn cache_path(&self, block: BlockHash) -> Option<PathBuf> {
        self.opts.cache_dir.as_ref().map(|d| d.join(block.to_string()))
    }

    /// Raw filter for `block`, served from the on-disk cache when present.
    pub(crate) async fn cfilter(&self, block: BlockHash) -> anyhow::Result<Vec<u8>> {
        if let Some(path) = self.cache_path(block) {
            match tokio::fs::read(&path).await {
                Ok(raw) => return Ok(raw),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("read {}", path.display()));
                }
            }
        }
        self.fetch_cfilter(block).await
    }

    /// Drop any cached copy of `block`'s filter and fetch it from the source again.
    pub(crate) async fn refetch_cfilter(&self, block: BlockHash) -> anyhow::Result<Vec<u8>> {
        if let Some(path) = self.cache_path(block) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(%block, "evicted cached filter"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("remove {}", path.display()));
                }
            }
        }
        self.fetch_cfilter(block).await
    }

    async fn fetch_cfilter(&self, block: BlockHash) -> anyhow::Result<Vec<u8>> {
        let raw = self.source.get_cfilter(block).await?;

        if let Some(path) = self.cache_path(block) {
            // Written aside and renamed, so the cache never holds a partial filter.
            let seq = CACHE_SEQ.fetch_add(1, Ordering::Relaxed);
            let tmp = path.with_extension(format!("tmp{seq}"));
            tokio::fs::write(&tmp, &raw)
                .await
                .with_context(|| format!("write {}", tmp.display()))?;
            tokio::fs::rename(&tmp, &path)
                .await
                .with_context(|| format!("rename {} into place", tmp.display()))?;
        }
        Ok(raw)
    }

    /// Fetch and decode a full block.
    pub(crate) async fn block(&self, hash: BlockHash) -> anyhow::Result<Block> {
        let raw = self
            .source
            .get_block(hash)
            .await
            .with_context(|| format!("get_block({hash})"))?;
        consensus::encode::deserialize(&raw).context("block deserialize")
    }
}

/// Chain engine driven by a [`FilterSource`] and a [`HeaderSource`].
/// `S` = store, `F` = network filter source, `H` = header source.
pub struct FilterChain<F, H, S = SqliteStore> {
    shared: Arc<Shared<F, H, S>>,
    quit: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<F, H, S> FilterChain<F, H, S>
where
    F: FilterSource + 'static,
    H: HeaderSource + 'static,
    S: Store + 'static,
{
    /// Create a stopped engine.
    pub fn new(source: F, headers: H, store: S, opts: EngineOptions) -> Self {
        let (tip, _) = watch::channel(CfHeaderChain::from_tip(None));
        let (quit, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                source,
                headers,
                store,
                opts,
                tip,
            }),
            quit,
            task: Mutex::new(None),
        }
    }

    /// Run one refresh round now, outside the background loop.
    pub async fn sync_once(&self) -> anyhow::Result<()> {
        self.shared.advance().await
    }

    /// Verified cfheader tip height.
    pub fn verified_height(&self) -> u32 {
        self.shared.verified_height()
    }

    async fn sync_loop(shared: Arc<Shared<F, H, S>>, mut quit: watch::Receiver<bool>) {
        loop {
            if let Err(e) = shared.advance().await {
                warn!(error = %format!("{e:#}"), "cfheader sync round failed");
            }
            tokio::select! {
                changed = quit.changed() => {
                    if changed.is_err() || *quit.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(shared.opts.sync_interval) => {}
            }
        }
        debug!("cfheader sync loop stopped");
    }
}

#[async_trait]
impl<F, H, S> ChainService for FilterChain<F, H, S>
where
    F: FilterSource + 'static,
    H: HeaderSource + 'static,
    S: Store + 'static,
{
    type Rescan = FilterRescan<F, H, S>;

    async fn start(&self) -> anyhow::Result<()> {
        if self.task.lock().map_err(|_| anyhow!("engine lock poisoned"))?.is_some() {
            bail!("engine already started");
        }
        if let Some(dir) = &self.shared.opts.cache_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create {}", dir.display()))?;
        }

        let stored = self.shared.store.load_cf_tip().await.context("load cf tip")?;
        let cfchain = CfHeaderChain::from_tip(stored);
        self.shared.tip.send_replace(cfchain);
        info!(height = cfchain.tip_height, "chain engine starting");

        let handle = tokio::spawn(Self::sync_loop(self.shared.clone(), self.quit.subscribe()));
        *self.task.lock().map_err(|_| anyhow!("engine lock poisoned"))? = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.quit.send_replace(true);
        let handle = self
            .task
            .lock()
            .map_err(|_| anyhow!("engine lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            handle.await.context("engine sync loop panicked")?;
        }
        Ok(())
    }

    async fn is_current(&self) -> bool {
        match self.shared.headers.tip_height().await {
            Ok(tip) => self.shared.verified_height() >= tip,
            Err(e) => {
                debug!(error = %format!("{e:#}"), "header tip unavailable");
                false
            }
        }
    }

    async fn best_block(&self) -> anyhow::Result<BlockStamp> {
        let height = self.shared.verified_height();
        let hash = if height == 0 {
            genesis_block(self.shared.opts.network).block_hash()
        } else {
            self.shared
                .headers
                .hash_at_height(height)
                .await
                .with_context(|| format!("hash at best height {height}"))?
        };
        Ok(BlockStamp { height, hash })
    }

    async fn block_hash(&self, height: u32) -> anyhow::Result<BlockHash> {
        self.shared.headers.hash_at_height(height).await
    }

    async fn block(&self, hash: BlockHash) -> anyhow::Result<Block> {
        self.shared.block(hash).await
    }

    fn new_rescan(
        &self,
        start_height: u32,
        addresses: Vec<Address>,
        handler: Arc<dyn BlockHandler>,
    ) -> Self::Rescan {
        FilterRescan::new(self.shared.clone(), start_height, addresses, handler)
    }
}

/// [`ChainBackend`] building a [`FilterChain`] over freshly connected peers.
pub struct FilterBackend<C> {
    connector: C,
}

impl<C: PeerConnector> FilterBackend<C> {
    /// Backend dialing peers through `connector`.
    pub fn new(connector: C) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl<C: PeerConnector> ChainBackend for FilterBackend<C> {
    type Chain = FilterChain<C::Filters, C::Headers, SqliteStore>;

    async fn build(&self, cfg: &ChainConfig, store: SqliteStore) -> anyhow::Result<Self::Chain> {
        tokio::fs::create_dir_all(&cfg.data_dir)
            .await
            .with_context(|| format!("create {}", cfg.data_dir.display()))?;

        let (filters, headers) = self
            .connector
            .connect(cfg)
            .await
            .with_context(|| format!("connect to {} peer(s)", cfg.peers.len()))?;

        Ok(FilterChain::new(
            filters,
            headers,
            store,
            EngineOptions::from_config(cfg),
        ))
    }
}
