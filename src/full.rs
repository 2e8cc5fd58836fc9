//! Watcher that downloads every block from a start height instead of matching filters.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use anyhow::Context;
use tokio::{
    sync::{watch, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    chain::{ChainBackend, ChainService},
    config::WatcherConfig,
    error::{Result, WatchError},
    hooks::BlockHandler,
    runtime::Runtime,
};

/// Follows the chain block by block and hands every transaction to the handler.
/// Costs a full block download per height; no address filtering happens.
pub struct FullWatcher<C: ChainService> {
    config: WatcherConfig,
    chain: Arc<C>,
    runtime: AsyncMutex<Option<Runtime<C>>>,
    closed: watch::Sender<bool>,
    started: AtomicBool,
    follower: Mutex<Option<JoinHandle<()>>>,
}

impl<C: ChainService> FullWatcher<C> {
    /// Open the store and start an engine built by `backend`.
    pub async fn new<B>(config: WatcherConfig, backend: &B) -> Result<Self>
    where
        B: ChainBackend<Chain = C>,
    {
        let runtime = Runtime::open(backend, &config).await?;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            config,
            chain: runtime.chain.clone(),
            runtime: AsyncMutex::new(Some(runtime)),
            closed,
            started: AtomicBool::new(false),
            follower: Mutex::new(None),
        })
    }

    /// Stop following, stop the engine and close the store.
    pub async fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Err(WatchError::Closed);
        }
        let follower = self.follower.lock().ok().and_then(|mut f| f.take());
        if let Some(follower) = follower {
            if let Err(e) = follower.await {
                error!(error = %e, "block follower panicked");
            }
        }
        let runtime = self.runtime.lock().await.take();
        match runtime {
            Some(rt) => rt.shutdown().await.map_err(WatchError::Shutdown),
            None => Ok(()),
        }
    }

    /// Block until the engine is current.
    pub async fn wait_for_sync(&self) -> Result<()> {
        if *self.closed.borrow() {
            return Err(WatchError::Closed);
        }
        let mut closed = self.closed.subscribe();
        while !self.chain.is_current().await {
            tokio::select! {
                _ = closed.changed() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            if *self.closed.borrow() {
                return Err(WatchError::Closed);
            }
            let best = self.chain.best_block().await.map_err(WatchError::Sync)?;
            info!(height = best.height, hash = %best.hash, "waiting for chain sync");
        }
        Ok(())
    }

    /// Best height of the engine's local view.
    pub async fn current_height(&self) -> Result<u32> {
        Ok(self
            .chain
            .best_block()
            .await
            .map_err(WatchError::Sync)?
            .height)
    }

    /// Wait for sync, then deliver every block from `start_height` on, forever.
    pub async fn start_watching(
        &self,
        start_height: u32,
        handler: Arc<dyn BlockHandler>,
    ) -> Result<()> {
        if *self.closed.borrow() {
            return Err(WatchError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WatchError::AlreadyWatching);
        }
        self.wait_for_sync().await?;

        let handle = tokio::spawn(follow(
            self.chain.clone(),
            start_height,
            handler,
            self.closed.subscribe(),
            self.config.rescan_interval,
        ));
        if let Ok(mut follower) = self.follower.lock() {
            *follower = Some(handle);
        }
        info!(start_height, "following full blocks");
        Ok(())
    }
}

async fn follow<C: ChainService>(
    chain: Arc<C>,
    mut height: u32,
    handler: Arc<dyn BlockHandler>,
    mut closed: watch::Receiver<bool>,
    retry: std::time::Duration,
) {
    loop {
        if *closed.borrow() {
            break;
        }
        let advanced = match deliver(&*chain, height, &*handler).await {
            Ok(advanced) => advanced,
            Err(e) => {
                if *closed.borrow() {
                    break;
                }
                warn!(height, error = %format!("{e:#}"), "fetch block failed");
                false
            }
        };
        if advanced {
            height += 1;
            continue;
        }
        tokio::select! {
            _ = closed.changed() => {}
            _ = tokio::time::sleep(retry) => {}
        }
    }
    debug!(height, "block follower stopped");
}

/// Deliver the block at `height`. `Ok(false)` when the engine has not reached it yet.
async fn deliver<C: ChainService>(
    chain: &C,
    height: u32,
    handler: &dyn BlockHandler,
) -> anyhow::Result<bool> {
    let best = chain.best_block().await.context("best block")?;
    if height > best.height {
        return Ok(false);
    }

    let hash = chain
        .block_hash(height)
        .await
        .with_context(|| format!("block hash at height {height}"))?;
    let block = chain
        .block(hash)
        .await
        .with_context(|| format!("for height {height} get block {hash}"))?;

    if let Err(e) = handler.on_block_connected(height, hash).await {
        error!(height, error = %format!("{e:#}"), "block handler failed");
    }
    if let Err(e) = handler
        .on_filtered_block(height, &block.header, block.txdata)
        .await
    {
        error!(height, error = %format!("{e:#}"), "block handler failed");
    }
    Ok(true)
}
