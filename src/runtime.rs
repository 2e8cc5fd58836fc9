//! One live engine + store pair, and the on-disk state behind it.
use std::{io, path::Path, sync::Arc};

use anyhow::Context;
use tracing::{info, warn};

use crate::{
    chain::{ChainBackend, ChainService},
    config::{data_dir, store_path, WatcherConfig},
    error::WatchError,
    store::{SqliteStore, Store},
};

/// Engine and the store it writes to. Built together, torn down together.
pub(crate) struct Runtime<C> {
    pub(crate) chain: Arc<C>,
    pub(crate) store: SqliteStore,
}

impl<C: ChainService> Runtime<C> {
    /// Open (or create) the store, build the engine over it and start it.
    /// On failure everything opened so far is closed again.
    pub(crate) async fn open<B>(backend: &B, cfg: &WatcherConfig) -> Result<Self, WatchError>
    where
        B: ChainBackend<Chain = C>,
    {
        tokio::fs::create_dir_all(&cfg.dir)
            .await
            .with_context(|| format!("create {}", cfg.dir.display()))
            .map_err(WatchError::Construct)?;

        let path = cfg.store_path();
        let store = tokio::task::spawn_blocking(move || SqliteStore::open_or_create(path))
            .await
            .map_err(|e| WatchError::Construct(e.into()))?
            .map_err(WatchError::Construct)?;

        let chain = match backend.build(&cfg.chain_config(), store.clone()).await {
            Ok(chain) => chain,
            Err(e) => {
                close_quietly(&store).await;
                return Err(WatchError::Construct(e.context("build chain engine")));
            }
        };

        if let Err(e) = chain.start().await {
            if let Err(stop) = chain.stop().await {
                warn!(error = %format!("{stop:#}"), "stop after failed start");
            }
            close_quietly(&store).await;
            return Err(WatchError::Construct(e.context("start chain engine")));
        }

        info!(dir = %cfg.dir.display(), network = %cfg.network, "chain engine started");
        Ok(Self {
            chain: Arc::new(chain),
            store,
        })
    }

    /// Stop the engine, then close the store. The store is closed even when
    /// stopping fails; the first error wins.
    pub(crate) async fn shutdown(self) -> anyhow::Result<()> {
        let stopped = self.chain.stop().await.context("stop chain engine");
        let closed = self.store.close().await.context("close store");
        stopped.and(closed)
    }
}

async fn close_quietly(store: &SqliteStore) {
    if let Err(e) = store.close().await {
        warn!(error = %format!("{e:#}"), "close store after failed construction");
    }
}

/// Delete the engine data directory and the store file (with its WAL sidecars).
pub(crate) async fn wipe(dir: &Path) -> anyhow::Result<()> {
    let data = data_dir(dir);
    match tokio::fs::remove_dir_all(&data).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("remove dir {}", data.display())),
    }

    let db = store_path(dir);
    for suffix in ["", "-wal", "-shm"] {
        let mut name = db.clone().into_os_string();
        name.push(suffix);
        match tokio::fs::remove_file(&name).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("remove {}", Path::new(&name).display()))
            }
        }
    }
    info!(dir = %dir.display(), "wiped chain engine state");
    Ok(())
}
