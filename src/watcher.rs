//! Self-healing address watcher.
//!
//! A [`Watcher`] owns exactly one chain engine + store pair and at most one rescan
//! session. The caller drives it sequentially:
//!
//! ```text
//! new -> wait_for_sync -> start_watching -> add_addresses* -> close
//! ```
//!
//! Two background activities run on their own:
//! - the rescan session delivering matched blocks to the [`BlockHandler`];
//! - a listener on the session's error stream. When it sees the compact filter
//!   defect ([`is_filter_defect`]) it runs the restart sequence:
//!   1. mark the watcher as restarting,
//!   2. stop the rescan session and wait for it to drain,
//!   3. stop the engine and close the store,
//!   4. delete the engine data directory and the store file,
//!   5. rebuild engine + store from the startup parameters,
//!   6. wait for the new engine to become current,
//!   7. start a new session from the *first* start height,
//!   8. re-apply every watched address, including ones added meanwhile,
//!   9. clear the restarting mark.
//!
//!   A failing step is logged and the sequence gives up; the watcher is left
//!   [`WatcherState::Degraded`] instead of retrying forever.
//!
//! The watched address set lives in memory, independent of the engine's storage,
//! so it survives rebuilds. Addresses are recorded before they are pushed to the
//! live session: an address accepted by [`Watcher::add_addresses`] is matched at
//! least once from the start height, even when a rebuild is in flight.
//!
//! [`Watcher::wait_for_sync`] additionally treats an engine whose best height stays
//! flat as wedged and rebuilds it (steps 2-5) before any session exists, bounded by
//! the configured [`StallPolicy`](crate::StallPolicy).
//!
//! [`Watcher::close`] during a rebuild aborts the sequence at its next step,
//! waits for it to unwind and then tears down whatever is live.
use std::{
    collections::HashSet,
    future::Future,
    pin::Pin,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use anyhow::{anyhow, bail, Context};
use bitcoin::{address::NetworkUnchecked, Address, Network};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::{
    chain::{is_filter_defect, ChainBackend, ChainService, RescanErrors, RescanSession},
    config::WatcherConfig,
    error::{Result, WatchError},
    hooks::BlockHandler,
    runtime::{self, Runtime},
};

/// Lifecycle of a [`Watcher`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherState {
    /// Engine built, nothing waited for yet.
    Created,
    /// Waiting for the engine to become current.
    Syncing,
    /// A rescan session is live.
    Watching,
    /// The engine is being torn down and rebuilt.
    Restarting,
    /// A rebuild gave up; no matching happens any more.
    Degraded,
    /// Closed; every owned resource is released.
    Closed,
}

/// State shared between caller calls and the restart sequence.
/// Only held for in-memory mutation, never across I/O.
struct Book {
    addresses: Vec<String>,
    seen: HashSet<String>,
    restarting: bool,
    state: WatcherState,
}

/// Engine + store + session, swapped as one unit.
struct Live<C: ChainService> {
    runtime: Runtime<C>,
    rescan: Option<Arc<C::Rescan>>,
    generation: u64,
}

struct Inner<B: ChainBackend> {
    backend: B,
    config: WatcherConfig,
    book: Mutex<Book>,
    live: AsyncMutex<Option<Live<B::Chain>>>,
    /// Serializes rebuilds against each other and against `close`.
    restart_lock: AsyncMutex<()>,
    closed: watch::Sender<bool>,
    started: AtomicBool,
    generation: AtomicU64,
    stall_restarts: AtomicU32,
}

/// Watches a growing address set for incoming payments. Cheap to clone.
pub struct Watcher<B: ChainBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: ChainBackend> Clone for Watcher<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Decode `s` and check it belongs to `network`.
pub fn decode_address(s: &str, network: Network) -> Result<Address> {
    let invalid = |source| WatchError::InvalidAddress {
        address: s.to_string(),
        source,
    };
    Address::<NetworkUnchecked>::from_str(s.trim())
        .map_err(invalid)?
        .require_network(network)
        .map_err(invalid)
}

impl<B: ChainBackend> Watcher<B> {
    /// Open (or create) the store under `config.dir`, build the engine through
    /// `backend` and start it. Nothing stays open on failure.
    pub async fn new(config: WatcherConfig, backend: B) -> Result<Self> {
        let runtime = Runtime::open(&backend, &config).await?;
        let (closed, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                config,
                book: Mutex::new(Book {
                    addresses: Vec::new(),
                    seen: HashSet::new(),
                    restarting: false,
                    state: WatcherState::Created,
                }),
                live: AsyncMutex::new(Some(Live {
                    runtime,
                    rescan: None,
                    generation: 0,
                })),
                restart_lock: AsyncMutex::new(()),
                closed,
                started: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                stall_restarts: AtomicU32::new(0),
            }),
        })
    }

    /// Startup parameters.
    pub fn config(&self) -> &WatcherConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WatcherState {
        self.book().state
    }

    /// Every address accepted so far, in insertion order.
    pub fn addresses(&self) -> Vec<String> {
        self.book().addresses.clone()
    }

    /// Number of stall rebuilds performed so far.
    pub fn stall_restarts(&self) -> u32 {
        self.inner.stall_restarts.load(Ordering::SeqCst)
    }

    /// Stop background work, drain the rescan session, stop the engine and close
    /// the store. Waits for an in-flight rebuild to abort first.
    /// A second call returns [`WatchError::Closed`].
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.send_replace(true) {
            return Err(WatchError::Closed);
        }
        info!("closing watcher");

        let _serial = self.inner.restart_lock.lock().await;
        let torn_down = self.teardown().await;
        {
            let mut book = self.book();
            book.restarting = false;
            book.state = WatcherState::Closed;
        }
        info!("watcher closed");
        torn_down.map_err(WatchError::Shutdown)
    }

    /// Block until the engine reports it is current, logging the best block on
    /// every poll. The first best-block query error is returned as is.
    /// Returns [`WatchError::Closed`] once the watcher is closed, and
    /// [`WatchError::Sync`] once it is [`WatcherState::Degraded`].
    pub async fn wait_for_sync(&self) -> Result<()> {
        if self.is_closed() {
            return Err(WatchError::Closed);
        }
        {
            let mut book = self.book();
            if book.state == WatcherState::Created {
                book.state = WatcherState::Syncing;
            }
        }
        self.poll_until_current(false).await
    }

    /// Best height of the engine's local view.
    pub async fn current_height(&self) -> Result<u32> {
        let chain = self.chain().await?;
        let best = chain.best_block().await.map_err(WatchError::Sync)?;
        Ok(best.height)
    }

    /// Start matching the watched addresses from `start_height`, delivering hits
    /// to `handler`. One-shot: a second call returns [`WatchError::AlreadyWatching`].
    pub async fn start_watching(
        &self,
        start_height: u32,
        handler: Arc<dyn BlockHandler>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(WatchError::Closed);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(WatchError::AlreadyWatching);
        }
        let _serial = self.inner.restart_lock.lock().await;
        if self.is_closed() {
            return Err(WatchError::Closed);
        }
        self.start_rescan(start_height, handler).await
    }

    /// Add addresses to the watched set.
    ///
    /// Every address is decoded first; one bad address rejects the whole call
    /// without touching the set. Accepted addresses are recorded before the live
    /// session is updated, so a failed update is reported but the addresses are
    /// still picked up by the next rebuild. Before `start_watching`, or while a
    /// rebuild runs, addresses are only recorded.
    pub async fn add_addresses<I, A>(&self, addrs: I) -> Result<()>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<str>,
    {
        let network = self.inner.config.network;
        let decoded = addrs
            .into_iter()
            .map(|a| decode_address(a.as_ref(), network))
            .collect::<Result<Vec<_>>>()?;

        {
            let mut book = self.book();
            if book.state == WatcherState::Closed || self.is_closed() {
                return Err(WatchError::Closed);
            }
            for addr in &decoded {
                let s = addr.to_string();
                if book.seen.insert(s.clone()) {
                    book.addresses.push(s);
                }
            }
            if book.restarting {
                debug!(count = decoded.len(), "rebuild in flight, addresses deferred");
                return Ok(());
            }
        }

        let Some(session) = self.session().await else {
            debug!(count = decoded.len(), "no rescan yet, addresses deferred");
            return Ok(());
        };
        session.update(decoded).await.map_err(WatchError::Update)
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.inner.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once `close` has been called.
    async fn closed_signal(&self) {
        let mut closed = self.inner.closed.subscribe();
        loop {
            if *closed.borrow_and_update() {
                return;
            }
            if closed.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    fn checkpoint(&self) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("watcher closed during rebuild");
        }
        Ok(())
    }

    async fn chain(&self) -> Result<Arc<B::Chain>> {
        if let Some(live) = self.inner.live.lock().await.as_ref() {
            return Ok(live.runtime.chain.clone());
        }
        if self.is_closed() {
            Err(WatchError::Closed)
        } else if self.state() == WatcherState::Degraded {
            Err(WatchError::Sync(anyhow!(
                "chain engine rebuild failed, watcher is degraded"
            )))
        } else {
            Err(WatchError::Sync(anyhow!("chain engine is being rebuilt")))
        }
    }

    async fn session(&self) -> Option<Arc<<B::Chain as ChainService>::Rescan>> {
        self.inner
            .live
            .lock()
            .await
            .as_ref()
            .and_then(|live| live.rescan.clone())
    }

    fn decoded_addresses(&self) -> Result<(Vec<Address>, usize)> {
        let snapshot = self.book().addresses.clone();
        let network = self.inner.config.network;
        let decoded = snapshot
            .iter()
            .map(|s| decode_address(s, network))
            .collect::<Result<Vec<_>>>()?;
        let n = snapshot.len();
        Ok((decoded, n))
    }

    async fn poll_until_current(&self, in_rebuild: bool) -> Result<()> {
        let mut closed = self.inner.closed.subscribe();
        let mut last_height: Option<u32> = None;
        let mut flat = 0u32;

        loop {
            if self.is_closed() {
                return Err(WatchError::Closed);
            }

            match self.chain().await {
                Ok(chain) => {
                    if chain.is_current().await {
                        return Ok(());
                    }

                    tokio::select! {
                        _ = closed.changed() => {}
                        _ = tokio::time::sleep(self.inner.config.poll_interval) => {}
                    }
                    if self.is_closed() {
                        return Err(WatchError::Closed);
                    }

                    let best = chain.best_block().await.map_err(WatchError::Sync)?;
                    info!(height = best.height, hash = %best.hash, "waiting for chain sync");

                    if last_height == Some(best.height) {
                        flat += 1;
                    } else {
                        flat = 0;
                    }
                    last_height = Some(best.height);

                    if self.stall_due(flat).await {
                        warn!(
                            height = best.height,
                            polls = flat,
                            "chain sync made no progress, rebuilding engine"
                        );
                        self.stall_rebuild(in_rebuild).await?;
                        last_height = None;
                        flat = 0;
                    }
                }
                Err(WatchError::Closed) => return Err(WatchError::Closed),
                Err(e) if self.state() == WatcherState::Degraded => return Err(e),
                Err(_) => {
                    // Someone else is rebuilding the engine.
                    tokio::select! {
                        _ = closed.changed() => {}
                        _ = tokio::time::sleep(self.inner.config.poll_interval) => {}
                    }
                }
            }
        }
    }

    async fn stall_due(&self, flat: u32) -> bool {
        let policy = &self.inner.config.stall;
        if !policy.enabled || flat == 0 {
            return false;
        }
        let done = self.inner.stall_restarts.load(Ordering::SeqCst);
        if done >= policy.max_restarts || flat < policy.threshold(done) {
            return false;
        }
        // Never pull the engine out from under a live session.
        let watching = self
            .inner
            .live
            .lock()
            .await
            .as_ref()
            .map_or(false, |live| live.rescan.is_some());
        !watching
    }

    async fn stall_rebuild(&self, in_rebuild: bool) -> Result<()> {
        let n = self.inner.stall_restarts.fetch_add(1, Ordering::SeqCst) + 1;

        if in_rebuild {
            return self
                .rebuild()
                .await
                .map_err(|e| WatchError::Sync(e.context("rebuild stalled engine")));
        }

        let _serial = self.inner.restart_lock.lock().await;
        if self.is_closed() {
            return Err(WatchError::Closed);
        }
        let prev = self.begin_restart();

        let rebuilt = self.rebuild().await;

        let mut book = self.book();
        book.restarting = false;
        match rebuilt {
            Ok(()) => {
                book.state = prev;
                info!(restarts = n, "stalled engine rebuilt");
                Ok(())
            }
            Err(e) => {
                book.state = WatcherState::Degraded;
                error!(error = %format!("{e:#}"), "failed to rebuild stalled engine, giving up");
                Err(WatchError::Sync(e.context("rebuild stalled engine")))
            }
        }
    }

    /// Mark the watcher as restarting; returns the state to go back to.
    fn begin_restart(&self) -> WatcherState {
        let mut book = self.book();
        book.restarting = true;
        std::mem::replace(&mut book.state, WatcherState::Restarting)
    }

    async fn start_rescan(&self, start_height: u32, handler: Arc<dyn BlockHandler>) -> Result<()> {
        let (addresses, count) = self.decoded_addresses()?;

        let mut slot = self.inner.live.lock().await;
        let live = slot.as_mut().ok_or(WatchError::Closed)?;
        if live.rescan.is_some() {
            return Err(WatchError::AlreadyWatching);
        }

        let session = Arc::new(
            live.runtime
                .chain
                .new_rescan(start_height, addresses, handler.clone()),
        );
        let errors = session.start().map_err(WatchError::Sync)?;
        live.rescan = Some(session);
        let generation = live.generation;
        drop(slot);

        {
            let mut book = self.book();
            if !book.restarting {
                book.state = WatcherState::Watching;
            }
        }
        info!(start_height, generation, addresses = count, "watching started");

        self.spawn_listener(generation, errors, start_height, handler);
        Ok(())
    }

    fn spawn_listener(
        &self,
        generation: u64,
        errors: RescanErrors,
        start_height: u32,
        handler: Arc<dyn BlockHandler>,
    ) {
        let watcher = self.clone();
        let listener: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
            watcher
                .listen(generation, errors, start_height, handler)
                .await
        });
        tokio::spawn(listener);
    }

    async fn listen(
        self,
        generation: u64,
        mut errors: RescanErrors,
        start_height: u32,
        handler: Arc<dyn BlockHandler>,
    ) {
        while let Some(err) = errors.recv().await {
            if !is_filter_defect(&err) {
                warn!(generation, error = %format!("{err:#}"), "rescan error");
                continue;
            }
            error!(
                generation,
                error = %format!("{err:#}"),
                "compact filter defect, rebuilding chain engine from scratch"
            );
            self.restart(generation, start_height, handler.clone()).await;
        }
        debug!(generation, "rescan error stream closed");
    }

    async fn restart(&self, generation: u64, start_height: u32, handler: Arc<dyn BlockHandler>) {
        let _serial = self.inner.restart_lock.lock().await;
        if self.is_closed() {
            return;
        }
        let live_generation = self.inner.live.lock().await.as_ref().map(|l| l.generation);
        if live_generation != Some(generation) {
            debug!(generation, "error from a replaced engine, ignoring");
            return;
        }

        self.begin_restart();
        match self.resume(start_height, handler).await {
            Ok(()) => info!(start_height, "chain engine rebuilt, watching resumed"),
            Err(e) if self.is_closed() => {
                info!(error = %format!("{e:#}"), "rebuild abandoned, watcher closed");
                self.book().restarting = false;
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "rebuild failed, giving up");
                let mut book = self.book();
                book.restarting = false;
                book.state = WatcherState::Degraded;
            }
        }
    }

    /// Steps 2-8 of the restart sequence.
    async fn resume(&self, start_height: u32, handler: Arc<dyn BlockHandler>) -> anyhow::Result<()> {
        self.rebuild().await?;
        self.poll_until_current(true)
            .await
            .context("wait for rebuilt engine")?;
        self.checkpoint()?;
        self.start_rescan(start_height, handler)
            .await
            .context("restart rescan")?;
        self.reapply_addresses().await
    }

    /// Steps 2-5: tear down, wipe, rebuild. The old pair is fully stopped
    /// before the new one is constructed.
    async fn rebuild(&self) -> anyhow::Result<()> {
        self.teardown().await?;
        self.checkpoint()?;
        runtime::wipe(&self.inner.config.dir).await?;
        self.checkpoint()?;

        // Dropping a half-built runtime closes whatever it opened.
        let runtime = tokio::select! {
            built = Runtime::open(&self.inner.backend, &self.inner.config) => built?,
            _ = self.closed_signal() => bail!("watcher closed during rebuild"),
        };
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.live.lock().await = Some(Live {
            runtime,
            rescan: None,
            generation,
        });
        info!(generation, "chain engine rebuilt");
        Ok(())
    }

    /// Steps 8-9: push every watched address to the new session, then clear the
    /// restarting mark in the same critical section that saw the set unchanged.
    async fn reapply_addresses(&self) -> anyhow::Result<()> {
        loop {
            let (addresses, count) = self.decoded_addresses()?;
            let session = self
                .session()
                .await
                .ok_or_else(|| anyhow!("no rescan session after rebuild"))?;
            session
                .update(addresses)
                .await
                .with_context(|| format!("re-apply {count} watched address(es)"))?;

            let mut book = self.book();
            if book.addresses.len() == count {
                book.restarting = false;
                book.state = WatcherState::Watching;
                return Ok(());
            }
        }
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        let live = self.inner.live.lock().await.take();
        let Some(live) = live else {
            return Ok(());
        };

        if let Some(rescan) = live.rescan {
            rescan.stop();
            rescan.wait_for_shutdown().await;
        }
        live.runtime.shutdown().await
    }
}
