//! Rescan session over a [`FilterChain`](crate::engine::FilterChain): walks heights from
//! a start block, tests each BIP-158 filter against the watched scripts and, on a hit,
//! fetches the block and delivers the paying transactions.
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bitcoin::{Address, ScriptBuf};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    chain::{RescanErrors, RescanSession},
    engine::Shared,
    filter_source::FilterSource,
    headers::HeaderSource,
    hooks::BlockHandler,
    matcher::{filter_matches_any, relevant_txs},
    store::Store,
};

/// Heights already scanned that must be re-checked for scripts added later.
struct Backfill {
    scripts: Vec<ScriptBuf>,
    next: u32,
    end: u32,
}

struct ScanState {
    scripts: Vec<ScriptBuf>,
    /// First height not yet handed to the scanner.
    next: u32,
    backfill: VecDeque<Backfill>,
}

enum Job {
    Forward(u32, Vec<ScriptBuf>),
    Backfill(u32, Vec<ScriptBuf>),
}

/// Session created by [`ChainService::new_rescan`](crate::chain::ChainService::new_rescan).
pub struct FilterRescan<F, H, S> {
    shared: Arc<Shared<F, H, S>>,
    start_height: u32,
    handler: Arc<dyn BlockHandler>,
    state: Arc<Mutex<ScanState>>,
    quit: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<F, H, S> FilterRescan<F, H, S>
where
    F: FilterSource + 'static,
    H: HeaderSource + 'static,
    S: Store + 'static,
{
    pub(crate) fn new(
        shared: Arc<Shared<F, H, S>>,
        start_height: u32,
        addresses: Vec<Address>,
        handler: Arc<dyn BlockHandler>,
    ) -> Self {
        let mut scripts: Vec<ScriptBuf> = Vec::with_capacity(addresses.len());
        for spk in addresses.iter().map(|a| a.script_pubkey()) {
            if !scripts.contains(&spk) {
                scripts.push(spk);
            }
        }
        let (quit, _) = watch::channel(false);
        Self {
            shared,
            start_height,
            handler,
            state: Arc::new(Mutex::new(ScanState {
                scripts,
                next: start_height.max(1),
                backfill: VecDeque::new(),
            })),
            quit,
            task: Mutex::new(None),
        }
    }

    /// Height the session started from.
    pub fn start_height(&self) -> u32 {
        self.start_height
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("rescan state lock poisoned")
}

#[async_trait]
impl<F, H, S> RescanSession for FilterRescan<F, H, S>
where
    F: FilterSource + 'static,
    H: HeaderSource + 'static,
    S: Store + 'static,
{
    fn start(&self) -> anyhow::Result<RescanErrors> {
        let mut task = self.task.lock().map_err(poisoned)?;
        if task.is_some() || *self.quit.borrow() {
            bail!("rescan already started");
        }

        let (errors, rx) = mpsc::unbounded_channel();
        let scanner = Scanner {
            shared: self.shared.clone(),
            handler: self.handler.clone(),
            state: self.state.clone(),
            errors,
            interval: self.shared.opts.rescan_interval,
        };
        *task = Some(tokio::spawn(scanner.run(self.quit.subscribe())));
        info!(start_height = self.start_height, "rescan started");
        Ok(rx)
    }

    async fn update(&self, addresses: Vec<Address>) -> anyhow::Result<()> {
        if *self.quit.borrow() {
            bail!("rescan session has shut down");
        }
        let mut state = self.state.lock().map_err(poisoned)?;

        let mut added = Vec::new();
        for spk in addresses.iter().map(|a| a.script_pubkey()) {
            if !state.scripts.contains(&spk) {
                state.scripts.push(spk.clone());
                added.push(spk);
            }
        }
        if added.is_empty() {
            return Ok(());
        }

        let first = self.start_height.max(1);
        if state.next > first {
            let end = state.next - 1;
            debug!(count = added.len(), from = first, to = end, "back-filling new scripts");
            state.backfill.push_back(Backfill {
                scripts: added,
                next: first,
                end,
            });
        }
        Ok(())
    }

    fn stop(&self) {
        self.quit.send_replace(true);
    }

    async fn wait_for_shutdown(&self) {
        let handle = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "rescan task panicked");
            }
        }
    }
}

/// The session's background task. Dropping it closes the error stream.
struct Scanner<F, H, S> {
    shared: Arc<Shared<F, H, S>>,
    handler: Arc<dyn BlockHandler>,
    state: Arc<Mutex<ScanState>>,
    errors: mpsc::UnboundedSender<anyhow::Error>,
    interval: Duration,
}

impl<F, H, S> Scanner<F, H, S>
where
    F: FilterSource + 'static,
    H: HeaderSource + 'static,
    S: Store + 'static,
{
    async fn run(self, mut quit: watch::Receiver<bool>) {
        loop {
            if *quit.borrow() {
                break;
            }

            let job = match self.next_job() {
                Ok(job) => job,
                Err(e) => {
                    let _ = self.errors.send(e);
                    break;
                }
            };

            let failed = match job {
                None => false,
                Some(Job::Forward(height, scripts)) => {
                    match self.scan_height(height, &scripts, true).await {
                        Ok(()) => false,
                        Err(e) => {
                            self.rewind(height);
                            self.report(height, e)
                        }
                    }
                }
                Some(Job::Backfill(height, scripts)) => {
                    match self.scan_height(height, &scripts, false).await {
                        Ok(()) => {
                            self.backfill_done(height);
                            false
                        }
                        Err(e) => self.report(height, e),
                    }
                }
            };

            let idle = failed || matches!(self.peek_idle(), Ok(true));
            if idle {
                tokio::select! {
                    changed = quit.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }
        debug!("rescan task stopped");
    }

    fn next_job(&self) -> anyhow::Result<Option<Job>> {
        let mut state = self.state.lock().map_err(poisoned)?;
        if let Some(bf) = state.backfill.front() {
            return Ok(Some(Job::Backfill(bf.next, bf.scripts.clone())));
        }
        let height = state.next;
        if height > self.shared.verified_height() {
            return Ok(None);
        }
        state.next = height + 1;
        Ok(Some(Job::Forward(height, state.scripts.clone())))
    }

    /// Nothing to do until the verified tip moves.
    fn peek_idle(&self) -> anyhow::Result<bool> {
        let state = self.state.lock().map_err(poisoned)?;
        Ok(state.backfill.is_empty() && state.next > self.shared.verified_height())
    }

    fn rewind(&self, height: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.next = state.next.min(height);
        }
    }

    fn backfill_done(&self, height: u32) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(bf) = state.backfill.front_mut() {
                if bf.next == height {
                    bf.next += 1;
                    if bf.next > bf.end {
                        state.backfill.pop_front();
                    }
                }
            }
        }
    }

    fn report(&self, height: u32, e: anyhow::Error) -> bool {
        warn!(height, error = %format!("{e:#}"), "rescan error");
        // A closed receiver only means nobody listens any more.
        let _ = self.errors.send(e);
        true
    }

    async fn scan_height(
        &self,
        height: u32,
        scripts: &[ScriptBuf],
        forward: bool,
    ) -> anyhow::Result<()> {
        let block_hash = self
            .shared
            .headers
            .hash_at_height(height)
            .await
            .with_context(|| format!("hash at height {height}"))?;

        if !scripts.is_empty() {
            // (a) Pull filter and test
            let raw_filter = self
                .shared
                .cfilter(block_hash)
                .await
                .with_context(|| format!("unable to fetch cfilter for block {block_hash}"))?;

            let hit = match filter_matches_any(block_hash, &raw_filter, scripts) {
                Ok(hit) => hit,
                Err(e) => {
                    // A filter that does not decode is refetched once, bypassing the cache.
                    warn!(height, %block_hash, error = %e, "undecodable filter, refetching");
                    let raw_filter = self
                        .shared
                        .refetch_cfilter(block_hash)
                        .await
                        .with_context(|| format!("unable to fetch cfilter for block {block_hash}"))?;
                    // Still broken from the source: treat like a failed fetch.
                    filter_matches_any(block_hash, &raw_filter, scripts).with_context(|| {
                        format!("unable to fetch cfilter for block {block_hash}: filter does not decode")
                    })?
                }
            };

            // (b) On hit, download block and keep the paying transactions
            if hit {
                let block = self.shared.block(block_hash).await?;
                let txs = relevant_txs(&block.txdata, scripts);
                if !txs.is_empty() {
                    debug!(height, %block_hash, txs = txs.len(), "filter hit");
                    if let Err(e) = self.handler.on_filtered_block(height, &block.header, txs).await
                    {
                        error!(height, error = %format!("{e:#}"), "block handler failed");
                    }
                }
            }
        }

        if forward {
            if let Err(e) = self.handler.on_block_connected(height, block_hash).await {
                error!(height, error = %format!("{e:#}"), "block handler failed");
            }
        }
        Ok(())
    }
}
