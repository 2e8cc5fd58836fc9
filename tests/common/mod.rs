//! Deterministic regtest chain fixture shared by the integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::bip158::{BlockFilter, Error as BfError};
use bitcoin::{
    block::{Header as BlockHeader, Version as BlockVersion},
    consensus,
    hash_types::TxMerkleNode,
    hashes::{sha256d, Hash},
    pow::CompactTarget,
    Address, Amount, Block, BlockHash, Network, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Txid, WPubkeyHash, Witness,
};
use niebla_watch::config::ChainConfig;
use niebla_watch::filter_source::CfHeadersBatch;
use niebla_watch::prelude::*;
use niebla_watch::{StallPolicy, Store};
use tokio::sync::{mpsc, Semaphore};

pub const NETWORK: Network = Network::Regtest;

/// Regtest address + script for a 20-byte key hash filled with `n`.
pub fn address(n: u8) -> (String, ScriptBuf) {
    let script = ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([n; 20]));
    let addr = Address::from_script(&script, NETWORK).unwrap().to_string();
    (addr, script)
}

/// Transaction paying `outputs` from a made-up outpoint.
pub fn payment(seed: u8, outputs: &[(&ScriptBuf, u64)]) -> Transaction {
    Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array([seed; 32]),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs
            .iter()
            .map(|(spk, sat)| TxOut {
                value: Amount::from_sat(*sat),
                script_pubkey: (*spk).clone(),
            })
            .collect(),
    }
}

fn coinbase(height: u32) -> Transaction {
    // Mine to a throwaway key so filters are never empty.
    let (_, miner) = address(200);
    let mut tx = payment(0, &[(&miner, 50 * 100_000_000)]);
    tx.input[0].previous_output = OutPoint {
        txid: Txid::from_byte_array([0u8; 32]),
        vout: u32::MAX,
    };
    tx.input[0].script_sig = ScriptBuf::from_bytes(height.to_le_bytes().to_vec());
    tx
}

/// Blocks at heights `1..=tip` plus their BIP-158 filters.
pub struct FixtureChain {
    pub blocks: Vec<Block>,
    pub filters: Vec<Vec<u8>>,
}

impl FixtureChain {
    /// `payments[i] = (height, tx)` puts `tx` into the block at `height`.
    pub fn build(tip: u32, payments: Vec<(u32, Transaction)>) -> Self {
        let mut blocks = Vec::with_capacity(tip as usize);
        let mut filters = Vec::with_capacity(tip as usize);
        let mut prev = BlockHash::all_zeros();

        for height in 1..=tip {
            let mut txdata = vec![coinbase(height)];
            txdata.extend(
                payments
                    .iter()
                    .filter(|(h, _)| *h == height)
                    .map(|(_, tx)| tx.clone()),
            );
            let block = Block {
                header: BlockHeader {
                    version: BlockVersion::from_consensus(2),
                    prev_blockhash: prev,
                    merkle_root: TxMerkleNode::all_zeros(),
                    time: 1_600_000_000 + height,
                    bits: CompactTarget::from_consensus(0x207fffff),
                    nonce: height,
                },
                txdata,
            };
            let bf = BlockFilter::new_script_filter(&block, |_op: &OutPoint| -> Result<
                ScriptBuf,
                BfError,
            > {
                Ok(ScriptBuf::new())
            })
            .unwrap();
            prev = block.block_hash();
            filters.push(bf.content);
            blocks.push(block);
        }

        Self { blocks, filters }
    }

    pub fn tip(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn hash(&self, height: u32) -> BlockHash {
        self.blocks[height as usize - 1].block_hash()
    }

    fn height_of(&self, hash: BlockHash) -> Option<usize> {
        self.blocks.iter().position(|b| b.block_hash() == hash)
    }
}

/// How a connected source misbehaves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Fault {
    #[default]
    None,
    /// `get_cfilter` always fails.
    Filters,
    /// `get_cfheaders` always fails, so the engine never becomes current.
    CfHeaders,
    /// `connect` itself fails.
    Refuse,
}

pub struct FixtureFilters {
    chain: Arc<FixtureChain>,
    fault: Fault,
    pub filter_calls: Arc<AtomicUsize>,
}

impl FixtureFilters {
    pub fn new(chain: Arc<FixtureChain>, fault: Fault) -> Self {
        Self {
            chain,
            fault,
            filter_calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl FilterSource for FixtureFilters {
    async fn get_cfheaders(
        &self,
        start_h: u32,
        stop: BlockHash,
    ) -> anyhow::Result<CfHeadersBatch> {
        if self.fault == Fault::CfHeaders {
            anyhow::bail!("peer stopped answering getcfheaders");
        }
        let stop_idx = self
            .chain
            .height_of(stop)
            .ok_or_else(|| anyhow::anyhow!("unknown stop hash {stop}"))?;
        let headers = self.chain.filters[start_h as usize - 1..=stop_idx]
            .iter()
            .map(|f| sha256d::Hash::hash(f).to_byte_array())
            .collect();
        Ok(CfHeadersBatch {
            start_height: start_h,
            headers,
        })
    }

    async fn get_cfilter(&self, block: BlockHash) -> anyhow::Result<Vec<u8>> {
        self.filter_calls.fetch_add(1, Ordering::SeqCst);
        if self.fault == Fault::Filters {
            anyhow::bail!("peer timed out");
        }
        let idx = self
            .chain
            .height_of(block)
            .ok_or_else(|| anyhow::anyhow!("unknown block {block}"))?;
        Ok(self.chain.filters[idx].clone())
    }

    async fn get_block(&self, block: BlockHash) -> anyhow::Result<Vec<u8>> {
        let idx = self
            .chain
            .height_of(block)
            .ok_or_else(|| anyhow::anyhow!("unknown block {block}"))?;
        Ok(consensus::encode::serialize(&self.chain.blocks[idx]))
    }
}

pub struct FixtureHeaders {
    chain: Arc<FixtureChain>,
}

impl FixtureHeaders {
    pub fn new(chain: Arc<FixtureChain>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl HeaderSource for FixtureHeaders {
    async fn tip_height(&self) -> anyhow::Result<u32> {
        Ok(self.chain.tip())
    }

    async fn hash_at_height(&self, h: u32) -> anyhow::Result<BlockHash> {
        if h == 0 || h > self.chain.tip() {
            anyhow::bail!("out of range: {h}");
        }
        Ok(self.chain.hash(h))
    }
}

/// Connector handing out fixture sources. Connection `n` (0-based) gets
/// `faults[n]` (healthy past the end). Connections after the first wait for a
/// permit on `gate` when one is installed.
#[derive(Clone)]
pub struct FixtureConnector {
    pub chain: Arc<FixtureChain>,
    pub faults: Vec<Fault>,
    pub connects: Arc<AtomicUsize>,
    pub gate: Option<Arc<Semaphore>>,
    pub seen: Arc<Mutex<Vec<ChainConfig>>>,
}

impl FixtureConnector {
    pub fn new(chain: Arc<FixtureChain>) -> Self {
        Self {
            chain,
            faults: vec![],
            connects: Arc::new(AtomicUsize::new(0)),
            gate: None,
            seen: Arc::new(Mutex::new(vec![])),
        }
    }

    pub fn with_faults(mut self, faults: Vec<Fault>) -> Self {
        self.faults = faults;
        self
    }

    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnector for FixtureConnector {
    type Filters = FixtureFilters;
    type Headers = FixtureHeaders;

    async fn connect(&self, cfg: &ChainConfig) -> anyhow::Result<(FixtureFilters, FixtureHeaders)> {
        let n = self.connects.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(cfg.clone());
        if n > 0 {
            if let Some(gate) = &self.gate {
                gate.acquire().await?.forget();
            }
        }
        let fault = self.faults.get(n).copied().unwrap_or_default();
        if fault == Fault::Refuse {
            anyhow::bail!("all peers refused the connection");
        }
        Ok((
            FixtureFilters::new(self.chain.clone(), fault),
            FixtureHeaders::new(self.chain.clone()),
        ))
    }
}

/// Block handler forwarding everything it sees to channels.
pub struct Recorder {
    hits: mpsc::UnboundedSender<(u32, BlockHash, Vec<Transaction>)>,
    connected: mpsc::UnboundedSender<u32>,
}

pub struct Recorded {
    pub hits: mpsc::UnboundedReceiver<(u32, BlockHash, Vec<Transaction>)>,
    pub connected: mpsc::UnboundedReceiver<u32>,
}

pub fn recorder() -> (Arc<Recorder>, Recorded) {
    let (hits, hits_rx) = mpsc::unbounded_channel();
    let (connected, connected_rx) = mpsc::unbounded_channel();
    (
        Arc::new(Recorder { hits, connected }),
        Recorded {
            hits: hits_rx,
            connected: connected_rx,
        },
    )
}

#[async_trait]
impl BlockHandler for Recorder {
    async fn on_filtered_block(
        &self,
        height: u32,
        header: &BlockHeader,
        txs: Vec<Transaction>,
    ) -> anyhow::Result<()> {
        let _ = self.hits.send((height, header.block_hash(), txs));
        Ok(())
    }

    async fn on_block_connected(&self, height: u32, _hash: BlockHash) -> anyhow::Result<()> {
        let _ = self.connected.send(height);
        Ok(())
    }
}

impl Recorded {
    pub async fn next_hit(&mut self, within: Duration) -> Option<(u32, BlockHash, Vec<Transaction>)> {
        tokio::time::timeout(within, self.hits.recv()).await.ok().flatten()
    }

    /// Wait until a block at `height` has been scanned.
    pub async fn wait_connected(&mut self, height: u32, within: Duration) -> bool {
        tokio::time::timeout(within, async {
            while let Some(h) = self.connected.recv().await {
                if h >= height {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }
}

/// Minimal in-memory Store for engine tests.
pub struct MemStore {
    cf_tip: Mutex<Option<(u32, BlockHash)>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            cf_tip: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Store for MemStore {
    async fn load_cf_tip(&self) -> anyhow::Result<Option<(u32, BlockHash)>> {
        Ok(*self.cf_tip.lock().unwrap())
    }
    async fn save_cf_tip(&self, height: u32, cfheader: BlockHash) -> anyhow::Result<()> {
        *self.cf_tip.lock().unwrap() = Some((height, cfheader));
        Ok(())
    }
}

pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

pub const WAIT: Duration = Duration::from_secs(10);

/// Fast-polling regtest config rooted at `dir`, stall rebuilds off.
pub fn config(dir: &Path) -> WatcherConfig {
    WatcherConfig::new(NETWORK, dir)
        .with_peers(["127.0.0.1:18444"])
        .with_poll_interval(ms(20))
        .with_sync_interval(ms(20))
        .with_rescan_interval(ms(20))
        .with_stall_policy(StallPolicy::disabled())
}

/// Poll `f` until it returns true.
pub async fn eventually<F: FnMut() -> bool>(mut f: F, within: Duration) -> bool {
    tokio::time::timeout(within, async {
        while !f() {
            tokio::time::sleep(ms(10)).await;
        }
    })
    .await
    .is_ok()
}
