use anyhow::{bail, Result};
use bitcoin::{
    hashes::{sha256d, Hash},
    BlockHash,
};

/// Verified rolling cfheader tip.
///
/// Rolling update (BIP157): `H_n = HASH256(F_n || H_{n-1})`, where `F_n` is the
/// per-block filter hash. `H_0` is all zeros; the engine starts at height 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CfHeaderChain {
    pub tip_height: u32,
    pub tip_hash: BlockHash,
}

impl CfHeaderChain {
    /// Resume from a persisted tip, or start from scratch.
    pub fn from_tip(prev: Option<(u32, BlockHash)>) -> Self {
        match prev {
            Some((height, hash)) if height > 0 => Self {
                tip_height: height,
                tip_hash: hash,
            },
            _ => Self {
                tip_height: 0,
                tip_hash: BlockHash::all_zeros(),
            },
        }
    }

    /// Height the next batch must start at.
    pub fn next_height(&self) -> u32 {
        self.tip_height.saturating_add(1)
    }

    /// Fold a batch of per-block filter hashes into the chain.
    /// `headers[i]` belongs to height `start_height + i`. On error the chain is left untouched.
    pub fn apply_batch(
        &mut self,
        start_height: u32,
        headers: &[[u8; 32]],
        checkpoints: &[(u32, BlockHash)],
    ) -> Result<usize> {
        let expected = self.next_height();
        if start_height != expected {
            bail!("cfheaders batch start mismatch: got {start_height}, expected {expected}");
        }

        let mut next = *self;
        for (i, filter_hash) in headers.iter().enumerate() {
            let height = start_height + i as u32;
            let rolled = roll(next.tip_hash, filter_hash);

            if let Some((_, want)) = checkpoints.iter().find(|(h, _)| *h == height) {
                if &rolled != want {
                    bail!("cfheaders checkpoint mismatch @{height}: got {rolled}, want {want}");
                }
            }

            next.tip_height = height;
            next.tip_hash = rolled;
        }

        *self = next;
        Ok(headers.len())
    }
}

fn roll(prev: BlockHash, filter_hash: &[u8; 32]) -> BlockHash {
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(filter_hash);
    data.extend_from_slice(prev.as_ref());
    BlockHash::from_byte_array(sha256d::Hash::hash(&data).to_byte_array())
}
