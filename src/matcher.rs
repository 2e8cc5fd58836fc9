use bitcoin::{bip158::BlockFilter, BlockHash, ScriptBuf, Transaction};

/// Test a raw BIP-158 filter against the watched scripts.
pub fn filter_matches_any(
    block_hash: BlockHash,
    raw_filter: &[u8],
    scripts: &[ScriptBuf],
) -> Result<bool, bitcoin::bip158::Error> {
    if scripts.is_empty() {
        return Ok(false);
    }
    let filter = BlockFilter::new(raw_filter);
    let mut it = scripts.iter().map(|s| s.as_bytes());
    filter.match_any(&block_hash, &mut it)
}

/// Transactions with at least one output paying a watched script.
/// Filters have false positives; this is the exact check.
pub fn relevant_txs(txs: &[Transaction], scripts: &[ScriptBuf]) -> Vec<Transaction> {
    txs.iter()
        .filter(|tx| {
            tx.output
                .iter()
                .any(|out| scripts.contains(&out.script_pubkey))
        })
        .cloned()
        .collect()
}
