use bitcoin::{BlockHash, Network};

/// Known rolling cfheader checkpoints `(height, rolling_header_hash)` for a network.
/// Empty until a vetted list is shipped; callers may supply their own through
/// [`WatcherConfig::with_checkpoints`](crate::WatcherConfig::with_checkpoints).
pub fn for_network(network: Network) -> Vec<(u32, BlockHash)> {
    match network {
        Network::Bitcoin => vec![],
        Network::Testnet => vec![],
        Network::Signet => vec![],
        _ => vec![],
    }
}
