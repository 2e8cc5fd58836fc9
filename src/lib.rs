#![forbid(unsafe_code)]
#![deny(missing_docs)]
//! niebla-watch: follow incoming payments to a growing set of addresses over
//! BIP-158 compact filters, and rebuild the light client when filter sync wedges.
//!
//! ## What you implement
//! - [`FilterSource`]: fetch cfheaders batches, per-block filters, and raw blocks.
//! - [`HeaderSource`]: return the header tip and block hashes by height.
//! - [`PeerConnector`]: dial the configured peers (optionally through a SOCKS proxy)
//!   and hand back a fresh source pair. Called again on every rebuild.
//! - [`BlockHandler`]: receive `(height, header, matched transactions)`.
//!
//! ## What the crate does
//! - [`FilterChain`] verifies cfheaders against optional checkpoints, persists the
//!   tip in a [`SqliteStore`], and serves rescan sessions that test filters against
//!   the watched scripts and fetch the matching blocks.
//! - [`Watcher`] owns one engine + store + session, keeps the watched address set in
//!   memory, and on the known "unable to fetch cfilter" defect wipes the engine's
//!   on-disk state, rebuilds it, rescans from the first start height and re-applies
//!   every address.
//! - [`tx_outputs`] sums what each address received in a transaction.
//!
//! ## Minimal usage
//! ```rust,ignore
//! use std::sync::Arc;
//! use niebla_watch::prelude::*;
//! use bitcoin::{block::Header, Network, Transaction};
//! use async_trait::async_trait;
//!
//! struct Incomes;
//! #[async_trait]
//! impl BlockHandler for Incomes {
//!     async fn on_filtered_block(
//!         &self, height: u32, _header: &Header, txs: Vec<Transaction>,
//!     ) -> anyhow::Result<()> {
//!         for tx in &txs {
//!             for (addr, amount) in tx_outputs(tx, Network::Bitcoin) {
//!                 println!("{height}: {addr} +{amount}");
//!             }
//!         }
//!         Ok(())
//!     }
//! }
//!
//! async fn run(connector: impl PeerConnector) -> anyhow::Result<()> {
//!     let config = WatcherConfig::new(Network::Bitcoin, "/var/lib/watch")
//!         .with_proxy(ProxyConfig::tor("127.0.0.1:9050"));
//!     let watcher = Watcher::new(config, FilterBackend::new(connector)).await?;
//!     watcher.wait_for_sync().await?;
//!     watcher.start_watching(613_000, Arc::new(Incomes)).await?;
//!     watcher.add_addresses(["176SsYVUoBcp3kzaBob7b6ikT5MKC16Rz1"]).await?;
//!     // ...
//!     watcher.close().await?;
//!     Ok(())
//! }
//! ```
/// Capability interface consumed from a chain sync engine.
pub mod chain;

/// Startup parameters, default peers, stall policy.
pub mod config;

/// Compact-filter chain engine and the backend that builds it.
pub mod engine;

/// Watcher error type.
pub mod error;

/// Traits for fetching cfheaders, cfilters, and blocks from the network.
pub mod filter_source;

/// Full-block watcher.
pub mod full;

/// Block header lookup abstraction (height → hash).
pub mod headers;

/// Block notifications delivered to the caller.
pub mod hooks;

/// Per-address amounts received by a transaction.
pub mod outputs;

/// Rescan sessions over the compact-filter engine.
pub mod rescan;

/// Persistence layer (traits and SQLite implementation).
pub mod store;

/// The self-healing watcher.
pub mod watcher;

// Internal helpers:
mod cfheaders;
mod checkpoints;
mod matcher;
mod runtime;

// Public re-exports
pub use chain::{is_filter_defect, BlockStamp, ChainBackend, ChainService, RescanSession};
pub use config::{ProxyConfig, StallPolicy, WatcherConfig};
pub use engine::{EngineOptions, FilterBackend, FilterChain};
pub use error::WatchError;
pub use filter_source::{FilterSource, PeerConnector};
pub use full::FullWatcher;
pub use headers::HeaderSource;
pub use hooks::BlockHandler;
pub use outputs::tx_outputs;
pub use store::{sqlite_store::SqliteStore, Store};
pub use watcher::{decode_address, Watcher, WatcherState};

/// Convenience prelude for end users.
pub mod prelude {
    pub use crate::{
        tx_outputs, BlockHandler, FilterBackend, FilterSource, HeaderSource, PeerConnector,
        ProxyConfig, Watcher, WatcherConfig,
    };
}
