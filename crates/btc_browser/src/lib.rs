//! Keeps the latest Bitcoin block and its predecessor in sync with an Esplora-style
//! block explorer, caching the last seen pair on disk.
//!
//! - `net::explorer`: REST client resolving the tip and the block below it
//! - `sync`: state container with refresh and polling
//! - `store`: key-value persistence used for the block cache and the theme
pub mod config;
pub mod net;
pub mod render;
pub mod store;
pub mod sync;
pub mod theme;

pub use net::explorer::{BlockDetails, BlockPair, BlockSource, ExplorerClient, FetchError};
pub use sync::{SyncState, SyncStore};
