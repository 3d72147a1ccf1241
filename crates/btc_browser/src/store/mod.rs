//! Small key-value persistence layer for the browser's local cache.
//!
//! Values are opaque strings (usually JSON). Callers decide how to react to I/O
//! failures; the sync store and the theme settings treat them as best effort.
use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing::warn;

pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> io::Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> io::Result<()>;
}

impl<T: Store + ?Sized> Store for Arc<T> {
    fn get(&self, key: &str) -> io::Result<Option<String>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: &str) -> io::Result<()> {
        (**self).put(key, value)
    }
}

impl<T: Store + ?Sized> Store for Box<T> {
    fn get(&self, key: &str) -> io::Result<Option<String>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: &str) -> io::Result<()> {
        (**self).put(key, value)
    }
}

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Opens a [`FileStore`] in `dir`, or an in-memory store if the directory is unusable.
///
/// The cache is never required to run, so an unusable data dir only costs persistence
/// across restarts.
pub fn open_data_dir(dir: &Path) -> Arc<dyn Store> {
    match FileStore::new(dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(
                "data dir {} unusable ({e}), cache will not survive a restart",
                dir.display()
            );
            Arc::new(MemoryStore::new())
        }
    }
}
