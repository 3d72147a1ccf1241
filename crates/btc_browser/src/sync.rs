use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::net::explorer::{BlockDetails, BlockPair, BlockSource};
use crate::store::Store;

/// Storage key holding the last successfully fetched pair.
pub const SNAPSHOT_KEY: &str = "btc-browser:lastBlock";

/// What the presentation layer reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    pub block: Option<BlockDetails>,
    pub previous_block: Option<BlockDetails>,
    pub loading: bool,
    pub error: Option<String>,
}

impl SyncState {
    /// Seconds between the current block and its predecessor.
    pub fn time_delta(&self) -> Option<i64> {
        match (&self.block, &self.previous_block) {
            (Some(cur), Some(prev)) => Some((cur.timestamp - prev.timestamp).abs()),
            _ => None,
        }
    }

    /// Change in transaction count from the predecessor to the current block.
    pub fn tx_delta(&self) -> Option<i64> {
        let cur = self.block.as_ref()?.tx_count?;
        let prev = self.previous_block.as_ref()?.tx_count?;
        Some(cur as i64 - prev as i64)
    }
}

/// Persisted form of the last known pair: `{"block": ..., "previousBlock": ...}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub block: Option<BlockDetails>,
    #[serde(default, rename = "previousBlock")]
    pub previous_block: Option<BlockDetails>,
}

impl From<&BlockPair> for Snapshot {
    fn from(pair: &BlockPair) -> Self {
        Snapshot {
            block: Some(pair.current.clone()),
            previous_block: pair.previous.clone(),
        }
    }
}

/// Reads the cached pair. Any failure (missing, unreadable, malformed) yields an empty snapshot.
pub fn load_snapshot<S: Store + ?Sized>(store: &S) -> Snapshot {
    let raw = match store.get(SNAPSHOT_KEY) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Snapshot::default(),
        Err(e) => {
            warn!("could not read cached block: {e}");
            return Snapshot::default();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("ignoring malformed cached block: {e}");
            Snapshot::default()
        }
    }
}

/// Writes the pair to storage. Failures are logged and dropped.
pub fn persist_snapshot<S: Store + ?Sized>(store: &S, snapshot: &Snapshot) {
    let result = serde_json::to_string(snapshot)
        .map_err(|e| std::io::Error::other(e.to_string()))
        .and_then(|json| store.put(SNAPSHOT_KEY, &json));
    if let Err(e) = result {
        warn!("could not cache latest block: {e}");
    }
}

struct Inner<B, S> {
    source: B,
    storage: S,
    state: watch::Sender<SyncState>,
    // held across publish and cache write so both happen in the same order
    commit: tokio::sync::Mutex<()>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl<B, S> Drop for Inner<B, S> {
    fn drop(&mut self) {
        let poller = self
            .poller
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = poller.take() {
            handle.abort();
        }
    }
}

/// Owns the latest two blocks and mediates every refresh.
///
/// Cloning is cheap and every clone shares the same state and poll timer. Fetches are
/// not serialized: if two overlap, whichever finishes last wins, both in memory and in
/// the cache.
pub struct SyncStore<B, S> {
    inner: Arc<Inner<B, S>>,
}

impl<B, S> Clone for SyncStore<B, S> {
    fn clone(&self) -> Self {
        SyncStore {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B, S> SyncStore<B, S>
where
    B: BlockSource + 'static,
    S: Store + 'static,
{
    /// Builds the store, seeding it from whatever `storage` has cached.
    pub fn new(source: B, storage: S) -> Self {
        let seed = load_snapshot(&storage);
        if let Some(block) = &seed.block {
            debug!("restored cached block {} at height {}", block.id, block.height);
        }
        let (state, _) = watch::channel(SyncState {
            block: seed.block,
            previous_block: seed.previous_block,
            loading: false,
            error: None,
        });
        SyncStore {
            inner: Arc::new(Inner {
                source,
                storage,
                state,
                commit: tokio::sync::Mutex::new(()),
                poller: Mutex::new(None),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        self.inner.state.borrow().clone()
    }

    /// Receiver that is notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    /// Fetches a fresh pair and merges it into the state.
    ///
    /// On success both slots are replaced together and the pair is cached. On failure the
    /// previous blocks stay in place and `error` carries the message. Never fails itself.
    pub async fn refresh(&self) {
        self.inner.state.send_modify(|s| {
            s.loading = true;
            s.error = None;
        });

        match self.inner.source.latest_pair().await {
            Ok(pair) => {
                info!(
                    "latest block {} at height {} (previous: {})",
                    pair.current.id,
                    pair.current.height,
                    if pair.previous.is_some() { "yes" } else { "no" }
                );
                let snapshot = Snapshot::from(&pair);
                let _commit = self.inner.commit.lock().await;
                self.inner.state.send_modify(|s| {
                    s.block = Some(pair.current);
                    s.previous_block = pair.previous;
                    s.loading = false;
                });
                let inner = Arc::clone(&self.inner);
                let written =
                    tokio::task::spawn_blocking(move || persist_snapshot(&inner.storage, &snapshot))
                        .await;
                if let Err(e) = written {
                    warn!("cache write task failed: {e}");
                }
            }
            Err(e) => {
                warn!("refresh failed: {e}");
                self.inner.state.send_modify(|s| {
                    s.error = Some(e.to_string());
                    s.loading = false;
                });
            }
        }
    }

    /// Refreshes every `interval`, starting one interval from now.
    ///
    /// Returns `false` without doing anything if a timer is already running. Each tick
    /// spawns its own refresh, so a slow refresh never delays the next tick. Must be
    /// called from within a tokio runtime.
    pub fn start_polling(&self, interval: Duration) -> bool {
        let mut poller = self.lock_poller();
        if poller.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("polling already active");
            return false;
        }

        let interval = interval.max(Duration::from_millis(1));
        let weak: Weak<Inner<B, S>> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let store = SyncStore { inner };
                tokio::spawn(async move { store.refresh().await });
            }
        });
        *poller = Some(handle);
        info!("polling every {}ms", interval.as_millis());
        true
    }

    /// Cancels future ticks. An in-flight refresh is left to finish.
    ///
    /// Returns whether a timer was actually running.
    pub fn stop_polling(&self) -> bool {
        match self.lock_poller().take() {
            Some(handle) => {
                handle.abort();
                info!("polling stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_polling(&self) -> bool {
        self.lock_poller()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn lock_poller(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
