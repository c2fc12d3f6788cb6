//! Hash-sharded in-memory TTL cache.
//!
//! The cache splits its keyspace over a fixed power-of-two shard count
//! (default 2048) selected by a 64-bit FNV-1a hash of the key, so writers on
//! different shards never contend on a common lock. Entries expire `ttl`
//! after their last write; a background task sweeps expired entries shard by
//! shard, holding only one shard's lock at a time.
//!
//! The rate-limit middleware keys per-client token buckets through this
//! cache.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

/// Default shard count. Must stay a power of two so shard selection can mask.
pub const DEFAULT_SHARDS: u64 = 2048;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a.
fn fnv1a(key: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

struct Entry<V> {
    value: V,
    written_at: Instant,
}

struct Shard<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V> Shard<V> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

/// Sharded key/value cache with per-entry TTL.
pub struct ShardedCache<V> {
    shards: Vec<Shard<V>>,
    mask: u64,
    ttl: Duration,
}

impl<V: Clone + Send + 'static> ShardedCache<V> {
    /// Cache with [`DEFAULT_SHARDS`] shards and [`DEFAULT_TTL`] lifetime. The
    /// returned handle owns the reaper task, which stops once every clone of
    /// the handle is dropped.
    pub fn new() -> Arc<Self> {
        Self::with_config(DEFAULT_SHARDS, DEFAULT_TTL)
    }

    /// Cache with an explicit shard count (rounded up to a power of two) and
    /// TTL.
    pub fn with_config(shards: u64, ttl: Duration) -> Arc<Self> {
        let shards = shards.max(1).next_power_of_two();
        let cache = Arc::new(Self {
            shards: (0..shards).map(|_| Shard::new()).collect(),
            mask: shards - 1,
            ttl,
        });
        Self::spawn_reaper(Arc::downgrade(&cache));
        cache
    }

    fn shard(&self, key: &str) -> &Shard<V> {
        &self.shards[(fnv1a(key) & self.mask) as usize]
    }

    /// Return the live value for `key`, or compute, store and return
    /// `fallback()`. The fallback runs under the shard lock, so it must not
    /// block.
    pub fn load(&self, key: &str, fallback: impl FnOnce() -> V) -> V {
        let shard = self.shard(key);
        let mut entries = shard.entries.lock().expect("shard lock");
        match entries.get(key) {
            Some(entry) if entry.written_at.elapsed() < self.ttl => entry.value.clone(),
            _ => {
                let value = fallback();
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.clone(),
                        written_at: Instant::now(),
                    },
                );
                value
            }
        }
    }

    /// Store `value` under `key`, resetting its TTL.
    pub fn store(&self, key: &str, value: V) {
        let shard = self.shard(key);
        let mut entries = shard.entries.lock().expect("shard lock");
        entries.insert(
            key.to_string(),
            Entry {
                value,
                written_at: Instant::now(),
            },
        );
    }

    /// Number of live (possibly expired, not yet swept) entries.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.entries.lock().expect("shard lock").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry whose TTL has elapsed. Called by the reaper; exposed
    /// for tests.
    pub fn sweep(&self) {
        for shard in &self.shards {
            let mut entries = shard.entries.lock().expect("shard lock");
            entries.retain(|_, entry| entry.written_at.elapsed() < self.ttl);
        }
    }

    fn spawn_reaper(cache: Weak<Self>) {
        let Some(strong) = cache.upgrade() else {
            return;
        };
        // Sweep at most once per TTL, at least once per second.
        let interval = strong.ttl.min(Duration::from_secs(1)).max(Duration::from_millis(10));
        drop(strong);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    match cache.upgrade() {
                        Some(cache) => cache.sweep(),
                        None => return,
                    }
                }
            });
        }
        // Without a runtime (plain unit tests), expiry still holds: `load`
        // checks freshness on read and `sweep` can be driven manually.
    }
}
