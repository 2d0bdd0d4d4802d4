//! Concurrent key → bucket map with per-entry idle expiry.
//!
//! Each entry expires once it has been idle for longer than its bucket's current retention, which
//! moves with the key's quota. Expired entries are dropped lazily on lookup, by a sweep that lookups
//! trigger once per burst window, and by [`KeyedCache::sweep`], which the limiter can also run on
//! an interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::MissedTickBehavior;

use crate::bucket::WindowBucket;
use crate::config::Shared;
use crate::error::AcquireError;

#[derive(Debug)]
pub(crate) struct KeyedCache {
    entries: DashMap<String, Arc<WindowBucket>>,
    next_sweep_tick: AtomicU64,
    shared: Arc<Shared>,
}

impl KeyedCache {
    pub(crate) fn new(shared: Arc<Shared>) -> Arc<Self> {
        let first_sweep = shared.now_ticks().saturating_add(shared.settings.burst_window_ticks);
        Arc::new(Self { entries: DashMap::new(), next_sweep_tick: AtomicU64::new(first_sweep), shared })
    }

    /// Live bucket for `key`, creating one on first use or after expiry.
    ///
    /// At most one bucket is built per key at a time: creation runs under the entry's shard lock.
    /// The initial fetch is started after that lock is released; if the source refuses it, the
    /// new bucket is removed again and the error returned.
    pub(crate) fn get_or_create(
        self: &Arc<Self>,
        key: &str,
        now: u64,
    ) -> Result<Arc<WindowBucket>, AcquireError> {
        self.sweep_if_due(now);

        // Touching under the read guard keeps a concurrent sweep from evicting the bucket between
        // the expiry check and the access.
        let live = self
            .entries
            .get(key)
            .and_then(|entry| entry.value().touch_if_live(now).then(|| entry.value().clone()));
        if let Some(bucket) = live {
            return Ok(bucket);
        }

        let bucket = match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().touch_if_live(now) {
                    return Ok(occupied.get().clone());
                }
                tracing::debug!(key, "evicting idle bucket");
                let bucket = WindowBucket::new(key, now, self.shared.clone(), Arc::downgrade(self));
                occupied.insert(bucket.clone());
                bucket
            }
            Entry::Vacant(vacant) => {
                let bucket = WindowBucket::new(key, now, self.shared.clone(), Arc::downgrade(self));
                vacant.insert(bucket.clone());
                bucket
            }
        };

        if let Err(e) = bucket.start(now) {
            self.entries.remove_if(key, |_, current| Arc::ptr_eq(current, &bucket));
            return Err(e);
        }
        Ok(bucket)
    }

    /// Sweep at most once per burst window, on whichever caller first sees the deadline pass.
    fn sweep_if_due(&self, now: u64) {
        let due = self.next_sweep_tick.load(Ordering::Acquire);
        if now < due {
            return;
        }
        let next = now.saturating_add(self.shared.settings.burst_window_ticks);
        if self
            .next_sweep_tick
            .compare_exchange(due, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let evicted = self.sweep(now);
            if evicted > 0 {
                tracing::trace!(evicted, remaining = self.len(), "swept idle buckets on access");
            }
        }
    }

    /// Bucket for `key` without recording an access.
    pub(crate) fn peek(&self, key: &str) -> Option<Arc<WindowBucket>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Re-evaluate `key`'s expiry after its retention changed.
    ///
    /// Counts as an access, so a key whose quota was just refreshed is not evicted on the stale
    /// retention.
    pub(crate) fn force_refresh_expiry(&self, key: &str, now: u64) {
        if let Some(entry) = self.entries.get(key) {
            entry.touch_if_live(now);
        }
    }

    /// Drop every expired entry, returning how many were evicted.
    pub(crate) fn sweep(&self, now: u64) -> usize {
        let mut evicted = 0;
        self.entries.retain(|key, bucket| {
            let expired = bucket.is_expired(now);
            if expired {
                tracing::debug!(key = %key, "evicting idle bucket");
                evicted += 1;
            }
            !expired
        });
        evicted
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Sweep on the limiter's runtime every `every` until the cache is dropped.
    pub(crate) fn spawn_sweeper(self: &Arc<Self>, every: Duration) {
        let cache: Weak<Self> = Arc::downgrade(self);
        tracing::debug!(interval = ?every, "bucket sweeper started");
        self.shared.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else { break };
                let evicted = cache.sweep(cache.shared.now_ticks());
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = cache.len(), "swept idle buckets");
                }
            }
            tracing::debug!("bucket sweeper stopped");
        });
    }
}
