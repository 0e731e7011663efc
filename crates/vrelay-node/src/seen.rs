//! Recently seen message ids.
//!
//! A time-bounded approximation of "ever seen": an id marked at `T`
//! reports as seen until at least `T + ttl`, and disappears at the first
//! sweep after that. Entries are only ever inserted or removed.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::Clock;
use crate::maintenance::PeriodicTask;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub ttl_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 3600,
            cleanup_interval_secs: 3600,
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

pub struct SeenCache {
    entries: DashMap<String, u64>,
    ttl: Duration,
    cleanup_interval: Duration,
}

impl SeenCache {
    pub fn new(ttl: Duration, cleanup_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            cleanup_interval,
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.ttl(), config.cleanup_interval())
    }

    pub fn seen(&self, message_id: &str) -> bool {
        self.entries.contains_key(message_id)
    }

    /// Record `message_id` if absent; the first-seen time is never overwritten.
    pub fn mark_seen(&self, message_id: &str, now_millis: u64) {
        self.entries
            .entry(message_id.to_string())
            .or_insert(now_millis);
    }

    /// Atomically check and mark. Returns `true` if this call inserted the id.
    pub fn try_mark(&self, message_id: &str, now_millis: u64) -> bool {
        match self.entries.entry(message_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(now_millis);
                true
            }
        }
    }

    /// Run `admit` with the id's slot held and mark it only if `admit` succeeds.
    ///
    /// Returns `None` without calling `admit` when the id is already marked.
    /// Concurrent callers for the same id wait for the slot, so a rejected
    /// attempt never hides the id from a retry that arrives meanwhile.
    pub fn try_mark_with<T, E>(
        &self,
        message_id: &str,
        now_millis: u64,
        admit: impl FnOnce() -> Result<T, E>,
    ) -> Option<Result<T, E>> {
        match self.entries.entry(message_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(v) => {
                let admitted = admit();
                if admitted.is_ok() {
                    v.insert(now_millis);
                }
                Some(admitted)
            }
        }
    }

    /// Remove entries first seen more than `ttl` before `now_millis`.
    pub fn sweep(&self, now_millis: u64, ttl: Duration) -> usize {
        let ttl_ms = ttl.as_millis() as u64;
        let before = self.entries.len();
        self.entries
            .retain(|_, first_seen| now_millis.saturating_sub(*first_seen) <= ttl_ms);
        before.saturating_sub(self.entries.len())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sweep with the configured ttl every `cleanup_interval`.
    pub fn start(self: &Arc<Self>, clock: Arc<dyn Clock>) -> PeriodicTask {
        let cache = Arc::clone(self);
        PeriodicTask::spawn("seen-cache-sweep", self.cleanup_interval, move || {
            let cache = Arc::clone(&cache);
            let clock = Arc::clone(&clock);
            async move {
                let removed = cache.sweep(clock.now_millis(), cache.ttl());
                if removed > 0 {
                    info!(
                        "Seen cache cleanup: removed {} old message ids, {} remaining",
                        removed,
                        cache.len()
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const T: u64 = 1_700_000_000_000;
    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn cache() -> SeenCache {
        SeenCache::new(DAY, Duration::from_secs(3600))
    }

    #[test]
    fn test_mark_and_seen() {
        let cache = cache();
        assert!(!cache.seen("m-1"));
        cache.mark_seen("m-1", T);
        assert!(cache.seen("m-1"));
        assert!(!cache.seen("m-2"));
    }

    #[test]
    fn test_sweep_respects_ttl() {
        let cache = cache();
        let ttl_ms = DAY.as_millis() as u64;
        cache.mark_seen("m-1", T);

        assert_eq!(cache.sweep(T + ttl_ms - 1, DAY), 0);
        assert!(cache.seen("m-1"));

        assert_eq!(cache.sweep(T + ttl_ms + 1, DAY), 1);
        assert!(!cache.seen("m-1"));
    }

    #[test]
    fn test_mark_does_not_refresh_first_seen() {
        let cache = cache();
        let ttl_ms = DAY.as_millis() as u64;
        cache.mark_seen("m-1", T);
        cache.mark_seen("m-1", T + ttl_ms);

        cache.sweep(T + ttl_ms + 1, DAY);
        assert!(!cache.seen("m-1"));
    }

    #[test]
    fn test_try_mark_is_exclusive() {
        let cache = cache();
        assert!(cache.try_mark("m-1", T));
        assert!(!cache.try_mark("m-1", T + 5));
    }

    #[test]
    fn test_try_mark_with_marks_only_when_admitted() {
        let cache = cache();
        assert_eq!(cache.try_mark_with("m-1", T, || Err::<(), _>("full")), Some(Err("full")));
        assert!(!cache.seen("m-1"));

        assert_eq!(cache.try_mark_with("m-1", T, || Ok::<_, ()>(7)), Some(Ok(7)));
        assert!(cache.seen("m-1"));

        let mut called = false;
        let again = cache.try_mark_with("m-1", T, || {
            called = true;
            Ok::<_, ()>(8)
        });
        assert_eq!(again, None);
        assert!(!called);
    }

    #[test]
    fn test_concurrent_rejections_do_not_hide_retries() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let cache = Arc::new(cache());
        let attempts = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let attempts = Arc::clone(&attempts);
                std::thread::spawn(move || {
                    cache.try_mark_with("contended", T, || {
                        // the first eight attempts are refused
                        if attempts.fetch_add(1, Ordering::SeqCst) < 8 {
                            Err(())
                        } else {
                            Ok(())
                        }
                    })
                })
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let count = |want: Option<Result<(), ()>>| outcomes.iter().filter(|o| **o == want).count();
        assert_eq!(count(Some(Err(()))), 8);
        assert_eq!(count(Some(Ok(()))), 1);
        assert_eq!(count(None), 7);
        assert!(cache.seen("contended"));
    }

    #[test]
    fn test_concurrent_try_mark_single_winner() {
        let cache = Arc::new(cache());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.try_mark("contended", T))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep() {
        let clock = Arc::new(ManualClock::new(T));
        let cache = Arc::new(SeenCache::new(Duration::from_secs(60), Duration::from_secs(10)));
        cache.mark_seen("m-1", T);

        let task = cache.start(clock.clone());
        clock.advance(Duration::from_secs(61));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!cache.seen("m-1"));
        task.stop().await;
    }
}
