mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier, OnceLock};
use std::thread;
use std::time::Duration;

use common::{eventually, ScriptedSource, SECOND};
use futures::FutureExt;
use quotagate::{FetchError, Limiter, ManualClock, QuotaFuture, QuotaSource};

const THREADS: usize = 16;

fn hammer<F>(f: F)
where
    F: Fn(usize) + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let f = f.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                f(i);
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_first_access_builds_one_bucket() {
    let source = ScriptedSource::new();
    let limiter = Limiter::builder()
        .clock(ManualClock::new())
        .failsafe_quota(5.0)
        .quota_source(source.clone())
        .build()
        .unwrap();

    let granted = Arc::new(AtomicUsize::new(0));
    let (l, g) = (limiter.clone(), granted.clone());
    tokio::task::spawn_blocking(move || {
        hammer(move |_| {
            for _ in 0..20 {
                if l.acquire_permit("shared").unwrap() {
                    g.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
    })
    .await
    .unwrap();

    assert_eq!(source.started(), 1);
    assert_eq!(limiter.tracked_keys(), 1);
    assert_eq!(granted.load(Ordering::SeqCst), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn at_most_one_fetch_in_flight_per_key() {
    let clock = ManualClock::new();
    let source = ScriptedSource::new();
    let limiter = Limiter::builder()
        .clock(clock.clone())
        // A zero quota is retained for the full hour, so the storm never evicts the bucket.
        .failsafe_quota(0.0)
        .refresh_interval(Duration::from_nanos(1))
        .max_retention(Duration::from_secs(3600))
        .quota_source(source.clone())
        .build()
        .unwrap();

    limiter.acquire_permit("k").unwrap();
    let storm = {
        let (l, c) = (limiter.clone(), clock.clone());
        move || {
            hammer(move |_| {
                for _ in 0..50 {
                    c.advance(SECOND);
                    l.acquire_permit("k").unwrap();
                }
            })
        }
    };

    // Every rollover finds the quota stale, but the first fetch is still outstanding.
    tokio::task::spawn_blocking(storm.clone()).await.unwrap();
    assert_eq!(source.started(), 1);

    source.resolve_next(Ok(Some(0.0)));
    let l = limiter.clone();
    eventually(move || !l.snapshot("k").unwrap().fetch_in_progress).await;

    tokio::task::spawn_blocking(storm).await.unwrap();
    assert_eq!(source.started(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mid_window_update_under_contention_never_over_grants() {
    let source = ScriptedSource::new();
    let limiter = Limiter::builder()
        .clock(ManualClock::new())
        .failsafe_quota(50.0)
        .quota_source(source.clone())
        .build()
        .unwrap();

    let granted = Arc::new(AtomicUsize::new(0));
    let (l, g) = (limiter.clone(), granted.clone());
    let workers = tokio::task::spawn_blocking(move || {
        hammer(move |_| {
            for _ in 0..40 {
                if l.acquire_permit("k").unwrap() {
                    g.fetch_add(1, Ordering::SeqCst);
                }
                thread::yield_now();
            }
        })
    });
    let l = limiter.clone();
    eventually(move || l.tracked_keys() == 1).await;
    source.resolve_next(Ok(Some(80.0)));
    workers.await.unwrap();

    let l = limiter.clone();
    eventually(move || !l.snapshot("k").unwrap().fetch_in_progress).await;
    // Whatever the interleaving, window 0 hands out at most its final allotment.
    assert!(granted.load(Ordering::SeqCst) <= 80);
    assert_eq!(limiter.snapshot("k").unwrap().window_permits, 80);
}

/// Source that calls back into the limiter while starting a fetch.
struct ReentrantSource {
    limiter: Arc<OnceLock<Limiter>>,
    seen_keys: Arc<AtomicUsize>,
}

impl QuotaSource for ReentrantSource {
    fn fetch(&self, key: &str) -> Result<QuotaFuture, FetchError> {
        if let Some(limiter) = self.limiter.get() {
            self.seen_keys.store(limiter.tracked_keys(), Ordering::SeqCst);
            let _ = limiter.acquire_permit(key);
        }
        Ok(async { Ok::<_, FetchError>(None) }.boxed())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn source_may_call_back_into_the_limiter() {
    let cell = Arc::new(OnceLock::new());
    let seen_keys = Arc::new(AtomicUsize::new(0));
    let limiter = Limiter::builder()
        .clock(ManualClock::new())
        .failsafe_quota(5.0)
        .quota_source(ReentrantSource { limiter: cell.clone(), seen_keys: seen_keys.clone() })
        .build()
        .unwrap();
    let _ = cell.set(limiter.clone());

    let (tx, rx) = mpsc::channel();
    let l = limiter.clone();
    thread::spawn(move || {
        let _ = tx.send(l.acquire_permit("k").map_err(|e| e.to_string()));
    });
    let result = rx.recv_timeout(Duration::from_secs(3)).expect("acquire_permit returned");

    assert_eq!(result, Ok(true));
    assert_eq!(seen_keys.load(Ordering::SeqCst), 1);
    // One permit went to the nested call made from inside the source.
    assert_eq!(limiter.snapshot("k").unwrap().available_permits, 3);
}
