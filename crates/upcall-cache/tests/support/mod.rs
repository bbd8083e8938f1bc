//! Shared harness for the integration test binaries in this crate.
//!
//! `CounterOps` stands in for a real upcall: `do_upcall` hands the key off
//! to a channel instead of actually shelling out, and a responder thread
//! (started per-test via [`spawn_responder`]) plays the role of the
//! external process by calling `downcall` back after a short delay. This
//! mirrors how the demo CLI drives `Cache` with a detached thread, just
//! with more control knobs for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use upcall_cache::{Cache, CacheError, CacheOps, Entry};

pub type TestCache = Cache<u64, u64, CounterOps>;

/// Counts `do_upcall` dispatches and can be told (before or during a test)
/// to fail the upcall dispatch itself, fail downcall parsing, or report
/// the key as removed upstream. The atomics are `Arc`-shared with the test
/// so they stay inspectable after `CounterOps` itself has been moved into
/// a `Cache`.
pub struct CounterOps {
    pub upcall_count: Arc<AtomicUsize>,
    pub fail_parse: Arc<AtomicBool>,
    pub removed_upstream: Arc<AtomicBool>,
    tx: Mutex<Sender<u64>>,
}

/// Handles for inspecting/controlling a `CounterOps` from outside the
/// `Cache` it was moved into.
pub struct CounterHandles {
    pub upcall_count: Arc<AtomicUsize>,
    pub fail_parse: Arc<AtomicBool>,
    pub removed_upstream: Arc<AtomicBool>,
}

impl CounterOps {
    pub fn new() -> (Self, CounterHandles, Receiver<u64>) {
        let (tx, rx) = mpsc::channel();
        let upcall_count = Arc::new(AtomicUsize::new(0));
        let fail_parse = Arc::new(AtomicBool::new(false));
        let removed_upstream = Arc::new(AtomicBool::new(false));
        let handles = CounterHandles {
            upcall_count: Arc::clone(&upcall_count),
            fail_parse: Arc::clone(&fail_parse),
            removed_upstream: Arc::clone(&removed_upstream),
        };
        (
            CounterOps {
                upcall_count,
                fail_parse,
                removed_upstream,
                tx: Mutex::new(tx),
            },
            handles,
            rx,
        )
    }
}

impl CacheOps<u64, u64> for CounterOps {
    fn do_upcall(&self, entry: &Entry<u64>) -> Result<(), CacheError> {
        self.upcall_count.fetch_add(1, Ordering::SeqCst);
        if self.removed_upstream.load(Ordering::SeqCst) {
            return Err(CacheError::RemovedUpstream);
        }
        self.tx
            .lock()
            .expect("sender mutex poisoned")
            .send(entry.key())
            .expect("responder thread dropped its receiver");
        Ok(())
    }

    fn parse_downcall(&self, _entry: &Entry<u64>, args: &u64) -> Result<u64, CacheError> {
        if self.fail_parse.load(Ordering::SeqCst) {
            Err(CacheError::UpcallError(1))
        } else {
            Ok(*args)
        }
    }
}

/// Builds a cache with a 16-chain table, a 60s entry TTL, and a bounded
/// acquire window, wired to a fresh `CounterOps`.
pub fn new_cache(
    acquire_expire_secs: i64,
    acquire_replay: bool,
) -> (Arc<TestCache>, CounterHandles, Receiver<u64>) {
    new_cache_with_entry_expire(60, acquire_expire_secs, acquire_replay)
}

/// Like [`new_cache`] but with a caller-chosen entry TTL, for tests that
/// need entries to go stale quickly.
pub fn new_cache_with_entry_expire(
    entry_expire_secs: i64,
    acquire_expire_secs: i64,
    acquire_replay: bool,
) -> (Arc<TestCache>, CounterHandles, Receiver<u64>) {
    let (ops, handles, rx) = CounterOps::new();
    let cache = Arc::new(Cache::new(
        "test",
        "/bin/true",
        16,
        entry_expire_secs,
        acquire_expire_secs,
        acquire_replay,
        ops,
    ));
    (cache, handles, rx)
}

/// Spawns a thread that answers every key it receives on `rx` by calling
/// `cache.downcall(0, key, &key)` after `delay`, i.e. a successful downcall
/// whose payload equals the key itself.
pub fn spawn_responder(cache: Arc<TestCache>, rx: Receiver<u64>, delay: Duration) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for key in rx {
            thread::sleep(delay);
            let _ = cache.downcall(0, key, &key);
        }
    })
}
