//! The cache itself: hash table ownership, the single table lock, and the
//! lookup/downcall/flush coordinators built on top of [`Entry`] and
//! [`Table`].

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::entry::{Entry, Settled};
use crate::error::CacheError;
use crate::ops::CacheOps;
use crate::table::Table;

/// A coalescing upcall cache: concurrent lookups for the same key share a
/// single in-flight acquisition, driven by `O`'s [`CacheOps`] hooks.
///
/// `V` is the cached payload type; `A` is the caller-supplied argument type
/// threaded through the compare/upcall/downcall hooks alongside the raw
/// `u64` key.
pub struct Cache<V, A, O> {
    table: Mutex<Table<V>>,
    ops: O,
    name: String,
    upcall_path: String,
    entry_expire: i64,
    acquire_expire_secs: i64,
    acquire_replay: bool,
    base: Instant,
    _args: PhantomData<fn() -> A>,
}

impl<V, A, O: CacheOps<V, A>> Cache<V, A, O> {
    /// Constructs a cache. `hash_size` is the number of collision chains;
    /// `entry_expire` is the default TTL (seconds) applied to a `Valid`
    /// entry when the downcall doesn't supply one; `acquire_expire` bounds
    /// (in seconds) how long an `Acquiring` entry may stay in flight;
    /// `acquire_replay` permits a single transparent retry for a waiter
    /// that timed out or was interrupted.
    pub fn new(
        name: impl Into<String>,
        upcall_path: impl Into<String>,
        hash_size: usize,
        entry_expire: i64,
        acquire_expire: i64,
        acquire_replay: bool,
        ops: O,
    ) -> Self {
        let name = name.into();
        let upcall_path = upcall_path.into();
        tracing::debug!(cache = %name, hash_size, entry_expire, acquire_expire, "initializing upcall cache");
        Cache {
            table: Mutex::new(Table::new(hash_size)),
            ops,
            name,
            upcall_path,
            entry_expire,
            acquire_expire_secs: acquire_expire,
            acquire_replay,
            base: Instant::now(),
            _args: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn upcall_path(&self) -> &str {
        &self.upcall_path
    }

    fn now_secs(&self) -> i64 {
        self.base.elapsed().as_secs() as i64
    }

    // ── Lookup coordinator ──────────────────────────────────────────────

    /// Returns a refcounted, `Valid` entry for `key`, dispatching the
    /// upcall hook at most once per acquisition episode and coalescing any
    /// number of concurrent callers onto that one acquisition.
    #[tracing::instrument(skip(self, args))]
    pub fn get_entry(&self, key: u64, args: &A) -> Result<Arc<Entry<V>>, CacheError> {
        let mut retried = false;
        let mut pending_new: Option<Arc<Entry<V>>> = None;

        loop {
            let mut table = self.table.lock().expect("upcall cache table mutex poisoned");

            let entry = match self.sweep_and_find(&mut table, key, args) {
                Some(found) => {
                    if let Some(pending) = pending_new.take() {
                        if !Arc::ptr_eq(&pending, &found) {
                            self.ops.free_entry(&pending);
                        }
                    }
                    found
                }
                None => match pending_new.take() {
                    Some(new_entry) => {
                        table.insert_front(new_entry.clone());
                        new_entry
                    }
                    None => {
                        drop(table);
                        let fresh = Arc::new(Entry::new(key));
                        self.ops.init_entry(&fresh, args);
                        pending_new = Some(fresh);
                        continue;
                    }
                },
            };

            entry.get_ref();

            let mut is_creator = false;
            if entry.flags().settled == Settled::New && !entry.flags().acquiring {
                is_creator = true;
                entry.set_flags(Settled::New, true);
                drop(table);
                let dispatch = self.ops.do_upcall(&entry);
                table = self.table.lock().expect("upcall cache table mutex poisoned");
                entry.set_acquire_expire(self.now_secs() + self.acquire_expire_secs);

                if let Err(e) = dispatch {
                    entry.set_flags(Settled::Invalid, false);
                    entry.waitq.notify_all();
                    tracing::warn!(key, error = %e, "do_upcall dispatch failed");
                    if matches!(e, CacheError::RemovedUpstream) {
                        self.release(&mut table, &entry);
                        return Err(e);
                    }
                }
            }

            if entry.flags().acquiring {
                let timeout = is_creator
                    .then(|| Duration::from_secs(self.acquire_expire_secs.max(0) as u64));
                table = self.wait_for_completion(table, &entry, timeout);

                if entry.flags().acquiring {
                    // Only the bounded (creator) wait can return here: the
                    // unbounded wait used by non-creators blocks until the
                    // predicate is false. std::sync::Condvar has no
                    // cancellation primitive, so an interrupted wait (the
                    // spec's INTERRUPTED classification) cannot occur via
                    // this backend — see DESIGN.md.
                    debug_assert!(is_creator);
                    self.expire_acquiring(&mut table, &entry);
                    self.release(&mut table, &entry);
                    drop(table);

                    let timed_out = CacheError::TimedOut;
                    if !retried && self.acquire_replay && timed_out.is_replayable() {
                        retried = true;
                        continue;
                    }
                    return Err(timed_out);
                }
            }

            if entry.flags().settled == Settled::Invalid {
                self.release(&mut table, &entry);
                return Err(CacheError::RemovedUpstream);
            }

            let now = self.now_secs();
            if self.check_unlink_entry(&mut table, &entry, now) {
                if is_creator {
                    // Give the creator one use of its own entry even
                    // though it just turned stale, to avoid a livelock
                    // against a pathologically short expiry.
                    return Ok(entry);
                }
                self.release(&mut table, &entry);
                drop(table);
                pending_new = None;
                continue;
            }

            return Ok(entry);
        }
    }

    /// Takes an additional reference on an already-held entry.
    pub fn get_entry_raw(&self, entry: &Arc<Entry<V>>) {
        let _table = self.table.lock().expect("upcall cache table mutex poisoned");
        entry.get_ref();
    }

    /// Releases a reference taken by [`Cache::get_entry`] or
    /// [`Cache::get_entry_raw`].
    pub fn put_entry(&self, entry: &Arc<Entry<V>>) {
        let mut table = self.table.lock().expect("upcall cache table mutex poisoned");
        self.release(&mut table, entry);
    }

    /// Sets `expire` and, if `force` names a settled state, forces it
    /// (otherwise the entry becomes `Valid`). Exposed for embedders that
    /// need to seed or correct an entry outside the downcall path.
    pub fn update_entry(&self, entry: &Arc<Entry<V>>, expire: i64, force: Option<Settled>) {
        let _table = self.table.lock().expect("upcall cache table mutex poisoned");
        entry.set_expire(expire);
        entry.set_flags(force.unwrap_or(Settled::Valid), false);
    }

    // ── Downcall coordinator ────────────────────────────────────────────

    /// Delivers an external result for `key`. `err == 0` is success.
    #[tracing::instrument(skip(self, args))]
    pub fn downcall(&self, err: i32, key: u64, args: &A) -> Result<(), CacheError> {
        let mut table = self.table.lock().expect("upcall cache table mutex poisoned");

        let entry = table
            .chain(key)
            .iter()
            .cloned()
            .find(|e| e.key() == key && self.ops.downcall_compare(e, key, args));

        let entry = match entry {
            Some(e) => e,
            None => {
                tracing::warn!(key, "downcall for key not expected");
                return Err(CacheError::NotFound);
            }
        };
        entry.get_ref();

        let mut status: Result<(), CacheError> = Ok(());
        let mut became_bad = false;
        let mut became_valid = false;

        if err != 0 {
            tracing::warn!(key, err, "downcall reported upcall failure");
            status = Err(CacheError::UpcallError(err));
            became_bad = true;
        } else if !entry.flags().acquiring {
            tracing::debug!(key, "downcall for an already-settled entry; result dropped");
        } else if entry.flags().is_settled_bad() {
            tracing::warn!(key, "downcall raced with an entry that already expired");
            status = Err(CacheError::InvalidState);
            became_bad = true;
        } else {
            drop(table);
            let parsed = self.ops.parse_downcall(&entry, args);
            table = self.table.lock().expect("upcall cache table mutex poisoned");
            match parsed {
                Ok(value) => {
                    entry.set_payload(value);
                    if entry.expire() == 0 {
                        entry.set_expire(self.now_secs() + self.entry_expire);
                    }
                    became_valid = true;
                    tracing::debug!(key, "entry is now valid");
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "parse_downcall failed");
                    status = Err(e);
                    became_bad = true;
                }
            }
        }

        if became_bad {
            entry.set_flags(Settled::Invalid, false);
            table.remove_if_present(&entry);
        } else if became_valid {
            entry.set_flags(Settled::Valid, false);
        } else {
            // No-op branch (already settled): acquiring is already false,
            // nothing left to clear.
        }
        entry.waitq.notify_all();
        self.release(&mut table, &entry);
        status
    }

    // ── Maintenance ─────────────────────────────────────────────────────

    /// Walks every chain. Entries with no outstanding references are
    /// freed; referenced entries are marked `Expired` (unless `force`,
    /// which asserts no references remain) and reclaimed once released.
    #[tracing::instrument(skip(self))]
    pub fn flush(&self, force: bool) {
        let mut table = self.table.lock().expect("upcall cache table mutex poisoned");
        for chain in table.all_chains_mut() {
            let mut i = 0;
            while i < chain.len() {
                let entry = chain[i].clone();
                if !force && entry.refcount() > 0 {
                    let acquiring = entry.flags().acquiring;
                    if entry.flags().settled != Settled::Expired {
                        entry.set_flags(Settled::Expired, acquiring);
                    }
                    i += 1;
                    continue;
                }
                debug_assert_eq!(entry.refcount(), 0, "flush(force=true) on a referenced entry");
                chain.remove(i);
                self.free_entry(&entry);
            }
        }
    }

    /// Flushes a single entry matching `key`/`args`, freeing it
    /// immediately if nothing else holds a reference.
    #[tracing::instrument(skip(self, args))]
    pub fn flush_one(&self, key: u64, args: &A) {
        let mut table = self.table.lock().expect("upcall cache table mutex poisoned");
        let found = table
            .chain(key)
            .iter()
            .cloned()
            .find(|e| e.key() == key && self.ops.upcall_compare(e, key, args));

        if let Some(entry) = found {
            tracing::warn!(
                key,
                refcount = entry.refcount(),
                flags = ?entry.flags(),
                acquire_expire = entry.acquire_expire(),
                expire = entry.expire(),
                "flushing single entry"
            );
            let acquiring = entry.flags().acquiring;
            entry.set_flags(Settled::Expired, acquiring);
            if entry.refcount() == 0 {
                table.remove_if_present(&entry);
                self.free_entry(&entry);
            }
        }
    }

    /// Forces out every entry, regardless of references, and releases the
    /// cache's own resources. No further lookups should be issued after
    /// this call.
    pub fn cleanup(&self) {
        self.flush(true);
    }

    // ── Shared internals ────────────────────────────────────────────────

    fn sweep_and_find(&self, table: &mut Table<V>, key: u64, args: &A) -> Option<Arc<Entry<V>>> {
        let now = self.now_secs();
        let snapshot: Vec<Arc<Entry<V>>> = table.chain(key).iter().cloned().collect();
        for entry in snapshot {
            if self.check_unlink_entry(table, &entry, now) {
                continue;
            }
            if entry.key() == key && self.ops.upcall_compare(&entry, key, args) {
                table.remove_if_present(&entry);
                table.insert_front(entry.clone());
                return Some(entry);
            }
        }
        None
    }

    /// Applies the sweep policy to one entry. If the entry is stale it is
    /// unlinked (and freed, if unreferenced) before returning `true`.
    fn check_unlink_entry(&self, table: &mut Table<V>, entry: &Arc<Entry<V>>, now: i64) -> bool {
        let flags = entry.flags();

        if flags.settled == Settled::Valid && now < entry.expire() {
            return false;
        }

        if flags.acquiring {
            if entry.acquire_expire() == 0 || now < entry.acquire_expire() {
                return false;
            }
            self.expire_acquiring(table, entry);
        } else if flags.settled != Settled::Invalid {
            entry.set_flags(Settled::Expired, false);
            table.remove_if_present(entry);
        } else {
            table.remove_if_present(entry);
        }

        if entry.refcount() == 0 {
            self.free_entry(entry);
        }
        true
    }

    /// Marks an in-flight entry `Expired`, wakes every waiter, and
    /// unlinks it from its chain. Shared by the sweep path and by a
    /// creator whose own bounded wait has just elapsed.
    fn expire_acquiring(&self, table: &mut Table<V>, entry: &Arc<Entry<V>>) {
        entry.set_flags(Settled::Expired, false);
        entry.waitq.notify_all();
        tracing::debug!(key = entry.key(), "acquire deadline elapsed; expiring entry");
        table.remove_if_present(entry);
    }

    /// Releases a reference. If it was the last one and the entry is
    /// settled-bad, frees it (unlinking first if it's still linked).
    fn release(&self, table: &mut Table<V>, entry: &Arc<Entry<V>>) {
        if entry.put_ref() == 0 && entry.flags().is_settled_bad() {
            table.remove_if_present(entry);
            self.free_entry(entry);
        }
    }

    fn free_entry(&self, entry: &Arc<Entry<V>>) {
        self.ops.free_entry(entry);
        tracing::debug!(key = entry.key(), "freed cache entry");
    }

    fn wait_for_completion<'a>(
        &'a self,
        table: MutexGuard<'a, Table<V>>,
        entry: &Entry<V>,
        timeout: Option<Duration>,
    ) -> MutexGuard<'a, Table<V>> {
        match timeout {
            Some(d) => {
                entry
                    .waitq
                    .wait_timeout_while(table, d, |_| entry.flags().acquiring)
                    .expect("upcall cache table mutex poisoned")
                    .0
            }
            None => entry
                .waitq
                .wait_while(table, |_| entry.flags().acquiring)
                .expect("upcall cache table mutex poisoned"),
        }
    }
}
