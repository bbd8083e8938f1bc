//! A single cache record and its state machine.
//!
//! Entries are reference-counted (`Arc`) so a lookup can hand one out to a
//! caller while the cache keeps its own chain-membership reference. The
//! mutable metadata (settledness, acquiring bit, refcount, deadlines) lives
//! behind atomics purely so `Entry` is `Send + Sync` and shareable — every
//! write to it happens while the owning [`crate::Cache`]'s single table lock
//! is held. The payload is a [`OnceLock`], set exactly once by a successful
//! downcall, so holders can read it afterward without touching the lock at
//! all.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Condvar, OnceLock};

/// The "settled" state of an entry — mutually exclusive, composed with a
/// separate `acquiring` bit (see module docs and spec's Design Notes on
/// why a tagged enum alone cannot express the transitional
/// "settled-bad while still ACQUIRING" wake window).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    New,
    Valid,
    Invalid,
    Expired,
}

impl Settled {
    fn to_bits(self) -> u8 {
        match self {
            Settled::New => 0,
            Settled::Valid => 1,
            Settled::Invalid => 2,
            Settled::Expired => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Settled::New,
            1 => Settled::Valid,
            2 => Settled::Invalid,
            _ => Settled::Expired,
        }
    }
}

const ACQUIRING_BIT: u8 = 1 << 7;
const SETTLED_MASK: u8 = 0b0111;

fn pack(settled: Settled, acquiring: bool) -> u8 {
    settled.to_bits() | if acquiring { ACQUIRING_BIT } else { 0 }
}

/// An entry's composite state, as read in one atomic snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub settled: Settled,
    pub acquiring: bool,
}

impl Flags {
    /// An entry is "settled-bad" if it will never become `Valid` again.
    pub fn is_settled_bad(self) -> bool {
        matches!(self.settled, Settled::Invalid | Settled::Expired)
    }
}

/// One cache record: key, payload, refcount, state, and a wake-all
/// rendezvous for threads awaiting acquisition.
pub struct Entry<V> {
    key: u64,
    flags: AtomicU8,
    refcount: AtomicU32,
    /// Deadline (seconds since the cache's epoch) by which an in-flight
    /// upcall must complete. `0` means "not yet dispatched".
    acquire_expire: AtomicI64,
    /// Deadline after which a `Valid` entry is considered stale.
    expire: AtomicI64,
    /// Wake-all rendezvous. Always waited on via a `MutexGuard` taken from
    /// the owning cache's table lock — see module docs.
    pub(crate) waitq: Condvar,
    payload: OnceLock<V>,
}

impl<V> Entry<V> {
    pub(crate) fn new(key: u64) -> Self {
        Entry {
            key,
            flags: AtomicU8::new(pack(Settled::New, false)),
            refcount: AtomicU32::new(0),
            acquire_expire: AtomicI64::new(0),
            expire: AtomicI64::new(0),
            waitq: Condvar::new(),
            payload: OnceLock::new(),
        }
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    /// The payload set by a successful downcall, if any. Readable without
    /// the cache lock — see module docs.
    pub fn payload(&self) -> Option<&V> {
        self.payload.get()
    }

    /// Sets the payload. Only ever called once, from the downcall path,
    /// while the cache lock is held; a second call is a logic bug upstream
    /// (an entry can only transition into `Valid` once) and panics.
    pub(crate) fn set_payload(&self, value: V) {
        if self.payload.set(value).is_err() {
            unreachable!("payload set twice for key {}", self.key);
        }
    }

    pub(crate) fn flags(&self) -> Flags {
        let bits = self.flags.load(Ordering::Acquire);
        Flags {
            settled: Settled::from_bits(bits & SETTLED_MASK),
            acquiring: bits & ACQUIRING_BIT != 0,
        }
    }

    pub(crate) fn set_flags(&self, settled: Settled, acquiring: bool) {
        self.flags.store(pack(settled, acquiring), Ordering::Release);
    }

    pub(crate) fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn get_ref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the refcount and returns the new value.
    pub(crate) fn put_ref(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn acquire_expire(&self) -> i64 {
        self.acquire_expire.load(Ordering::Acquire)
    }

    pub(crate) fn set_acquire_expire(&self, at: i64) {
        self.acquire_expire.store(at, Ordering::Release);
    }

    pub fn expire(&self) -> i64 {
        self.expire.load(Ordering::Acquire)
    }

    pub(crate) fn set_expire(&self, at: i64) {
        self.expire.store(at, Ordering::Release);
    }
}

impl<V> std::fmt::Debug for Entry<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flags = self.flags();
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("settled", &flags.settled)
            .field("acquiring", &flags.acquiring)
            .field("refcount", &self.refcount())
            .field("acquire_expire", &self.acquire_expire())
            .field("expire", &self.expire())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_starts_new_not_acquiring() {
        let e: Entry<()> = Entry::new(42);
        let flags = e.flags();
        assert_eq!(flags.settled, Settled::New);
        assert!(!flags.acquiring);
        assert_eq!(e.refcount(), 0);
    }

    #[test]
    fn flags_pack_and_round_trip_through_all_combinations() {
        let e: Entry<()> = Entry::new(1);
        for settled in [Settled::New, Settled::Valid, Settled::Invalid, Settled::Expired] {
            for acquiring in [true, false] {
                e.set_flags(settled, acquiring);
                let got = e.flags();
                assert_eq!(got.settled, settled);
                assert_eq!(got.acquiring, acquiring);
            }
        }
    }

    #[test]
    fn settled_bad_is_invalid_or_expired_only() {
        let e: Entry<()> = Entry::new(1);
        e.set_flags(Settled::New, false);
        assert!(!e.flags().is_settled_bad());
        e.set_flags(Settled::Valid, false);
        assert!(!e.flags().is_settled_bad());
        e.set_flags(Settled::Invalid, false);
        assert!(e.flags().is_settled_bad());
        e.set_flags(Settled::Expired, false);
        assert!(e.flags().is_settled_bad());
    }

    #[test]
    fn refcount_increments_and_decrements() {
        let e: Entry<()> = Entry::new(1);
        e.get_ref();
        e.get_ref();
        assert_eq!(e.refcount(), 2);
        assert_eq!(e.put_ref(), 1);
        assert_eq!(e.put_ref(), 0);
    }

    #[test]
    fn payload_is_set_once_and_readable_after() {
        let e: Entry<String> = Entry::new(1);
        assert!(e.payload().is_none());
        e.set_payload("hello".to_string());
        assert_eq!(e.payload(), Some(&"hello".to_string()));
    }
}
