//! The fixed-size hash table of entry chains guarded by the cache's single
//! lock. Chain order is a recency hint: a successful lookup moves its entry
//! to the chain head, mirroring `list_move(&entry->ue_hash, head)` in the
//! reference.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::entry::Entry;

/// The table plus all entry state, owned behind one `Mutex` by
/// [`crate::Cache`]. Nothing outside this module (and `cache.rs`, which is
/// the only caller) touches the chains directly.
pub(crate) struct Table<V> {
    chains: Vec<VecDeque<Arc<Entry<V>>>>,
}

impl<V> Table<V> {
    pub(crate) fn new(hash_size: usize) -> Self {
        let hash_size = hash_size.max(1);
        Table {
            chains: (0..hash_size).map(|_| VecDeque::new()).collect(),
        }
    }

    fn chain_index(&self, key: u64) -> usize {
        (key % self.chains.len() as u64) as usize
    }

    pub(crate) fn chain(&self, key: u64) -> &VecDeque<Arc<Entry<V>>> {
        &self.chains[self.chain_index(key)]
    }

    pub(crate) fn chain_mut(&mut self, key: u64) -> &mut VecDeque<Arc<Entry<V>>> {
        let idx = self.chain_index(key);
        &mut self.chains[idx]
    }

    pub(crate) fn insert_front(&mut self, entry: Arc<Entry<V>>) {
        self.chain_mut(entry.key()).push_front(entry);
    }

    /// Removes `entry` from its chain by identity, if still linked.
    /// Returns whether it was found and removed.
    pub(crate) fn remove_if_present(&mut self, entry: &Arc<Entry<V>>) -> bool {
        let chain = self.chain_mut(entry.key());
        if let Some(pos) = chain.iter().position(|e| Arc::ptr_eq(e, entry)) {
            chain.remove(pos);
            true
        } else {
            false
        }
    }

    pub(crate) fn all_chains_mut(&mut self) -> impl Iterator<Item = &mut VecDeque<Arc<Entry<V>>>> {
        self.chains.iter_mut()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.chains.iter().map(VecDeque::len).sum()
    }
}
