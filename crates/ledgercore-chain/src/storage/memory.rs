// SPDX-License-Identifier: MIT

//! An in-memory [`ChainStore`] (§4.3, §10.3): the backend this workspace's
//! own test suite and the six end-to-end scenarios of §8 run against, and
//! adequate for embedding in a process whose own storage layer already
//! provides durability.
//!
//! Staged writes accumulate in `staged` (a key → pending-value overlay,
//! `None` meaning "staged for deletion") and are applied to `committed`
//! only by [`MemoryChainStore::commit`]; [`ChainStore::read`] only ever
//! consults `committed`, matching §4.3's "never a mix" requirement and
//! §5's "readers see only committed state".

use ledgercore_common::prelude::HashMap;
use ledgercore_common::prelude::Vec;
use ledgercore_common::ChainStore;
use ledgercore_common::StorageError;
use ledgercore_common::StoreKey;

/// `HashMap`-backed [`ChainStore`] with an in-memory staged-write overlay.
#[derive(Debug, Default)]
pub struct MemoryChainStore {
    committed: HashMap<StoreKey, Vec<u8>>,
    /// `None` records a staged deletion; absence means "untouched this
    /// transaction, consult `committed`".
    staged: HashMap<StoreKey, Option<Vec<u8>>>,
}

impl MemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The value `key` would have if committed right now: the staged
    /// overlay if it's been touched this transaction, else the committed
    /// value. Used internally by `write_subsection`/`append`/`change_key`,
    /// which all need to see their own transaction's prior writes even
    /// though external readers (`read`) must not.
    fn working_value(&self, key: &StoreKey) -> Option<&Vec<u8>> {
        match self.staged.get(key) {
            Some(Some(v)) => Some(v),
            Some(None) => None,
            None => self.committed.get(key),
        }
    }
}

impl ChainStore for MemoryChainStore {
    fn read(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.committed.get(key).cloned())
    }

    fn get_length(&self, key: &StoreKey) -> Result<Option<u32>, StorageError> {
        Ok(self.committed.get(key).map(|v| v.len() as u32))
    }

    fn write(&mut self, key: StoreKey, value: Vec<u8>) {
        self.staged.insert(key, Some(value));
    }

    fn write_subsection(&mut self, key: StoreKey, offset: u32, data: Vec<u8>) {
        let mut current = self.working_value(&key).cloned().unwrap_or_default();
        let offset = offset as usize;
        let end = offset + data.len();
        assert!(
            end <= current.len(),
            "write_subsection past the end of {key}: offset {offset} + {} > {}",
            data.len(),
            current.len()
        );
        current[offset..end].copy_from_slice(&data);
        self.staged.insert(key, Some(current));
    }

    fn append(&mut self, key: StoreKey, data: Vec<u8>) {
        let mut current = self.working_value(&key).cloned().unwrap_or_default();
        current.extend_from_slice(&data);
        self.staged.insert(key, Some(current));
    }

    fn remove(&mut self, key: StoreKey) {
        self.staged.insert(key, None);
    }

    fn change_key(&mut self, old: StoreKey, new: StoreKey) {
        let value = self.working_value(&old).cloned();
        self.staged.insert(old, None);
        self.staged.insert(new, value);
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        for (key, value) in self.staged.drain() {
            match value {
                Some(v) => {
                    self.committed.insert(key, v);
                }
                None => {
                    self.committed.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.staged.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgercore_common::BlockLocation;

    fn key() -> StoreKey {
        StoreKey::Block(BlockLocation {
            branch: 0,
            block_index: 0,
        })
    }

    #[test]
    fn uncommitted_writes_are_invisible_to_read() {
        let mut store = MemoryChainStore::new();
        store.write(key(), vec![1, 2, 3]);
        assert_eq!(store.read(&key()).unwrap(), None);
    }

    #[test]
    fn commit_makes_writes_visible() {
        let mut store = MemoryChainStore::new();
        store.write(key(), vec![1, 2, 3]);
        store.commit().unwrap();
        assert_eq!(store.read(&key()).unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn reset_discards_pending_writes() {
        let mut store = MemoryChainStore::new();
        store.write(key(), vec![1, 2, 3]);
        store.reset();
        store.commit().unwrap();
        assert_eq!(store.read(&key()).unwrap(), None);
    }

    #[test]
    fn write_subsection_overwrites_in_place() {
        let mut store = MemoryChainStore::new();
        store.write(key(), vec![0, 0, 0, 0]);
        store.write_subsection(key(), 1, vec![9, 9]);
        store.commit().unwrap();
        assert_eq!(store.read(&key()).unwrap(), Some(vec![0, 9, 9, 0]));
    }

    #[test]
    fn append_extends_existing_value() {
        let mut store = MemoryChainStore::new();
        store.write(key(), vec![1, 2]);
        store.append(key(), vec![3, 4]);
        store.commit().unwrap();
        assert_eq!(store.read(&key()).unwrap(), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn append_to_absent_key_creates_it() {
        let mut store = MemoryChainStore::new();
        store.append(key(), vec![7]);
        store.commit().unwrap();
        assert_eq!(store.read(&key()).unwrap(), Some(vec![7]));
    }

    #[test]
    fn change_key_moves_value_without_touching_bytes() {
        let mut store = MemoryChainStore::new();
        let other = StoreKey::Block(BlockLocation {
            branch: 1,
            block_index: 0,
        });
        store.write(key(), vec![5, 5]);
        store.commit().unwrap();
        store.change_key(key(), other.clone());
        store.commit().unwrap();
        assert_eq!(store.read(&key()).unwrap(), None);
        assert_eq!(store.read(&other).unwrap(), Some(vec![5, 5]));
    }

    #[test]
    fn remove_deletes_on_commit() {
        let mut store = MemoryChainStore::new();
        store.write(key(), vec![1]);
        store.commit().unwrap();
        store.remove(key());
        store.commit().unwrap();
        assert_eq!(store.read(&key()).unwrap(), None);
    }

    #[test]
    #[should_panic(expected = "write_subsection past the end")]
    fn write_subsection_past_end_panics() {
        let mut store = MemoryChainStore::new();
        store.write(key(), vec![0, 0]);
        store.write_subsection(key(), 1, vec![9, 9]);
    }
}
