// SPDX-License-Identifier: MIT

//! An append-only, memory-mapped [`ChainStore`] (§4.3, §10.3), the
//! production-shaped counterpart to [`super::memory::MemoryChainStore`].
//! Grounded in `cbitcoin`'s `CBBlockChainStorage.c` (§10.9): an
//! append-only data file, a small durable index, a deletion free-list for
//! reusing holes left by `remove`/`change_key`/`append`-driven
//! reallocation, and writes batched through a redo log so a crash
//! mid-`commit` replays cleanly on reopen.
//!
//! Two files live under the store's base directory:
//!
//! - `data.bin` — the append-only blob every value's bytes live in,
//!   memory-mapped for both reads and in-place `write_subsection`
//!   overwrites.
//! - `index.log` — a durable append-only log of `(key, offset, length)`
//!   records (or a tombstone marker), replayed in full on open to
//!   reconstruct the in-memory `index` and `free_list`.
//!
//! A third, transient `commit.redo` file exists only while a `commit` is
//! in flight: it records the staged changes *before* any durable file is
//! touched, and is removed only once every file write from that commit
//! has landed. On reopen, a leftover redo file means the previous process
//! crashed mid-commit; its contents are replayed before anything else.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read as _;
use std::io::Seek as _;
use std::io::SeekFrom;
use std::io::Write as _;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;

use ledgercore_common::prelude::HashMap;
use ledgercore_common::prelude::Vec;
use ledgercore_common::ChainStore;
use ledgercore_common::StorageError;
use ledgercore_common::StoreKey;
use lru::LruCache;
use memmap2::MmapMut;
use memmap2::MmapOptions;
use spin::Mutex;

/// Number of recently-read values kept in the hot-read cache.
const CACHE_CAPACITY: usize = 4096;

/// Data file grows in chunks of this size rather than byte-by-byte, to
/// keep remaps infrequent.
const GROWTH_CHUNK: u64 = 4 * 1024 * 1024;

/// How many staged changes `commit` applies before flushing the mapped
/// file once and appending one batched index-log record group --- mirrors
/// `CBBlockChainStorage.c`'s `CB_MAX_VALUE_WRITES` batching, so a large
/// reorg's writes don't each pay their own `flush` syscall.
const MAX_BATCH_WRITES: usize = 512;

#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: u64,
    len: u32,
}

/// An on-disk, memory-mapped [`ChainStore`]. See the module documentation
/// for the on-disk layout.
pub struct FlatChainStore {
    base_dir: PathBuf,
    data_file: File,
    mmap: MmapMut,
    data_len: u64,
    index_log: File,
    index: HashMap<StoreKey, Slot>,
    free_list: Vec<Slot>,
    cache: Mutex<LruCache<u64, Vec<u8>>>,
    /// `None` records a staged deletion; absence means "untouched this
    /// transaction". Mirrors `MemoryChainStore`'s overlay: staged values
    /// are fully materialised in memory and only touch the mapped files
    /// at `commit`, so `read`/`get_length` (committed-only, §5) never see
    /// them.
    staged: HashMap<StoreKey, Option<Vec<u8>>>,
}

impl FlatChainStore {
    /// Opens (creating if absent) a flat chain store rooted at
    /// `base_dir`, replaying any leftover redo log and then the full
    /// index log to reconstruct in-memory state.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)
            .map_err(|e| StorageError::Io(ledgercore_common::prelude::format!("{e}")))?;

        let data_path = base_dir.join("data.bin");
        let index_log_path = base_dir.join("index.log");
        let redo_path = base_dir.join("commit.redo");

        let mut data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)
            .map_err(io_err)?;
        let mut index_log = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&index_log_path)
            .map_err(io_err)?;

        if redo_path.exists() {
            replay_redo_log(&redo_path, &mut data_file, &mut index_log)?;
            std::fs::remove_file(&redo_path).map_err(io_err)?;
        }

        let data_len = data_file.metadata().map_err(io_err)?.len();
        let mmap_len = data_len.max(GROWTH_CHUNK);
        data_file.set_len(mmap_len).map_err(io_err)?;
        let mmap = unsafe {
            MmapOptions::new()
                .len(mmap_len as usize)
                .map_mut(&data_file)
                .map_err(io_err)?
        };

        let (index, free_list) = replay_index_log(&mut index_log)?;

        Ok(FlatChainStore {
            base_dir,
            data_file,
            mmap,
            data_len,
            index_log,
            index,
            free_list,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("constant capacity is nonzero"),
            )),
            staged: HashMap::new(),
        })
    }

    fn working_value(&self, key: &StoreKey) -> Option<Vec<u8>> {
        match self.staged.get(key) {
            Some(Some(v)) => Some(v.clone()),
            Some(None) => None,
            None => self.read_committed(key),
        }
    }

    fn read_committed(&self, key: &StoreKey) -> Option<Vec<u8>> {
        let slot = *self.index.get(key)?;
        let cache_key = cache_key_for(key);
        if let Some(hit) = self.cache.lock().get(&cache_key) {
            return Some(hit.clone());
        }
        let start = slot.offset as usize;
        let end = start + slot.len as usize;
        let bytes = self.mmap[start..end].to_vec();
        self.cache.lock().put(cache_key, bytes.clone());
        Some(bytes)
    }

    /// Grows `data.bin` (and remaps it) until it can hold at least
    /// `required` bytes.
    fn ensure_capacity(&mut self, required: u64) -> Result<(), StorageError> {
        if required <= self.mmap.len() as u64 {
            return Ok(());
        }
        self.mmap.flush().map_err(io_err)?;
        let mut new_len = self.mmap.len() as u64;
        while new_len < required {
            new_len += GROWTH_CHUNK;
        }
        self.data_file.set_len(new_len).map_err(io_err)?;
        self.mmap = unsafe {
            MmapOptions::new()
                .len(new_len as usize)
                .map_mut(&self.data_file)
                .map_err(io_err)?
        };
        Ok(())
    }

    /// Finds or creates room for `len` bytes: first-fit over the
    /// deletion free-list, falling back to an append at `data_len`
    /// (`cbitcoin`'s deletion index, §10.9).
    fn allocate(&mut self, len: u32) -> Result<Slot, StorageError> {
        if let Some(pos) = self.free_list.iter().position(|s| s.len >= len) {
            let slot = self.free_list.remove(pos);
            if slot.len > len {
                // Split the remainder back into the free list.
                self.free_list.push(Slot {
                    offset: slot.offset + len as u64,
                    len: slot.len - len,
                });
            }
            return Ok(Slot {
                offset: slot.offset,
                len,
            });
        }
        let offset = self.data_len;
        self.ensure_capacity(offset + len as u64)?;
        self.data_len = offset + len as u64;
        Ok(Slot { offset, len })
    }

    fn write_bytes(&mut self, slot: Slot, bytes: &[u8]) {
        let start = slot.offset as usize;
        self.mmap[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn append_index_record(&mut self, record: &IndexRecord) -> Result<(), StorageError> {
        let encoded = record.encode();
        self.index_log.write_all(&encoded).map_err(io_err)?;
        Ok(())
    }

    /// Path to this store's base directory, for tests and diagnostics.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

impl ChainStore for FlatChainStore {
    fn read(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.read_committed(key))
    }

    fn get_length(&self, key: &StoreKey) -> Result<Option<u32>, StorageError> {
        Ok(self.index.get(key).map(|s| s.len))
    }

    fn write(&mut self, key: StoreKey, value: Vec<u8>) {
        self.staged.insert(key, Some(value));
    }

    fn write_subsection(&mut self, key: StoreKey, offset: u32, data: Vec<u8>) {
        let mut current = self.working_value(&key).unwrap_or_default();
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
        let mut current = self.working_value(&key).unwrap_or_default();
        current.extend_from_slice(&data);
        self.staged.insert(key, Some(current));
    }

    fn remove(&mut self, key: StoreKey) {
        self.staged.insert(key, None);
    }

    fn change_key(&mut self, old: StoreKey, new: StoreKey) {
        let value = self.working_value(&old);
        self.staged.insert(old, None);
        self.staged.insert(new, value);
    }

    /// Applies every staged change atomically: writes a redo-log entry
    /// for the whole batch first, then touches `data.bin`/`index.log`,
    /// then removes the redo log. A crash between those two points is
    /// recovered from on the next [`FlatChainStore::open`].
    fn commit(&mut self) -> Result<(), StorageError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let redo_path = self.base_dir.join("commit.redo");
        let changes: Vec<(StoreKey, Option<Vec<u8>>)> = self.staged.drain().collect();
        write_redo_log(&redo_path, &changes)?;

        for batch in changes.chunks(MAX_BATCH_WRITES) {
            for (key, value) in batch {
                self.apply_committed_change(key.clone(), value.clone())?;
            }
            self.mmap.flush().map_err(io_err)?;
            self.index_log.flush().map_err(io_err)?;
        }

        std::fs::remove_file(&redo_path).map_err(io_err)?;
        Ok(())
    }

    fn reset(&mut self) {
        self.staged.clear();
    }
}

impl FlatChainStore {
    fn apply_committed_change(
        &mut self,
        key: StoreKey,
        value: Option<Vec<u8>>,
    ) -> Result<(), StorageError> {
        self.cache.lock().pop(&cache_key_for(&key));
        if let Some(old) = self.index.remove(&key) {
            self.free_list.push(old);
        }
        match value {
            None => {
                self.append_index_record(&IndexRecord::Tombstone { key })?;
            }
            Some(bytes) => {
                let slot = self.allocate(bytes.len() as u32)?;
                self.write_bytes(slot, &bytes);
                self.index.insert(key.clone(), slot);
                self.append_index_record(&IndexRecord::Put { key, slot })?;
            }
        }
        Ok(())
    }
}

fn io_err(e: std::io::Error) -> StorageError {
    StorageError::Io(ledgercore_common::prelude::format!("{e}"))
}

fn cache_key_for(key: &StoreKey) -> u64 {
    let encoded = encode_store_key(key);
    twox_hash::XxHash3_64::oneshot(&encoded)
}

/// A durable `index.log` record: either a value's location, or a
/// tombstone marking it deleted (and its old slot reusable).
enum IndexRecord {
    Put { key: StoreKey, slot: Slot },
    Tombstone { key: StoreKey },
}

impl IndexRecord {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            IndexRecord::Put { key, slot } => {
                out.push(1u8);
                let encoded_key = encode_store_key(key);
                out.extend_from_slice(&(encoded_key.len() as u32).to_le_bytes());
                out.extend_from_slice(&encoded_key);
                out.extend_from_slice(&slot.offset.to_le_bytes());
                out.extend_from_slice(&slot.len.to_le_bytes());
            }
            IndexRecord::Tombstone { key } => {
                out.push(0u8);
                let encoded_key = encode_store_key(key);
                out.extend_from_slice(&(encoded_key.len() as u32).to_le_bytes());
                out.extend_from_slice(&encoded_key);
            }
        }
        out
    }
}

/// A stable byte encoding for [`StoreKey`], used both as the `index.log`
/// on-disk key representation and as the input to the cache's hash.
fn encode_store_key(key: &StoreKey) -> Vec<u8> {
    let mut out = Vec::new();
    match key {
        StoreKey::BlockHash(prefix) => {
            out.push(0);
            out.extend_from_slice(prefix);
        }
        StoreKey::Block(loc) => {
            out.push(1);
            out.push(loc.branch);
            out.extend_from_slice(&loc.block_index.to_le_bytes());
        }
        StoreKey::Branch(None) => out.push(2),
        StoreKey::Branch(Some(b)) => {
            out.push(3);
            out.push(*b);
        }
        StoreKey::BranchWork(b) => {
            out.push(4);
            out.push(*b);
        }
        StoreKey::Orphan(slot) => {
            out.push(5);
            out.push(*slot);
        }
        StoreKey::Tx(hash) => {
            out.push(6);
            out.extend_from_slice(hash.as_le_bytes());
        }
        StoreKey::Unspent(hash, vout) => {
            out.push(7);
            out.extend_from_slice(hash.as_le_bytes());
            out.extend_from_slice(&vout.to_le_bytes());
        }
    }
    out
}

fn decode_store_key(bytes: &[u8]) -> StoreKey {
    match bytes[0] {
        0 => {
            let mut prefix = [0u8; 20];
            prefix.copy_from_slice(&bytes[1..21]);
            StoreKey::BlockHash(prefix)
        }
        1 => StoreKey::Block(ledgercore_common::BlockLocation {
            branch: bytes[1],
            block_index: u32::from_le_bytes(bytes[2..6].try_into().unwrap()),
        }),
        2 => StoreKey::Branch(None),
        3 => StoreKey::Branch(Some(bytes[1])),
        4 => StoreKey::BranchWork(bytes[1]),
        5 => StoreKey::Orphan(bytes[1]),
        6 => {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&bytes[1..33]);
            StoreKey::Tx(ledgercore_common::Hash256(hash))
        }
        7 => {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&bytes[1..33]);
            let vout = u32::from_le_bytes(bytes[33..37].try_into().unwrap());
            StoreKey::Unspent(ledgercore_common::Hash256(hash), vout)
        }
        tag => panic!("corrupt index.log: unknown key tag {tag}"),
    }
}

/// Replays every record in `index_log` (positioned at its start) to
/// rebuild the in-memory index and deletion free-list.
fn replay_index_log(
    index_log: &mut File,
) -> Result<(HashMap<StoreKey, Slot>, Vec<Slot>), StorageError> {
    index_log.seek(SeekFrom::Start(0)).map_err(io_err)?;
    let mut bytes = Vec::new();
    index_log.read_to_end(&mut bytes).map_err(io_err)?;

    let mut index = HashMap::new();
    let mut free_list = Vec::new();
    let mut cursor = 0usize;
    while cursor < bytes.len() {
        let tag = bytes[cursor];
        cursor += 1;
        let key_len = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;
        let key = decode_store_key(&bytes[cursor..cursor + key_len]);
        cursor += key_len;
        match tag {
            1 => {
                let offset = u64::from_le_bytes(bytes[cursor..cursor + 8].try_into().unwrap());
                cursor += 8;
                let len = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
                cursor += 4;
                if let Some(old) = index.insert(key, Slot { offset, len }) {
                    free_list.push(old);
                }
            }
            0 => {
                if let Some(old) = index.remove(&key) {
                    free_list.push(old);
                }
            }
            other => return Err(StorageError::Corrupt(ledgercore_common::prelude::format!(
                "index.log: unknown record tag {other}"
            ))),
        }
    }
    Ok((index, free_list))
}

/// Serialises the set of staged changes a `commit` is about to apply, so
/// a crash partway through applying them can be replayed on reopen.
fn write_redo_log(
    path: &Path,
    changes: &[(StoreKey, Option<Vec<u8>>)],
) -> Result<(), StorageError> {
    let mut out = Vec::new();
    for (key, value) in changes {
        let encoded_key = encode_store_key(key);
        match value {
            Some(bytes) => {
                out.push(1u8);
                out.extend_from_slice(&(encoded_key.len() as u32).to_le_bytes());
                out.extend_from_slice(&encoded_key);
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            None => {
                out.push(0u8);
                out.extend_from_slice(&(encoded_key.len() as u32).to_le_bytes());
                out.extend_from_slice(&encoded_key);
            }
        }
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(io_err)?;
    file.write_all(&out).map_err(io_err)?;
    file.flush().map_err(io_err)?;
    Ok(())
}

/// Recovers from a crash that landed between writing the redo log and
/// removing it: re-applies every change the redo log recorded directly
/// to `data_file`/`index_log`, then the caller deletes the redo log.
fn replay_redo_log(
    redo_path: &Path,
    data_file: &mut File,
    index_log: &mut File,
) -> Result<(), StorageError> {
    let mut bytes = Vec::new();
    File::open(redo_path)
        .map_err(io_err)?
        .read_to_end(&mut bytes)
        .map_err(io_err)?;

    let (mut index, _free_list) = replay_index_log(index_log)?;
    let mut data_len = data_file.metadata().map_err(io_err)?.len();

    let mut cursor = 0usize;
    index_log.seek(SeekFrom::End(0)).map_err(io_err)?;
    while cursor < bytes.len() {
        let tag = bytes[cursor];
        cursor += 1;
        let key_len = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;
        let key = decode_store_key(&bytes[cursor..cursor + key_len]);
        cursor += key_len;
        match tag {
            1 => {
                let val_len =
                    u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
                cursor += 4;
                let value = &bytes[cursor..cursor + val_len];
                cursor += val_len;

                let offset = data_len;
                data_file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
                data_file.write_all(value).map_err(io_err)?;
                data_len += value.len() as u64;
                let slot = Slot {
                    offset,
                    len: value.len() as u32,
                };
                index.insert(key.clone(), slot);
                let record = IndexRecord::Put { key, slot };
                index_log.write_all(&record.encode()).map_err(io_err)?;
            }
            0 => {
                index.remove(&key);
                let record = IndexRecord::Tombstone { key };
                index_log.write_all(&record.encode()).map_err(io_err)?;
            }
            other => {
                return Err(StorageError::Corrupt(ledgercore_common::prelude::format!(
                    "commit.redo: unknown record tag {other}"
                )))
            }
        }
    }
    data_file.flush().map_err(io_err)?;
    index_log.flush().map_err(io_err)?;
    Ok(())
}
