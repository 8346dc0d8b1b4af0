// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

// Copyright 2015 The etcd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod sled_storage;

pub use self::sled_storage::SledStorage;

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::Codec;
use crate::errors::{Error, Result, StorageError};
use crate::message::{ConfState, Entry, HardState, SnapshotMetadata};
use crate::util::limit_size;
use crate::HashMap;

/// Metadata key of the encoded `HardState`.
pub const HARD_STATE_KEY: &[u8] = b"hard_state";
/// Metadata key of the encoded current `ConfState`.
pub const CONF_STATE_KEY: &[u8] = b"conf_state";
/// Metadata key of the encoded `SnapshotMetadata` the log starts after.
pub const SNAPSHOT_META_KEY: &[u8] = b"snapshot_meta";
/// Metadata key of the applied index watermark.
pub const APPLIED_KEY: &[u8] = b"applied";
/// Metadata key of the last compacted entry, as big-endian `index` and `term`.
pub const TRUNCATED_KEY: &[u8] = b"truncated";

/// Holds both the hard state (commit index, vote leader, term) and the configuration state
/// (Current node IDs)
#[derive(Debug, Clone, Default, Getters, Setters)]
pub struct RaftState {
    /// Contains the last meta information including commit index, the vote leader, and the vote term.
    #[get = "pub"]
    #[set = "pub"]
    pub hard_state: HardState,

    /// Records the current node IDs like `[1, 2, 3]` in the cluster. Every Raft node must have a
    /// unique ID in the cluster;
    #[get = "pub"]
    #[set = "pub"]
    pub conf_state: ConfState,
}

impl RaftState {
    /// Create a new RaftState.
    pub fn new(hard_state: HardState, conf_state: ConfState) -> RaftState {
        RaftState {
            hard_state,
            conf_state,
        }
    }

    /// Indicates the `RaftState` is initialized or not.
    pub fn initialized(&self) -> bool {
        self.conf_state != ConfState::default()
    }
}

/// Durable storage of one group's log and metadata.
///
/// The log is a gap-free run of entries. `first_index` and `last_index`
/// return `0` when it is empty. Once a snapshot has been installed, the log
/// continues right after `snapshot_meta().index`.
///
/// All mutating calls must be atomic with respect to a crash.
pub trait Storage: Send + Sync {
    /// Writes a contiguous run of entries.
    ///
    /// Entries whose index and term are already stored are skipped. An entry
    /// with a different term at a stored index replaces it and drops every
    /// entry after it.
    fn append(&self, entries: &[Entry]) -> Result<()>;

    /// Returns the entry at `index`, or `StorageError::LogNotFound` if it is
    /// not retained. Callers have to fall back to a snapshot in that case.
    fn get(&self, index: u64) -> Result<Entry>;

    /// The index of the first retained entry, `0` if the log is empty.
    fn first_index(&self) -> Result<u64>;

    /// The index of the last retained entry, `0` if the log is empty.
    fn last_index(&self) -> Result<u64>;

    /// Removes the entries in `[min, max]`. The range must touch one end of
    /// the log so the surviving entries stay contiguous.
    fn delete_range(&self, min: u64, max: u64) -> Result<()>;

    /// Stores a metadata value.
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Loads a metadata value, `StorageError::KeyNotFound` if never set.
    fn get_bytes(&self, key: &[u8]) -> Result<Bytes>;

    /// Stores a metadata integer.
    fn set_u64(&self, key: &[u8], value: u64) -> Result<()>;

    /// Loads a metadata integer, `StorageError::KeyNotFound` if never set.
    fn get_u64(&self, key: &[u8]) -> Result<u64>;

    /// Drops the whole log and records `meta` as the point it restarts from,
    /// in one atomic write.
    fn apply_snapshot_meta(&self, meta: &SnapshotMetadata) -> Result<()>;

    /// Loads the state a raft peer restarts from.
    fn initial_state(&self) -> Result<RaftState> {
        Ok(RaftState::new(self.hard_state()?, self.conf_state()?))
    }

    /// The last persisted `HardState`, empty if none.
    fn hard_state(&self) -> Result<HardState> {
        decode_optional(self, HARD_STATE_KEY)
    }

    /// Persists `hs`.
    fn set_hard_state(&self, hs: &HardState) -> Result<()> {
        self.set(HARD_STATE_KEY, &hs.encode_to_bytes())
    }

    /// The last persisted membership, empty if none.
    fn conf_state(&self) -> Result<ConfState> {
        decode_optional(self, CONF_STATE_KEY)
    }

    /// Persists the current membership.
    fn set_conf_state(&self, cs: &ConfState) -> Result<()> {
        self.set(CONF_STATE_KEY, &cs.encode_to_bytes())
    }

    /// The snapshot point the log continues from, empty if none.
    fn snapshot_meta(&self) -> Result<SnapshotMetadata> {
        decode_optional(self, SNAPSHOT_META_KEY)
    }

    /// The applied watermark, `0` if never recorded.
    fn applied_index(&self) -> Result<u64> {
        match self.get_u64(APPLIED_KEY) {
            Err(Error::Store(StorageError::KeyNotFound)) => Ok(0),
            res => res,
        }
    }

    /// Records the applied watermark.
    fn set_applied_index(&self, applied: u64) -> Result<()> {
        self.set_u64(APPLIED_KEY, applied)
    }

    /// The index and term of the last entry dropped by `compact`, `(0, 0)`
    /// if the log was never compacted.
    fn truncated_state(&self) -> Result<(u64, u64)> {
        let v = match self.get_bytes(TRUNCATED_KEY) {
            Ok(v) => v,
            Err(Error::Store(StorageError::KeyNotFound)) => return Ok((0, 0)),
            Err(e) => return Err(e),
        };
        if v.len() != 16 {
            return Err(Error::Store(StorageError::Corrupted(format!(
                "truncated state of {} bytes",
                v.len()
            ))));
        }
        let mut buf = &v[..];
        Ok((buf.get_u64(), buf.get_u64()))
    }

    /// Returns the term of entry `idx`. The terms of the snapshot point and
    /// of the last compacted entry are retained even though their entries
    /// are not.
    fn term(&self, idx: u64) -> Result<u64> {
        let meta = self.snapshot_meta()?;
        if idx == meta.index {
            return Ok(meta.term);
        }
        match self.get(idx) {
            Ok(e) => Ok(e.term),
            Err(Error::Store(StorageError::LogNotFound(_))) if idx != 0 => {
                match self.truncated_state()? {
                    (index, term) if index == idx => Ok(term),
                    _ => Err(Error::Store(StorageError::LogNotFound(idx))),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Returns the entries in `[low, high)`, at least one if any, limited to
    /// `max_size` encoded bytes.
    fn entries(&self, low: u64, high: u64, max_size: Option<u64>) -> Result<Vec<Entry>> {
        let mut ents = Vec::with_capacity(high.saturating_sub(low) as usize);
        let mut size = 0u64;
        for idx in low..high {
            let e = self.get(idx)?;
            size += e.encoded_len() as u64;
            ents.push(e);
            if max_size.map_or(false, |max| size > max) {
                break;
            }
        }
        limit_size(&mut ents, max_size);
        Ok(ents)
    }

    /// Discards all log entries prior to `compact_index`.
    fn compact(&self, compact_index: u64) -> Result<()> {
        let first = self.first_index()?;
        if first == 0 || compact_index <= first {
            return Ok(());
        }
        let last = self.last_index()?;
        if compact_index > last {
            return Err(Error::InvariantViolated(format!(
                "compact {} is out of bound lastindex({})",
                compact_index, last
            )));
        }
        // The new first entry still needs the term of the one before it.
        let prev = compact_index - 1;
        let mut v = BytesMut::with_capacity(16);
        v.put_u64(prev);
        v.put_u64(self.term(prev)?);
        self.set(TRUNCATED_KEY, &v)?;
        self.delete_range(first, prev)
    }
}

fn decode_optional<S: Storage + ?Sized, T: Codec + Default>(s: &S, key: &[u8]) -> Result<T> {
    match s.get_bytes(key) {
        Ok(v) => T::decode_from(&v)
            .map_err(|e| Error::Store(StorageError::Corrupted(format!("{:?}: {}", key, e)))),
        Err(Error::Store(StorageError::KeyNotFound)) => Ok(T::default()),
        Err(e) => Err(e),
    }
}

/// Works out how `ents` lands on a log spanning `[first, last]`.
///
/// Returns the suffix of `ents` that has to be written. Every stored entry at
/// or after its first index must be replaced. An empty log accepts any start
/// after `snapshot_index`.
pub(crate) fn plan_append<F>(
    ents: &[Entry],
    first: u64,
    last: u64,
    snapshot_index: u64,
    term_of: F,
) -> Result<&[Entry]>
where
    F: Fn(u64) -> Result<u64>,
{
    for w in ents.windows(2) {
        if w[1].index != w[0].index + 1 {
            return Err(Error::InvariantViolated(format!(
                "appending discontinuous entries {} and {}",
                w[0].index, w[1].index
            )));
        }
    }
    if last == 0 {
        let skip = ents.iter().take_while(|e| e.index <= snapshot_index).count();
        return Ok(&ents[skip..]);
    }
    let ents = match ents.first() {
        None => return Ok(ents),
        Some(e) if e.index < first => {
            let skip = (first - e.index) as usize;
            if skip >= ents.len() {
                return Ok(&[]);
            }
            &ents[skip..]
        }
        Some(_) => ents,
    };
    if ents[0].index > last + 1 {
        return Err(Error::InvariantViolated(format!(
            "missing log entries [last: {}, append at: {}]",
            last, ents[0].index
        )));
    }
    for (i, e) in ents.iter().enumerate() {
        if e.index > last || term_of(e.index)? != e.term {
            return Ok(&ents[i..]);
        }
    }
    Ok(&[])
}

/// Checks `[min, max]` against a log spanning `[first, last]` and clips it.
/// Returns `None` if nothing is stored in the range.
pub(crate) fn plan_delete_range(
    min: u64,
    max: u64,
    first: u64,
    last: u64,
) -> Result<Option<(u64, u64)>> {
    if last == 0 || min > max {
        return Ok(None);
    }
    let (min, max) = (min.max(first), max.min(last));
    if min > max {
        return Ok(None);
    }
    if min > first && max < last {
        return Err(Error::InvariantViolated(format!(
            "delete [{}, {}] would leave a gap in [{}, {}]",
            min, max, first, last
        )));
    }
    Ok(Some((min, max)))
}

/// The Memory Storage Core instance holds the actual state of the storage struct. To access this
/// value, use the `rl` and `wl` functions on the main MemStorage implementation.
#[derive(Default)]
pub struct MemStorageCore {
    entries: Vec<Entry>,
    kv: HashMap<Vec<u8>, Bytes>,
}

impl MemStorageCore {
    fn first_index(&self) -> u64 {
        self.entries.first().map_or(0, |e| e.index)
    }

    fn last_index(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.index)
    }

    fn snapshot_index(&self) -> Result<u64> {
        match self.kv.get(SNAPSHOT_META_KEY) {
            Some(v) => Ok(SnapshotMetadata::decode_from(v)?.index),
            None => Ok(0),
        }
    }

    /// Appends entries, see `Storage::append`.
    pub fn append(&mut self, ents: &[Entry]) -> Result<()> {
        let (first, last) = (self.first_index(), self.last_index());
        let snapshot_index = self.snapshot_index()?;
        let entries = &self.entries;
        let to_write = plan_append(ents, first, last, snapshot_index, |idx| {
            Ok(entries[(idx - first) as usize].term)
        })?;
        if let Some(start) = to_write.first().map(|e| e.index) {
            if !self.entries.is_empty() {
                self.entries.truncate((start - first) as usize);
            }
            self.entries.extend_from_slice(to_write);
        }
        Ok(())
    }
}

/// `MemStorage` is a thread-safe but incomplete implementation of `Storage`, mainly for tests.
///
/// A real `Storage` should save both raft logs and applied data. However `MemStorage` only
/// contains raft logs. So you can call `MemStorage::append` to persist new received unstable raft
/// logs and then access them with `Storage` APIs.
///
/// Clones share the same core.
#[derive(Clone, Default)]
pub struct MemStorage {
    core: Arc<RwLock<MemStorageCore>>,
}

impl MemStorage {
    /// Returns a new memory storage value.
    pub fn new() -> MemStorage {
        MemStorage::default()
    }

    /// Create a new `MemStorage` with a given `ConfState`, which is how a
    /// group is bootstrapped.
    pub fn new_with_conf_state<T>(conf_state: T) -> MemStorage
    where
        ConfState: From<T>,
    {
        let store = MemStorage::new();
        let cs = ConfState::from(conf_state);
        store
            .wl()
            .kv
            .insert(CONF_STATE_KEY.to_vec(), cs.encode_to_bytes());
        store
    }

    /// Opens up a read lock on the storage and returns a guard handle. Use this
    /// with functions that don't require mutation.
    pub fn rl(&self) -> RwLockReadGuard<'_, MemStorageCore> {
        self.core.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens up a write lock on the storage and returns guard handle. Use this
    /// with functions that take a mutable reference to self.
    pub fn wl(&self) -> RwLockWriteGuard<'_, MemStorageCore> {
        self.core.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for MemStorage {
    fn append(&self, entries: &[Entry]) -> Result<()> {
        self.wl().append(entries)
    }

    fn get(&self, index: u64) -> Result<Entry> {
        let core = self.rl();
        let first = core.first_index();
        if first == 0 || index < first || index > core.last_index() {
            return Err(Error::Store(StorageError::LogNotFound(index)));
        }
        Ok(core.entries[(index - first) as usize].clone())
    }

    fn first_index(&self) -> Result<u64> {
        Ok(self.rl().first_index())
    }

    fn last_index(&self) -> Result<u64> {
        Ok(self.rl().last_index())
    }

    fn delete_range(&self, min: u64, max: u64) -> Result<()> {
        let mut core = self.wl();
        let first = core.first_index();
        let last = core.last_index();
        if let Some((min, max)) = plan_delete_range(min, max, first, last)? {
            let (lo, hi) = ((min - first) as usize, (max - first) as usize);
            core.entries.drain(lo..=hi);
        }
        Ok(())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.wl()
            .kv
            .insert(key.to_vec(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn get_bytes(&self, key: &[u8]) -> Result<Bytes> {
        self.rl()
            .kv
            .get(key)
            .cloned()
            .ok_or(Error::Store(StorageError::KeyNotFound))
    }

    fn set_u64(&self, key: &[u8], value: u64) -> Result<()> {
        self.set(key, &value.to_be_bytes())
    }

    fn get_u64(&self, key: &[u8]) -> Result<u64> {
        let v = self.get_bytes(key)?;
        let raw: [u8; 8] = v.as_ref().try_into().map_err(|_| {
            Error::Store(StorageError::Corrupted(format!(
                "u64 value of {} bytes",
                v.len()
            )))
        })?;
        Ok(u64::from_be_bytes(raw))
    }

    fn apply_snapshot_meta(&self, meta: &SnapshotMetadata) -> Result<()> {
        let mut core = self.wl();
        core.entries.clear();
        core.kv
            .insert(SNAPSHOT_META_KEY.to_vec(), meta.encode_to_bytes());
        core.kv
            .insert(CONF_STATE_KEY.to_vec(), meta.conf_state.encode_to_bytes());
        Ok(())
    }
}

impl<S: Storage + ?Sized> Storage for Arc<S> {
    fn append(&self, entries: &[Entry]) -> Result<()> {
        (**self).append(entries)
    }

    fn get(&self, index: u64) -> Result<Entry> {
        (**self).get(index)
    }

    fn first_index(&self) -> Result<u64> {
        (**self).first_index()
    }

    fn last_index(&self) -> Result<u64> {
        (**self).last_index()
    }

    fn delete_range(&self, min: u64, max: u64) -> Result<()> {
        (**self).delete_range(min, max)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        (**self).set(key, value)
    }

    fn get_bytes(&self, key: &[u8]) -> Result<Bytes> {
        (**self).get_bytes(key)
    }

    fn set_u64(&self, key: &[u8], value: u64) -> Result<()> {
        (**self).set_u64(key, value)
    }

    fn get_u64(&self, key: &[u8]) -> Result<u64> {
        (**self).get_u64(key)
    }

    fn apply_snapshot_meta(&self, meta: &SnapshotMetadata) -> Result<()> {
        (**self).apply_snapshot_meta(meta)
    }

    fn compact(&self, compact_index: u64) -> Result<()> {
        (**self).compact(compact_index)
    }
}
