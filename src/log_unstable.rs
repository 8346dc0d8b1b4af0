//! A representation of not-yet-persisted log entries and state.

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

use crate::errors::{Error, Result};
use crate::message::{Entry, SnapshotMetadata};
use crate::util::entry_approximate_size;

/// The `unstable.entries[i]` has raft log position `i+unstable.offset`.
/// Note that `unstable.offset` may be less than the highest log
/// position in storage; this means that the next write to storage
/// might need to truncate the log before persisting unstable.entries.
#[derive(Debug, Default)]
pub struct Unstable {
    /// The incoming unstable snapshot point, if any.
    pub snapshot: Option<SnapshotMetadata>,

    /// All entries that have not yet been written to storage.
    pub entries: Vec<Entry>,

    /// The size of entries.
    pub entries_size: usize,

    /// The offset from the vector index.
    pub offset: u64,
}

impl Unstable {
    /// Creates a new log of unstable entries.
    pub fn new(offset: u64) -> Unstable {
        Unstable {
            offset,
            ..Default::default()
        }
    }

    /// Returns the index of the first possible entry in entries
    /// if it has a snapshot.
    pub fn maybe_first_index(&self) -> Option<u64> {
        self.snapshot.as_ref().map(|meta| meta.index + 1)
    }

    /// Returns the last index if it has at least one unstable entry or snapshot.
    pub fn maybe_last_index(&self) -> Option<u64> {
        match self.entries.len() {
            0 => self.snapshot.as_ref().map(|meta| meta.index),
            len => Some(self.offset + len as u64 - 1),
        }
    }

    /// Returns the term of the entry at index idx, if there is any.
    pub fn maybe_term(&self, idx: u64) -> Option<u64> {
        if idx < self.offset {
            let meta = self.snapshot.as_ref()?;
            if idx == meta.index {
                Some(meta.term)
            } else {
                None
            }
        } else {
            let last = self.maybe_last_index()?;
            if idx > last {
                return None;
            }
            self.entries
                .get((idx - self.offset) as usize)
                .map(|e| e.term)
        }
    }

    /// Drops the entries up to `index` once they are durable, provided the
    /// entry there still has `term`. A mismatch means the entries were
    /// replaced meanwhile and must stay.
    pub fn stable_to(&mut self, index: u64, term: u64) {
        if index < self.offset || self.maybe_term(index) != Some(term) {
            return;
        }
        let n = (index + 1 - self.offset) as usize;
        for e in self.entries.drain(..n) {
            self.entries_size -= entry_approximate_size(&e);
        }
        self.offset = index + 1;
    }

    /// Clears the unstable snapshot once it is durable.
    pub fn stable_snap(&mut self, index: u64) {
        if self.snapshot.as_ref().map_or(false, |meta| meta.index == index) {
            self.snapshot = None;
        }
    }

    /// From a given snapshot, restores the snapshot to self, but doesn't unpack.
    pub fn restore(&mut self, meta: SnapshotMetadata) {
        self.entries.clear();
        self.entries_size = 0;
        self.offset = meta.index + 1;
        self.snapshot = Some(meta);
    }

    /// Append entries to unstable, truncate local block first if overlapped.
    pub fn truncate_and_append(&mut self, ents: &[Entry]) -> Result<()> {
        let after = match ents.first() {
            Some(e) => e.index,
            None => return Ok(()),
        };
        let upper = self.offset + self.entries.len() as u64;
        if after == upper {
            // after is the next index in the self.entries, append directly
        } else if after <= self.offset {
            // The log is being truncated to before our current offset
            // portion, so set the offset and replace the entries
            self.offset = after;
            self.entries.clear();
            self.entries_size = 0;
        } else if after < upper {
            let keep = (after - self.offset) as usize;
            for e in &self.entries[keep..] {
                self.entries_size -= entry_approximate_size(e);
            }
            self.entries.truncate(keep);
        } else {
            return Err(Error::InvariantViolated(format!(
                "unstable append at {} leaves a gap after {}",
                after,
                upper - 1
            )));
        }
        self.entries.extend_from_slice(ents);
        self.entries_size += ents.iter().map(entry_approximate_size).sum::<usize>();
        Ok(())
    }

    /// Returns a slice of entries between `lo` and `hi`.
    pub fn slice(&self, lo: u64, hi: u64) -> Result<&[Entry]> {
        let upper = self.offset + self.entries.len() as u64;
        if lo > hi || lo < self.offset || hi > upper {
            return Err(Error::InvariantViolated(format!(
                "unstable.slice[{}, {}] out of bound[{}, {}]",
                lo, hi, self.offset, upper
            )));
        }
        let off = self.offset;
        Ok(&self.entries[(lo - off) as usize..(hi - off) as usize])
    }
}
