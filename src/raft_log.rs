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

use std::cmp;
use std::fmt;

use slog::Logger;

use crate::errors::{Error, Result, StorageError};
use crate::log_unstable::Unstable;
use crate::message::{Entry, SnapshotMetadata};
use crate::storage::Storage;
use crate::util;

/// Raft log storage
///
/// Every write to the underlying store goes through `persist_entries`,
/// `persist_snapshot` or `compact`, which keeps the cached stable bounds
/// in line with the store.
pub struct RaftLog<T: Storage> {
    /// Contains all stable entries since the last snapshot.
    pub store: T,

    /// Contains all unstable entries and snapshot.
    /// they will be saved into storage.
    pub unstable: Unstable,

    /// The highest log position that is known to be in stable storage
    /// on a quorum of nodes.
    pub committed: u64,

    /// The highest log position that the application has been instructed
    /// to apply to its state machine.
    ///
    /// Invariant: applied <= committed
    pub applied: u64,

    stable_first: u64,
    stable_last: u64,
    // The index right before `stable_first` and its term, if known.
    stable_prev: (u64, u64),

    logger: Logger,
}

impl<T: Storage> fmt::Display for RaftLog<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "committed={}, applied={}, unstable.offset={}, unstable.entries.len()={}",
            self.committed,
            self.applied,
            self.unstable.offset,
            self.unstable.entries.len()
        )
    }
}

impl<T: Storage> RaftLog<T> {
    /// Creates a new raft log on top of the given store.
    pub fn new(store: T, logger: Logger) -> Result<RaftLog<T>> {
        let meta = store.snapshot_meta()?;
        let (first, last) = match (store.first_index()?, store.last_index()?) {
            (0, _) => (meta.index + 1, meta.index),
            bounds => bounds,
        };
        let prev_term = if first == meta.index + 1 {
            meta.term
        } else {
            match store.truncated_state()? {
                (index, term) if index + 1 == first => term,
                _ => 0,
            }
        };

        // Initialize committed and applied pointers to the time of the last compaction.
        Ok(RaftLog {
            store,
            committed: first - 1,
            applied: first - 1,
            unstable: Unstable::new(last + 1),
            stable_first: first,
            stable_last: last,
            stable_prev: (first - 1, prev_term),
            logger,
        })
    }

    /// Grabs the term from the last entry.
    pub fn last_term(&self) -> u64 {
        match self.term(self.last_index()) {
            Ok(t) => t,
            Err(e) => {
                error!(
                    self.logger,
                    "unexpected error when getting the last term";
                    "error" => ?e,
                );
                0
            }
        }
    }

    /// Grab a read-only reference to the underlying storage.
    #[inline]
    pub fn store(&self) -> &T {
        &self.store
    }

    /// For a given index, finds the term associated with it.
    ///
    /// Indexes outside `[first_index - 1, last_index]` have term 0. An
    /// index no longer retained fails with `StorageError::LogNotFound`.
    pub fn term(&self, idx: u64) -> Result<u64> {
        // the valid term range is [index of dummy entry, last index]
        let dummy_idx = self.first_index() - 1;
        if idx < dummy_idx || idx > self.last_index() {
            return Ok(0u64);
        }
        if let Some(term) = self.unstable.maybe_term(idx) {
            return Ok(term);
        }
        if idx == self.stable_prev.0 {
            return Ok(self.stable_prev.1);
        }
        self.store.get(idx).map(|e| e.term)
    }

    /// Returns the first index available via entries.
    pub fn first_index(&self) -> u64 {
        self.unstable
            .maybe_first_index()
            .unwrap_or(self.stable_first)
    }

    /// Returns the last index in the raft log.
    pub fn last_index(&self) -> u64 {
        self.unstable
            .maybe_last_index()
            .unwrap_or(self.stable_last)
    }

    /// Finds the index of the conflict.
    ///
    /// It returns the first index of conflicting entries between the existing
    /// entries and the given entries, if there are any.
    ///
    /// If there are no conflicting entries, and the existing entries contain
    /// all the given entries, zero will be returned.
    ///
    /// If there are no conflicting entries, but the given entries contains new
    /// entries, the index of the first new entry will be returned.
    ///
    /// An entry is considered to be conflicting if it has the same index but
    /// a different term.
    pub fn find_conflict(&self, ents: &[Entry]) -> u64 {
        for e in ents {
            if !self.match_term(e.index, e.term) {
                if e.index <= self.last_index() {
                    info!(
                        self.logger,
                        "found conflict at index {index}",
                        index = e.index;
                        "existing term" => self.term(e.index).unwrap_or(0),
                        "conflicting term" => e.term,
                    );
                }
                return e.index;
            }
        }
        0
    }

    /// Answers the question: Does this index belong to this term?
    pub fn match_term(&self, idx: u64, term: u64) -> bool {
        self.term(idx).map(|t| t == term).unwrap_or(false)
    }

    /// Returns `None` if the entries cannot be appended. Otherwise,
    /// it returns `Some((conflict_index, last_index))`.
    ///
    /// A conflict at or below the committed index is an invariant violation.
    pub fn maybe_append(
        &mut self,
        idx: u64,
        term: u64,
        committed: u64,
        ents: &[Entry],
    ) -> Result<Option<(u64, u64)>> {
        if !self.match_term(idx, term) {
            return Ok(None);
        }
        let conflict_idx = self.find_conflict(ents);
        if conflict_idx != 0 {
            if conflict_idx <= self.committed {
                return Err(Error::InvariantViolated(format!(
                    "entry {} conflict with committed entry {}",
                    conflict_idx, self.committed
                )));
            }
            let start = (conflict_idx - (idx + 1)) as usize;
            self.append(&ents[start..])?;
        }
        let last_new_index = idx + ents.len() as u64;
        self.commit_to(cmp::min(committed, last_new_index))?;
        Ok(Some((conflict_idx, last_new_index)))
    }

    /// Sets the last committed value to the passed in value. Commit never
    /// decreases and never passes the last index.
    pub fn commit_to(&mut self, to_commit: u64) -> Result<()> {
        if self.committed >= to_commit {
            return Ok(());
        }
        if self.last_index() < to_commit {
            return Err(Error::InvariantViolated(format!(
                "to_commit {} is out of range [last_index {}]",
                to_commit,
                self.last_index()
            )));
        }
        self.committed = to_commit;
        Ok(())
    }

    /// Advance the applied index to the passed in value.
    pub fn applied_to(&mut self, idx: u64) -> Result<()> {
        if idx == 0 {
            return Ok(());
        }
        if self.committed < idx || idx < self.applied {
            return Err(Error::InvariantViolated(format!(
                "applied({}) is out of range [prev_applied({}), committed({})]",
                idx, self.applied, self.committed
            )));
        }
        self.applied = idx;
        Ok(())
    }

    /// Returns the last applied index.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Appends a set of entries to the unstable list and returns the new
    /// last index.
    pub fn append(&mut self, ents: &[Entry]) -> Result<u64> {
        trace!(
            self.logger,
            "Entries being appended to unstable list";
            "ents" => ?ents,
        );
        let first = match ents.first() {
            Some(e) => e.index,
            None => return Ok(self.last_index()),
        };

        let after = first - 1;
        if after < self.committed {
            return Err(Error::InvariantViolated(format!(
                "after {} is out of range [committed {}]",
                after, self.committed
            )));
        }
        self.unstable.truncate_and_append(ents)?;
        Ok(self.last_index())
    }

    /// Returns the entries not yet written to the store.
    pub fn unstable_entries(&self) -> &[Entry] {
        &self.unstable.entries
    }

    /// Returns entries starting from a particular index and not exceeding a bytesize.
    pub fn entries(&self, idx: u64, max_size: impl Into<Option<u64>>) -> Result<Vec<Entry>> {
        let last = self.last_index();
        if idx > last {
            return Ok(Vec::new());
        }
        self.slice(idx, last + 1, max_size)
    }

    /// Returns all the entries. Only used by tests.
    #[doc(hidden)]
    pub fn all_entries(&self) -> Vec<Entry> {
        let first_index = self.first_index();
        match self.entries(first_index, None) {
            Ok(ents) => ents,
            Err(e) => {
                error!(self.logger, "failed to load entries"; "error" => ?e);
                vec![]
            }
        }
    }

    /// Determines if the given (lastIndex,term) log is more up-to-date
    /// by comparing the index and term of the last entry in the existing logs.
    /// If the logs have last entry with different terms, then the log with the
    /// later term is more up-to-date. If the logs end with the same term, then
    /// whichever log has the larger last_index is more up-to-date. If the logs are
    /// the same, the given log is up-to-date.
    pub fn is_up_to_date(&self, last_index: u64, term: u64) -> bool {
        term > self.last_term() || (term == self.last_term() && last_index >= self.last_index())
    }

    /// Returns committed entries after `since_idx`, limited to `max_size`.
    pub fn next_entries_since(
        &self,
        since_idx: u64,
        max_size: Option<u64>,
    ) -> Result<Option<Vec<Entry>>> {
        let offset = cmp::max(since_idx + 1, self.first_index());
        let committed = self.committed;
        if committed + 1 > offset {
            return self.slice(offset, committed + 1, max_size).map(Some);
        }
        Ok(None)
    }

    /// Returns all the available entries for execution.
    /// If applied is smaller than the index of snapshot, it returns all committed
    /// entries after the index of snapshot.
    pub fn next_entries(&self, max_size: Option<u64>) -> Result<Option<Vec<Entry>>> {
        self.next_entries_since(self.applied, max_size)
    }

    /// Returns whether there are entries that can be applied between `since_idx` and the committed index.
    pub fn has_next_entries_since(&self, since_idx: u64) -> bool {
        let offset = cmp::max(since_idx + 1, self.first_index());
        self.committed + 1 > offset
    }

    /// Returns whether there are new entries.
    pub fn has_next_entries(&self) -> bool {
        self.has_next_entries_since(self.applied)
    }

    /// The snapshot received from the leader and not yet persisted.
    pub fn pending_snapshot(&self) -> Option<&SnapshotMetadata> {
        self.unstable.snapshot.as_ref()
    }

    fn must_check_outofbounds(&self, low: u64, high: u64) -> Result<()> {
        if low > high {
            return Err(Error::InvariantViolated(format!(
                "invalid slice {} > {}",
                low, high
            )));
        }
        let first_index = self.first_index();
        if low < first_index {
            return Err(Error::Store(StorageError::Compacted));
        }
        if high > self.last_index() + 1 {
            return Err(Error::InvariantViolated(format!(
                "slice[{},{}] out of bound[{},{}]",
                low,
                high,
                first_index,
                self.last_index()
            )));
        }
        Ok(())
    }

    /// Attempts to commit the index and term and returns whether it did.
    pub fn maybe_commit(&mut self, max_index: u64, term: u64) -> bool {
        if max_index > self.committed
            && max_index <= self.last_index()
            && self.term(max_index).map_or(false, |t| t == term)
        {
            debug!(
                self.logger,
                "committing index {index}",
                index = max_index
            );
            self.committed = max_index;
            true
        } else {
            false
        }
    }

    /// Grabs a slice of entries from the raft. Unlike a rust slice pointer, these are
    /// returned by value. The result is truncated to the max_size in bytes.
    pub fn slice(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
    ) -> Result<Vec<Entry>> {
        let max_size = max_size.into();
        self.must_check_outofbounds(low, high)?;

        let mut ents = vec![];
        if low == high {
            return Ok(ents);
        }

        if low < self.unstable.offset {
            let unstable_high = cmp::min(high, self.unstable.offset);
            ents = self.store.entries(low, unstable_high, max_size)?;
            if (ents.len() as u64) < unstable_high - low {
                return Ok(ents);
            }
        }

        if high > self.unstable.offset {
            let offset = self.unstable.offset;
            let unstable = self.unstable.slice(cmp::max(low, offset), high)?;
            ents.extend_from_slice(unstable);
        }
        util::limit_size(&mut ents, max_size);
        Ok(ents)
    }

    /// Restores the current log from a snapshot point received from the
    /// leader. The store is only touched once the snapshot is persisted.
    pub fn restore(&mut self, meta: SnapshotMetadata) {
        info!(
            self.logger,
            "log [{log}] starts to restore snapshot [index: {snapshot_index}, term: {snapshot_term}]",
            log = self.to_string(),
            snapshot_index = meta.index,
            snapshot_term = meta.term,
        );
        self.committed = meta.index;
        self.unstable.restore(meta);
    }

    /// Writes `ents`, the unstable entries handed out by a `Ready`, to the
    /// store and drops them from the unstable buffer.
    pub fn persist_entries(&mut self, ents: &[Entry]) -> Result<()> {
        let last = match ents.last() {
            Some(e) => e,
            None => return Ok(()),
        };
        self.store.append(ents)?;
        self.stable_last = last.index;
        self.unstable.stable_to(last.index, last.term);
        Ok(())
    }

    /// Records a received snapshot point in the store, dropping the whole log.
    pub fn persist_snapshot(&mut self, meta: &SnapshotMetadata) -> Result<()> {
        self.store.apply_snapshot_meta(meta)?;
        self.stable_first = meta.index + 1;
        self.stable_last = meta.index;
        self.stable_prev = (meta.index, meta.term);
        self.unstable.stable_snap(meta.index);
        Ok(())
    }

    /// Drops stable entries below `to`. Only applied entries are ever
    /// dropped, and at least the last stable entry is kept.
    pub fn compact(&mut self, to: u64) -> Result<()> {
        let to = cmp::min(to, cmp::min(self.applied + 1, self.stable_last));
        if to <= self.stable_first {
            return Ok(());
        }
        let prev_term = self.term(to - 1)?;
        self.store.compact(to)?;
        debug!(
            self.logger,
            "compacted raft log";
            "first_index" => to,
            "previous_first" => self.stable_first,
        );
        self.stable_first = to;
        self.stable_prev = (to - 1, prev_term);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::default_logger;
    use crate::errors::{Error, StorageError};
    use crate::message::{Entry, SnapshotMetadata};
    use crate::raft_log::RaftLog;
    use crate::storage::{MemStorage, Storage};

    fn new_entry(index: u64, term: u64) -> Entry {
        Entry::new(index, term, "")
    }

    fn new_snapshot(meta_index: u64, meta_term: u64) -> SnapshotMetadata {
        SnapshotMetadata {
            index: meta_index,
            term: meta_term,
            ..Default::default()
        }
    }

    fn new_log(ents: &[Entry]) -> RaftLog<MemStorage> {
        let store = MemStorage::new();
        store.append(ents).unwrap();
        RaftLog::new(store, default_logger()).unwrap()
    }

    #[test]
    fn test_find_conflict() {
        let previous_ents = vec![new_entry(1, 1), new_entry(2, 2), new_entry(3, 3)];
        let tests = vec![
            // no conflict, empty ent
            (vec![], 0),
            // no conflict
            (vec![new_entry(1, 1), new_entry(2, 2), new_entry(3, 3)], 0),
            (vec![new_entry(2, 2), new_entry(3, 3)], 0),
            (vec![new_entry(3, 3)], 0),
            // no conflict, but has new entries
            (
                vec![
                    new_entry(1, 1),
                    new_entry(2, 2),
                    new_entry(3, 3),
                    new_entry(4, 4),
                    new_entry(5, 4),
                ],
                4,
            ),
            (vec![new_entry(3, 3), new_entry(4, 4), new_entry(5, 4)], 4),
            (vec![new_entry(4, 4), new_entry(5, 4)], 4),
            // conflicts with existing entries
            (vec![new_entry(1, 4), new_entry(2, 4)], 1),
            (vec![new_entry(2, 1), new_entry(3, 4), new_entry(4, 4)], 2),
            (
                vec![
                    new_entry(3, 1),
                    new_entry(4, 2),
                    new_entry(5, 4),
                    new_entry(6, 4),
                ],
                3,
            ),
        ];
        for (i, (ents, wconflict)) in tests.iter().enumerate() {
            let mut raft_log = new_log(&[]);
            raft_log.append(&previous_ents).unwrap();
            let gconflict = raft_log.find_conflict(ents);
            if gconflict != *wconflict {
                panic!("#{}: conflict = {}, want {}", i, gconflict, wconflict)
            }
        }
    }

    #[test]
    fn test_is_up_to_date() {
        let mut raft_log = new_log(&[]);
        raft_log
            .append(&[new_entry(1, 1), new_entry(2, 2), new_entry(3, 3)])
            .unwrap();
        let last = raft_log.last_index();
        let tests = vec![
            // greater term, ignore lastIndex
            (last - 1, 4, true),
            (last, 4, true),
            (last + 1, 4, true),
            // smaller term, ignore lastIndex
            (last - 1, 2, false),
            (last, 2, false),
            (last + 1, 2, false),
            // equal term, larger lastIndex wins
            (last - 1, 3, false),
            (last, 3, true),
            (last + 1, 3, true),
        ];
        for (i, &(last_index, term, up_to_date)) in tests.iter().enumerate() {
            let g = raft_log.is_up_to_date(last_index, term);
            if g != up_to_date {
                panic!("#{}: uptodate = {}, want {}", i, g, up_to_date);
            }
        }
    }

    #[test]
    fn test_append() {
        let previous_ents = vec![new_entry(1, 1), new_entry(2, 2)];
        let tests = vec![
            (vec![], 2, vec![new_entry(1, 1), new_entry(2, 2)], 3),
            (
                vec![new_entry(3, 2)],
                3,
                vec![new_entry(1, 1), new_entry(2, 2), new_entry(3, 2)],
                3,
            ),
            // conflicts with index 1
            (vec![new_entry(1, 2)], 1, vec![new_entry(1, 2)], 1),
            // conflicts with index 2
            (
                vec![new_entry(2, 3), new_entry(3, 3)],
                3,
                vec![new_entry(1, 1), new_entry(2, 3), new_entry(3, 3)],
                2,
            ),
        ];
        for (i, (ents, windex, wents, wunstable)) in tests.into_iter().enumerate() {
            let mut raft_log = new_log(&previous_ents);
            let index = raft_log.append(&ents).unwrap();
            if index != windex {
                panic!("#{}: last_index = {}, want {}", i, index, windex);
            }
            match raft_log.entries(1, None) {
                Err(e) => panic!("#{}: unexpected error {}", i, e),
                Ok(ref g) if *g != wents => {
                    panic!("#{}: logEnts = {:?}, want {:?}", i, g, wents)
                }
                _ => {
                    let goff = raft_log.unstable.offset;
                    if goff != wunstable {
                        panic!("#{}: unstable = {}, want {}", i, goff, wunstable);
                    }
                }
            }
        }
    }

    #[test]
    fn test_log_maybe_append() {
        let previous_ents = vec![new_entry(1, 1), new_entry(2, 2), new_entry(3, 3)];
        let (last_index, last_term, commit) = (3u64, 3u64, 1u64);

        // log_term, index, committed, ents, wlasti, wcommit, werr
        let tests = vec![
            // not match: term is different
            (last_term - 1, last_index, last_index, vec![new_entry(4, 4)], None, commit, false),
            // not match: index out of bound
            (last_term, last_index + 1, last_index, vec![new_entry(5, 4)], None, commit, false),
            // match with the last existing entry
            (last_term, last_index, last_index, vec![], Some(3), 3, false),
            // do not increase commit higher than lastnewi
            (last_term, last_index, last_index + 1, vec![], Some(3), 3, false),
            // commit up to the commit in the message
            (last_term, last_index, last_index - 1, vec![], Some(3), 2, false),
            // commit do not decrease
            (last_term, last_index, 0, vec![], Some(3), commit, false),
            (0, 0, last_index, vec![], Some(0), commit, false),
            (last_term, last_index, last_index, vec![new_entry(4, 4)], Some(4), 3, false),
            (last_term, last_index, last_index + 1, vec![new_entry(4, 4)], Some(4), 4, false),
            // do not increase commit higher than lastnewi
            (
                last_term,
                last_index,
                last_index + 2,
                vec![new_entry(4, 4)],
                Some(4),
                4,
                false,
            ),
            (
                last_term,
                last_index,
                last_index + 2,
                vec![new_entry(4, 4), new_entry(5, 4)],
                Some(5),
                5,
                false,
            ),
            // match with the the entry in the middle
            (last_term - 1, last_index - 1, last_index, vec![new_entry(3, 4)], Some(3), 3, false),
            (last_term - 2, last_index - 2, last_index, vec![new_entry(2, 4)], Some(2), 2, false),
            // conflict with existing committed entry
            (last_term - 3, last_index - 3, last_index, vec![new_entry(1, 4)], None, commit, true),
            (
                last_term - 2,
                last_index - 2,
                last_index,
                vec![new_entry(2, 4), new_entry(3, 4)],
                Some(3),
                3,
                false,
            ),
        ];

        for (i, (log_term, index, committed, ents, wlasti, wcommit, werr)) in
            tests.into_iter().enumerate()
        {
            let mut raft_log = new_log(&[]);
            raft_log.append(&previous_ents).unwrap();
            raft_log.committed = commit;
            let res = raft_log.maybe_append(index, log_term, committed, &ents);
            if res.is_err() != werr {
                panic!("#{}: error = {:?}, want error {}", i, res, werr);
            }
            if werr {
                continue;
            }
            let glasti = res.unwrap().map(|(_, last)| last);
            if glasti != wlasti {
                panic!("#{}: lastindex = {:?}, want {:?}", i, glasti, wlasti);
            }
            if raft_log.committed != wcommit {
                panic!("#{}: committed = {}, want {}", i, raft_log.committed, wcommit);
            }
            if glasti.is_some() && !ents.is_empty() {
                let gents = raft_log
                    .slice(raft_log.last_index() - ents.len() as u64 + 1, raft_log.last_index() + 1, None)
                    .unwrap();
                if ents != gents {
                    panic!("#{}: appended entries = {:?}, want {:?}", i, gents, ents);
                }
            }
        }
    }

    #[test]
    fn test_commit_to() {
        let mut raft_log = new_log(&[new_entry(1, 1), new_entry(2, 2), new_entry(3, 3)]);
        raft_log.committed = 2;
        // never decrease
        raft_log.commit_to(1).unwrap();
        assert_eq!(raft_log.committed, 2);
        raft_log.commit_to(3).unwrap();
        assert_eq!(raft_log.committed, 3);
        // past the last index
        assert!(matches!(
            raft_log.commit_to(4),
            Err(Error::InvariantViolated(_))
        ));
        assert_eq!(raft_log.committed, 3);
    }

    #[test]
    fn test_persist_and_next_entries() {
        let mut raft_log = new_log(&[new_entry(1, 1), new_entry(2, 1)]);
        raft_log
            .append(&[new_entry(3, 1), new_entry(4, 2)])
            .unwrap();
        assert_eq!(raft_log.unstable_entries().len(), 2);
        raft_log.commit_to(4).unwrap();
        raft_log.applied_to(1).unwrap();
        // committed entries may still be unstable
        let next = raft_log.next_entries(None).unwrap().unwrap();
        assert_eq!(next, vec![new_entry(2, 1), new_entry(3, 1), new_entry(4, 2)]);

        let ents = raft_log.unstable_entries().to_vec();
        raft_log.persist_entries(&ents).unwrap();
        assert!(raft_log.unstable_entries().is_empty());
        assert_eq!(raft_log.unstable.offset, 5);
        assert_eq!(raft_log.store().last_index().unwrap(), 4);
        assert_eq!(raft_log.last_index(), 4);
        assert_eq!(raft_log.last_term(), 2);

        raft_log.applied_to(4).unwrap();
        assert!(!raft_log.has_next_entries());
        assert!(raft_log.applied_to(5).is_err());
    }

    #[test]
    fn test_truncate_persisted_suffix() {
        let mut raft_log = new_log(&[new_entry(5, 1), new_entry(6, 1), new_entry(7, 1)]);
        assert_eq!(raft_log.first_index(), 5);
        raft_log.committed = 5;
        assert_eq!(
            raft_log
                .maybe_append(5, 1, 5, &[new_entry(6, 2)])
                .unwrap(),
            Some((6, 6))
        );
        assert_eq!(raft_log.last_index(), 6);
        assert_eq!(raft_log.term(7).unwrap(), 0);
        let ents = raft_log.unstable_entries().to_vec();
        raft_log.persist_entries(&ents).unwrap();
        assert_eq!(raft_log.store().last_index().unwrap(), 6);
        assert_eq!(raft_log.all_entries(), vec![new_entry(5, 1), new_entry(6, 2)]);
    }

    #[test]
    fn test_compaction() {
        let ents: Vec<Entry> = (1..=10).map(|i| new_entry(i, i)).collect();
        let mut raft_log = new_log(&ents);
        raft_log.committed = 10;
        raft_log.applied = 6;

        // never past applied
        raft_log.compact(9).unwrap();
        assert_eq!(raft_log.first_index(), 7);
        assert_eq!(raft_log.store().first_index().unwrap(), 7);
        // the term right before the first entry is kept
        assert_eq!(raft_log.term(6).unwrap(), 6);
        assert_eq!(
            raft_log.slice(5, 8, None).unwrap_err(),
            Error::Store(StorageError::Compacted)
        );
        assert_eq!(raft_log.term(4).unwrap(), 0);
        // a no-op below the first index
        raft_log.compact(3).unwrap();
        assert_eq!(raft_log.first_index(), 7);
    }

    #[test]
    fn test_compaction_survives_restart() {
        let ents: Vec<Entry> = (1..=10).map(|i| new_entry(i, 3)).collect();
        let mut raft_log = new_log(&ents);
        raft_log.committed = 10;
        raft_log.applied = 10;
        raft_log.compact(6).unwrap();
        assert_eq!(raft_log.term(5).unwrap(), 3);

        let raft_log = RaftLog::new(raft_log.store().clone(), default_logger()).unwrap();
        assert_eq!(raft_log.first_index(), 6);
        assert_eq!(raft_log.term(5).unwrap(), 3);
        // an append probing right before the first entry still matches
        assert!(raft_log.match_term(5, 3));
    }

    #[test]
    fn test_restore_and_persist_snapshot() {
        let mut raft_log = new_log(&[new_entry(1, 1), new_entry(2, 1)]);
        raft_log.restore(new_snapshot(100, 5));
        assert_eq!(raft_log.committed, 100);
        assert_eq!(raft_log.first_index(), 101);
        assert_eq!(raft_log.last_index(), 100);
        assert_eq!(raft_log.term(100).unwrap(), 5);
        assert!(raft_log.pending_snapshot().is_some());

        let meta = raft_log.pending_snapshot().cloned().unwrap();
        raft_log.persist_snapshot(&meta).unwrap();
        assert!(raft_log.pending_snapshot().is_none());
        assert_eq!(raft_log.first_index(), 101);
        assert_eq!(raft_log.last_index(), 100);
        assert_eq!(raft_log.term(100).unwrap(), 5);
        assert_eq!(raft_log.store().last_index().unwrap(), 0);

        // a restart picks the snapshot point back up
        let reopened = RaftLog::new(raft_log.store().clone(), default_logger()).unwrap();
        assert_eq!(reopened.first_index(), 101);
        assert_eq!(reopened.last_term(), 5);
    }

    #[test]
    fn test_slice() {
        let (offset, num) = (100u64, 100u64);
        let (last, half) = (offset + num, offset + num / 2);
        let halfe = new_entry(half, half);

        let store = MemStorage::new();
        store.apply_snapshot_meta(&new_snapshot(offset, 0)).unwrap();
        let stable: Vec<Entry> = (1..num / 2).map(|i| new_entry(offset + i, offset + i)).collect();
        store.append(&stable).unwrap();
        let mut raft_log = RaftLog::new(store, default_logger()).unwrap();
        let unstable: Vec<Entry> = (num / 2..num).map(|i| new_entry(offset + i, offset + i)).collect();
        raft_log.append(&unstable).unwrap();

        let tests = vec![
            // test no limit
            (offset - 1, offset + 1, None, vec![], true),
            (offset, offset + 1, None, vec![], true),
            (half - 1, half + 1, None, vec![new_entry(half - 1, half - 1), halfe.clone()], false),
            (half, half + 1, None, vec![halfe.clone()], false),
            (last - 1, last, None, vec![new_entry(last - 1, last - 1)], false),
            // test limit
            (half - 1, half + 1, Some(0), vec![new_entry(half - 1, half - 1)], false),
            (half, half + 1, Some(0), vec![halfe], false),
        ];
        for (i, (from, to, limit, w, wcompacted)) in tests.into_iter().enumerate() {
            match raft_log.slice(from, to, limit) {
                Err(e) => {
                    if !wcompacted || e != Error::Store(StorageError::Compacted) {
                        panic!("#{}: unexpected error {}", i, e);
                    }
                }
                Ok(g) => {
                    if wcompacted {
                        panic!("#{}: expect compacted, got {:?}", i, g);
                    }
                    if g != w {
                        panic!("#{}: from {} to {} = {:?}, want {:?}", i, from, to, g, w);
                    }
                }
            }
        }
        assert!(matches!(
            raft_log.slice(last, last + 2, None),
            Err(Error::InvariantViolated(_))
        ));
    }
}
