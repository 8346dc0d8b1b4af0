// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::cmp;

use super::{Inflights, ProgressState};

/// What a leader knows about one peer's copy of the group log.
///
/// The leader drives replication to the peer from this record: `next_idx`
/// says where the next append starts, `matched` says how far the peer is
/// known to agree, and `state` decides how eagerly entries are pushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// The highest index known to be stored on the peer.
    pub matched: u64,
    /// The first index of the next append sent to the peer.
    pub next_idx: u64,
    /// How replication to the peer proceeds.
    ///
    /// `Probe` sends a single append and waits for the answer, `Replicate`
    /// streams appends bounded by `ins`, `Snapshot` sends nothing until the
    /// snapshot in flight is resolved.
    pub state: ProgressState,
    /// Set after a probing append until the peer answers.
    pub paused: bool,
    /// Index of the snapshot in flight while in `Snapshot`, `0` when it
    /// failed.
    pub pending_snapshot: u64,
    /// Whether the peer was heard from during the current election timeout.
    pub recent_active: bool,
    /// Last indexes of appends not yet acknowledged.
    pub ins: Inflights,
    /// Whether the peer only replicates without voting.
    pub is_learner: bool,
    /// The highest commit index the peer has reported.
    pub committed_index: u64,
}

impl Progress {
    /// A progress in `Probe` starting at `next_idx`, with room for
    /// `ins_size` unacknowledged appends.
    pub fn new(next_idx: u64, ins_size: usize) -> Self {
        Progress {
            matched: 0,
            next_idx,
            state: ProgressState::default(),
            paused: false,
            pending_snapshot: 0,
            recent_active: false,
            ins: Inflights::new(ins_size),
            is_learner: false,
            committed_index: 0,
        }
    }

    /// Forgets everything learned about the peer, as on a new term.
    pub(crate) fn reset(&mut self, next_idx: u64) {
        self.enter(ProgressState::Probe);
        self.matched = 0;
        self.next_idx = next_idx;
        self.recent_active = false;
        self.committed_index = 0;
    }

    fn enter(&mut self, state: ProgressState) {
        self.state = state;
        self.paused = false;
        self.pending_snapshot = 0;
        self.ins.reset();
    }

    /// Falls back to probing from the last known match. Leaving `Snapshot`
    /// also skips past the snapshot if one was delivered.
    pub fn become_probe(&mut self) {
        let known = match self.state {
            ProgressState::Snapshot => cmp::max(self.matched, self.pending_snapshot),
            _ => self.matched,
        };
        self.enter(ProgressState::Probe);
        self.next_idx = known + 1;
    }

    /// Starts streaming appends right after the match.
    pub fn become_replicate(&mut self) {
        self.enter(ProgressState::Replicate);
        self.next_idx = self.matched + 1;
    }

    /// Stops appends until the snapshot at `snapshot_idx` is resolved.
    pub fn become_snapshot(&mut self, snapshot_idx: u64) {
        self.enter(ProgressState::Snapshot);
        self.pending_snapshot = snapshot_idx;
    }

    /// Marks the snapshot in flight as lost.
    #[inline]
    pub fn snapshot_failure(&mut self) {
        self.pending_snapshot = 0;
    }

    /// Whether the peer already matched the snapshot in flight by other means.
    #[inline]
    pub fn maybe_snapshot_abort(&self) -> bool {
        self.state == ProgressState::Snapshot && self.matched >= self.pending_snapshot
    }

    /// Applies an acknowledgement of index `n`. Returns whether it moved the
    /// match forward, `false` for a stale one.
    pub fn maybe_update(&mut self, n: u64) -> bool {
        self.next_idx = cmp::max(self.next_idx, n + 1);
        if n <= self.matched {
            return false;
        }
        self.matched = n;
        self.resume();
        true
    }

    /// Records the commit index the peer reported.
    #[inline]
    pub fn update_committed(&mut self, committed_index: u64) {
        self.committed_index = cmp::max(self.committed_index, committed_index);
    }

    /// Handles a rejected append at `rejected` from a peer whose log ends at
    /// `last`. Returns `false` when the rejection is stale.
    pub fn maybe_decr_to(&mut self, rejected: u64, last: u64) -> bool {
        match self.state {
            ProgressState::Replicate if rejected <= self.matched => false,
            ProgressState::Replicate => {
                self.next_idx = self.matched + 1;
                true
            }
            // Only the answer to the single probing append counts.
            _ if self.next_idx != rejected + 1 => false,
            _ => {
                self.next_idx = cmp::max(cmp::min(rejected, last + 1), 1);
                self.resume();
                true
            }
        }
    }

    /// Whether the leader must hold appends to the peer for now.
    #[inline]
    pub fn is_paused(&self) -> bool {
        match self.state {
            ProgressState::Probe => self.paused,
            ProgressState::Replicate => self.ins.full(),
            ProgressState::Snapshot => true,
        }
    }

    #[inline]
    pub fn resume(&mut self) {
        self.paused = false;
    }

    #[inline]
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Records that entries up to `last` were just sent.
    pub fn update_state(&mut self, last: u64) {
        match self.state {
            ProgressState::Replicate => {
                self.next_idx = last + 1;
                self.ins.add(last);
            }
            ProgressState::Probe => self.pause(),
            ProgressState::Snapshot => {}
        }
    }
}
