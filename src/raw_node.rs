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

//! The raw node of the raft module.
//!
//! This module contains the value types for the node and it's connection to other
//! nodes but not the raft consensus itself. Generally, you'll interact with the
//! RawNode first and use it to access the inner workings of the consensus protocol.

use std::mem;

use bytes::Bytes;
use slog::Logger;

use crate::codec::Codec;
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::message::{
    is_local_msg, is_response_msg, ConfChange, ConfState, Entry, EntryType, HardState, Message,
    MessageType, SnapshotMetadata,
};
use crate::raft::{Raft, SoftState};
use crate::read_only::ReadState;
use crate::status::Status;
use crate::storage::Storage;

/// The status of the snapshot.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SnapshotStatus {
    /// Represents that the snapshot is finished being created.
    Finish,
    /// Indicates that the snapshot failed to build or is not ready.
    Failure,
}

/// Ready encapsulates the entries and messages that are ready to read,
/// be saved to stable storage, committed or sent to other peers.
/// All fields in Ready are read-only.
#[derive(Default, Debug, PartialEq)]
pub struct Ready {
    ss: Option<SoftState>,

    hs: Option<HardState>,

    read_states: Vec<ReadState>,

    entries: Vec<Entry>,

    snapshot: Option<SnapshotMetadata>,

    /// CommittedEntries specifies entries to be committed to a
    /// store/state-machine. These have previously been committed to stable
    /// store.
    pub committed_entries: Vec<Entry>,

    /// Messages specifies outbound messages to be sent AFTER Entries are
    /// committed to stable storage.
    /// If it contains a MsgSnapshot message, the application MUST report back to raft
    /// when the snapshot has been received or has failed by calling report_snapshot.
    pub messages: Vec<Message>,

    must_sync: bool,
}

impl Ready {
    fn new<T: Storage>(
        raft: &mut Raft<T>,
        prev_ss: &SoftState,
        prev_hs: &HardState,
        max_committed_size: Option<u64>,
    ) -> Result<Ready> {
        let mut rd = Ready {
            entries: raft.raft_log.unstable_entries().to_vec(),
            ..Default::default()
        };
        if !raft.msgs.is_empty() {
            mem::swap(&mut raft.msgs, &mut rd.messages);
        }
        rd.committed_entries = raft
            .raft_log
            .next_entries(max_committed_size)?
            .unwrap_or_default();
        let ss = raft.soft_state();
        if &ss != prev_ss {
            rd.ss = Some(ss);
        }
        let hs = raft.hard_state();
        if &hs != prev_hs {
            if hs.vote != prev_hs.vote || hs.term != prev_hs.term || !rd.entries.is_empty() {
                rd.must_sync = true;
            }
            rd.hs = Some(hs);
        }
        rd.snapshot = raft.raft_log.pending_snapshot().cloned();
        if !raft.read_states.is_empty() {
            mem::swap(&mut raft.read_states, &mut rd.read_states);
        }
        Ok(rd)
    }

    /// The current volatile state of a Node.
    /// SoftState will be nil if there is no update.
    /// It is not required to consume or store SoftState.
    #[inline]
    pub fn ss(&self) -> Option<&SoftState> {
        self.ss.as_ref()
    }

    /// The current state of a Node to be saved to stable storage BEFORE
    /// Messages are sent.
    /// HardState will be equal to empty state if there is no update.
    #[inline]
    pub fn hs(&self) -> Option<&HardState> {
        self.hs.as_ref()
    }

    /// States can be used for node to serve linearizable read requests locally
    /// when its applied index is greater than the index in ReadState.
    /// Note that the read_state will be returned when raft receives MsgReadIndex.
    /// The returned is only valid for the request that requested to read.
    #[inline]
    pub fn read_states(&self) -> &[ReadState] {
        &self.read_states
    }

    /// Entries specifies entries to be saved to stable storage BEFORE
    /// Messages are sent.
    #[inline]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// The snapshot point to be saved to stable storage, if any.
    #[inline]
    pub fn snapshot(&self) -> Option<&SnapshotMetadata> {
        self.snapshot.as_ref()
    }

    /// MustSync indicates whether the HardState and Entries must be synchronously
    /// written to disk or if an asynchronous write is permissible.
    #[inline]
    pub fn must_sync(&self) -> bool {
        self.must_sync
    }

    /// Takes the read states out of the ready.
    #[inline]
    pub fn take_read_states(&mut self) -> Vec<ReadState> {
        mem::take(&mut self.read_states)
    }

    // The index everything handed out by this ready goes up to.
    fn applied_index(&self) -> Option<u64> {
        self.committed_entries
            .last()
            .map(|e| e.index)
            .or_else(|| self.snapshot.as_ref().map(|s| s.index))
    }
}

/// RawNode is a thread-unsafe Node.
/// The methods of this struct correspond to the methods of Node and are described
/// more fully there.
pub struct RawNode<T: Storage> {
    /// The internal raft state.
    pub raft: Raft<T>,
    prev_ss: SoftState,
    prev_hs: HardState,
    max_committed_size: Option<u64>,
}

impl<T: Storage> RawNode<T> {
    #[allow(clippy::new_ret_no_self)]
    /// Create a new RawNode given some [`Config`](../struct.Config.html).
    pub fn new(config: &Config, store: T, logger: &Logger) -> Result<Self> {
        let r = Raft::new(config, store, logger)?;
        let mut rn = RawNode {
            raft: r,
            prev_hs: Default::default(),
            prev_ss: Default::default(),
            max_committed_size: None,
        };
        rn.prev_hs = rn.raft.hard_state();
        rn.prev_ss = rn.raft.soft_state();
        info!(
            rn.raft.logger,
            "RawNode created with id {id}.",
            id = rn.raft.id
        );
        Ok(rn)
    }

    /// Create a new RawNode given some [`Config`](../struct.Config.html) and the default logger.
    #[cfg(feature = "default-logger")]
    #[allow(clippy::new_ret_no_self)]
    pub fn with_default_logger(c: &Config, store: T) -> Result<Self> {
        Self::new(c, store, &crate::default_logger())
    }

    /// Sets priority of node.
    #[inline]
    pub fn set_priority(&mut self, priority: u64) {
        self.raft.set_priority(priority);
    }

    /// Limits the size of the committed entries handed out by one `Ready`.
    #[inline]
    pub fn set_max_committed_size(&mut self, max: Option<u64>) {
        self.max_committed_size = max;
    }

    /// Tick advances the internal logical clock by a single tick.
    ///
    /// Returns true to indicate that there will probably be some readiness which
    /// needs to be handled.
    pub fn tick(&mut self) -> bool {
        self.raft.tick()
    }

    /// Campaign causes this RawNode to transition to candidate state.
    pub fn campaign(&mut self) -> Result<()> {
        let m = Message {
            msg_type: MessageType::MsgHup,
            ..Default::default()
        };
        self.raft.step(m)
    }

    /// Propose proposes a batch of commands be appended to the raft log.
    ///
    /// Returns the index of the last entry appended on a leader, 0 if the
    /// proposal was forwarded.
    pub fn propose(&mut self, data: Vec<Bytes>) -> Result<u64> {
        let m = Message {
            msg_type: MessageType::MsgPropose,
            from: self.raft.id,
            entries: data
                .into_iter()
                .map(|data| Entry {
                    data,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        self.step_proposal(m)
    }

    /// Proposes a configuration change. See `propose` for the return value.
    ///
    /// If the node enters joint state with `auto_leave` set to true, the
    /// leader proposes the change leaving it once the joint state is applied.
    pub fn propose_conf_change(&mut self, cc: &ConfChange) -> Result<u64> {
        let m = Message {
            msg_type: MessageType::MsgPropose,
            from: self.raft.id,
            entries: vec![Entry {
                entry_type: EntryType::EntryConfChange,
                data: cc.encode_to_bytes(),
                ..Default::default()
            }],
            ..Default::default()
        };
        self.step_proposal(m)
    }

    fn step_proposal(&mut self, m: Message) -> Result<u64> {
        let was_leader = self.raft.leader_id == self.raft.id;
        self.raft.step(m)?;
        if was_leader {
            Ok(self.raft.raft_log.last_index())
        } else {
            Ok(0)
        }
    }

    /// Broadcast heartbeats to all the followers.
    ///
    /// If it's not leader, nothing will happen.
    pub fn ping(&mut self) {
        self.raft.ping()
    }

    /// Applies a config change to the local node. The app must call this when it
    /// applies a configuration change, except when it decides to reject the
    /// configuration change, in which case no call must take place.
    pub fn apply_conf_change(&mut self, cc: &ConfChange) -> Result<ConfState> {
        self.raft.apply_conf_change(cc)
    }

    /// Step advances the state machine using the given message.
    pub fn step(&mut self, m: Message) -> Result<()> {
        // ignore unexpected local messages receiving over network
        if is_local_msg(m.msg_type) {
            return Err(Error::StepLocalMsg);
        }
        if self.raft.prs().get(m.from).is_some() || !is_response_msg(m.msg_type) {
            return self.raft.step(m);
        }
        Err(Error::StepPeerNotFound)
    }

    /// Ready returns the current point-in-time state of this RawNode.
    pub fn ready(&mut self) -> Result<Ready> {
        Ready::new(
            &mut self.raft,
            &self.prev_ss,
            &self.prev_hs,
            self.max_committed_size,
        )
    }

    /// HasReady called when RawNode user need to check if any Ready pending.
    pub fn has_ready(&self) -> bool {
        let raft = &self.raft;
        if !raft.msgs.is_empty() || !raft.raft_log.unstable_entries().is_empty() {
            return true;
        }
        if !raft.read_states.is_empty() {
            return true;
        }
        if self.snap().is_some() {
            return true;
        }
        if raft.raft_log.has_next_entries() {
            return true;
        }
        if raft.soft_state() != self.prev_ss {
            return true;
        }
        let hs = raft.hard_state();
        if hs != HardState::default() && hs != self.prev_hs {
            return true;
        }
        false
    }

    /// Grabs the snapshot from the raft if available.
    #[inline]
    pub fn snap(&self) -> Option<&SnapshotMetadata> {
        self.raft.snap()
    }

    /// Writes what `rd` asks to be saved: the snapshot point first, then the
    /// entries, then the hard state.
    pub fn persist(&mut self, rd: &Ready) -> Result<()> {
        if let Some(meta) = rd.snapshot() {
            self.raft.raft_log.persist_snapshot(meta)?;
        }
        self.raft.raft_log.persist_entries(rd.entries())?;
        if let Some(hs) = rd.hs() {
            self.raft.raft_log.store.set_hard_state(hs)?;
        }
        Ok(())
    }

    /// Advance notifies the RawNode that the application has saved the last
    /// Ready and taken over its committed entries.
    pub fn advance(&mut self, rd: Ready) -> Result<()> {
        let applied = rd.applied_index();
        self.advance_append(rd);
        if let Some(applied) = applied {
            self.advance_apply(applied)?;
        }
        Ok(())
    }

    /// Records the soft and hard state of the ready without applying.
    pub fn advance_append(&mut self, rd: Ready) {
        if let Some(ss) = rd.ss {
            self.prev_ss = ss;
        }
        if let Some(hs) = rd.hs {
            if hs != HardState::default() {
                self.prev_hs = hs;
            }
        }
    }

    /// Advance apply to the passed index.
    #[inline]
    pub fn advance_apply(&mut self, applied: u64) -> Result<()> {
        if applied <= self.raft.raft_log.applied {
            return Ok(());
        }
        self.raft.commit_apply(applied)
    }

    /// Drops stable log entries below `to` that are already applied.
    pub fn compact(&mut self, to: u64) -> Result<()> {
        self.raft.raft_log.compact(to)
    }

    /// Status returns the current status of the given group.
    #[inline]
    pub fn status(&self) -> Status {
        Status::new(&self.raft)
    }

    /// ReportUnreachable reports the given node is not reachable for the last send.
    pub fn report_unreachable(&mut self, id: u64) {
        let m = Message {
            msg_type: MessageType::MsgUnreachable,
            from: id,
            ..Default::default()
        };
        // we don't care if it is ok actually
        let _ = self.raft.step(m);
    }

    /// ReportSnapshot reports the status of the sent snapshot.
    pub fn report_snapshot(&mut self, id: u64, status: SnapshotStatus) {
        let m = Message {
            msg_type: MessageType::MsgSnapStatus,
            from: id,
            reject: status == SnapshotStatus::Failure,
            ..Default::default()
        };
        // we don't care if it is ok actually
        let _ = self.raft.step(m);
    }

    /// TransferLeader tries to transfer leadership to the given transferee.
    pub fn transfer_leader(&mut self, transferee: u64) {
        let m = Message {
            msg_type: MessageType::MsgTransferLeader,
            from: transferee,
            ..Default::default()
        };
        let _ = self.raft.step(m);
    }

    /// ReadIndex requests a read state. The read state will be set in ready.
    /// Read State has a read index. Once the application advances further than the read
    /// index, any linearizable read requests issued before the read request can be
    /// processed safely. The read state will have the same rctx attached.
    pub fn read_index(&mut self, rctx: Bytes) -> Result<()> {
        let m = Message {
            msg_type: MessageType::MsgReadIndex,
            entries: vec![Entry {
                data: rctx,
                ..Default::default()
            }],
            ..Default::default()
        };
        self.raft.step(m)
    }

    /// Returns the store as an immutable reference.
    #[inline]
    pub fn store(&self) -> &T {
        self.raft.store()
    }

    /// Set whether skip broadcast empty commit messages at runtime.
    #[inline]
    pub fn skip_bcast_commit(&mut self, skip: bool) {
        self.raft.skip_bcast_commit(skip)
    }
}
