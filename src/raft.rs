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
use std::ops::{Deref, DerefMut};

use bytes::Bytes;
use rand::{self, Rng};
use slog::Logger;

use super::codec::Codec;
use super::confchange::{self, Changer};
use super::config::Config;
use super::errors::{Error, Result};
use super::message::{
    vote_resp_msg_type, ConfChange, ConfState, Entry, EntryType, HardState, Message, MessageType,
    SnapshotMetadata,
};
use super::quorum::VoteResult;
use super::raft_log::RaftLog;
use super::read_only::{ReadOnly, ReadOnlyOption, ReadState};
use super::storage::Storage;
use super::tracker::{Progress, ProgressState, ProgressTracker};
use super::{HashSet, INVALID_ID, INVALID_INDEX};

// CAMPAIGN_PRE_ELECTION represents the first phase of a normal election when
// Config.pre_vote is true.
const CAMPAIGN_PRE_ELECTION: &[u8] = b"CampaignPreElection";
// CAMPAIGN_ELECTION represents a normal (time-based) election (the second phase
// of the election when Config.pre_vote is true).
const CAMPAIGN_ELECTION: &[u8] = b"CampaignElection";
// CAMPAIGN_TRANSFER represents the type of leader transfer.
const CAMPAIGN_TRANSFER: &[u8] = b"CampaignTransfer";

/// The role of the node.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum StateRole {
    /// The node is a follower of the leader.
    #[default]
    Follower,
    /// The node could become a leader.
    Candidate,
    /// The node is a leader.
    Leader,
    /// The node could become a candidate, if `prevote` is enabled.
    PreCandidate,
}

impl fmt::Display for StateRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// SoftState provides state that is useful for logging and debugging.
/// The state is volatile and does not need to be persisted to the WAL.
#[derive(Default, PartialEq, Eq, Debug, Clone, Copy)]
pub struct SoftState {
    /// The potential leader of the cluster.
    pub leader_id: u64,
    /// The soft role this node may take.
    pub raft_state: StateRole,
}

/// The core struct of raft consensus.
///
/// It's a helper struct to get around rust borrow checks.
pub struct RaftCore<T: Storage> {
    /// The current election term.
    pub term: u64,

    /// Which peer this raft is voting for.
    pub vote: u64,

    /// The ID of this node.
    pub id: u64,

    /// The current read states.
    pub read_states: Vec<ReadState>,

    /// The persistent log.
    pub raft_log: RaftLog<T>,

    /// The maximum number of messages that can be inflight.
    pub max_inflight: usize,

    /// The maximum length (in bytes) of all the entries.
    pub max_msg_size: u64,

    /// The current role of this node.
    pub state: StateRole,

    /// Indicates whether state machine can be promoted to leader,
    /// which is true when it's a voter and its own id is in progress list.
    promotable: bool,

    /// The leader id
    pub leader_id: u64,

    /// ID of the leader transfer target when its value is not None.
    ///
    /// If this is Some(id), we follow the procedure defined in raft thesis 3.10.
    pub lead_transferee: Option<u64>,

    /// Only one conf change may be pending (in the log, but not yet
    /// applied) at a time. This is enforced via `pending_conf_index`, which
    /// is set to a value >= the log index of the latest pending
    /// configuration change (if any). Config changes are only allowed to
    /// be proposed if the leader's applied index is greater than this
    /// value.
    pub pending_conf_index: u64,

    /// The queue of read-only requests.
    pub read_only: ReadOnly,

    // Read index requests received before the leader committed an entry of
    // its own term. They are answered once it has.
    pending_read_index_messages: Vec<Message>,

    /// Ticks since it reached last electionTimeout when it is leader or candidate.
    /// Number of ticks since it reached last electionTimeout or received a
    /// valid message from current leader when it is a follower.
    pub election_elapsed: usize,

    /// Number of ticks since it reached last heartbeatTimeout.
    /// only leader keeps heartbeatElapsed.
    heartbeat_elapsed: usize,

    /// Whether to check the quorum
    pub check_quorum: bool,

    /// Enable the prevote algorithm.
    ///
    /// This enables a pre-election vote round on Candidates prior to disrupting the cluster.
    ///
    /// Enable this if greater cluster stability is preferred over faster elections.
    pub pre_vote: bool,

    skip_bcast_commit: bool,
    coalesced_heartbeat: bool,

    heartbeat_timeout: usize,
    election_timeout: usize,

    // randomized_election_timeout is a random number between
    // [min_election_timeout, max_election_timeout - 1]. It gets reset
    // when raft changes its state to follower or candidate.
    randomized_election_timeout: usize,
    min_election_timeout: usize,
    max_election_timeout: usize,

    /// The logger for the raft structure.
    pub(crate) logger: Logger,

    /// The election priority of this node.
    pub priority: u64,
}

/// A struct that represents the raft consensus itself. Stores details concerning the current
/// and possible state the system can take.
pub struct Raft<T: Storage> {
    prs: ProgressTracker,

    /// The list of messages.
    pub msgs: Vec<Message>,
    /// Internal raftCore.
    pub r: RaftCore<T>,
}

impl<T: Storage> Deref for Raft<T> {
    type Target = RaftCore<T>;

    #[inline]
    fn deref(&self) -> &RaftCore<T> {
        &self.r
    }
}

impl<T: Storage> DerefMut for Raft<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.r
    }
}

trait AssertSend: Send {}

impl<T: Storage + Send> AssertSend for Raft<T> {}

fn new_message(to: u64, field_type: MessageType, from: Option<u64>) -> Message {
    let mut m = Message {
        to,
        msg_type: field_type,
        ..Default::default()
    };
    if let Some(id) = from {
        m.from = id;
    }
    m
}

impl<T: Storage> Raft<T> {
    /// Creates a new raft for use on the node.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(c: &Config, store: T, logger: &Logger) -> Result<Self> {
        c.validate()?;
        let logger = logger.new(o!("raft_id" => c.id));
        let raft_state = store.initial_state()?;
        let conf_state = &raft_state.conf_state;
        let raft_log = RaftLog::new(store, logger.clone())?;

        let mut prs = ProgressTracker::with_capacity(
            conf_state.voters.len(),
            conf_state.learners.len(),
            c.max_inflight_msgs,
        );
        confchange::restore(&mut prs, raft_log.last_index() + 1, conf_state)?;

        let mut r = Raft {
            prs,
            msgs: Default::default(),
            r: RaftCore {
                id: c.id,
                read_states: Default::default(),
                raft_log,
                max_inflight: c.max_inflight_msgs,
                max_msg_size: c.max_size_per_msg,
                state: StateRole::Follower,
                promotable: false,
                check_quorum: c.check_quorum,
                pre_vote: c.pre_vote,
                read_only: ReadOnly::new(c.read_only_option),
                pending_read_index_messages: Vec::new(),
                heartbeat_timeout: c.heartbeat_tick,
                election_timeout: c.election_tick,
                leader_id: Default::default(),
                lead_transferee: None,
                term: Default::default(),
                election_elapsed: Default::default(),
                pending_conf_index: Default::default(),
                vote: Default::default(),
                heartbeat_elapsed: Default::default(),
                randomized_election_timeout: 0,
                min_election_timeout: c.min_election_tick(),
                max_election_timeout: c.max_election_tick(),
                skip_bcast_commit: c.skip_bcast_commit,
                coalesced_heartbeat: c.coalesced_heartbeat,
                logger,
                priority: c.priority,
            },
        };
        r.promotable = r.prs.conf().voters().contains(r.id);

        if raft_state.hard_state != HardState::default() {
            r.load_state(&raft_state.hard_state)?;
        }
        if c.applied > 0 {
            let applied = cmp::min(c.applied, r.raft_log.committed);
            if applied > r.raft_log.applied {
                r.raft_log.applied_to(applied)?;
            }
        }
        let term = r.term;
        r.become_follower(term, INVALID_ID);

        info!(
            r.logger,
            "newRaft";
            "term" => r.term,
            "commit" => r.raft_log.committed,
            "applied" => r.raft_log.applied,
            "last index" => r.raft_log.last_index(),
            "last term" => r.raft_log.last_term(),
            "peers" => %r.prs.conf(),
        );
        Ok(r)
    }

    /// Creates a new raft for use on the node with the default logger.
    #[allow(clippy::new_ret_no_self)]
    #[cfg(feature = "default-logger")]
    pub fn with_default_logger(c: &Config, store: T) -> Result<Self> {
        Self::new(c, store, &crate::default_logger())
    }

    /// Sets priority of node.
    pub fn set_priority(&mut self, priority: u64) {
        self.priority = priority;
    }

    /// Grabs an immutable reference to the store.
    #[inline]
    pub fn store(&self) -> &T {
        &self.raft_log.store
    }

    /// Grabs a reference to the snapshot point received and not yet persisted.
    #[inline]
    pub fn snap(&self) -> Option<&SnapshotMetadata> {
        self.raft_log.pending_snapshot()
    }

    /// Returns the number of pending read-only messages.
    #[inline]
    pub fn pending_read_count(&self) -> usize {
        self.read_only.pending_read_count()
    }

    /// Returns how many read states exist.
    #[inline]
    pub fn ready_read_count(&self) -> usize {
        self.read_states.len()
    }

    /// Returns a value representing the softstate at the time of calling.
    pub fn soft_state(&self) -> SoftState {
        SoftState {
            leader_id: self.leader_id,
            raft_state: self.state,
        }
    }

    /// Returns a value representing the hardstate at the time of calling.
    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            vote: self.vote,
            commit: self.raft_log.committed,
        }
    }

    /// Returns whether the current raft is in lease.
    pub fn in_lease(&self) -> bool {
        self.state == StateRole::Leader && self.check_quorum
    }

    /// For testing leader lease
    #[doc(hidden)]
    pub fn set_randomized_election_timeout(&mut self, t: usize) {
        assert!(self.min_election_timeout <= t && t < self.max_election_timeout);
        self.randomized_election_timeout = t;
    }

    /// Fetch the length of the election timeout.
    pub fn election_timeout(&self) -> usize {
        self.election_timeout
    }

    /// Fetch the length of the heartbeat timeout
    pub fn heartbeat_timeout(&self) -> usize {
        self.heartbeat_timeout
    }

    /// Fetch the number of ticks elapsed since last heartbeat.
    pub fn heartbeat_elapsed(&self) -> usize {
        self.heartbeat_elapsed
    }

    /// Return the length of the current randomized election timeout.
    pub fn randomized_election_timeout(&self) -> usize {
        self.randomized_election_timeout
    }

    /// Set whether skip broadcast empty commit messages at runtime.
    #[inline]
    pub fn skip_bcast_commit(&mut self, skip: bool) {
        self.skip_bcast_commit = skip;
    }

    /// Checks if logs are committed to its term.
    ///
    /// The check is useful usually when raft is leader.
    pub fn commit_to_current_term(&self) -> bool {
        self.raft_log
            .term(self.raft_log.committed)
            .map_or(false, |t| t == self.term)
    }

    /// Checks if logs are applied to current term.
    pub fn apply_to_current_term(&self) -> bool {
        self.raft_log
            .term(self.raft_log.applied)
            .map_or(false, |t| t == self.term)
    }
}

impl<T: Storage> RaftCore<T> {
    // send stamps the message with this peer's id and term and queues it.
    fn send(&mut self, mut m: Message, msgs: &mut Vec<Message>) {
        debug!(
            self.logger,
            "Sending from {from} to {to}",
            from = self.id,
            to = m.to;
            "msg" => %m,
        );
        m.from = self.id;
        if matches!(
            m.msg_type,
            MessageType::MsgRequestVote
                | MessageType::MsgRequestPreVote
                | MessageType::MsgRequestVoteResponse
                | MessageType::MsgRequestPreVoteResponse
        ) {
            // All {pre-,}campaign messages carry the term they are about.
            debug_assert_ne!(m.term, 0, "term should be set when sending {:?}", m.msg_type);
        } else {
            debug_assert_eq!(
                m.term, 0,
                "term should not be set when sending {:?}",
                m.msg_type
            );
            // Proposals and read index requests are forwarded to the leader
            // and treated as local messages there.
            if m.msg_type != MessageType::MsgPropose && m.msg_type != MessageType::MsgReadIndex {
                m.term = self.term;
            }
        }
        if m.msg_type == MessageType::MsgRequestVote
            || m.msg_type == MessageType::MsgRequestPreVote
        {
            m.priority = self.priority;
        }
        msgs.push(m);
    }

    // Points the peer at the applied state. The driver replaces the metadata
    // with the one of the snapshot the state machine actually produces.
    fn prepare_send_snapshot(
        &mut self,
        m: &mut Message,
        pr: &mut Progress,
        to: u64,
        conf_state: ConfState,
    ) -> bool {
        if !pr.recent_active {
            debug!(
                self.logger,
                "ignore sending snapshot to {} since it is not recently active",
                to;
            );
            return false;
        }
        let index = self.raft_log.applied;
        let term = match self.raft_log.term(index) {
            Ok(t) if index != INVALID_INDEX => t,
            _ => {
                debug!(
                    self.logger,
                    "failed to send snapshot to {} because snapshot is temporarily unavailable",
                    to;
                    "applied" => index,
                );
                return false;
            }
        };

        m.msg_type = MessageType::MsgSnapshot;
        m.snapshot = Some(SnapshotMetadata {
            index,
            term,
            conf_state,
            peers: vec![],
        });
        debug!(
            self.logger,
            "[firstindex: {first_index}, commit: {committed}] sent snapshot[index: {snapshot_index}, term: {snapshot_term}] to {to}",
            first_index = self.raft_log.first_index(),
            committed = self.raft_log.committed,
            snapshot_index = index,
            snapshot_term = term,
            to = to;
            "progress" => ?pr,
        );
        pr.become_snapshot(index);
        debug!(
            self.logger,
            "paused sending replication messages to {}",
            to;
            "progress" => ?pr,
        );
        true
    }

    fn prepare_send_entries(
        &mut self,
        m: &mut Message,
        pr: &mut Progress,
        term: u64,
        ents: Vec<Entry>,
    ) {
        m.msg_type = MessageType::MsgAppend;
        m.index = pr.next_idx - 1;
        m.log_term = term;
        m.entries = ents;
        m.commit = self.raft_log.committed;
        if let Some(last) = m.entries.last().map(|e| e.index) {
            pr.update_state(last);
        }
    }

    /// Sends an append RPC with new entries (if any) and the current commit index to the given
    /// peer.
    fn send_append(
        &mut self,
        to: u64,
        pr: &mut Progress,
        conf_state: &ConfState,
        msgs: &mut Vec<Message>,
    ) {
        self.maybe_send_append(to, pr, conf_state, true, msgs);
    }

    /// Sends an append RPC with new entries to the given peer,
    /// if necessary. Returns true if a message was sent. The allow_empty
    /// argument controls whether messages with no entries will be sent
    /// ("empty" messages are useful to convey updated Commit indexes, but
    /// are undesirable when we're sending multiple messages in a batch).
    fn maybe_send_append(
        &mut self,
        to: u64,
        pr: &mut Progress,
        conf_state: &ConfState,
        allow_empty: bool,
        msgs: &mut Vec<Message>,
    ) -> bool {
        if pr.is_paused() {
            trace!(
                self.logger,
                "Skipping sending to {to}, it's paused",
                to = to;
                "progress" => ?pr,
            );
            return false;
        }
        let mut m = Message {
            to,
            ..Default::default()
        };
        let ents = self.raft_log.entries(pr.next_idx, self.max_msg_size);
        if !allow_empty && ents.as_ref().ok().map_or(true, |e| e.is_empty()) {
            return false;
        }
        let term = self.raft_log.term(pr.next_idx - 1);
        match (term, ents) {
            (Ok(term), Ok(ents)) => self.prepare_send_entries(&mut m, pr, term, ents),
            _ => {
                // send snapshot if we failed to get term or entries.
                if !self.prepare_send_snapshot(&mut m, pr, to, conf_state.clone()) {
                    return false;
                }
            }
        }
        self.send(m, msgs);
        true
    }

    // send_heartbeat sends an empty MsgAppend
    fn send_heartbeat(&mut self, to: u64, pr: &Progress, ctx: Option<Bytes>, msgs: &mut Vec<Message>) {
        // Attach the commit as min(to.matched, self.raft_log.committed).
        // When the leader sends out heartbeat message,
        // the receiver(follower) might not be matched with the leader
        // or it might not have all the committed entries.
        // The leader MUST NOT forward the follower's commit to
        // an unmatched index.
        let mut m = new_message(to, MessageType::MsgHeartbeat, None);
        m.commit = cmp::min(pr.matched, self.raft_log.committed);
        if let Some(context) = ctx {
            m.context = context;
        }
        self.send(m, msgs);
    }
}

impl<T: Storage> Raft<T> {
    /// Sends an append RPC with new entries (if any) and the current commit index to the given
    /// peer.
    pub fn send_append(&mut self, to: u64) {
        let cs = self.prs.conf().to_conf_state();
        if let Some(pr) = self.prs.get_mut(to) {
            self.r.send_append(to, pr, &cs, &mut self.msgs)
        }
    }

    /// Sends RPC, with entries to all peers that are not up-to-date
    /// according to the progress recorded in r.prs().
    pub fn bcast_append(&mut self) {
        let self_id = self.id;
        let cs = self.prs.conf().to_conf_state();
        let core = &mut self.r;
        let msgs = &mut self.msgs;
        self.prs
            .iter_mut()
            .filter(|&(id, _)| *id != self_id)
            .for_each(|(id, pr)| core.send_append(*id, pr, &cs, msgs));
    }

    /// Broadcasts heartbeats to all the followers if it's leader.
    pub fn ping(&mut self) {
        if self.state == StateRole::Leader {
            self.bcast_heartbeat();
        }
    }

    /// Sends RPC, without entries to all the peers.
    pub fn bcast_heartbeat(&mut self) {
        let ctx = self.read_only.last_pending_request_ctx();
        self.bcast_heartbeat_with_ctx(ctx)
    }

    #[allow(clippy::needless_pass_by_value)]
    fn bcast_heartbeat_with_ctx(&mut self, ctx: Option<Bytes>) {
        let self_id = self.id;
        let core = &mut self.r;
        let msgs = &mut self.msgs;
        self.prs
            .iter_mut()
            .filter(|&(id, _)| *id != self_id)
            .for_each(|(id, pr)| core.send_heartbeat(*id, pr, ctx.clone(), msgs));
    }

    /// Attempts to advance the commit index. Returns true if the commit index
    /// changed (in which case the caller should call `r.bcast_append`).
    pub fn maybe_commit(&mut self) -> bool {
        let mci = self.prs.maximal_committed_index();
        self.r.raft_log.maybe_commit(mci, self.r.term)
    }

    /// Commit that the Raft peer has applied up to the given index.
    ///
    /// Registers the new applied index to the Raft log.
    ///
    /// # Hooks
    ///
    /// * Post: Checks to see if it's time to finalize a Joint Consensus state.
    pub fn commit_apply(&mut self, applied: u64) -> Result<()> {
        let old_applied = self.raft_log.applied;
        self.raft_log.applied_to(applied)?;

        // If the current (and most recent, at least for this leader's term)
        // configuration should be auto-left, initiate that now.
        if self.prs.conf().auto_leave
            && old_applied <= self.pending_conf_index
            && applied >= self.pending_conf_index
            && self.state == StateRole::Leader
        {
            let mut entry = Entry {
                entry_type: EntryType::EntryConfChange,
                data: ConfChange::leave().encode_to_bytes(),
                ..Default::default()
            };
            self.append_entry(std::slice::from_mut(&mut entry))?;
            self.pending_conf_index = self.raft_log.last_index();
            self.bcast_append();
            info!(
                self.logger,
                "initiating automatic transition out of joint configuration";
                "config" => %self.prs.conf(),
            );
        }
        Ok(())
    }

    /// Resets the current node to a given term.
    pub fn reset(&mut self, term: u64) {
        if self.term != term {
            self.term = term;
            self.vote = INVALID_ID;
        }
        self.leader_id = INVALID_ID;
        self.reset_randomized_election_timeout();
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;

        self.abort_leader_transfer();

        self.prs.reset_votes();

        self.pending_conf_index = 0;
        self.read_only = ReadOnly::new(self.read_only.option);
        self.pending_read_index_messages.clear();

        let last_index = self.raft_log.last_index();
        let self_id = self.id;
        for (&id, pr) in self.prs.iter_mut() {
            pr.reset(last_index + 1);
            if id == self_id {
                pr.matched = last_index;
            }
        }
    }

    /// Appends a slice of entries to the log. The entries are updated to match
    /// the current index and term.
    pub fn append_entry(&mut self, es: &mut [Entry]) -> Result<()> {
        let li = self.raft_log.last_index();
        for (i, e) in es.iter_mut().enumerate() {
            e.term = self.term;
            e.index = li + 1 + i as u64;
        }
        // use latest "last" index after truncate/append
        let li = self.raft_log.append(es)?;

        let self_id = self.id;
        if let Some(pr) = self.prs.get_mut(self_id) {
            pr.maybe_update(li);
        }

        // Regardless of maybe_commit's return, our caller will call bcastAppend.
        self.maybe_commit();
        Ok(())
    }

    /// Returns true to indicate that there will probably be some readiness need to be handled.
    pub fn tick(&mut self) -> bool {
        match self.state {
            StateRole::Follower | StateRole::PreCandidate | StateRole::Candidate => {
                self.tick_election()
            }
            StateRole::Leader => self.tick_heartbeat(),
        }
    }

    /// Run by followers and candidates after self.election_timeout.
    ///
    /// Returns true to indicate that there will probably be some readiness need to be handled.
    pub fn tick_election(&mut self) -> bool {
        self.election_elapsed += 1;
        if !self.pass_election_timeout() || !self.promotable {
            return false;
        }

        self.election_elapsed = 0;
        let m = new_message(INVALID_ID, MessageType::MsgHup, Some(self.id));
        if let Err(e) = self.step(m) {
            error!(self.logger, "failed to campaign"; "error" => %e);
        }
        true
    }

    // tick_heartbeat is run by leaders to send a MsgBeat after self.heartbeat_timeout.
    // Returns true to indicate that there will probably be some readiness need to be handled.
    fn tick_heartbeat(&mut self) -> bool {
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;

        let mut has_ready = false;
        if self.election_elapsed >= self.election_timeout {
            self.election_elapsed = 0;
            if self.check_quorum {
                let m = new_message(INVALID_ID, MessageType::MsgCheckQuorum, Some(self.id));
                has_ready = true;
                let _ = self.step(m);
            }
            if self.state == StateRole::Leader && self.lead_transferee.is_some() {
                self.abort_leader_transfer()
            }
        }

        if self.state != StateRole::Leader {
            return has_ready;
        }

        if self.heartbeat_elapsed >= self.heartbeat_timeout {
            self.heartbeat_elapsed = 0;
            // Node heartbeats carry liveness, only unconfirmed reads are
            // retried here.
            if self.coalesced_heartbeat && self.read_only.last_pending_request_ctx().is_none() {
                return has_ready;
            }
            has_ready = true;
            let m = new_message(INVALID_ID, MessageType::MsgBeat, Some(self.id));
            let _ = self.step(m);
        }
        has_ready
    }

    /// Converts this node to a follower.
    pub fn become_follower(&mut self, term: u64, leader_id: u64) {
        self.reset(term);
        self.leader_id = leader_id;
        self.state = StateRole::Follower;
        info!(
            self.logger,
            "became follower at term {term}",
            term = self.term;
        );
    }

    /// Converts this node to a candidate
    pub fn become_candidate(&mut self) {
        debug_assert_ne!(
            self.state,
            StateRole::Leader,
            "invalid transition [leader -> candidate]"
        );
        let term = self.term + 1;
        self.reset(term);
        let id = self.id;
        self.vote = id;
        self.state = StateRole::Candidate;
        info!(
            self.logger,
            "became candidate at term {term}",
            term = self.term;
        );
    }

    /// Converts this node to a pre-candidate
    pub fn become_pre_candidate(&mut self) {
        debug_assert_ne!(
            self.state,
            StateRole::Leader,
            "invalid transition [leader -> pre-candidate]"
        );
        // Becoming a pre-candidate changes our state.
        // but doesn't change anything else. In particular it does not increase
        // self.term or change self.vote.
        self.state = StateRole::PreCandidate;
        self.prs.reset_votes();
        // If a network partition happens, and leader is in minority partition,
        // it will step down, and become follower without notifying others.
        self.leader_id = INVALID_ID;
        info!(
            self.logger,
            "became pre-candidate at term {term}",
            term = self.term;
        );
    }

    /// Makes this raft the leader.
    pub fn become_leader(&mut self) -> Result<()> {
        trace!(self.logger, "ENTER become_leader");
        if self.state == StateRole::Follower {
            return Err(Error::InvariantViolated(
                "invalid transition [follower -> leader]".to_owned(),
            ));
        }
        let term = self.term;
        self.reset(term);
        self.leader_id = self.id;
        self.state = StateRole::Leader;

        // Followers enter replicate mode once an append to them has been accepted
        // (perhaps after having received a snapshot as a result). The leader is
        // trivially in this state. Note that r.reset() has initialized this
        // progress with the last index already.
        let id = self.id;
        if let Some(pr) = self.prs.get_mut(id) {
            pr.become_replicate();
        }

        // Conservatively set the pending_conf_index to the last index in the
        // log. There may or may not be a pending config change, but it's
        // safe to delay any future proposals until we commit all our
        // pending log entries, and scanning the entire tail of the log
        // could be expensive.
        self.pending_conf_index = self.raft_log.last_index();

        self.append_entry(&mut [Entry::default()])?;

        info!(
            self.logger,
            "became leader at term {term}",
            term = self.term;
        );
        trace!(self.logger, "EXIT become_leader");
        Ok(())
    }

    fn num_pending_conf(&self, ents: &[Entry]) -> usize {
        ents.iter()
            .filter(|e| e.entry_type == EntryType::EntryConfChange)
            .count()
    }

    /// Campaign to attempt to become a leader.
    ///
    /// If prevote is enabled, this is handled as well.
    pub fn campaign(&mut self, campaign_type: &'static [u8]) -> Result<()> {
        let (vote_msg, term) = if campaign_type == CAMPAIGN_PRE_ELECTION {
            self.become_pre_candidate();
            // Pre-vote RPCs are sent for next term before we've incremented self.term.
            (MessageType::MsgRequestPreVote, self.term + 1)
        } else {
            self.become_candidate();
            (MessageType::MsgRequestVote, self.term)
        };
        let self_id = self.id;
        if VoteResult::Won == self.poll(self_id, vote_msg, true) {
            // We won the election after voting for ourselves (which must mean that
            // this is a single-node cluster).
            return if campaign_type == CAMPAIGN_PRE_ELECTION {
                self.campaign(CAMPAIGN_ELECTION)
            } else {
                self.become_leader()
            };
        }

        // Only send vote request to voters.
        let mut voters: Vec<u64> = self.prs.conf().voters().ids().collect();
        voters.sort_unstable();
        for id in voters.into_iter().filter(|id| *id != self_id) {
            info!(
                self.logger,
                "[logterm: {log_term}, index: {log_index}] sent request to {id}",
                log_term = self.raft_log.last_term(),
                log_index = self.raft_log.last_index(),
                id = id;
                "term" => self.term,
                "msg" => ?vote_msg,
            );
            let mut m = new_message(id, vote_msg, None);
            m.term = term;
            m.index = self.raft_log.last_index();
            m.log_term = self.raft_log.last_term();
            if campaign_type == CAMPAIGN_TRANSFER {
                m.context = Bytes::from_static(campaign_type);
            }
            self.r.send(m, &mut self.msgs);
        }
        Ok(())
    }

    // Records a vote and returns the outcome of the election so far.
    fn poll(&mut self, from: u64, t: MessageType, vote: bool) -> VoteResult {
        self.prs.record_vote(from, vote);
        let (granted, rejected, res) = self.prs.tally_votes();
        if from != self.id {
            info!(
                self.logger,
                "received votes response";
                "vote" => vote,
                "from" => from,
                "rejections" => rejected,
                "approvals" => granted,
                "type" => ?t,
                "term" => self.term,
            );
        }
        res
    }

    /// Steps the raft along via a message. This should be called everytime your raft receives a
    /// message from a peer.
    pub fn step(&mut self, m: Message) -> Result<()> {
        // Handle the message term, which may result in our stepping down to a follower.
        if m.term == 0 {
            // local message
        } else if m.term > self.term {
            if m.msg_type == MessageType::MsgRequestVote
                || m.msg_type == MessageType::MsgRequestPreVote
            {
                let force = m.context.as_ref() == CAMPAIGN_TRANSFER;
                // A campaign of the leader itself does not break its lease.
                let in_lease = self.check_quorum
                    && self.leader_id != INVALID_ID
                    && self.leader_id != m.from
                    && self.election_elapsed < self.election_timeout;
                if !force && in_lease {
                    // if a server receives RequestVote request within the minimum election
                    // timeout of hearing from a current leader, it does not update its term
                    // or grant its vote
                    info!(
                        self.logger,
                        "[logterm: {log_term}, index: {log_index}, vote: {vote}] ignored vote from \
                         {from} [logterm: {msg_term}, index: {msg_index}]: lease is not expired",
                        log_term = self.raft_log.last_term(),
                        log_index = self.raft_log.last_index(),
                        vote = self.vote,
                        from = m.from,
                        msg_term = m.log_term,
                        msg_index = m.index;
                        "term" => self.term,
                        "remaining ticks" => self.election_timeout - self.election_elapsed,
                        "msg type" => ?m.msg_type,
                    );
                    // A peer that lost track of the leader hears of it again
                    // through an append when no raft heartbeats are sent.
                    if self.coalesced_heartbeat
                        && self.state == StateRole::Leader
                        && m.msg_type == MessageType::MsgRequestPreVote
                    {
                        self.send_append(m.from);
                    }
                    return Ok(());
                }
            }

            if m.msg_type == MessageType::MsgRequestPreVote
                || (m.msg_type == MessageType::MsgRequestPreVoteResponse && !m.reject)
            {
                // For a pre-vote request:
                // Never change our term in response to a pre-vote request.
                //
                // For a pre-vote response with pre-vote granted:
                // We send pre-vote requests with a term in our future. If the
                // pre-vote is granted, we will increment our term when we get a
                // quorum. If it is not, the term comes from the node that
                // rejected our vote so we should become a follower at the new
                // term.
            } else {
                info!(
                    self.logger,
                    "received a message with higher term from {from}",
                    from = m.from;
                    "term" => self.term,
                    "message_term" => m.term,
                    "msg type" => ?m.msg_type,
                );
                if m.msg_type == MessageType::MsgAppend
                    || m.msg_type == MessageType::MsgHeartbeat
                    || m.msg_type == MessageType::MsgSnapshot
                {
                    self.become_follower(m.term, m.from);
                } else {
                    self.become_follower(m.term, INVALID_ID);
                }
            }
        } else if m.term < self.term {
            if (self.check_quorum || self.pre_vote)
                && (m.msg_type == MessageType::MsgHeartbeat || m.msg_type == MessageType::MsgAppend)
            {
                // We have received messages from a leader at a lower term. It is possible
                // that these messages were simply delayed in the network, but this could
                // also mean that this node has advanced its term number during a network
                // partition, and it is now unable to either win an election or to rejoin
                // the majority on the old term. Answering lets the stale leader learn
                // the new term and step down.
                let to_send = new_message(m.from, MessageType::MsgAppendResponse, None);
                self.r.send(to_send, &mut self.msgs);
            } else if m.msg_type == MessageType::MsgRequestPreVote {
                // Before pre_vote enable, there may be a recieving candidate with higher term,
                // but less log. After update to pre_vote, the cluster may deadlock if
                // we drop messages with a lower term.
                info!(
                    self.logger,
                    "{} [log_term: {}, index: {}, vote: {}] rejected {:?} from {} [log_term: {}, index: {}] at term {}",
                    self.id,
                    self.raft_log.last_term(),
                    self.raft_log.last_index(),
                    self.vote,
                    m.msg_type,
                    m.from,
                    m.log_term,
                    m.index,
                    self.term,
                );

                let mut to_send = new_message(m.from, MessageType::MsgRequestPreVoteResponse, None);
                to_send.term = self.term;
                to_send.reject = true;
                self.r.send(to_send, &mut self.msgs);
            } else {
                // ignore other cases
                info!(
                    self.logger,
                    "ignored a message with lower term from {from}",
                    from = m.from;
                    "term" => self.term,
                    "msg type" => ?m.msg_type,
                    "msg term" => m.term
                );
            }
            return Ok(());
        }

        #[cfg(feature = "failpoints")]
        fail::fail_point!("before_step");

        match m.msg_type {
            MessageType::MsgHup => self.hup(false)?,
            MessageType::MsgRequestVote | MessageType::MsgRequestPreVote => {
                // We can vote if this is a repeat of a vote we've already cast...
                let can_vote = (self.vote == m.from) ||
                    // ...we haven't voted and we don't think there's a leader yet in this term...
                    (self.vote == INVALID_ID && self.leader_id == INVALID_ID) ||
                    // ...or this is a PreVote for a future term...
                    (m.msg_type == MessageType::MsgRequestPreVote && m.term > self.term);
                // ...and we believe the candidate is up to date.
                if can_vote
                    && self.raft_log.is_up_to_date(m.index, m.log_term)
                    && (m.index > self.raft_log.last_index() || self.priority <= m.priority)
                {
                    // When responding to Msg{Pre,}Vote messages we include the term
                    // from the message, not the local term. To see why consider the
                    // case where a single node was previously partitioned away and
                    // it's local term is now of date. If we include the local term
                    // (recall that for pre-votes we don't update the local term), the
                    // (pre-)campaigning node on the other end will proceed to ignore
                    // the message (it ignores all out of date messages).
                    self.log_vote_approve(&m);
                    let mut to_send = new_message(m.from, vote_resp_msg_type(m.msg_type), None);
                    to_send.reject = false;
                    to_send.term = m.term;
                    self.r.send(to_send, &mut self.msgs);
                    if m.msg_type == MessageType::MsgRequestVote {
                        // Only record real votes.
                        self.election_elapsed = 0;
                        self.vote = m.from;
                    }
                } else {
                    self.log_vote_reject(&m);
                    let mut to_send = new_message(m.from, vote_resp_msg_type(m.msg_type), None);
                    to_send.reject = true;
                    to_send.term = self.term;
                    self.r.send(to_send, &mut self.msgs);
                }
            }
            _ => match self.state {
                StateRole::PreCandidate | StateRole::Candidate => self.step_candidate(m)?,
                StateRole::Follower => self.step_follower(m)?,
                StateRole::Leader => self.step_leader(m)?,
            },
        }
        Ok(())
    }

    fn hup(&mut self, transfer_leader: bool) -> Result<()> {
        if self.state == StateRole::Leader {
            debug!(
                self.logger,
                "ignoring MsgHup because already leader";
            );
            return Ok(());
        }
        if !self.promotable {
            warn!(self.logger, "is unpromotable and can not campaign");
            return Ok(());
        }

        // If there is a pending snapshot, its index will be returned by
        // `maybe_first_index`. Note that snapshot updates configuration
        // already, so as long as pending entries don't contain conf change
        // it's safe to start campaign.
        let first_index = match self.raft_log.unstable.maybe_first_index() {
            Some(idx) => idx,
            None => self.raft_log.applied + 1,
        };

        let ents = self
            .raft_log
            .slice(first_index, self.raft_log.committed + 1, None)?;
        let n = self.num_pending_conf(&ents);
        if n != 0 {
            warn!(
                self.logger,
                "cannot campaign at term {term} since there are still {pending_changes} pending \
                 configuration changes to apply",
                term = self.term,
                pending_changes = n;
            );
            return Ok(());
        }
        info!(
            self.logger,
            "starting a new election";
            "term" => self.term,
        );
        if transfer_leader {
            self.campaign(CAMPAIGN_TRANSFER)
        } else if self.pre_vote {
            self.campaign(CAMPAIGN_PRE_ELECTION)
        } else {
            self.campaign(CAMPAIGN_ELECTION)
        }
    }

    fn log_vote_approve(&self, m: &Message) {
        info!(
            self.logger,
            "[logterm: {log_term}, index: {log_index}, vote: {vote}] cast vote for {from} [logterm: {msg_term}, index: {msg_index}] \
             at term {term}",
            log_term = self.raft_log.last_term(),
            log_index = self.raft_log.last_index(),
            vote = self.vote,
            from = m.from,
            msg_term = m.log_term,
            msg_index = m.index,
            term = self.term;
            "msg type" => ?m.msg_type,
        );
    }

    fn log_vote_reject(&self, m: &Message) {
        info!(
            self.logger,
            "[logterm: {log_term}, index: {log_index}, vote: {vote}] rejected vote from {from} [logterm: {msg_term}, index: \
             {msg_index}] at term {term}",
            log_term = self.raft_log.last_term(),
            log_index = self.raft_log.last_index(),
            vote = self.vote,
            from = m.from,
            msg_term = m.log_term,
            msg_index = m.index,
            term = self.term;
            "msg type" => ?m.msg_type,
        );
    }

    fn handle_append_response(&mut self, m: &Message) {
        let cs = self.prs.conf().to_conf_state();
        let pr = match self.prs.get_mut(m.from) {
            Some(pr) => pr,
            None => {
                debug!(
                    self.logger,
                    "no progress available for {}",
                    m.from;
                );
                return;
            }
        };
        pr.recent_active = true;
        pr.update_committed(m.commit);

        if m.reject {
            debug!(
                self.r.logger,
                "received msgAppend rejection";
                "last index" => m.reject_hint,
                "from" => m.from,
                "index" => m.index,
            );

            if pr.maybe_decr_to(m.index, m.reject_hint) {
                debug!(
                    self.r.logger,
                    "decreased progress of {}",
                    m.from;
                    "progress" => ?pr,
                );
                if pr.state == ProgressState::Replicate {
                    pr.become_probe();
                }
                self.r.send_append(m.from, pr, &cs, &mut self.msgs);
            }
            return;
        }

        let old_paused = pr.is_paused();
        if !pr.maybe_update(m.index) {
            return;
        }

        match pr.state {
            ProgressState::Probe => pr.become_replicate(),
            ProgressState::Snapshot => {
                if pr.maybe_snapshot_abort() {
                    debug!(
                        self.r.logger,
                        "snapshot aborted, resumed sending replication messages to {from}",
                        from = m.from;
                        "progress" => ?pr,
                    );
                    pr.become_probe();
                }
            }
            ProgressState::Replicate => pr.ins.free_to(m.index),
        }

        if self.maybe_commit() {
            self.release_pending_read_index_messages();
            if self.should_bcast_commit() {
                self.bcast_append()
            }
        } else if old_paused {
            self.send_append(m.from)
        }

        let pr = match self.prs.get_mut(m.from) {
            Some(pr) => pr,
            None => return,
        };
        // We've updated flow control information above, which may
        // allow us to send multiple (size-limited) in-flight messages
        // at once (such as when transitioning from Probe to
        // replicate, or when freeTo() covers multiple messages). If
        // we have more entries to send, send as many messages as we
        // can (without sending empty messages for the commit index)
        while self
            .r
            .maybe_send_append(m.from, pr, &cs, false, &mut self.msgs)
        {}

        // Transfer leadership is in progress.
        if Some(m.from) == self.r.lead_transferee {
            let last_index = self.r.raft_log.last_index();
            if pr.matched == last_index {
                info!(
                    self.logger,
                    "sent MsgTimeoutNow to {from} after received MsgAppResp",
                    from = m.from;
                );
                self.send_timeout_now(m.from);
            }
        }
    }

    fn handle_heartbeat_response(&mut self, m: &Message) {
        let cs = self.prs.conf().to_conf_state();
        let pr = match self.prs.get_mut(m.from) {
            Some(pr) => pr,
            None => {
                debug!(
                    self.logger,
                    "no progress available for {}",
                    m.from;
                );
                return;
            }
        };
        pr.recent_active = true;
        pr.update_committed(m.commit);
        pr.resume();

        // free one slot for the full inflights window to allow progress.
        if pr.state == ProgressState::Replicate && pr.ins.full() {
            pr.ins.free_first_one();
        }
        if pr.matched < self.r.raft_log.last_index() {
            self.r.send_append(m.from, pr, &cs, &mut self.msgs);
        }

        if self.read_only.option != ReadOnlyOption::Safe || m.context.is_empty() {
            return;
        }

        match self.r.read_only.recv_ack(m.from, &m.context) {
            Some(acks) if self.prs.has_quorum(acks) => {}
            _ => return,
        }

        for rs in self.r.read_only.advance(&m.context) {
            if let Some(m) = self.handle_ready_read_index(rs.req, rs.index) {
                self.r.send(m, &mut self.msgs);
            }
        }
    }

    fn handle_transfer_leader(&mut self, m: &Message) {
        let from = m.from;
        let is_learner = match self.prs.get(from) {
            Some(pr) => pr.is_learner,
            None => {
                debug!(
                    self.logger,
                    "no progress available for {}",
                    from;
                );
                return;
            }
        };
        if is_learner {
            debug!(
                self.logger,
                "ignored transferring leadership";
            );
            return;
        }
        let lead_transferee = from;
        if let Some(last_lead_transferee) = self.lead_transferee {
            if last_lead_transferee == lead_transferee {
                info!(
                    self.logger,
                    "[term {term}] transfer leadership to {lead_transferee} is in progress, ignores request \
                     to same node {lead_transferee}",
                    term = self.term,
                    lead_transferee = lead_transferee;
                );
                return;
            }
            self.abort_leader_transfer();
            info!(
                self.logger,
                "[term {term}] abort previous transferring leadership to {last_lead_transferee}",
                term = self.term,
                last_lead_transferee = last_lead_transferee;
            );
        }
        if lead_transferee == self.id {
            debug!(
                self.logger,
                "already leader; ignored transferring leadership to self";
            );
            return;
        }
        // Transfer leadership to third party.
        info!(
            self.logger,
            "[term {term}] starts to transfer leadership to {lead_transferee}",
            term = self.term,
            lead_transferee = lead_transferee;
        );
        // Transfer leadership should be finished in one electionTimeout
        // so reset r.electionElapsed.
        self.election_elapsed = 0;
        self.lead_transferee = Some(lead_transferee);
        let up_to_date = self
            .prs
            .get(from)
            .map_or(false, |pr| pr.matched == self.r.raft_log.last_index());
        if up_to_date {
            self.send_timeout_now(lead_transferee);
            info!(
                self.logger,
                "sends MsgTimeoutNow to {lead_transferee} immediately as {lead_transferee} already has up-to-date log",
                lead_transferee = lead_transferee;
            );
        } else {
            self.send_append(lead_transferee);
        }
    }

    fn handle_snapshot_status(&mut self, m: &Message) {
        let pr = match self.prs.get_mut(m.from) {
            Some(pr) => pr,
            None => {
                debug!(
                    self.logger,
                    "no progress available for {}",
                    m.from;
                );
                return;
            }
        };
        if pr.state != ProgressState::Snapshot {
            return;
        }
        if m.reject {
            pr.snapshot_failure();
            pr.become_probe();
            debug!(
                self.r.logger,
                "snapshot failed, resumed sending replication messages to {from}",
                from = m.from;
                "progress" => ?pr,
            );
        } else {
            pr.become_probe();
            debug!(
                self.r.logger,
                "snapshot succeeded, resumed sending replication messages to {from}",
                from = m.from;
                "progress" => ?pr,
            );
        }
        // If snapshot finish, wait for the msgAppResp from the remote node before sending
        // out the next msgAppend.
        // If snapshot failure, wait for a heartbeat interval before next try
        pr.pause();
    }

    fn handle_unreachable(&mut self, m: &Message) {
        let pr = match self.prs.get_mut(m.from) {
            Some(pr) => pr,
            None => {
                debug!(
                    self.logger,
                    "no progress available for {}",
                    m.from;
                );
                return;
            }
        };
        // During optimistic replication, if the remote becomes unreachable,
        // there is huge probability that a MsgAppend is lost.
        if pr.state == ProgressState::Replicate {
            pr.become_probe();
        }
        debug!(
            self.r.logger,
            "failed to send message to {from} because it is unreachable",
            from = m.from;
            "progress" => ?pr,
        );
    }

    // Refuses the configuration changes among `m`'s entries that cannot be
    // proposed now, replacing them with empty entries.
    fn filter_conf_changes(&mut self, m: &mut Message) -> Result<()> {
        let already_joint = self.prs.conf().voters().is_joint();
        let last_index = self.raft_log.last_index();
        for (i, e) in m.entries.iter_mut().enumerate() {
            if e.entry_type != EntryType::EntryConfChange {
                continue;
            }
            let cc = ConfChange::decode_from(&e.data)?;
            let wants_leave_joint = cc.leave_joint();
            let refused = if self.has_pending_conf() {
                Some("possible unapplied conf change")
            } else if already_joint && !wants_leave_joint {
                Some("must transition out of joint config first")
            } else if !already_joint && wants_leave_joint {
                Some("not in joint state; refusing empty conf change")
            } else {
                None
            };
            match refused {
                Some(reason) => {
                    info!(
                        self.r.logger,
                        "ignoring conf change";
                        "reason" => reason,
                        "config" => %self.prs.conf(),
                        "index" => self.r.pending_conf_index,
                        "applied" => self.r.raft_log.applied,
                    );
                    *e = Entry::default();
                }
                None => self.r.pending_conf_index = last_index + i as u64 + 1,
            }
        }
        Ok(())
    }

    fn step_leader(&mut self, mut m: Message) -> Result<()> {
        // These message types do not require any progress for m.From.
        match m.msg_type {
            MessageType::MsgBeat => {
                self.bcast_heartbeat();
                return Ok(());
            }
            MessageType::MsgCheckQuorum => {
                if !self.check_quorum_active() {
                    warn!(
                        self.logger,
                        "stepped down to follower since quorum is not active";
                    );
                    let term = self.term;
                    self.become_follower(term, INVALID_ID);
                }
                return Ok(());
            }
            MessageType::MsgPropose => {
                if m.entries.is_empty() {
                    return Err(Error::InvariantViolated("stepped empty MsgProp".to_owned()));
                }
                if !self.prs.conf().voters().contains(self.id) {
                    // If we are not currently a member of the range (i.e. this node
                    // was removed from the configuration while serving as leader),
                    // drop any new proposals.
                    return Err(Error::ProposalDropped);
                }
                if let Some(lead_transferee) = self.lead_transferee {
                    debug!(
                        self.logger,
                        "[term {term}] transfer leadership to {lead_transferee} is in progress; dropping \
                         proposal",
                        term = self.term,
                        lead_transferee = lead_transferee;
                    );
                    return Err(Error::ProposalDropped);
                }

                self.filter_conf_changes(&mut m)?;
                self.append_entry(&mut m.entries)?;
                self.bcast_append();
                return Ok(());
            }
            MessageType::MsgReadIndex => {
                if !self.commit_to_current_term() {
                    // Reject read only request when this leader has not committed any log entry
                    // in its term. Keep it until one is.
                    self.pending_read_index_messages.push(m);
                    return Ok(());
                }
                self.send_read_index(m);
                return Ok(());
            }
            _ => {}
        }

        match m.msg_type {
            MessageType::MsgAppendResponse => {
                self.handle_append_response(&m);
            }
            MessageType::MsgHeartbeatResponse => {
                self.handle_heartbeat_response(&m);
            }
            MessageType::MsgSnapStatus => {
                self.handle_snapshot_status(&m);
            }
            MessageType::MsgUnreachable => {
                self.handle_unreachable(&m);
            }
            MessageType::MsgTransferLeader => {
                self.handle_transfer_leader(&m);
            }
            _ => {
                if self.prs.get(m.from).is_none() {
                    debug!(
                        self.logger,
                        "no progress available for {}",
                        m.from;
                    );
                }
            }
        }

        Ok(())
    }

    fn send_read_index(&mut self, m: Message) {
        let mut self_set = HashSet::default();
        self_set.insert(self.id);
        if self.prs.has_quorum(&self_set) {
            // A single voter answers at once.
            let read_index = self.raft_log.committed;
            if let Some(m) = self.handle_ready_read_index(m, read_index) {
                self.r.send(m, &mut self.msgs);
            }
            return;
        }
        match self.read_only.option {
            ReadOnlyOption::Safe => {
                let ctx = match m.entries.first() {
                    Some(e) => e.data.clone(),
                    None => return,
                };
                self.r
                    .read_only
                    .add_request(self.r.raft_log.committed, m, self.r.id);
                self.bcast_heartbeat_with_ctx(Some(ctx));
            }
            ReadOnlyOption::LeaseBased => {
                let read_index = self.raft_log.committed;
                if let Some(m) = self.handle_ready_read_index(m, read_index) {
                    self.r.send(m, &mut self.msgs);
                }
            }
        }
    }

    fn release_pending_read_index_messages(&mut self) {
        if self.pending_read_index_messages.is_empty() || !self.commit_to_current_term() {
            return;
        }
        let msgs = std::mem::take(&mut self.pending_read_index_messages);
        for m in msgs {
            self.send_read_index(m);
        }
    }

    // step_candidate is shared by state Candidate and PreCandidate; the difference is
    // whether they respond to MsgRequestVote or MsgRequestPreVote.
    fn step_candidate(&mut self, m: Message) -> Result<()> {
        match m.msg_type {
            MessageType::MsgPropose => {
                info!(
                    self.logger,
                    "no leader at term {term}; dropping proposal",
                    term = self.term;
                );
                return Err(Error::ProposalDropped);
            }
            MessageType::MsgAppend => {
                debug_assert_eq!(self.term, m.term);
                self.become_follower(m.term, m.from);
                self.handle_append_entries(&m)?;
            }
            MessageType::MsgHeartbeat => {
                debug_assert_eq!(self.term, m.term);
                self.become_follower(m.term, m.from);
                self.handle_heartbeat(m)?;
            }
            MessageType::MsgSnapshot => {
                debug_assert_eq!(self.term, m.term);
                self.become_follower(m.term, m.from);
                self.handle_snapshot(m)?;
            }
            MessageType::MsgRequestPreVoteResponse | MessageType::MsgRequestVoteResponse => {
                // Only handle vote responses corresponding to our candidacy (while in
                // state Candidate, we may get stale MsgPreVoteResp messages in this term from
                // our pre-candidate state).
                if (self.state == StateRole::PreCandidate
                    && m.msg_type != MessageType::MsgRequestPreVoteResponse)
                    || (self.state == StateRole::Candidate
                        && m.msg_type != MessageType::MsgRequestVoteResponse)
                {
                    return Ok(());
                }

                match self.poll(m.from, m.msg_type, !m.reject) {
                    VoteResult::Won => {
                        if self.state == StateRole::PreCandidate {
                            self.campaign(CAMPAIGN_ELECTION)?;
                        } else {
                            self.become_leader()?;
                            self.bcast_append();
                        }
                    }
                    VoteResult::Lost => {
                        // pb.MsgPreVoteResp contains future term of pre-candidate
                        // m.term > self.term; reuse self.term
                        let term = self.term;
                        self.become_follower(term, INVALID_ID);
                    }
                    VoteResult::Pending => {}
                }
            }
            MessageType::MsgTimeoutNow => debug!(
                self.logger,
                "{term} ignored MsgTimeoutNow from {from}",
                term = self.term,
                from = m.from;
                "state" => ?self.state,
            ),
            _ => {}
        }
        Ok(())
    }

    fn step_follower(&mut self, mut m: Message) -> Result<()> {
        match m.msg_type {
            MessageType::MsgPropose => {
                if self.leader_id == INVALID_ID {
                    info!(
                        self.logger,
                        "no leader at term {term}; dropping proposal",
                        term = self.term;
                    );
                    return Err(Error::ProposalDropped);
                }
                m.to = self.leader_id;
                self.r.send(m, &mut self.msgs);
            }
            MessageType::MsgAppend => {
                self.election_elapsed = 0;
                self.leader_id = m.from;
                self.handle_append_entries(&m)?;
            }
            MessageType::MsgHeartbeat => {
                self.election_elapsed = 0;
                self.leader_id = m.from;
                self.handle_heartbeat(m)?;
            }
            MessageType::MsgSnapshot => {
                self.election_elapsed = 0;
                self.leader_id = m.from;
                self.handle_snapshot(m)?;
            }
            MessageType::MsgTransferLeader => {
                if self.leader_id == INVALID_ID {
                    info!(
                        self.logger,
                        "no leader at term {term}; dropping leader transfer msg",
                        term = self.term;
                    );
                    return Ok(());
                }
                m.to = self.leader_id;
                self.r.send(m, &mut self.msgs);
            }
            MessageType::MsgTimeoutNow => {
                if self.promotable {
                    info!(
                        self.logger,
                        "[term {term}] received MsgTimeoutNow from {from} and starts an election to \
                         get leadership.",
                        term = self.term,
                        from = m.from;
                    );
                    // Leadership transfers never use pre-vote even if self.pre_vote is true; we
                    // know we are not recovering from a partition so there is no need for the
                    // extra round trip.
                    self.hup(true)?;
                } else {
                    info!(
                        self.logger,
                        "received MsgTimeoutNow from {} but is not promotable",
                        m.from;
                    );
                }
            }
            MessageType::MsgReadIndex => {
                if self.leader_id == INVALID_ID {
                    info!(
                        self.logger,
                        "no leader at term {term}; dropping index reading msg",
                        term = self.term;
                    );
                    return Ok(());
                }
                m.to = self.leader_id;
                self.r.send(m, &mut self.msgs);
            }
            MessageType::MsgReadIndexResp => {
                if m.entries.len() != 1 {
                    error!(
                        self.logger,
                        "invalid format of MsgReadIndexResp from {}",
                        m.from;
                        "entries count" => m.entries.len(),
                    );
                    return Ok(());
                }
                let rs = ReadState {
                    index: m.index,
                    request_ctx: m.entries[0].data.clone(),
                };
                self.read_states.push(rs);
                // `index` and `term` in MsgReadIndexResp is the leader's commit index and its current term,
                // the log entry in the leader's commit index will always have the leader's current term,
                // because the leader only handle MsgReadIndex after it has committed log entry in its term.
                self.raft_log.maybe_commit(m.index, m.term);
            }
            _ => {}
        }
        Ok(())
    }

    /// For a given message, append the entries to the log.
    pub fn handle_append_entries(&mut self, m: &Message) -> Result<()> {
        if m.index < self.raft_log.committed {
            debug!(
                self.logger,
                "got message with lower index than committed.";
            );
            let mut to_send = new_message(m.from, MessageType::MsgAppendResponse, None);
            to_send.index = self.raft_log.committed;
            to_send.commit = self.raft_log.committed;
            self.r.send(to_send, &mut self.msgs);
            return Ok(());
        }

        let mut to_send = new_message(m.from, MessageType::MsgAppendResponse, None);
        match self
            .raft_log
            .maybe_append(m.index, m.log_term, m.commit, &m.entries)?
        {
            Some((_, last_idx)) => to_send.index = last_idx,
            None => {
                debug!(
                    self.logger,
                    "rejected msgApp [logterm: {msg_log_term}, index: {msg_index}] \
                    from {from}",
                    msg_log_term = m.log_term,
                    msg_index = m.index,
                    from = m.from;
                    "index" => m.index,
                    "logterm" => ?self.raft_log.term(m.index),
                );
                to_send.index = m.index;
                to_send.reject = true;
                to_send.reject_hint = self.raft_log.last_index();
            }
        }

        to_send.commit = self.raft_log.committed;
        self.r.send(to_send, &mut self.msgs);
        Ok(())
    }

    /// For a message, commit and send out heartbeat.
    pub fn handle_heartbeat(&mut self, m: Message) -> Result<()> {
        self.raft_log.commit_to(m.commit)?;
        let mut to_send = new_message(m.from, MessageType::MsgHeartbeatResponse, None);
        to_send.context = m.context;
        to_send.commit = self.raft_log.committed;
        self.r.send(to_send, &mut self.msgs);
        Ok(())
    }

    fn handle_snapshot(&mut self, m: Message) -> Result<()> {
        let meta = match m.snapshot {
            Some(meta) => meta,
            None => {
                warn!(self.logger, "ignored snapshot message without metadata"; "from" => m.from);
                return Ok(());
            }
        };
        let (sindex, sterm) = (meta.index, meta.term);
        let mut to_send = new_message(m.from, MessageType::MsgAppendResponse, None);
        if self.restore(meta)? {
            info!(
                self.logger,
                "[commit: {commit}, term: {term}] restored snapshot [index: {snapshot_index}, term: {snapshot_term}]",
                term = self.term,
                commit = self.raft_log.committed,
                snapshot_index = sindex,
                snapshot_term = sterm;
            );
            to_send.index = self.raft_log.last_index();
        } else {
            info!(
                self.logger,
                "[commit: {commit}] ignored snapshot [index: {snapshot_index}, term: {snapshot_term}]",
                commit = self.raft_log.committed,
                snapshot_index = sindex,
                snapshot_term = sterm;
            );
            to_send.index = self.raft_log.committed;
        }
        self.r.send(to_send, &mut self.msgs);
        Ok(())
    }

    /// Recovers the state machine from a snapshot. It restores the log and the
    /// configuration of state machine.
    ///
    /// Returns false if the snapshot is not newer than what is already committed.
    pub fn restore(&mut self, meta: SnapshotMetadata) -> Result<bool> {
        if meta.index <= self.raft_log.committed {
            return Ok(false);
        }
        if self.state != StateRole::Follower {
            // This is defense-in-depth: if the leader somehow ended up applying a
            // snapshot, it could move into a new term without moving into a
            // follower state.
            warn!(self.logger, "non-follower attempted to restore snapshot"; "state" => ?self.state);
            let term = self.term + 1;
            self.become_follower(term, INVALID_ID);
            return Ok(false);
        }

        let cs = &meta.conf_state;
        if !cs.voters.contains(&self.id)
            && !cs.learners.contains(&self.id)
            && !cs.voters_outgoing.contains(&self.id)
        {
            warn!(
                self.logger,
                "attempted to restore snapshot but it is not in the ConfState";
                "conf state" => ?cs,
            );
            return Ok(false);
        }

        // Do not fast-forward commit if the snapshot matches what we have.
        if self.raft_log.match_term(meta.index, meta.term) {
            info!(
                self.logger,
                "[commit: {commit}, lastindex: {last_index}, lastterm: {last_term}] fast-forwarded commit to \
                 snapshot [index: {snapshot_index}, term: {snapshot_term}]",
                commit = self.raft_log.committed,
                last_index = self.raft_log.last_index(),
                last_term = self.raft_log.last_term(),
                snapshot_index = meta.index,
                snapshot_term = meta.term;
            );
            self.raft_log.commit_to(meta.index)?;
            return Ok(false);
        }

        let cs = meta.conf_state.clone();
        self.raft_log.restore(meta);

        // Reset the configuration and add the (potentially updated) peers in anew.
        self.prs.clear();
        let next_idx = self.raft_log.last_index() + 1;
        confchange::restore(&mut self.prs, next_idx, &cs)?;
        let restored = self.post_conf_change();
        if !restored.eq_ignoring_order(&cs) {
            return Err(Error::InvariantViolated(format!(
                "restored conf state {:?} differs from snapshot conf state {:?}",
                restored, cs
            )));
        }

        let id = self.id;
        if let Some(pr) = self.prs.get_mut(id) {
            let next = pr.next_idx;
            pr.maybe_update(next - 1);
        }
        Ok(true)
    }

    /// Check if there is any pending confchange.
    ///
    /// This method can be false positive.
    #[inline]
    pub fn has_pending_conf(&self) -> bool {
        self.pending_conf_index > self.raft_log.applied
    }

    /// Specifies if the commit should be broadcast.
    pub fn should_bcast_commit(&self) -> bool {
        !self.skip_bcast_commit || self.has_pending_conf()
    }

    /// Indicates whether state machine can be promoted to leader,
    /// which is true when it's a voter and its own id is in progress list.
    pub fn promotable(&self) -> bool {
        self.promotable
    }

    /// Applies a committed membership change and returns the resulting
    /// configuration.
    ///
    /// The change is validated as a whole before anything is installed; a
    /// refused change leaves the configuration untouched.
    pub fn apply_conf_change(&mut self, cc: &ConfChange) -> Result<ConfState> {
        let (cfg, changes) = {
            let changer = Changer::new(&self.prs);
            if cc.leave_joint() {
                changer.leave_joint()?
            } else if let Some(auto_leave) = cc.enter_joint() {
                changer.enter_joint(auto_leave, &cc.changes)?
            } else {
                changer.simple(&cc.changes)?
            }
        };
        let next_idx = self.raft_log.last_index() + 1;
        self.prs.apply_conf(cfg, changes, next_idx);
        Ok(self.post_conf_change())
    }

    // Updates the in-memory state after the configuration changed and
    // returns the resulting ConfState.
    fn post_conf_change(&mut self) -> ConfState {
        let cs = self.prs.conf().to_conf_state();
        let is_voter = self.prs.conf().voters().contains(self.id);
        self.promotable = is_voter;
        if !is_voter && self.state == StateRole::Leader {
            // This node is leader and was removed or demoted. We prevent demotions
            // at the time writing but hypothetically we handle them the same way as
            // removing the leader: it keeps leading until it steps down.
            return cs;
        }

        // The remaining steps only make sense if this node is the leader and there
        // are other nodes.
        if self.state != StateRole::Leader || cs.voters.is_empty() {
            return cs;
        }

        if self.maybe_commit() {
            // If the configuration change means that more entries are committed now,
            // broadcast/append to everyone in the updated config.
            self.bcast_append();
        } else {
            // Otherwise, still send appends to the newly added replicas; there's no reason to
            // let them wait out a heartbeat interval (or the next incoming
            // proposal).
            let self_id = self.id;
            let core = &mut self.r;
            let msgs = &mut self.msgs;
            self.prs
                .iter_mut()
                .filter(|&(id, _)| *id != self_id)
                .for_each(|(id, pr)| {
                    core.maybe_send_append(*id, pr, &cs, false, msgs);
                });
        }

        // The quorum may be smaller now, consider to response some read requests.
        if let Some(ctx) = self.read_only.last_pending_request_ctx() {
            let prs = &self.prs;
            if self
                .r
                .read_only
                .recv_ack(self.r.id, &ctx)
                .map_or(false, |acks| prs.has_quorum(acks))
            {
                for rs in self.r.read_only.advance(&ctx) {
                    if let Some(m) = self.handle_ready_read_index(rs.req, rs.index) {
                        self.r.send(m, &mut self.msgs);
                    }
                }
            }
        }

        // If the leadTransferee was removed or demoted, abort the leadership transfer.
        if let Some(transferee) = self.lead_transferee {
            if !self.prs.conf().voters().contains(transferee) {
                self.abort_leader_transfer();
            }
        }
        cs
    }

    /// Returns a read-only reference to the progress set.
    pub fn prs(&self) -> &ProgressTracker {
        &self.prs
    }

    /// Returns a mutable reference to the progress set.
    pub fn mut_prs(&mut self) -> &mut ProgressTracker {
        &mut self.prs
    }

    /// For a given hardstate, load the state into self.
    pub fn load_state(&mut self, hs: &HardState) -> Result<()> {
        if hs.commit < self.raft_log.committed || hs.commit > self.raft_log.last_index() {
            return Err(Error::InvariantViolated(format!(
                "hs.commit {} is out of range [{}, {}]",
                hs.commit,
                self.raft_log.committed,
                self.raft_log.last_index()
            )));
        }
        self.raft_log.committed = hs.commit;
        self.term = hs.term;
        self.vote = hs.vote;
        Ok(())
    }

    /// `pass_election_timeout` returns true iff `election_elapsed` is greater
    /// than or equal to the randomized election timeout in
    /// [`election_timeout`, 2 * `election_timeout` - 1].
    pub fn pass_election_timeout(&self) -> bool {
        self.election_elapsed >= self.randomized_election_timeout
    }

    /// Regenerates and stores the election timeout.
    pub fn reset_randomized_election_timeout(&mut self) {
        let prev_timeout = self.randomized_election_timeout;
        let timeout =
            rand::thread_rng().gen_range(self.min_election_timeout..self.max_election_timeout);
        debug!(
            self.logger,
            "reset election timeout {prev_timeout} -> {timeout} at {election_elapsed}",
            prev_timeout = prev_timeout,
            timeout = timeout,
            election_elapsed = self.election_elapsed;
        );
        self.randomized_election_timeout = timeout;
    }

    // check_quorum_active returns true if the quorum is active from
    // the view of the local raft state machine. Otherwise, it returns
    // false.
    // check_quorum_active also resets all recent_active to false.
    // check_quorum_active can only called by leader.
    fn check_quorum_active(&mut self) -> bool {
        let self_id = self.id;
        self.prs.quorum_recently_active(self_id)
    }

    /// Issues a message to timeout immediately.
    pub fn send_timeout_now(&mut self, to: u64) {
        let msg = new_message(to, MessageType::MsgTimeoutNow, None);
        self.r.send(msg, &mut self.msgs);
    }

    /// Stops the transfer of a leader.
    pub fn abort_leader_transfer(&mut self) {
        self.lead_transferee = None;
    }

    /// Records a coalesced heartbeat from node `from`: it proves the leader
    /// is alive without carrying any log state.
    pub fn on_node_heartbeat(&mut self, from: u64) {
        if self.state == StateRole::Follower && self.leader_id == from {
            self.election_elapsed = 0;
        }
    }

    /// Records a coalesced heartbeat response from node `from`.
    ///
    /// It stands in for the raft heartbeat response: the peer is marked
    /// active, a paused peer resumes, and an append is sent when the peer
    /// misses entries or has not acknowledged the latest commit it may know.
    pub fn on_node_heartbeat_response(&mut self, from: u64) {
        if self.state != StateRole::Leader {
            return;
        }
        let cs = self.prs.conf().to_conf_state();
        let last_index = self.raft_log.last_index();
        let committed = self.raft_log.committed;
        let pr = match self.prs.get_mut(from) {
            Some(pr) => pr,
            None => return,
        };
        pr.recent_active = true;
        pr.resume();
        if pr.state == ProgressState::Replicate && pr.ins.full() {
            pr.ins.free_first_one();
        }
        if pr.matched < last_index || pr.committed_index < cmp::min(pr.matched, committed) {
            self.r.send_append(from, pr, &cs, &mut self.msgs);
        }
    }

    fn handle_ready_read_index(&mut self, req: Message, index: u64) -> Option<Message> {
        if req.from == INVALID_ID || req.from == self.id {
            let rs = ReadState {
                index,
                request_ctx: req.entries.first().map(|e| e.data.clone()).unwrap_or_default(),
            };
            self.read_states.push(rs);
            return None;
        }
        let mut to_send = new_message(req.from, MessageType::MsgReadIndexResp, None);
        to_send.index = index;
        to_send.entries = req.entries;
        Some(to_send)
    }
}
