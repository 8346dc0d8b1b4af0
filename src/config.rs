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

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use super::read_only::{ReadOnlyOption, ReadState};
use super::errors::{Error, Result};
use super::message::Peer;
use super::state_machine::StateMachine;
use super::storage::Storage;
use super::INVALID_ID;

/// Config contains the parameters to start a raft.
#[derive(Clone, Debug)]
pub struct Config {
    /// The identity of the local raft. It cannot be 0, and must be unique in the group.
    pub id: u64,

    /// The number of node.tick invocations that must pass between
    /// elections. That is, if a follower does not receive any message from the
    /// leader of current term before ElectionTick has elapsed, it will become
    /// candidate and start an election. election_tick must be greater than
    /// HeartbeatTick. We suggest election_tick = 10 * HeartbeatTick to avoid
    /// unnecessary leader switching
    pub election_tick: usize,

    /// HeartbeatTick is the number of node.tick invocations that must pass between
    /// heartbeats. That is, a leader sends heartbeat messages to maintain its
    /// leadership every heartbeat ticks.
    pub heartbeat_tick: usize,

    /// Applied is the last applied index. It should only be set when restarting
    /// raft. raft will not return entries to the application smaller or equal to Applied.
    /// If Applied is unset when restarting, raft might return previous applied entries.
    /// This is a very application dependent configuration.
    pub applied: u64,

    /// Limit the max size of each append message. Smaller value lowers
    /// the raft recovery cost(initial probing and message lost during normal operation).
    /// On the other side, it might affect the throughput during normal replication.
    /// Note: u64::MAX for unlimited, 0 for at most one entry per message.
    pub max_size_per_msg: u64,

    /// Limit the max number of in-flight append messages during optimistic
    /// replication phase. The application transportation layer usually has its own sending
    /// buffer over TCP/UDP. Set to avoid overflowing that sending buffer.
    pub max_inflight_msgs: usize,

    /// Specify if the leader should check quorum activity. Leader steps down when
    /// quorum is not active for an electionTimeout.
    pub check_quorum: bool,

    /// Enables the Pre-Vote algorithm described in raft thesis section
    /// 9.6. This prevents disruption when a node that has been partitioned away
    /// rejoins the cluster.
    pub pre_vote: bool,

    /// The range of election timeout. In some cases, we hope some nodes has less possibility
    /// to become leader. This configuration ensures that the randomized election_timeout
    /// will always be suit in [min_election_tick, max_election_tick).
    /// If it is 0, then election_tick will be chosen.
    pub min_election_tick: usize,

    /// If it is 0, then 2 * election_tick will be chosen.
    pub max_election_tick: usize,

    /// Choose the linearizability mode or the lease mode to read data. If you don’t care about the read consistency and want a higher read performance, you can use the lease mode.
    ///
    /// Setting this to `LeaseBased` requires `check_quorum = true`.
    pub read_only_option: ReadOnlyOption,

    /// Don't broadcast an empty raft entry to notify follower to commit an entry.
    /// This may make follower wait a longer time to apply an entry. This configuration
    /// May affect proposal forwarding and follower read.
    pub skip_bcast_commit: bool,

    /// The election priority of this node.
    pub priority: u64,

    /// Liveness comes from node-level heartbeats sent outside the raft, so
    /// the leader sends no periodic heartbeats of its own. Followers still
    /// learn commits from appends, and pending reads are still confirmed by
    /// heartbeats.
    pub coalesced_heartbeat: bool,
}

impl Default for Config {
    fn default() -> Self {
        const HEARTBEAT_TICK: usize = 2;
        Self {
            id: 0,
            election_tick: HEARTBEAT_TICK * 10,
            heartbeat_tick: HEARTBEAT_TICK,
            applied: 0,
            max_size_per_msg: 0,
            max_inflight_msgs: 256,
            check_quorum: false,
            pre_vote: false,
            min_election_tick: 0,
            max_election_tick: 0,
            read_only_option: ReadOnlyOption::Safe,
            skip_bcast_commit: false,
            priority: 0,
            coalesced_heartbeat: false,
        }
    }
}

impl Config {
    /// Creates a new config.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// The minimum number of ticks before an election.
    #[inline]
    pub fn min_election_tick(&self) -> usize {
        if self.min_election_tick == 0 {
            self.election_tick
        } else {
            self.min_election_tick
        }
    }

    /// The maximum number of ticks before an election.
    #[inline]
    pub fn max_election_tick(&self) -> usize {
        if self.max_election_tick == 0 {
            2 * self.election_tick
        } else {
            self.max_election_tick
        }
    }

    /// Runs validations against the config.
    pub fn validate(&self) -> Result<()> {
        if self.id == INVALID_ID {
            return Err(Error::ConfigInvalid("invalid node id".to_owned()));
        }

        if self.heartbeat_tick == 0 {
            return Err(Error::ConfigInvalid(
                "heartbeat tick must greater than 0".to_owned(),
            ));
        }

        if self.election_tick <= self.heartbeat_tick {
            return Err(Error::ConfigInvalid(
                "election tick must be greater than heartbeat tick".to_owned(),
            ));
        }

        let min_timeout = self.min_election_tick();
        let max_timeout = self.max_election_tick();
        if min_timeout < self.election_tick {
            return Err(Error::ConfigInvalid(format!(
                "min election tick {} must not be less than election_tick {}",
                min_timeout, self.election_tick
            )));
        }

        if min_timeout >= max_timeout {
            return Err(Error::ConfigInvalid(format!(
                "min election tick {} should be less than max election tick {}",
                min_timeout, max_timeout
            )));
        }

        if self.max_inflight_msgs == 0 {
            return Err(Error::ConfigInvalid(
                "max inflight messages must be greater than 0".to_owned(),
            ));
        }

        if self.read_only_option == ReadOnlyOption::LeaseBased && !self.check_quorum {
            return Err(Error::ConfigInvalid(
                "read_only_option == LeaseBased requires check_quorum == true".into(),
            ));
        }

        Ok(())
    }
}

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_TICK: usize = 2;
const DEFAULT_ELECTION_TICK: usize = 5;
const DEFAULT_INFLIGHT_MSGS: usize = 128;
const MAX_INFLIGHT_MSGS: usize = 1024;
const DEFAULT_SIZE_PER_MSG: u64 = 1024 * 1024;
const MAX_SIZE_PER_MSG: u64 = 4 * 1024 * 1024;
const DEFAULT_RECV_BUFFER_SIZE: usize = 2048;
const DEFAULT_APPLY_BUFFER_SIZE: usize = 2048;
const DEFAULT_PROPOSE_BUFFER_SIZE: usize = 256;
const DEFAULT_READ_INDEX_BUFFER_SIZE: usize = 256;
const DEFAULT_TICK_BUFFER_SIZE: usize = 64;
const DEFAULT_RETAIN_LOGS: u64 = 20000;
const DEFAULT_MAX_PROPOSAL_BATCH: usize = 64;

/// Process wide settings shared by every group of a `Server`.
///
/// Zero values stand for the defaults and are filled in by `validate`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// The id of this node. Every group hosted here uses it as its raft id.
    pub node_id: u64,
    /// The period of the shared ticker.
    pub tick_interval: Duration,
    /// Server ticks between two rounds of coalesced heartbeats, also the
    /// per-group heartbeat tick.
    pub heartbeat_tick: usize,
    /// Ticks without hearing from a leader before a follower campaigns.
    pub election_tick: usize,
    pub max_inflight_msgs: usize,
    pub max_size_per_msg: u64,
    /// Capacity of a group's inbound message queue.
    pub recv_buffer_size: usize,
    /// Capacity of a group's apply queue.
    pub apply_buffer_size: usize,
    pub propose_buffer_size: usize,
    pub read_index_buffer_size: usize,
    pub tick_buffer_size: usize,
    /// Applied entries kept in the log behind the applied index.
    pub retain_logs: u64,
    /// Queued proposals folded into one local propose message.
    pub max_proposal_batch: usize,
    /// The period of the monitor task.
    pub status_interval: Duration,
    /// Leaders step down when they stop hearing from a quorum.
    pub check_quorum: bool,
    pub pre_vote: bool,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            node_id: 0,
            tick_interval: DEFAULT_TICK_INTERVAL,
            heartbeat_tick: DEFAULT_HEARTBEAT_TICK,
            election_tick: DEFAULT_ELECTION_TICK,
            max_inflight_msgs: DEFAULT_INFLIGHT_MSGS,
            max_size_per_msg: DEFAULT_SIZE_PER_MSG,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            apply_buffer_size: DEFAULT_APPLY_BUFFER_SIZE,
            propose_buffer_size: DEFAULT_PROPOSE_BUFFER_SIZE,
            read_index_buffer_size: DEFAULT_READ_INDEX_BUFFER_SIZE,
            tick_buffer_size: DEFAULT_TICK_BUFFER_SIZE,
            retain_logs: DEFAULT_RETAIN_LOGS,
            max_proposal_batch: DEFAULT_MAX_PROPOSAL_BATCH,
            status_interval: DEFAULT_STATUS_INTERVAL,
            check_quorum: true,
            pre_vote: true,
        }
    }
}

fn or_default<T: Default + PartialEq>(v: &mut T, default: T) {
    if *v == T::default() {
        *v = default;
    }
}

impl ServerConfig {
    /// Creates the default settings for node `node_id`.
    pub fn new(node_id: u64) -> ServerConfig {
        ServerConfig {
            node_id,
            ..Default::default()
        }
    }

    /// Replaces zero values by their defaults, then checks the result.
    pub fn validate(&mut self) -> Result<()> {
        if self.node_id == INVALID_ID {
            return Err(Error::ConfigInvalid("invalid node id".to_owned()));
        }
        or_default(&mut self.tick_interval, DEFAULT_TICK_INTERVAL);
        or_default(&mut self.heartbeat_tick, DEFAULT_HEARTBEAT_TICK);
        or_default(&mut self.election_tick, DEFAULT_ELECTION_TICK);
        or_default(&mut self.max_inflight_msgs, DEFAULT_INFLIGHT_MSGS);
        or_default(&mut self.max_size_per_msg, DEFAULT_SIZE_PER_MSG);
        or_default(&mut self.recv_buffer_size, DEFAULT_RECV_BUFFER_SIZE);
        or_default(&mut self.apply_buffer_size, DEFAULT_APPLY_BUFFER_SIZE);
        or_default(&mut self.propose_buffer_size, DEFAULT_PROPOSE_BUFFER_SIZE);
        or_default(
            &mut self.read_index_buffer_size,
            DEFAULT_READ_INDEX_BUFFER_SIZE,
        );
        or_default(&mut self.tick_buffer_size, DEFAULT_TICK_BUFFER_SIZE);
        or_default(&mut self.retain_logs, DEFAULT_RETAIN_LOGS);
        or_default(&mut self.max_proposal_batch, DEFAULT_MAX_PROPOSAL_BATCH);
        or_default(&mut self.status_interval, DEFAULT_STATUS_INTERVAL);

        if self.election_tick <= self.heartbeat_tick {
            return Err(Error::ConfigInvalid(format!(
                "election tick {} must be greater than heartbeat tick {}",
                self.election_tick, self.heartbeat_tick
            )));
        }
        if self.max_inflight_msgs > MAX_INFLIGHT_MSGS {
            return Err(Error::ConfigInvalid(format!(
                "max inflight messages {} must not exceed {}",
                self.max_inflight_msgs, MAX_INFLIGHT_MSGS
            )));
        }
        if self.max_size_per_msg > MAX_SIZE_PER_MSG {
            return Err(Error::ConfigInvalid(format!(
                "max size per message {} must not exceed {}",
                self.max_size_per_msg, MAX_SIZE_PER_MSG
            )));
        }
        Ok(())
    }

    /// The raft settings of one group hosted by this node.
    pub fn raft_config(&self, group: &GroupConfig) -> Config {
        let priority = group
            .peers
            .iter()
            .find(|p| p.id == self.node_id)
            .map_or(0, |p| p.priority);
        Config {
            id: self.node_id,
            election_tick: self.election_tick,
            heartbeat_tick: self.heartbeat_tick,
            applied: group.applied.unwrap_or_default(),
            max_size_per_msg: self.max_size_per_msg,
            max_inflight_msgs: self.max_inflight_msgs,
            check_quorum: self.check_quorum,
            pre_vote: self.pre_vote,
            priority,
            coalesced_heartbeat: true,
            ..Default::default()
        }
    }
}

/// Everything needed to start one group on a node.
#[derive(Clone, Getters, Setters)]
pub struct GroupConfig {
    #[get = "pub"]
    group_id: u64,
    /// The initial members, used when the store holds no membership yet.
    #[get = "pub"]
    peers: Vec<Peer>,
    /// The index the state machine has applied up to. When unset the group
    /// resumes from the applied index recorded in its store.
    applied: Option<u64>,
    /// The last term the group is known to have reached.
    #[get = "pub"]
    #[set = "pub"]
    term: u64,
    /// The node believed to lead the group, `INVALID_ID` if unknown.
    #[get = "pub"]
    #[set = "pub"]
    leader: u64,
    storage: Arc<dyn Storage>,
    state_machine: Arc<dyn StateMachine>,
}

impl fmt::Debug for GroupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupConfig")
            .field("group_id", &self.group_id)
            .field("peers", &self.peers)
            .field("applied", &self.applied)
            .field("term", &self.term)
            .field("leader", &self.leader)
            .finish()
    }
}

impl GroupConfig {
    /// Creates the config of group `group_id`.
    pub fn new(
        group_id: u64,
        peers: Vec<Peer>,
        storage: Arc<dyn Storage>,
        state_machine: Arc<dyn StateMachine>,
    ) -> GroupConfig {
        GroupConfig {
            group_id,
            peers,
            applied: None,
            term: 0,
            leader: INVALID_ID,
            storage,
            state_machine,
        }
    }

    /// The applied index the application asked to restart from, if any.
    pub fn applied(&self) -> Option<u64> {
        self.applied
    }

    /// Restarts the group as if its state machine holds every entry up to
    /// `applied`. Zero replays the whole log.
    pub fn set_applied(&mut self, applied: u64) -> &mut Self {
        self.applied = Some(applied);
        self
    }

    /// The store of the group's log and metadata.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The application the group applies committed commands to.
    pub fn state_machine(&self) -> &Arc<dyn StateMachine> {
        &self.state_machine
    }

    /// Runs validations against the config.
    pub fn validate(&self) -> Result<()> {
        if self.group_id == 0 {
            return Err(Error::ConfigInvalid("invalid group id".to_owned()));
        }
        if self.peers.is_empty() {
            return Err(Error::ConfigInvalid(format!(
                "group {} has no peers",
                self.group_id
            )));
        }
        if self.peers.iter().any(|p| p.id == INVALID_ID) {
            return Err(Error::ConfigInvalid(format!(
                "group {} has a peer with invalid id",
                self.group_id
            )));
        }
        Ok(())
    }
}
