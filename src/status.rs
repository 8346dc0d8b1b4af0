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

use crate::message::HardState;
use crate::raft::{Raft, SoftState, StateRole};
use crate::storage::Storage;
use crate::tracker::Progress;
use crate::HashMap;

/// Represents the current status of the raft
#[derive(Default, Clone, Debug)]
pub struct Status {
    /// The ID of the current node.
    pub id: u64,
    /// The group the status belongs to, 0 for a bare raft.
    pub group_id: u64,
    /// The hardstate of the raft, representing voted state.
    pub hs: HardState,
    /// The softstate of the raft, representing proposed state.
    pub ss: SoftState,
    /// The index of the last entry to have been applied.
    pub applied: u64,
    /// The index of the last entry in the log.
    pub last_index: u64,
    /// The index of the first entry still in the log.
    pub first_index: u64,
    /// The progress towards catching up and applying logs.
    pub progress: HashMap<u64, Progress>,
    /// Number of proposals waiting to be applied.
    pub pending_proposals: usize,
    /// Number of inbound messages dropped because the mailbox was full.
    pub dropped_messages: u64,
    /// Whether a snapshot is being installed.
    pub restoring: bool,
}

impl Status {
    /// Gets a copy of the current raft status.
    pub fn new<T: Storage>(raft: &Raft<T>) -> Status {
        let mut s = Status {
            id: raft.id,
            ..Default::default()
        };
        s.hs = raft.hard_state();
        s.ss = raft.soft_state();
        s.applied = raft.raft_log.applied;
        s.last_index = raft.raft_log.last_index();
        s.first_index = raft.raft_log.first_index();
        if s.ss.raft_state == StateRole::Leader {
            s.progress = raft
                .prs()
                .iter()
                .map(|(&k, v)| (k, v.clone()))
                .collect();
        }
        s
    }

    /// The commit index of the group.
    #[inline]
    pub fn committed(&self) -> u64 {
        self.hs.commit
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "group {} on {}: {} term {} leader {} commit {} applied {} log [{}, {}]",
            self.group_id,
            self.id,
            self.ss.raft_state,
            self.hs.term,
            self.ss.leader_id,
            self.hs.commit,
            self.applied,
            self.first_index,
            self.last_index,
        )
    }
}
