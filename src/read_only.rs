// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

// Copyright 2016 The etcd Authors
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

use std::collections::VecDeque;

use bytes::Bytes;

use crate::message::Message;
use crate::{HashMap, HashSet};

/// Determines the relative safety of and consistency of read only requests.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum ReadOnlyOption {
    /// Safe guarantees the linearizability of the read only request by
    /// communicating with the quorum. It is the default and suggested option.
    #[default]
    Safe,
    /// LeaseBased ensures linearizability of the read only request by
    /// relying on the leader lease. It can be affected by clock drift.
    LeaseBased,
}

/// ReadState provides state for read only query.
/// It's caller's responsibility to send MsgReadIndex first before getting
/// this state from ready. The request context tells the caller which of
/// its requests this answers.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct ReadState {
    /// The commit index the read must wait for.
    pub index: u64,
    /// A datagram consisting of context about the request.
    pub request_ctx: Bytes,
}

#[derive(Default, Debug, Clone)]
pub struct ReadIndexStatus {
    pub req: Message,
    pub index: u64,
    pub acks: HashSet<u64>,
}

/// Read index requests waiting for a heartbeat round to confirm leadership.
#[derive(Default, Debug, Clone)]
pub struct ReadOnly {
    pub option: ReadOnlyOption,
    pub pending_read_index: HashMap<Bytes, ReadIndexStatus>,
    pub read_index_queue: VecDeque<Bytes>,
}

impl ReadOnly {
    pub fn new(option: ReadOnlyOption) -> ReadOnly {
        ReadOnly {
            option,
            pending_read_index: HashMap::default(),
            read_index_queue: VecDeque::new(),
        }
    }

    /// Adds a read only request.
    ///
    /// `index` is the commit index when the request was received and `req`
    /// the original request, whose first entry carries the context.
    pub fn add_request(&mut self, index: u64, req: Message, self_id: u64) {
        let ctx = match req.entries.first() {
            Some(e) => e.data.clone(),
            None => return,
        };
        if self.pending_read_index.contains_key(&ctx) {
            return;
        }
        let mut acks = HashSet::<u64>::default();
        acks.insert(self_id);
        let status = ReadIndexStatus { req, index, acks };
        self.pending_read_index.insert(ctx.clone(), status);
        self.read_index_queue.push_back(ctx);
    }

    /// Records a heartbeat acknowledgement carrying `ctx` and returns every
    /// peer known to have acknowledged it.
    pub fn recv_ack(&mut self, id: u64, ctx: &[u8]) -> Option<&HashSet<u64>> {
        self.pending_read_index.get_mut(ctx).map(|rs| {
            rs.acks.insert(id);
            &rs.acks
        })
    }

    /// Dequeues every request up to and including the one with context `ctx`.
    /// Requests queued earlier are confirmed by the same round.
    pub fn advance(&mut self, ctx: &[u8]) -> Vec<ReadIndexStatus> {
        let i = match self.read_index_queue.iter().position(|x| x.as_ref() == ctx) {
            Some(i) => i,
            None => return vec![],
        };
        self.read_index_queue
            .drain(..=i)
            .filter_map(|rs| self.pending_read_index.remove(&rs))
            .collect()
    }

    /// Returns the context of the last pending read only request.
    pub fn last_pending_request_ctx(&self) -> Option<Bytes> {
        self.read_index_queue.back().cloned()
    }

    #[inline]
    pub fn pending_read_count(&self) -> usize {
        self.read_index_queue.len()
    }
}
