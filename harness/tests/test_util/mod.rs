// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

// Copyright 2015 CoreOS, Inc.
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

#![allow(dead_code)]

use bytes::Bytes;
use harness::*;
use multiraft::codec::Codec;
use multiraft::prelude::*;
use multiraft::storage::MemStorage;
use multiraft::{RaftLog, NO_LIMIT};
use slog::Logger;

#[allow(clippy::declare_interior_mutable_const)]
pub const NOP_STEPPER: Option<Interface> = Some(Interface { raft: None });

pub fn ltoa(raft_log: &RaftLog<MemStorage>) -> String {
    let mut s = format!("committed: {}\n", raft_log.committed);
    s = s + &format!("applied: {}\n", raft_log.applied);
    for (i, e) in raft_log.all_entries().iter().enumerate() {
        s = s + &format!("#{}: {:?}\n", i, e);
    }
    s
}

pub fn new_test_config(id: u64, election_tick: usize, heartbeat_tick: usize) -> Config {
    Config {
        id,
        election_tick,
        heartbeat_tick,
        max_size_per_msg: NO_LIMIT,
        max_inflight_msgs: 256,
        ..Default::default()
    }
}

pub fn new_test_raft_with_config(config: &Config, storage: MemStorage, l: &Logger) -> Interface {
    Interface::new(Raft::new(config, storage, l).unwrap())
}

pub fn new_test_raft(
    id: u64,
    peers: Vec<u64>,
    election: usize,
    heartbeat: usize,
    l: &Logger,
) -> Interface {
    let config = new_test_config(id, election, heartbeat);
    let storage = MemStorage::new_with_conf_state((peers, vec![]));
    new_test_raft_with_config(&config, storage, l)
}

pub const SOME_DATA: &[u8] = b"somedata";

pub fn new_message_with_entries(from: u64, to: u64, t: MessageType, ents: Vec<Entry>) -> Message {
    Message {
        from,
        to,
        msg_type: t,
        entries: ents,
        ..Default::default()
    }
}

pub fn new_message(from: u64, to: u64, t: MessageType, n: usize) -> Message {
    let ents = (0..n).map(|_| new_entry(0, 0, SOME_DATA)).collect();
    new_message_with_entries(from, to, t, ents)
}

pub fn new_entry(term: u64, index: u64, data: &'static [u8]) -> Entry {
    Entry::new(index, term, Bytes::from_static(data))
}

pub fn empty_entry(term: u64, index: u64) -> Entry {
    Entry::new(index, term, Bytes::new())
}

pub fn propose(from: u64, to: u64, data: &'static [u8]) -> Message {
    new_message_with_entries(from, to, MessageType::MsgPropose, vec![new_entry(0, 0, data)])
}

pub fn propose_conf_change(id: u64, cc: &ConfChange) -> Message {
    let e = Entry {
        entry_type: EntryType::EntryConfChange,
        data: cc.encode_to_bytes(),
        ..Default::default()
    };
    new_message_with_entries(id, id, MessageType::MsgPropose, vec![e])
}
