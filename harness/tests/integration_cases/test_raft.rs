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

use bytes::Bytes;
use harness::*;
use multiraft::prelude::*;
use multiraft::{default_logger, StateRole, NO_LIMIT};

use crate::test_util::*;

fn test_leader_election_with_config(pre_vote: bool) {
    let l = default_logger();
    let mut config = Network::default_config();
    config.pre_vote = pre_vote;
    let mut tests = vec![
        (
            Network::new_with_config(vec![None, None, None], &config, &l),
            StateRole::Leader,
            1,
        ),
        (
            Network::new_with_config(vec![None, None, NOP_STEPPER], &config, &l),
            StateRole::Leader,
            1,
        ),
        (
            Network::new_with_config(vec![None, NOP_STEPPER, NOP_STEPPER], &config, &l),
            StateRole::Candidate,
            1,
        ),
        (
            Network::new_with_config(vec![None, NOP_STEPPER, NOP_STEPPER, None], &config, &l),
            StateRole::Candidate,
            1,
        ),
        (
            Network::new_with_config(
                vec![None, NOP_STEPPER, NOP_STEPPER, None, None],
                &config,
                &l,
            ),
            StateRole::Leader,
            1,
        ),
    ];

    for (i, &mut (ref mut network, state, term)) in tests.iter_mut().enumerate() {
        network.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);
        let raft = &network.peers[&1];
        let (exp_state, exp_term) = if state == StateRole::Candidate && pre_vote {
            // In pre-vote mode, an election that fails to complete
            // leaves the node in pre-candidate state without advancing
            // the term.
            (StateRole::PreCandidate, 0)
        } else {
            (state, term)
        };
        if raft.state != exp_state {
            panic!("#{}: state = {:?}, want {:?}", i, raft.state, exp_state);
        }
        if raft.term != exp_term {
            panic!("#{}: term = {}, want {}", i, raft.term, exp_term)
        }
    }
}

#[test]
fn test_leader_election() {
    test_leader_election_with_config(false);
}

#[test]
fn test_leader_election_pre_vote() {
    test_leader_election_with_config(true);
}

#[test]
fn test_log_replication() {
    let l = default_logger();
    let tests = vec![
        (vec![propose(1, 1, SOME_DATA)], 2),
        // A follower forwards the proposal to its leader.
        (vec![propose(2, 2, SOME_DATA)], 2),
        (vec![propose(1, 1, SOME_DATA), propose(2, 2, b"other")], 3),
    ];

    for (i, (msgs, wcommitted)) in tests.into_iter().enumerate() {
        let mut network = Network::new(vec![None, None, None], &l);
        network.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);
        for m in msgs {
            network.send(vec![m]);
        }

        for (j, x) in &network.peers {
            if x.raft_log.committed != wcommitted {
                panic!(
                    "#{}.{}: committed = {}, want {}",
                    i, j, x.raft_log.committed, wcommitted
                );
            }
            let ents: Vec<Entry> = x
                .raft_log
                .entries(2, NO_LIMIT)
                .unwrap()
                .into_iter()
                .filter(|e| !e.data.is_empty())
                .collect();
            if ents.is_empty() || ents[0].data != Bytes::from_static(SOME_DATA) {
                panic!("#{}.{}: entries = {:?}, want somedata first", i, j, ents);
            }
        }
    }
}

#[test]
fn test_single_node_commit() {
    let l = default_logger();
    let mut tt = Network::new(vec![None], &l);
    tt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);
    tt.send(vec![propose(1, 1, SOME_DATA)]);
    tt.send(vec![propose(1, 1, SOME_DATA)]);
    assert_eq!(tt.peers[&1].raft_log.committed, 3);
}

// An isolated leader keeps appending, but what it appended alone is
// overwritten once it rejoins a cluster that moved on without it.
#[test]
fn test_stale_leader_log_is_overwritten() {
    let l = default_logger();
    let mut tt = Network::new(vec![None, None, None], &l);
    tt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);
    assert_eq!(tt.peers[&1].state, StateRole::Leader);

    tt.isolate(1);
    tt.send(vec![propose(1, 1, b"lost")]);
    assert_eq!(tt.peers[&1].raft_log.last_index(), 2);
    assert_eq!(tt.peers[&1].raft_log.committed, 1);

    tt.send(vec![new_message(2, 2, MessageType::MsgHup, 0)]);
    assert_eq!(tt.peers[&2].state, StateRole::Leader);
    assert_eq!(tt.peers[&2].term, 2);
    tt.send(vec![propose(2, 2, b"kept")]);
    assert_eq!(tt.peers[&2].raft_log.committed, 3);

    tt.recover();
    tt.send(vec![new_message(2, 2, MessageType::MsgBeat, 0)]);

    let old = &tt.peers[&1];
    assert_eq!(old.state, StateRole::Follower);
    assert_eq!(old.leader_id, 2);
    assert_eq!(old.raft_log.term(2), Ok(2), "{}", ltoa(&old.raft_log));
    assert_eq!(old.raft_log.last_index(), 3);
    assert_eq!(old.raft_log.committed, 3);
    let ents = old.raft_log.entries(3, NO_LIMIT).unwrap();
    assert_eq!(ents[0].data, Bytes::from_static(b"kept"));
}

#[test]
fn test_leader_transfer() {
    let l = default_logger();
    let mut nt = Network::new(vec![None, None, None], &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);

    // The transferee asks the leader, which makes it time out at once.
    nt.send(vec![new_message(2, 1, MessageType::MsgTransferLeader, 0)]);
    assert_eq!(nt.peers[&2].state, StateRole::Leader);
    assert_eq!(nt.peers[&2].term, 2);
    assert_eq!(nt.peers[&1].state, StateRole::Follower);
    assert_eq!(nt.peers[&1].leader_id, 2);
    assert_eq!(nt.peers[&3].leader_id, 2);
}

#[test]
fn test_leader_transfer_to_self_is_ignored() {
    let l = default_logger();
    let mut nt = Network::new(vec![None, None, None], &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);
    nt.send(vec![new_message(1, 1, MessageType::MsgTransferLeader, 0)]);
    assert_eq!(nt.peers[&1].state, StateRole::Leader);
    assert_eq!(nt.peers[&1].term, 1);
}

#[test]
fn test_leader_steps_down_on_lost_quorum() {
    let l = default_logger();
    let mut config = Network::default_config();
    config.check_quorum = true;
    let mut nt = Network::new_with_config(vec![None, None, None], &config, &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);
    assert_eq!(nt.peers[&1].state, StateRole::Leader);

    nt.isolate(1);
    // The first quorum check still sees the acks of the election.
    for _ in 0..2 * config.election_tick {
        nt.peers.get_mut(&1).unwrap().tick();
    }
    assert_eq!(nt.peers[&1].state, StateRole::Follower);
    assert_eq!(nt.peers[&1].term, 1);
}

#[test]
fn test_read_index() {
    let l = default_logger();
    let mut nt = Network::new(vec![None, None, None], &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);
    nt.send(vec![propose(1, 1, SOME_DATA)]);

    let tests: Vec<(u64, &'static [u8])> =
        vec![(1, &b"ctx1"[..]), (2, &b"ctx2"[..]), (3, &b"ctx3"[..])];
    for (i, (id, ctx)) in tests.into_iter().enumerate() {
        nt.send(vec![new_message_with_entries(
            id,
            id,
            MessageType::MsgReadIndex,
            vec![new_entry(0, 0, ctx)],
        )]);
        let r = nt.peers.get_mut(&id).unwrap();
        let read_states: Vec<ReadState> = r.read_states.drain(..).collect();
        if read_states.len() != 1 {
            panic!("#{}: read_states = {:?}, want one", i, read_states);
        }
        let rs = &read_states[0];
        if rs.index != 2 {
            panic!("#{}: read index = {}, want 2", i, rs.index);
        }
        if rs.request_ctx != Bytes::from_static(ctx) {
            panic!("#{}: request ctx = {:?}, want {:?}", i, rs.request_ctx, ctx);
        }
    }
}

#[test]
fn test_read_index_without_leader_is_dropped() {
    let l = default_logger();
    let mut nt = Network::new(vec![None, None, None], &l);
    nt.send(vec![new_message_with_entries(
        2,
        2,
        MessageType::MsgReadIndex,
        vec![new_entry(0, 0, b"ctx")],
    )]);
    assert!(nt.peers[&2].read_states.is_empty());
    assert!(nt.peers[&1].read_states.is_empty());
}

#[test]
fn test_dropped_messages_are_retried() {
    let l = default_logger();
    let mut nt = Network::new(vec![None, None, None], &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);
    nt.cut(1, 3);
    nt.send(vec![propose(1, 1, SOME_DATA)]);
    assert_eq!(nt.peers[&1].raft_log.committed, 2);
    assert_eq!(nt.peers[&3].raft_log.last_index(), 1);

    nt.recover();
    nt.send(vec![new_message(1, 1, MessageType::MsgBeat, 0)]);
    assert_eq!(nt.peers[&3].raft_log.last_index(), 2);
    assert_eq!(nt.peers[&3].raft_log.committed, 2);
}
