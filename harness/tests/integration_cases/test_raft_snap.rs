// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use harness::*;
use multiraft::prelude::*;
use multiraft::{default_logger, ProgressState, StateRole};

use crate::test_util::*;

// Builds a cluster where node 3 missed entries the leader already compacted.
fn lagging_follower_network() -> Network {
    let l = default_logger();
    let mut nt = Network::new(vec![None, None, None], &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);
    assert_eq!(nt.peers[&1].state, StateRole::Leader);

    nt.isolate(3);
    for _ in 0..3 {
        nt.send(vec![propose(1, 1, SOME_DATA)]);
    }
    assert_eq!(nt.peers[&1].raft_log.committed, 4);
    assert_eq!(nt.peers[&3].raft_log.last_index(), 1);

    nt.persist().unwrap();
    let leader = nt.peers.get_mut(&1).unwrap();
    leader.commit_apply(4).unwrap();
    leader.raft_log.compact(4).unwrap();
    assert_eq!(leader.raft_log.first_index(), 4);
    nt
}

#[test]
fn test_snapshot_to_lagging_follower() {
    let mut nt = lagging_follower_network();
    nt.recover();
    nt.send(vec![new_message(1, 1, MessageType::MsgBeat, 0)]);

    let follower = &nt.peers[&3];
    assert_eq!(follower.raft_log.committed, 4);
    let meta = follower.raft_log.pending_snapshot().unwrap();
    assert_eq!(meta.index, 4);
    assert_eq!(meta.term, 1);
    assert_eq!(meta.conf_state.voters, vec![1, 2, 3]);

    let pr = nt.peers[&1].prs().get(3).unwrap();
    assert_eq!(pr.matched, 4);
    assert_ne!(pr.state, ProgressState::Snapshot);
}

#[test]
fn test_snapshot_failure_restarts_single_appends() {
    let mut nt = lagging_follower_network();
    nt.recover();
    // The snapshot never reaches node 3.
    nt.ignore(MessageType::MsgSnapshot);
    nt.send(vec![new_message(1, 1, MessageType::MsgBeat, 0)]);
    {
        let pr = nt.peers[&1].prs().get(3).unwrap();
        assert_eq!(pr.state, ProgressState::Snapshot);
        assert_eq!(pr.pending_snapshot, 4);
    }

    let mut m = new_message(3, 1, MessageType::MsgSnapStatus, 0);
    m.reject = true;
    nt.peers.get_mut(&1).unwrap().step(m).unwrap();
    let pr = nt.peers[&1].prs().get(3).unwrap();
    assert_eq!(pr.state, ProgressState::Probe);
    assert_eq!(pr.pending_snapshot, 0);
    assert!(pr.paused);
}

#[test]
fn test_stale_snapshot_is_ignored() {
    let l = default_logger();
    let mut nt = Network::new(vec![None, None, None], &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);
    nt.send(vec![propose(1, 1, SOME_DATA)]);

    let mut m = new_message(1, 2, MessageType::MsgSnapshot, 0);
    m.term = 1;
    m.snapshot = Some(SnapshotMetadata {
        index: 1,
        term: 1,
        conf_state: ConfState::from((vec![1, 2, 3], Vec::<u64>::new())),
        peers: vec![],
    });
    let follower = nt.peers.get_mut(&2).unwrap();
    follower.step(m).unwrap();
    assert!(follower.raft_log.pending_snapshot().is_none());
    assert_eq!(follower.raft_log.committed, 2);
    let resp = follower.read_messages();
    assert_eq!(resp.len(), 1);
    assert_eq!(resp[0].msg_type, MessageType::MsgAppendResponse);
    assert_eq!(resp[0].index, 2);
}
