// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

use harness::*;
use multiraft::codec::Codec;
use multiraft::prelude::*;
use multiraft::{default_logger, StateRole, NO_LIMIT};

use crate::test_util::*;

fn elected_network() -> Network {
    let l = default_logger();
    let mut nt = Network::new(vec![None, None, None], &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);
    assert_eq!(nt.peers[&1].state, StateRole::Leader);
    // The leader refuses membership changes until its first entry is applied.
    nt.peers.get_mut(&1).unwrap().commit_apply(1).unwrap();
    nt
}

fn apply_everywhere(nt: &mut Network, cc: &ConfChange) {
    for (id, p) in nt.peers.iter_mut() {
        if let Err(e) = p.apply_conf_change(cc) {
            panic!("{}: apply {:?}: {:?}", id, cc, e);
        }
    }
}

#[test]
fn test_explicit_joint_consensus() {
    let mut nt = elected_network();
    let cc = ConfChange {
        transition: ConfChangeTransition::Explicit,
        changes: vec![new_conf_change_single(3, ConfChangeType::RemoveNode)],
        ..Default::default()
    };
    nt.send(vec![propose_conf_change(1, &cc)]);
    assert_eq!(nt.peers[&1].raft_log.committed, 2);
    apply_everywhere(&mut nt, &cc);

    let cs = nt.peers[&1].prs().conf().to_conf_state();
    assert_eq!(cs.voters, vec![1, 2]);
    assert_eq!(cs.voters_outgoing, vec![1, 2, 3]);
    assert!(!cs.auto_leave);

    // An explicit transition stays joint until asked to leave.
    nt.peers.get_mut(&1).unwrap().commit_apply(2).unwrap();
    assert_eq!(nt.peers[&1].raft_log.last_index(), 2);

    let leave = ConfChange::leave();
    nt.send(vec![propose_conf_change(1, &leave)]);
    assert_eq!(nt.peers[&1].raft_log.committed, 3);
    apply_everywhere(&mut nt, &leave);
    let cs = nt.peers[&1].prs().conf().to_conf_state();
    assert_eq!(cs.voters, vec![1, 2]);
    assert!(cs.voters_outgoing.is_empty());
    nt.peers.get_mut(&1).unwrap().commit_apply(3).unwrap();

    // Node 3 no longer counts toward the quorum.
    nt.isolate(3);
    nt.send(vec![propose(1, 1, SOME_DATA)]);
    assert_eq!(nt.peers[&1].raft_log.committed, 4);
}

#[test]
fn test_implicit_joint_consensus_leaves_automatically() {
    let mut nt = elected_network();
    let cc = ConfChange {
        transition: ConfChangeTransition::Implicit,
        changes: vec![new_conf_change_single(4, ConfChangeType::AddLearnerNode)],
        ..Default::default()
    };
    nt.send(vec![propose_conf_change(1, &cc)]);
    assert_eq!(nt.peers[&1].raft_log.committed, 2);
    apply_everywhere(&mut nt, &cc);
    assert!(nt.peers[&1].prs().conf().to_conf_state().auto_leave);

    // Applying the joint entry makes the leader append the leave entry.
    nt.peers.get_mut(&1).unwrap().commit_apply(2).unwrap();
    let msgs = nt.read_messages();
    nt.send(msgs);

    let leader = &nt.peers[&1];
    assert_eq!(leader.raft_log.committed, 3);
    let ents = leader.raft_log.entries(3, NO_LIMIT).unwrap();
    assert_eq!(ents[0].entry_type, EntryType::EntryConfChange);
    let leave = ConfChange::decode_from(&ents[0].data).unwrap();
    assert!(leave.leave_joint());
}

#[test]
fn test_pending_conf_change_is_refused() {
    let mut nt = elected_network();
    let cc = ConfChange::new(vec![new_conf_change_single(
        4,
        ConfChangeType::AddLearnerNode,
    )]);
    nt.send(vec![propose_conf_change(1, &cc)]);
    // The first change is not applied yet, so the second turns into a no-op.
    let other = ConfChange::new(vec![new_conf_change_single(5, ConfChangeType::AddLearnerNode)]);
    nt.send(vec![propose_conf_change(1, &other)]);

    let ents = nt.peers[&1].raft_log.entries(2, NO_LIMIT).unwrap();
    assert_eq!(ents.len(), 2);
    assert_eq!(ents[0].entry_type, EntryType::EntryConfChange);
    assert_eq!(ents[1].entry_type, EntryType::EntryNormal);
    assert!(ents[1].data.is_empty());
}

#[test]
fn test_leave_outside_joint_is_refused() {
    let mut nt = elected_network();
    nt.send(vec![propose_conf_change(1, &ConfChange::leave())]);
    let ents = nt.peers[&1].raft_log.entries(2, NO_LIMIT).unwrap();
    assert_eq!(ents[0].entry_type, EntryType::EntryNormal);
}

#[test]
fn test_removing_all_voters_fails() {
    let mut nt = elected_network();
    let cc = ConfChange::new(vec![
        new_conf_change_single(1, ConfChangeType::RemoveNode),
        new_conf_change_single(2, ConfChangeType::RemoveNode),
        new_conf_change_single(3, ConfChangeType::RemoveNode),
    ]);
    let leader = nt.peers.get_mut(&1).unwrap();
    assert!(leader.apply_conf_change(&cc).is_err());
    assert_eq!(
        leader.prs().conf().to_conf_state().voters,
        vec![1, 2, 3]
    );
}
