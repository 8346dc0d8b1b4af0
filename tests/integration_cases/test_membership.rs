// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

use bytes::Bytes;
use multiraft::prelude::*;

use crate::test_util::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_add_learner_then_remove_voter() {
    let cluster = Cluster::start(&[1, 2, 3, 4]);
    let sms = cluster.create_group(1, &voters(&[1, 2, 3]), &[1, 2, 3], 1);
    assert_eq!(cluster.wait_leader(1).await, 1);
    let leader = cluster.server(1);
    leader.propose(1, Bytes::from_static(b"a")).await.unwrap();

    let cc = ConfChange::new(vec![new_conf_change_single(
        4,
        ConfChangeType::AddLearnerNode,
    )]);
    let resp = leader.propose_member_change(1, cc).await.unwrap();
    assert_eq!(resp, Bytes::from_static(b"changed"));
    let peers = leader.group(1).unwrap().peers();
    assert!(
        peers
            .iter()
            .any(|p| p.id == 4 && p.peer_type == PeerType::NonVoting),
        "{:?}",
        peers
    );
    for sm in sms.values() {
        assert!(wait_for(|| sm.member_changes() == 1).await);
    }

    // The learner catches up from the start of the log.
    let mut all = voters(&[1, 2, 3]);
    all.push(Peer::learner(4));
    let sm4 = cluster.create_group(1, &all, &[4], 1)[&4].clone();
    leader.propose(1, Bytes::from_static(b"b")).await.unwrap();
    let want = vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")];
    assert!(
        wait_for(|| sm4.commands() == want).await,
        "learner has {:?}",
        sm4.commands()
    );
    assert!(!cluster.server(4).is_leader(1));

    let cc = ConfChange::new(vec![new_conf_change_single(3, ConfChangeType::RemoveNode)]);
    leader.propose_member_change(1, cc).await.unwrap();
    let peers = leader.group(1).unwrap().peers();
    assert!(peers.iter().all(|p| p.id != 3), "{:?}", peers);

    // Two voters out of two make the quorum now.
    cluster.router.isolate(3);
    leader.propose(1, Bytes::from_static(b"c")).await.unwrap();
    assert!(wait_for(|| sm4.commands().len() == 3).await);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_removing_last_voter_is_refused() {
    let cluster = Cluster::start(&[1]);
    cluster.create_group(1, &voters(&[1]), &[1], 1);
    assert_eq!(cluster.wait_leader(1).await, 1);

    let cc = ConfChange::new(vec![new_conf_change_single(1, ConfChangeType::RemoveNode)]);
    match cluster.server(1).propose_member_change(1, cc).await {
        Err(multiraft::Error::ConfChangeError(_)) => {}
        res => panic!("unexpected result {:?}", res),
    }
    // The group keeps serving.
    cluster
        .server(1)
        .propose(1, Bytes::from_static(b"a"))
        .await
        .unwrap();
    cluster.stop().await;
}
