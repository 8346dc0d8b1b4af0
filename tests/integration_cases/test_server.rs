// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use multiraft::Error;

use crate::test_util::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_node_replication() {
    let cluster = Cluster::start(&[1, 2, 3]);
    let sms = cluster.create_group(1, &voters(&[1, 2, 3]), &[1, 2, 3], 1);
    let leader = cluster.wait_leader(1).await;
    assert_eq!(leader, 1);

    for i in 0..10u8 {
        let resp = cluster
            .server(leader)
            .propose(1, Bytes::from(vec![i]))
            .await
            .unwrap();
        assert_eq!(resp, Bytes::from(vec![i]));
    }

    let want: Vec<Bytes> = (0..10u8).map(|i| Bytes::from(vec![i])).collect();
    for (id, sm) in &sms {
        assert!(
            wait_for(|| sm.commands() == want).await,
            "node {}: commands = {:?}",
            id,
            sm.commands()
        );
    }
    // Every node reports the leader to its state machine.
    assert!(wait_for(|| sms.values().all(|sm| sm.leaders().last() == Some(&1))).await);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_requests_on_follower_are_rejected() {
    let cluster = Cluster::start(&[1, 2, 3]);
    cluster.create_group(1, &voters(&[1, 2, 3]), &[1, 2, 3], 1);
    let leader = cluster.wait_leader(1).await;
    let follower = if leader == 1 { 2 } else { 1 };

    let s = cluster.server(follower);
    assert_eq!(
        s.propose(1, Bytes::from_static(b"x")).await,
        Err(Error::NotLeader)
    );
    assert_eq!(s.read_index(1).await, Err(Error::NotLeader));
    assert_eq!(s.leader_term(1).unwrap().0, leader);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_index_after_writes() {
    let cluster = Cluster::start(&[1, 2, 3]);
    let sms = cluster.create_group(1, &voters(&[1, 2, 3]), &[1, 2, 3], 1);
    let leader = cluster.wait_leader(1).await;
    let s = cluster.server(leader);

    s.propose(1, Bytes::from_static(b"a")).await.unwrap();
    s.propose(1, Bytes::from_static(b"b")).await.unwrap();
    let reads: Vec<_> = (0..5).map(|_| s.read_index(1)).collect();
    for r in reads {
        r.await.unwrap();
        // A read resolves only once the state machine caught up.
        assert_eq!(
            sms[&leader].commands(),
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
    }
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_index_waits_for_lagging_apply() {
    let cluster = Cluster::start(&[1, 2, 3]);
    let sms: HashMap<u64, Arc<GatedStateMachine>> = [1, 2, 3]
        .iter()
        .map(|id| (*id, Arc::new(GatedStateMachine::default())))
        .collect();
    cluster.create_group_with(1, &voters(&[1, 2, 3]), &[1, 2, 3], 1, |id| sms[&id].clone());
    assert_eq!(cluster.wait_leader(1).await, 1);
    let s = cluster.server(1);
    let sm = &sms[&1];

    sm.close();
    let write = s.propose(1, Bytes::from_static(b"a"));
    // The write commits, the leader's state machine holds it at the gate.
    assert!(wait_for(|| sm.is_waiting()).await);
    let read = s.read_index(1);
    tokio::pin!(read);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), &mut read)
            .await
            .is_err(),
        "the read resolved before the write was applied"
    );
    assert!(sm.commands().is_empty());

    sm.open();
    read.await.unwrap();
    assert_eq!(sm.commands(), vec![Bytes::from_static(b"a")]);
    assert_eq!(write.await, Ok(Bytes::from_static(b"a")));
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_idle_groups_send_no_group_heartbeats() {
    let cluster = Cluster::start(&[1, 2, 3]);
    for group_id in 1..=10 {
        cluster.create_group(group_id, &voters(&[1, 2, 3]), &[1, 2, 3], 1);
    }
    for group_id in 1..=10 {
        assert_eq!(cluster.wait_leader(group_id).await, 1);
    }
    let terms: Vec<(u64, u64)> = (1..=10)
        .map(|g| cluster.server(2).leader_term(g).unwrap())
        .collect();

    let group_heartbeats = cluster.router.group_heartbeats();
    let seen = cluster.router.heartbeats().len();
    // Fifteen heartbeat rounds.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(cluster.router.group_heartbeats(), group_heartbeats);
    let all: Vec<u64> = (1..=10).collect();
    let rounds = cluster.router.heartbeats()[seen..]
        .iter()
        .filter(|(from, to, ids)| *from == 1 && *to == 2 && *ids == all)
        .count();
    assert!(rounds >= 5, "{} rounds of node heartbeats", rounds);
    // The node heartbeats alone keep every leader in place.
    let now: Vec<(u64, u64)> = (1..=10)
        .map(|g| cluster.server(2).leader_term(g).unwrap())
        .collect();
    assert_eq!(now, terms);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_groups_share_coalesced_heartbeats() {
    let cluster = Cluster::start(&[1, 2, 3]);
    for group_id in 1..=5 {
        cluster.create_group(group_id, &voters(&[1, 2, 3]), &[1, 2, 3], 1);
    }
    for group_id in 1..=5 {
        assert_eq!(cluster.wait_leader(group_id).await, 1);
    }

    let all: Vec<u64> = (1..=5).collect();
    assert!(
        wait_for(|| {
            cluster
                .router
                .heartbeats()
                .iter()
                .any(|(from, to, ids)| *from == 1 && *to == 2 && *ids == all)
        })
        .await
    );
    // Only the node leading the groups sends heartbeats, never to itself.
    for (from, to, ids) in cluster.router.heartbeats() {
        assert_eq!(from, 1);
        assert_ne!(to, 1);
        assert!(!ids.is_empty() && ids.len() <= 5, "{:?}", ids);
    }

    // Removing a group on the leader takes it out of the heartbeats.
    cluster.server(1).remove(5).await.unwrap();
    let seen = cluster.router.heartbeats().len();
    assert!(
        wait_for(|| {
            cluster.router.heartbeats()[seen..]
                .iter()
                .any(|(from, _, ids)| *from == 1 && *ids == vec![1, 2, 3, 4])
        })
        .await
    );
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_transfer() {
    let cluster = Cluster::start(&[1, 2, 3]);
    let sms = cluster.create_group(1, &voters(&[1, 2, 3]), &[1, 2, 3], 1);
    assert_eq!(cluster.wait_leader(1).await, 1);
    cluster
        .server(1)
        .propose(1, Bytes::from_static(b"a"))
        .await
        .unwrap();

    cluster.server(1).transfer_leader(1, 2).unwrap();
    assert!(wait_for(|| cluster.server(2).is_leader(1)).await);
    assert_eq!(cluster.wait_leader(1).await, 2);
    let (_, term) = cluster.server(2).leader_term(1).unwrap();
    assert!(term >= 2, "term {}", term);
    assert!(wait_for(|| sms[&1].leaders().last() == Some(&2)).await);

    cluster
        .server(2)
        .propose(1, Bytes::from_static(b"b"))
        .await
        .unwrap();
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolated_leader_loses_group() {
    let cluster = Cluster::start(&[1, 2, 3]);
    cluster.create_group(1, &voters(&[1, 2, 3]), &[1, 2, 3], 1);
    assert_eq!(cluster.wait_leader(1).await, 1);

    cluster.router.isolate(1);
    let pending = cluster.server(1).propose(1, Bytes::from_static(b"lost"));
    // The old leader steps down on lost quorum and fails what it still holds.
    assert_eq!(pending.await, Err(Error::NotLeader));
    assert!(
        wait_for(|| {
            [2, 3].iter().any(|id| cluster.server(*id).is_leader(1))
        })
        .await
    );

    cluster.router.recover();
    let leader = cluster.wait_leader(1).await;
    assert_ne!(leader, 1);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_status_and_stop() {
    let cluster = Cluster::start(&[1, 2, 3]);
    cluster.create_group(7, &voters(&[1, 2, 3]), &[1, 2, 3], 1);
    assert_eq!(cluster.wait_leader(7).await, 1);
    let s = cluster.server(1);
    s.propose(7, Bytes::from_static(b"a")).await.unwrap();

    let status = s.status(7).await.unwrap();
    assert_eq!(status.group_id, 7);
    assert_eq!(status.id, 1);
    assert!(status.applied >= 2);
    assert_eq!(status.progress.len(), 3);
    assert_eq!(s.status(8).await.err(), Some(Error::RaftNotExists(8)));

    cluster.stop().await;
    assert_eq!(
        s.propose(7, Bytes::from_static(b"b")).await,
        Err(Error::RaftNotExists(7))
    );
}
