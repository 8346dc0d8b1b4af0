// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use bytes::Bytes;

use crate::test_util::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lagging_follower_is_restored_from_snapshot() {
    let cluster = Cluster::start_with_config(&[1, 2, 3], |id| {
        let mut cfg = test_config(id);
        cfg.retain_logs = 1;
        cfg
    });
    let sms = cluster.create_group(1, &voters(&[1, 2, 3]), &[1, 2, 3], 1);
    assert_eq!(cluster.wait_leader(1).await, 1);
    let leader = cluster.server(1);

    cluster.router.isolate(3);
    let want: Vec<Bytes> = (0..20u8).map(|i| Bytes::from(vec![i])).collect();
    for cmd in &want {
        leader.propose(1, cmd.clone()).await.unwrap();
    }
    let mut compacted = false;
    for _ in 0..500 {
        if leader.status(1).await.unwrap().first_index > 10 {
            compacted = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(compacted, "log was not compacted");
    assert!(sms[&3].commands().is_empty());

    cluster.router.recover();
    assert!(
        wait_for(|| sms[&3].commands() == want).await,
        "follower has {:?}",
        sms[&3].commands()
    );
    assert!(wait_for(|| sms[&3].applied() == sms[&1].applied()).await);

    // Replication goes on from the snapshot.
    leader.propose(1, Bytes::from_static(b"after")).await.unwrap();
    assert!(wait_for(|| sms[&3].commands().len() == 21).await);
    cluster.stop().await;
}
