// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use bytes::Bytes;

use crate::test_util::*;

// A group that cannot persist its state reports the error once and is
// taken down, while the server keeps running.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_persist_failure_stops_group() {
    let scenario = fail::FailScenario::setup();
    let cluster = Cluster::start(&[1]);
    let sms = cluster.create_group(1, &voters(&[1]), &[1], 1);
    assert_eq!(cluster.wait_leader(1).await, 1);
    let server = cluster.server(1);
    server.propose(1, Bytes::from_static(b"a")).await.unwrap();

    fail::cfg("before_persist_ready", "return").unwrap();
    assert!(server.propose(1, Bytes::from_static(b"b")).await.is_err());
    assert!(wait_for(|| server.group_ids().is_empty()).await);
    let fatal = sms[&1].fatal();
    assert_eq!(fatal.len(), 1, "{:?}", fatal);
    assert!(fatal[0].contains("invariant violated"), "{}", fatal[0]);
    assert_eq!(sms[&1].commands(), vec![Bytes::from_static(b"a")]);
    fail::remove("before_persist_ready");

    // Other groups are still served.
    let sms = cluster.create_group(2, &voters(&[1]), &[1], 1);
    assert_eq!(cluster.wait_leader(2).await, 1);
    server.propose(2, Bytes::from_static(b"c")).await.unwrap();
    assert_eq!(sms[&1].commands(), vec![Bytes::from_static(b"c")]);
    cluster.stop().await;
    scenario.teardown();
}
