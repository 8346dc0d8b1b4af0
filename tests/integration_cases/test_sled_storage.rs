// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use bytes::Bytes;
use multiraft::prelude::*;
use multiraft::{GroupConfig, SledStorage};

use crate::test_util::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_from_sled() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = sled::open(dir.path())?;
    let cmds = vec![
        Bytes::from_static(b"a"),
        Bytes::from_static(b"b"),
        Bytes::from_static(b"c"),
    ];

    let term = {
        let cluster = Cluster::start(&[1]);
        for group_id in [1, 2] {
            let mut group = GroupConfig::new(
                group_id,
                voters(&[1]),
                Arc::new(SledStorage::open(&db, group_id)?),
                Arc::new(MemStateMachine::default()),
            );
            group.set_leader(1);
            cluster.server(1).create(group)?;
            cluster.wait_leader(group_id).await;
        }
        for cmd in &cmds {
            cluster.server(1).propose(1, cmd.clone()).await?;
        }
        let (_, term) = cluster.server(1).leader_term(1)?;
        cluster.stop().await;
        term
    };

    let storage = SledStorage::open(&db, 1)?;
    let state = storage.initial_state()?;
    assert_eq!(state.conf_state.voters, vec![1]);
    assert_eq!(state.hard_state.term, term);
    assert_eq!(state.hard_state.commit, 4);
    assert_eq!(storage.last_index()?, 4);
    assert_eq!(storage.applied_index()?, 4);
    // Groups never share a log.
    assert_eq!(SledStorage::open(&db, 2)?.last_index()?, 1);

    // Asking for applied index 0 replays the whole log into a fresh state machine.
    let cluster = Cluster::start(&[1]);
    let sm = Arc::new(MemStateMachine::default());
    let mut group = GroupConfig::new(1, voters(&[1]), Arc::new(storage), sm.clone());
    group.set_applied(0);
    cluster.server(1).create(group)?;
    cluster.wait_leader(1).await;
    assert!(wait_for(|| sm.commands() == cmds).await);

    let resp = cluster.server(1).propose(1, Bytes::from_static(b"d")).await?;
    assert_eq!(resp, Bytes::from_static(b"d"));
    let (_, second_term) = cluster.server(1).leader_term(1)?;
    assert!(second_term > term);
    cluster.stop().await;

    // Without an applied index the group resumes after the last applied entry.
    let storage = SledStorage::open(&db, 1)?;
    let applied = storage.applied_index()?;
    assert_eq!(applied, storage.last_index()?);
    let cluster = Cluster::start(&[1]);
    let sm = Arc::new(MemStateMachine::default());
    cluster.server(1).create(GroupConfig::new(
        1,
        voters(&[1]),
        Arc::new(storage),
        sm.clone(),
    ))?;
    cluster.wait_leader(1).await;
    let resp = cluster.server(1).propose(1, Bytes::from_static(b"e")).await?;
    assert_eq!(resp, Bytes::from_static(b"e"));
    assert_eq!(sm.commands(), vec![Bytes::from_static(b"e")]);
    assert!(cluster.server(1).leader_term(1)?.1 > second_term);
    cluster.stop().await;
    Ok(())
}
