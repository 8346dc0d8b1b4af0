// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::mem;
use std::ops::{Deref, DerefMut};

use multiraft::message::Message;
use multiraft::storage::MemStorage;
use multiraft::{Raft, Result};

/// One slot of a [`Network`](crate::Network).
///
/// An empty slot swallows whatever is sent to it and never answers, standing
/// in for a peer that is down.
pub struct Interface {
    /// The peer, `None` for a slot that is down.
    pub raft: Option<Raft<MemStorage>>,
}

impl Interface {
    /// A slot holding `r`.
    pub fn new(r: Raft<MemStorage>) -> Interface {
        Interface { raft: Some(r) }
    }

    /// Steps `m` into the peer.
    pub fn step(&mut self, m: Message) -> Result<()> {
        match &mut self.raft {
            Some(r) => r.step(m),
            None => Ok(()),
        }
    }

    /// Takes the messages the peer has queued.
    pub fn read_messages(&mut self) -> Vec<Message> {
        self.raft
            .as_mut()
            .map(|r| mem::take(&mut r.msgs))
            .unwrap_or_default()
    }

    /// Writes the unstable snapshot and entries to the peer's store.
    pub fn persist(&mut self) -> Result<()> {
        let Some(r) = &mut self.raft else {
            return Ok(());
        };
        if let Some(meta) = r.raft_log.pending_snapshot().cloned() {
            r.raft_log.persist_snapshot(&meta)?;
        }
        let unstable = r.raft_log.unstable_entries().to_vec();
        r.raft_log.persist_entries(&unstable)
    }
}

impl Deref for Interface {
    type Target = Raft<MemStorage>;
    fn deref(&self) -> &Raft<MemStorage> {
        self.raft.as_ref().expect("peer is down")
    }
}

impl DerefMut for Interface {
    fn deref_mut(&mut self) -> &mut Raft<MemStorage> {
        self.raft.as_mut().expect("peer is down")
    }
}
