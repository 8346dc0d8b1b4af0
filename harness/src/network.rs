// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::{HashMap, HashSet};

use multiraft::message::{ConfState, Message, MessageType};
use multiraft::storage::MemStorage;
use multiraft::{Config, Raft, Result, NO_LIMIT};
use slog::Logger;

use super::interface::Interface;

/// A group of raft peers wired to each other in memory.
///
/// Messages move only when the test calls [`Network::send`], which keeps
/// stepping responses until the group is quiet. Links can be severed with
/// [`Network::cut`] or [`Network::isolate`] and message types can be
/// swallowed with [`Network::ignore`].
#[derive(Default)]
pub struct Network {
    /// The peers, keyed by their ids `1..=n`.
    pub peers: HashMap<u64, Interface>,
    severed: HashSet<(u64, u64)>,
    ignored: HashSet<MessageType>,
}

impl Network {
    /// The config every peer built by [`Network::new`] starts from.
    pub fn default_config() -> Config {
        Config {
            election_tick: 10,
            heartbeat_tick: 1,
            max_size_per_msg: NO_LIMIT,
            max_inflight_msgs: 256,
            ..Default::default()
        }
    }

    /// Builds a network where peer `i + 1` is `peers[i]`. A `None` slot gets
    /// a fresh voter of a group made of every slot.
    pub fn new(peers: Vec<Option<Interface>>, l: &Logger) -> Network {
        Network::new_with_config(peers, &Network::default_config(), l)
    }

    /// Like [`Network::new`] with fresh voters built from `config`.
    pub fn new_with_config(peers: Vec<Option<Interface>>, config: &Config, l: &Logger) -> Network {
        let voters: Vec<u64> = (1..=peers.len() as u64).collect();
        let mut network = Network::default();
        for (id, peer) in voters.iter().copied().zip(peers) {
            let peer = peer.unwrap_or_else(|| {
                let store = MemStorage::new_with_conf_state(ConfState::from((voters.clone(), vec![])));
                let mut config = config.clone();
                config.id = id;
                Interface::new(Raft::new(&config, store, l).unwrap())
            });
            if let Some(raft) = &peer.raft {
                assert_eq!(raft.id, id, "peer {} in wrong position", raft.id);
            }
            network.peers.insert(id, peer);
        }
        network
    }

    /// Swallows every message of type `t` from now on.
    pub fn ignore(&mut self, t: MessageType) {
        self.ignored.insert(t);
    }

    fn deliverable(&self, m: &Message) -> bool {
        assert_ne!(m.msg_type, MessageType::MsgHup, "hups are local");
        !self.ignored.contains(&m.msg_type) && !self.severed.contains(&(m.from, m.to))
    }

    /// Drains the outboxes of all peers, unfiltered.
    pub fn read_messages(&mut self) -> Vec<Message> {
        self.peers
            .values_mut()
            .flat_map(Interface::read_messages)
            .collect()
    }

    /// Steps `msgs` into their peers and keeps delivering the responses
    /// until none are left. `msgs` themselves are never filtered.
    pub fn send(&mut self, mut msgs: Vec<Message>) {
        while !msgs.is_empty() {
            let mut next = vec![];
            for m in msgs.drain(..) {
                let Some(peer) = self.peers.get_mut(&m.to) else {
                    continue;
                };
                let _ = peer.step(m);
                let resp = peer.read_messages();
                next.extend(resp.into_iter().filter(|m| self.deliverable(m)));
            }
            msgs = next;
        }
    }

    /// Makes every peer's unstable entries and snapshot durable.
    pub fn persist(&mut self) -> Result<()> {
        for p in self.peers.values_mut() {
            p.persist()?;
        }
        Ok(())
    }

    /// Severs the link between `one` and `other` in both directions.
    pub fn cut(&mut self, one: u64, other: u64) {
        self.severed.insert((one, other));
        self.severed.insert((other, one));
    }

    /// Severs every link of `id`.
    pub fn isolate(&mut self, id: u64) {
        let others: Vec<u64> = self.peers.keys().copied().filter(|p| *p != id).collect();
        for other in others {
            self.cut(id, other);
        }
    }

    /// Restores every link and stops ignoring message types.
    pub fn recover(&mut self) {
        self.severed.clear();
        self.ignored.clear();
    }
}
