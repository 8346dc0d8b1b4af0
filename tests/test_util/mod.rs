// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use multiraft::codec::decode_heartbeat_context;
use multiraft::prelude::*;
use multiraft::{default_logger, Error, GroupConfig, MemStorage, Result, Server, ServerConfig};
use slog::Logger;
use tokio::runtime::Handle;

/// Settings fast enough for tests: a 10ms tick, elections after 100ms.
pub fn test_config(id: u64) -> ServerConfig {
    let mut cfg = ServerConfig::new(id);
    cfg.tick_interval = Duration::from_millis(10);
    cfg.heartbeat_tick = 2;
    cfg.election_tick = 10;
    cfg
}

/// Polls `cond` for up to five seconds.
pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// A state machine keeping every applied command in memory.
#[derive(Default)]
pub struct MemStateMachine {
    commands: Mutex<Vec<Bytes>>,
    applied: AtomicU64,
    member_changes: AtomicUsize,
    leaders: Mutex<Vec<u64>>,
    fatal: Mutex<Vec<String>>,
}

impl MemStateMachine {
    pub fn commands(&self) -> Vec<Bytes> {
        self.commands.lock().unwrap().clone()
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    pub fn member_changes(&self) -> usize {
        self.member_changes.load(Ordering::SeqCst)
    }

    pub fn leaders(&self) -> Vec<u64> {
        self.leaders.lock().unwrap().clone()
    }

    pub fn fatal(&self) -> Vec<String> {
        self.fatal.lock().unwrap().clone()
    }
}

impl StateMachine for MemStateMachine {
    fn apply(&self, command: &[u8], index: u64) -> Result<Bytes> {
        let cmd = Bytes::copy_from_slice(command);
        self.commands.lock().unwrap().push(cmd.clone());
        self.applied.store(index, Ordering::SeqCst);
        Ok(cmd)
    }

    fn apply_member_change(&self, _: &ConfChange, index: u64) -> Result<Bytes> {
        self.member_changes.fetch_add(1, Ordering::SeqCst);
        self.applied.store(index, Ordering::SeqCst);
        Ok(Bytes::from_static(b"changed"))
    }

    fn snapshot(&self) -> Result<Box<dyn Snapshot>> {
        let commands = self.commands.lock().unwrap();
        Ok(Box::new(MemSnapshot::new(
            self.applied.load(Ordering::SeqCst),
            commands.clone(),
        )))
    }

    fn apply_snapshot(&self, _: &[Peer], snapshot: Box<dyn Snapshot>) -> Result<()> {
        let index = snapshot.applied_index();
        let commands = snapshot.collect::<Result<Vec<Bytes>>>()?;
        *self.commands.lock().unwrap() = commands;
        self.applied.store(index, Ordering::SeqCst);
        Ok(())
    }

    fn handle_leader_change(&self, leader: u64) {
        self.leaders.lock().unwrap().push(leader);
    }

    fn handle_fatal(&self, err: &Error) {
        self.fatal.lock().unwrap().push(err.to_string());
    }
}

/// A state machine whose commands wait while its gate is closed. The wait
/// gives up after five seconds so that a failing test still stops.
#[derive(Default)]
pub struct GatedStateMachine {
    inner: MemStateMachine,
    closed: Mutex<bool>,
    cond: Condvar,
    waiting: AtomicBool,
}

impl GatedStateMachine {
    pub fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }

    pub fn open(&self) {
        *self.closed.lock().unwrap() = false;
        self.cond.notify_all();
    }

    /// Whether a command is held at the gate.
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<Bytes> {
        self.inner.commands()
    }
}

impl StateMachine for GatedStateMachine {
    fn apply(&self, command: &[u8], index: u64) -> Result<Bytes> {
        let closed = self.closed.lock().unwrap();
        self.waiting.store(*closed, Ordering::SeqCst);
        let (closed, _) = self
            .cond
            .wait_timeout_while(closed, Duration::from_secs(5), |closed| *closed)
            .unwrap();
        drop(closed);
        self.waiting.store(false, Ordering::SeqCst);
        self.inner.apply(command, index)
    }

    fn apply_member_change(&self, cc: &ConfChange, index: u64) -> Result<Bytes> {
        self.inner.apply_member_change(cc, index)
    }

    fn snapshot(&self) -> Result<Box<dyn Snapshot>> {
        self.inner.snapshot()
    }

    fn apply_snapshot(&self, peers: &[Peer], snapshot: Box<dyn Snapshot>) -> Result<()> {
        self.inner.apply_snapshot(peers, snapshot)
    }

    fn handle_leader_change(&self, leader: u64) {
        self.inner.handle_leader_change(leader)
    }

    fn handle_fatal(&self, err: &Error) {
        self.inner.handle_fatal(err)
    }
}

/// Delivers messages between the servers of one process.
#[derive(Default)]
pub struct Router {
    nodes: RwLock<HashMap<u64, Weak<Server>>>,
    isolated: RwLock<HashSet<u64>>,
    // (from, to, group ids) of every coalesced heartbeat.
    heartbeats: Mutex<Vec<(u64, u64, Vec<u64>)>>,
    // Heartbeats sent by the raft of a single group.
    group_heartbeats: AtomicUsize,
}

impl Router {
    pub fn register(&self, server: &Arc<Server>) {
        self.nodes
            .write()
            .unwrap()
            .insert(server.node_id(), Arc::downgrade(server));
    }

    pub fn isolate(&self, id: u64) {
        self.isolated.write().unwrap().insert(id);
    }

    pub fn recover(&self) {
        self.isolated.write().unwrap().clear();
    }

    pub fn heartbeats(&self) -> Vec<(u64, u64, Vec<u64>)> {
        self.heartbeats.lock().unwrap().clone()
    }

    pub fn group_heartbeats(&self) -> usize {
        self.group_heartbeats.load(Ordering::SeqCst)
    }

    fn route(&self, from: u64, to: u64) -> Option<Arc<Server>> {
        let isolated = self.isolated.read().unwrap();
        if isolated.contains(&from) || isolated.contains(&to) {
            return None;
        }
        self.nodes.read().unwrap().get(&to).and_then(Weak::upgrade)
    }
}

impl Transport for Router {
    fn send(&self, m: Message) {
        if m.group_id == 0 && m.msg_type == MessageType::MsgHeartbeat {
            let ids = decode_heartbeat_context(&m.context).unwrap();
            self.heartbeats.lock().unwrap().push((m.from, m.to, ids));
        } else if m.msg_type == MessageType::MsgHeartbeat {
            self.group_heartbeats.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(server) = self.route(m.from, m.to) {
            server.receive_message(m);
        }
    }

    fn send_snapshot(&self, m: Message, snapshot: Box<dyn Snapshot>) -> Result<()> {
        let server = self.route(m.from, m.to).ok_or(Error::Stopped)?;
        Handle::current().block_on(server.receive_snapshot(m, snapshot))
    }
}

/// A set of servers wired through one `Router`.
pub struct Cluster {
    pub router: Arc<Router>,
    pub servers: HashMap<u64, Arc<Server>>,
    pub logger: Logger,
}

impl Cluster {
    pub fn start(ids: &[u64]) -> Cluster {
        Cluster::start_with_config(ids, test_config)
    }

    pub fn start_with_config(ids: &[u64], cfg: impl Fn(u64) -> ServerConfig) -> Cluster {
        let logger = default_logger();
        let router = Arc::new(Router::default());
        let mut servers = HashMap::new();
        for id in ids {
            let server = Server::start(cfg(*id), router.clone(), &logger).unwrap();
            router.register(&server);
            servers.insert(*id, server);
        }
        Cluster {
            router,
            servers,
            logger,
        }
    }

    pub fn server(&self, id: u64) -> &Arc<Server> {
        &self.servers[&id]
    }

    /// Creates group `group_id` with `peers` on every node listed in `on`,
    /// hinting `leader` as its first leader.
    pub fn create_group(
        &self,
        group_id: u64,
        peers: &[Peer],
        on: &[u64],
        leader: u64,
    ) -> HashMap<u64, Arc<MemStateMachine>> {
        let sms: HashMap<u64, Arc<MemStateMachine>> = on
            .iter()
            .map(|id| (*id, Arc::new(MemStateMachine::default())))
            .collect();
        self.create_group_with(group_id, peers, on, leader, |id| sms[&id].clone());
        sms
    }

    /// Like `create_group`, with the state machine of each node built by
    /// `sm_of`. The leader is started last so that its first campaign
    /// reaches everybody.
    pub fn create_group_with<S: StateMachine + 'static>(
        &self,
        group_id: u64,
        peers: &[Peer],
        on: &[u64],
        leader: u64,
        sm_of: impl Fn(u64) -> Arc<S>,
    ) {
        let mut on = on.to_vec();
        on.sort_by_key(|id| *id == leader);
        for id in &on {
            let mut group = GroupConfig::new(
                group_id,
                peers.to_vec(),
                Arc::new(MemStorage::new()),
                sm_of(*id),
            );
            group.set_leader(leader);
            self.server(*id).create(group).unwrap();
        }
    }

    /// Waits until one node leads `group_id` and the others follow it.
    pub async fn wait_leader(&self, group_id: u64) -> u64 {
        let mut leader = 0;
        let settled = wait_for(|| {
            let leaders: Vec<u64> = self
                .servers
                .values()
                .filter_map(|s| s.group(group_id))
                .filter(|d| d.peers().iter().any(|p| p.id == d.node_id()))
                .map(|d| d.leader_term().0)
                .collect();
            leader = leaders.first().cloned().unwrap_or(0);
            leader != 0
                && leaders.iter().all(|l| *l == leader)
                && self.server(leader).is_leader(group_id)
        })
        .await;
        assert!(settled, "group {} has no leader", group_id);
        leader
    }

    pub async fn stop(&self) {
        for server in self.servers.values() {
            server.stop().await;
        }
    }
}

pub fn voters(ids: &[u64]) -> Vec<Peer> {
    ids.iter().map(|id| Peer::voter(*id)).collect()
}
