// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! Hosts the raft groups of one node.
//!
//! The server owns the group map, a shared ticker, and the coalesced
//! heartbeats: every `heartbeat_tick` ticks, each node that follows at least
//! one group led here gets a single heartbeat naming all of those groups.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use slog::Logger;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::codec::{decode_heartbeat_context, encode_heartbeat_context};
use crate::config::{GroupConfig, ServerConfig};
use crate::driver::{Driver, FatalSender};
use crate::errors::{Error, Result};
use crate::future::Future;
use crate::message::{ConfChange, Message, MessageType};
use crate::state_machine::Snapshot;
use crate::status::Status;
use crate::transport::Transport;
use crate::{HashMap, INVALID_ID};

/// A node hosting many raft groups over one transport.
pub struct Server {
    cfg: ServerConfig,
    transport: Arc<dyn Transport>,
    groups: RwLock<HashMap<u64, Arc<Driver>>>,
    ticks: AtomicU64,
    fatal_tx: FatalSender,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    logger: Logger,
}

impl Server {
    /// Validates `cfg` and starts the ticker, the monitor and the fatal error
    /// handler on the current tokio runtime.
    pub fn start(
        mut cfg: ServerConfig,
        transport: Arc<dyn Transport>,
        logger: &Logger,
    ) -> Result<Arc<Server>> {
        cfg.validate()?;
        let logger = logger.new(o!("raft_id" => cfg.node_id));
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let tick_interval = cfg.tick_interval;
        let status_interval = cfg.status_interval;
        let server = Arc::new(Server {
            cfg,
            transport,
            groups: RwLock::default(),
            ticks: AtomicU64::new(0),
            fatal_tx,
            stop_tx,
            tasks: Mutex::default(),
            logger,
        });

        let tasks = vec![
            tokio::spawn(run_ticker(
                Arc::downgrade(&server),
                tick_interval,
                stop_rx.clone(),
            )),
            tokio::spawn(run_monitor(
                Arc::downgrade(&server),
                status_interval,
                stop_rx.clone(),
            )),
            tokio::spawn(run_fatal_handler(
                Arc::downgrade(&server),
                fatal_rx,
                stop_rx,
            )),
        ];
        *server.tasks.lock().unwrap_or_else(PoisonError::into_inner) = tasks;
        info!(server.logger, "server started"; "tick_interval" => ?tick_interval);
        Ok(server)
    }

    /// The id of this node.
    #[inline]
    pub fn node_id(&self) -> u64 {
        self.cfg.node_id
    }

    /// The settings the server runs with, defaults filled in.
    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Starts a group and registers it.
    pub fn create(&self, group: GroupConfig) -> Result<Arc<Driver>> {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }
        let group_id = *group.group_id();
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        if groups.contains_key(&group_id) {
            return Err(Error::RaftExists(group_id));
        }
        let driver = Driver::spawn(
            &self.cfg,
            group,
            self.transport.clone(),
            self.fatal_tx.clone(),
            &self.logger,
        )?;
        groups.insert(group_id, driver.clone());
        Ok(driver)
    }

    /// Stops a group and unregisters it.
    pub async fn remove(&self, group_id: u64) -> Result<()> {
        let driver = self
            .groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&group_id);
        match driver {
            Some(driver) => {
                driver.stop().await;
                info!(self.logger, "group removed"; "group_id" => group_id);
                Ok(())
            }
            None => Err(Error::RaftNotExists(group_id)),
        }
    }

    /// The driver of a group.
    pub fn group(&self, group_id: u64) -> Option<Arc<Driver>> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&group_id)
            .cloned()
    }

    /// The ids of all registered groups, sorted.
    pub fn group_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    fn drivers(&self) -> Vec<Arc<Driver>> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Proposes a command to a group.
    pub fn propose(&self, group_id: u64, data: Bytes) -> Future<Bytes> {
        match self.group(group_id) {
            Some(driver) => driver.propose(data),
            None => Future::ready(Err(Error::RaftNotExists(group_id))),
        }
    }

    /// Proposes a membership change to a group.
    pub fn propose_member_change(&self, group_id: u64, cc: ConfChange) -> Future<Bytes> {
        match self.group(group_id) {
            Some(driver) => driver.propose_member_change(cc),
            None => Future::ready(Err(Error::RaftNotExists(group_id))),
        }
    }

    /// Requests a linearizable read barrier on a group.
    pub fn read_index(&self, group_id: u64) -> Future<()> {
        match self.group(group_id) {
            Some(driver) => driver.read_index(),
            None => Future::ready(Err(Error::RaftNotExists(group_id))),
        }
    }

    /// Asks the leader of a group to hand leadership to `target`.
    pub fn transfer_leader(&self, group_id: u64, target: u64) -> Result<()> {
        self.with_group(group_id, |d| d.transfer_leader(target))
    }

    /// Reports that a message of a group to `node` was not delivered.
    pub fn report_unreachable(&self, group_id: u64, node: u64) -> Result<()> {
        self.with_group(group_id, |d| d.report_unreachable(node))
    }

    fn with_group<T>(&self, group_id: u64, f: impl FnOnce(&Driver) -> T) -> Result<T> {
        self.group(group_id)
            .map(|d| f(&d))
            .ok_or(Error::RaftNotExists(group_id))
    }

    /// Whether this node leads the group.
    pub fn is_leader(&self, group_id: u64) -> bool {
        self.group(group_id).map_or(false, |d| d.is_leader())
    }

    /// The known leader and the term of a group.
    pub fn leader_term(&self, group_id: u64) -> Result<(u64, u64)> {
        self.with_group(group_id, |d| d.leader_term())
    }

    /// The status of a group.
    pub async fn status(&self, group_id: u64) -> Result<Status> {
        let driver = self
            .group(group_id)
            .ok_or(Error::RaftNotExists(group_id))?;
        driver.status().await
    }

    /// Advances the clock of every group by one tick, and sends the coalesced
    /// heartbeats when they are due.
    pub fn tick(&self) {
        let ticks = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let drivers = self.drivers();
        for driver in &drivers {
            driver.tick();
        }
        if ticks % self.cfg.heartbeat_tick as u64 == 0 {
            self.send_heartbeats(&drivers);
        }
    }

    fn send_heartbeats(&self, drivers: &[Arc<Driver>]) {
        let mut targets: HashMap<u64, Vec<u64>> = HashMap::default();
        for driver in drivers.iter().filter(|d| d.is_leader()) {
            for peer in driver.peers() {
                if peer.id != self.cfg.node_id {
                    targets.entry(peer.id).or_default().push(driver.group_id());
                }
            }
        }
        for (to, group_ids) in targets {
            self.transport.send(Message {
                msg_type: MessageType::MsgHeartbeat,
                to,
                from: self.cfg.node_id,
                context: encode_heartbeat_context(&group_ids),
                ..Default::default()
            });
        }
    }

    /// Hands a message from the network to its group. Messages of unknown
    /// groups are dropped.
    pub fn receive_message(&self, m: Message) {
        if m.group_id != 0 {
            match self.group(m.group_id) {
                Some(driver) => driver.receive(m),
                None => debug!(
                    self.logger,
                    "message for unknown group";
                    "group_id" => m.group_id,
                    "from" => m.from,
                ),
            }
            return;
        }

        let group_ids = match decode_heartbeat_context(&m.context) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(self.logger, "bad coalesced heartbeat"; "from" => m.from, "error" => %e);
                return;
            }
        };
        match m.msg_type {
            MessageType::MsgHeartbeat => {
                let mut known = Vec::with_capacity(group_ids.len());
                for group_id in group_ids {
                    if let Some(driver) = self.group(group_id) {
                        driver.node_heartbeat(m.from);
                        known.push(group_id);
                    }
                }
                self.transport.send(Message {
                    msg_type: MessageType::MsgHeartbeatResponse,
                    to: m.from,
                    from: self.cfg.node_id,
                    context: encode_heartbeat_context(&known),
                    ..Default::default()
                });
            }
            MessageType::MsgHeartbeatResponse => {
                for group_id in group_ids {
                    if let Some(driver) = self.group(group_id) {
                        driver.node_heartbeat_response(m.from);
                    }
                }
            }
            t => debug!(self.logger, "message without group"; "msg_type" => ?t, "from" => m.from),
        }
    }

    /// Installs a snapshot sent by the leader of `m.group_id`.
    pub async fn receive_snapshot(&self, m: Message, snapshot: Box<dyn Snapshot>) -> Result<()> {
        let driver = self
            .group(m.group_id)
            .ok_or(Error::RaftNotExists(m.group_id))?;
        driver.receive_snapshot(m, snapshot).await
    }

    /// Stops every group and the background tasks. Safe to call more than
    /// once.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let drivers: Vec<Arc<Driver>> = self
            .groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, d)| d)
            .collect();
        for driver in drivers {
            driver.stop().await;
        }
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(self.logger, "server stopped");
    }

    fn log_leaderless(&self) {
        let mut leaderless: Vec<u64> = self
            .drivers()
            .iter()
            .filter(|d| d.leader_term().0 == INVALID_ID)
            .map(|d| d.group_id())
            .collect();
        if leaderless.is_empty() {
            return;
        }
        leaderless.sort_unstable();
        warn!(
            self.logger,
            "groups without leader";
            "count" => leaderless.len(),
            "groups" => ?leaderless,
        );
    }
}

async fn run_ticker(server: Weak<Server>, period: Duration, mut stop_rx: watch::Receiver<bool>) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        if *stop_rx.borrow() {
            return;
        }
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = interval.tick() => match server.upgrade() {
                Some(server) => server.tick(),
                None => return,
            },
        }
    }
}

async fn run_monitor(server: Weak<Server>, period: Duration, mut stop_rx: watch::Receiver<bool>) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        if *stop_rx.borrow() {
            return;
        }
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = interval.tick() => match server.upgrade() {
                Some(server) => server.log_leaderless(),
                None => return,
            },
        }
    }
}

async fn run_fatal_handler(
    server: Weak<Server>,
    mut fatal_rx: mpsc::UnboundedReceiver<(u64, Error)>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        if *stop_rx.borrow() {
            return;
        }
        let (group_id, err) = tokio::select! {
            _ = stop_rx.changed() => return,
            res = fatal_rx.recv() => match res {
                Some(res) => res,
                None => return,
            },
        };
        let server = match server.upgrade() {
            Some(server) => server,
            None => return,
        };
        error!(server.logger, "removing failed group"; "group_id" => group_id, "error" => %err);
        let _ = server.remove(group_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::default_logger;
    use crate::message::Peer;
    use crate::state_machine::tests::NopStateMachine;
    use crate::storage::MemStorage;

    #[derive(Default)]
    struct RecordTransport {
        sent: Mutex<Vec<Message>>,
    }

    impl Transport for RecordTransport {
        fn send(&self, m: Message) {
            self.sent.lock().unwrap().push(m);
        }

        fn send_snapshot(&self, _: Message, _: Box<dyn Snapshot>) -> Result<()> {
            Ok(())
        }
    }

    fn group(id: u64, peers: &[u64]) -> GroupConfig {
        GroupConfig::new(
            id,
            peers.iter().map(|id| Peer::voter(*id)).collect(),
            Arc::new(MemStorage::new()),
            Arc::new(NopStateMachine::default()),
        )
    }

    fn manual_config(node_id: u64) -> ServerConfig {
        let mut cfg = ServerConfig::new(node_id);
        cfg.tick_interval = Duration::from_secs(3600);
        cfg
    }

    #[tokio::test]
    async fn test_create_and_remove() {
        let transport = Arc::new(RecordTransport::default());
        let server = Server::start(manual_config(1), transport, &default_logger()).unwrap();
        server.create(group(1, &[1, 2, 3])).unwrap();
        server.create(group(2, &[1, 2, 3])).unwrap();
        assert_eq!(
            server.create(group(1, &[1])).err(),
            Some(Error::RaftExists(1))
        );
        assert_eq!(server.group_ids(), vec![1, 2]);

        server.remove(1).await.unwrap();
        assert_eq!(server.remove(1).await, Err(Error::RaftNotExists(1)));
        assert_eq!(
            server.propose(1, Bytes::from_static(b"x")).await,
            Err(Error::RaftNotExists(1))
        );
        // Group 2 is a follower without a leader.
        assert_eq!(
            server.propose(2, Bytes::from_static(b"x")).await,
            Err(Error::NotLeader)
        );

        server.stop().await;
        server.stop().await;
        assert!(server.group_ids().is_empty());
        assert_eq!(server.create(group(3, &[1])).err(), Some(Error::Stopped));
    }

    #[tokio::test]
    async fn test_coalesced_heartbeat_demux() {
        let transport = Arc::new(RecordTransport::default());
        let server =
            Server::start(manual_config(1), transport.clone(), &default_logger()).unwrap();
        server.create(group(1, &[1, 2])).unwrap();
        server.create(group(3, &[1, 2])).unwrap();

        // Group 7 is unknown here and left out of the response.
        server.receive_message(Message {
            msg_type: MessageType::MsgHeartbeat,
            to: 1,
            from: 2,
            context: encode_heartbeat_context(&[1, 3, 7]),
            ..Default::default()
        });
        let sent = transport.sent.lock().unwrap().clone();
        let resp = sent
            .iter()
            .find(|m| m.msg_type == MessageType::MsgHeartbeatResponse)
            .expect("no heartbeat response");
        assert_eq!(resp.to, 2);
        assert_eq!(resp.group_id, 0);
        assert_eq!(decode_heartbeat_context(&resp.context).unwrap(), vec![1, 3]);

        // A message of a removed group is ignored.
        server.receive_message(Message {
            msg_type: MessageType::MsgAppend,
            group_id: 9,
            from: 2,
            to: 1,
            ..Default::default()
        });
        server.stop().await;
    }

    #[tokio::test]
    async fn test_single_voter_groups_send_no_heartbeats() {
        let transport = Arc::new(RecordTransport::default());
        let server =
            Server::start(manual_config(1), transport.clone(), &default_logger()).unwrap();
        let mut leaders = vec![];
        for id in 1..=3 {
            let mut g = group(id, &[1]);
            g.set_leader(1);
            leaders.push(server.create(g).unwrap());
        }
        for d in &leaders {
            for _ in 0..100 {
                if d.is_leader() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(d.is_leader(), "group {} has no leader", d.group_id());
        }
        // Single voter groups have nobody to heartbeat.
        for _ in 0..server.config().heartbeat_tick {
            server.tick();
        }
        let sent = transport.sent.lock().unwrap().clone();
        assert!(sent.iter().all(|m| m.msg_type != MessageType::MsgHeartbeat));
        server.stop().await;
    }
}
