// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! The tasks driving one raft group.
//!
//! Every group runs two tokio tasks. The run loop owns the [`RawNode`]: it
//! takes ticks, inbound messages, proposals and reads from bounded mailboxes,
//! persists each `Ready` to the group's storage, sends the messages and hands
//! committed entries to the apply task. The apply task feeds the state machine
//! in log order and completes the futures of the proposals it applies.
//!
//! All mailboxes are bounded and nothing blocks the caller: a full mailbox
//! drops the request.

use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use slog::Logger;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::codec::Codec;
use crate::config::{GroupConfig, ServerConfig};
use crate::confchange::Changer;
use crate::errors::{Error, Result};
use crate::future::{self, Future, Promise};
use crate::message::{
    ConfChange, ConfChangeType, ConfState, Entry, EntryType, Message, MessageType, Peer,
    PeerType, SnapshotMetadata,
};
use crate::raft::StateRole;
use crate::raw_node::{RawNode, SnapshotStatus};
use crate::state_machine::{Snapshot, StateMachine};
use crate::status::Status;
use crate::storage::Storage;
use crate::transport::Transport;
use crate::{HashMap, StorageError, INVALID_ID};

/// Where fatal group errors are reported, tagged with the group id.
pub type FatalSender = mpsc::UnboundedSender<(u64, Error)>;

enum ProposalKind {
    Command(Bytes),
    MemberChange(ConfChange),
}

struct Proposal {
    kind: ProposalKind,
    promise: Promise<Bytes>,
}

enum Control {
    Snapshot {
        msg: Message,
        snapshot: Box<dyn Snapshot>,
        done: oneshot::Sender<Result<()>>,
    },
    SnapshotStatus {
        to: u64,
        status: SnapshotStatus,
    },
    Unreachable(u64),
    TransferLeader(u64),
    NodeHeartbeat(u64),
    NodeHeartbeatResponse(u64),
    Status(oneshot::Sender<Status>),
}

enum ApplyItem {
    Entry {
        entry: Entry,
        promise: Option<Promise<Bytes>>,
    },
    MemberChange {
        index: u64,
        cc: ConfChange,
        result: Result<ConfState>,
        promise: Option<Promise<Bytes>>,
    },
    Read {
        index: u64,
        promise: Promise<()>,
    },
    LeaderChange(u64),
    SendSnapshot(Message),
    Restore {
        meta: SnapshotMetadata,
        snapshot: Box<dyn Snapshot>,
        done: oneshot::Sender<Result<()>>,
    },
}

#[derive(Clone, Copy, Default)]
struct SoftInfo {
    leader: u64,
    term: u64,
    role: StateRole,
}

/// State published by the tasks for lock-free or short-lock reads.
#[derive(Default)]
struct Shared {
    soft: RwLock<SoftInfo>,
    peers: RwLock<Vec<Peer>>,
    applied: AtomicU64,
    committed: AtomicU64,
    dropped: AtomicU64,
    restoring: AtomicBool,
    fatal: AtomicBool,
}

impl Shared {
    fn soft(&self) -> SoftInfo {
        *self.soft.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_soft(&self, info: SoftInfo) {
        *self.soft.write().unwrap_or_else(PoisonError::into_inner) = info;
    }

    fn peers(&self) -> Vec<Peer> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_peers(&self, peers: Vec<Peer>) {
        *self.peers.write().unwrap_or_else(PoisonError::into_inner) = peers;
    }
}

/// Reports `err` once per group: the state machine learns it first, then the
/// server, which deregisters the group.
fn report_fatal(
    shared: &Shared,
    sm: &dyn StateMachine,
    fatal_tx: &FatalSender,
    group_id: u64,
    err: Error,
    logger: &Logger,
) {
    if shared.fatal.swap(true, Ordering::SeqCst) {
        return;
    }
    crit!(logger, "group stops on fatal error"; "error" => %err);
    sm.handle_fatal(&err);
    let _ = fatal_tx.send((group_id, err));
}

/// The receiving ends of a driver's mailboxes.
struct Mailbox {
    propose_rx: mpsc::Receiver<Proposal>,
    read_index_rx: mpsc::Receiver<Promise<()>>,
    tick_rx: mpsc::Receiver<()>,
    recv_rx: mpsc::Receiver<Message>,
    control_rx: mpsc::Receiver<Control>,
    done_tx: watch::Sender<bool>,
}

/// The handle of one running group.
pub struct Driver {
    group_id: u64,
    node_id: u64,
    shared: Arc<Shared>,
    propose_tx: mpsc::Sender<Proposal>,
    read_index_tx: mpsc::Sender<Promise<()>>,
    tick_tx: mpsc::Sender<()>,
    recv_tx: mpsc::Sender<Message>,
    control_tx: mpsc::Sender<Control>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    done_rx: watch::Receiver<bool>,
    logger: Logger,
}

impl Driver {
    fn new(cfg: &ServerConfig, group_id: u64, logger: Logger) -> (Driver, Mailbox) {
        let (propose_tx, propose_rx) = mpsc::channel(cfg.propose_buffer_size);
        let (read_index_tx, read_index_rx) = mpsc::channel(cfg.read_index_buffer_size);
        let (tick_tx, tick_rx) = mpsc::channel(cfg.tick_buffer_size);
        let (recv_tx, recv_rx) = mpsc::channel(cfg.recv_buffer_size);
        let (control_tx, control_rx) = mpsc::channel(cfg.recv_buffer_size);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let driver = Driver {
            group_id,
            node_id: cfg.node_id,
            shared: Arc::default(),
            propose_tx,
            read_index_tx,
            tick_tx,
            recv_tx,
            control_tx,
            stop_tx,
            stop_rx,
            done_rx,
            logger,
        };
        let mailbox = Mailbox {
            propose_rx,
            read_index_rx,
            tick_rx,
            recv_rx,
            control_rx,
            done_tx,
        };
        (driver, mailbox)
    }

    /// Starts the tasks of `group` on the current tokio runtime.
    ///
    /// A store without membership is bootstrapped from the group's peers.
    pub fn spawn(
        cfg: &ServerConfig,
        group: GroupConfig,
        transport: Arc<dyn Transport>,
        fatal_tx: FatalSender,
        logger: &Logger,
    ) -> Result<Arc<Driver>> {
        group.validate()?;
        let group_id = *group.group_id();
        let logger = logger.new(o!("group_id" => group_id));
        let storage = group.storage().clone();
        let sm = group.state_machine().clone();

        bootstrap(storage.as_ref(), &group)?;
        let conf_state = storage.conf_state()?;
        let peers = peers_of(&conf_state, group.peers(), &[]);

        let mut raft_cfg = cfg.raft_config(&group);
        if group.applied().is_none() {
            raft_cfg.applied = storage.applied_index()?;
        }
        let mut raw_node = RawNode::new(&raft_cfg, storage.clone(), &logger)?;
        let leader = *group.leader();
        if leader == cfg.node_id {
            raw_node.campaign()?;
        } else if leader != INVALID_ID && raw_node.raft.state == StateRole::Follower {
            let term = raw_node.raft.term;
            raw_node.raft.become_follower(term, leader);
        }

        let (driver, mailbox) = Driver::new(cfg, group_id, logger.clone());
        let shared = driver.shared.clone();
        shared.set_peers(peers);
        let applied = raw_node.raft.raft_log.applied;
        shared.applied.store(applied, Ordering::SeqCst);
        shared
            .committed
            .store(raw_node.raft.raft_log.committed, Ordering::SeqCst);

        let (apply_tx, apply_rx) = mpsc::channel(cfg.apply_buffer_size);
        let applier = Applier {
            group_id,
            sm: sm.clone(),
            storage: storage.clone(),
            transport: transport.clone(),
            shared: shared.clone(),
            control_tx: driver.control_tx.clone(),
            fatal_tx: fatal_tx.clone(),
            rx: apply_rx,
            stop_rx: driver.stop_rx.clone(),
            applied,
            conf_state,
            reads: vec![],
            logger: logger.clone(),
        };

        let Mailbox {
            propose_rx,
            read_index_rx,
            tick_rx,
            recv_rx,
            control_rx,
            done_tx,
        } = mailbox;
        let runner = Runner {
            group_id,
            raw_node,
            storage,
            sm,
            transport,
            shared,
            apply_tx,
            fatal_tx,
            propose_rx,
            read_index_rx,
            tick_rx,
            recv_rx,
            control_rx,
            stop_rx: driver.stop_rx.clone(),
            proposals: BTreeMap::new(),
            reads: HashMap::default(),
            read_seq: 0,
            prev_leader: INVALID_ID,
            retain_logs: cfg.retain_logs,
            max_batch: cfg.max_proposal_batch,
            logger: logger.clone(),
        };

        let applier = tokio::spawn(applier.run());
        tokio::spawn(runner.run(applier, done_tx));
        info!(logger, "group started"; "peers" => ?driver.peers());
        Ok(Arc::new(driver))
    }

    /// The id of the group.
    #[inline]
    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    /// Proposes a command, resolved with the state machine's response once
    /// the command is applied.
    pub fn propose(&self, data: Bytes) -> Future<Bytes> {
        self.send_proposal(ProposalKind::Command(data))
    }

    /// Proposes a membership change, resolved once it is applied.
    ///
    /// Only one change may be in flight at a time, a second one is dropped.
    pub fn propose_member_change(&self, cc: ConfChange) -> Future<Bytes> {
        self.send_proposal(ProposalKind::MemberChange(cc))
    }

    fn send_proposal(&self, kind: ProposalKind) -> Future<Bytes> {
        if let Err(e) = self.check_leader() {
            return Future::ready(Err(e));
        }
        let (promise, f) = future::pair();
        match self.propose_tx.try_send(Proposal { kind, promise }) {
            Ok(()) => f,
            Err(TrySendError::Full(mut p)) => {
                p.promise.fail(Error::ProposalDropped);
                f
            }
            Err(TrySendError::Closed(mut p)) => {
                p.promise.fail(Error::Stopped);
                f
            }
        }
    }

    /// Requests a linearizable read barrier. The future resolves once the
    /// local state machine has applied everything committed at the time of
    /// the request.
    pub fn read_index(&self) -> Future<()> {
        if let Err(e) = self.check_leader() {
            return Future::ready(Err(e));
        }
        let (promise, f) = future::pair();
        match self.read_index_tx.try_send(promise) {
            Ok(()) => f,
            Err(TrySendError::Full(mut p)) => {
                p.fail(Error::ProposalDropped);
                f
            }
            Err(TrySendError::Closed(mut p)) => {
                p.fail(Error::Stopped);
                f
            }
        }
    }

    fn check_leader(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }
        if !self.is_leader() {
            return Err(Error::NotLeader);
        }
        Ok(())
    }

    /// Advances the logical clock by one tick. Dropped while a snapshot is
    /// installed or when the group lags behind.
    pub fn tick(&self) {
        if self.shared.restoring.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.tick_tx.try_send(());
    }

    /// Queues an inbound message. The message is dropped and counted in
    /// `dropped_messages` when the mailbox is full. While a snapshot is being
    /// restored into the state machine every inbound message is dropped and
    /// counted the same way.
    pub fn receive(&self, m: Message) {
        if self.shared.restoring.load(Ordering::SeqCst) {
            self.drop_message(&m);
            return;
        }
        match self.recv_tx.try_send(m) {
            Ok(()) => {}
            Err(TrySendError::Full(m)) | Err(TrySendError::Closed(m)) => self.drop_message(&m),
        }
    }

    fn drop_message(&self, m: &Message) {
        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        trace!(
            self.logger,
            "dropped inbound message";
            "msg_type" => ?m.msg_type,
            "from" => m.from,
        );
    }

    /// Installs a snapshot streamed from the leader, returning once the
    /// state machine holds it or it was rejected.
    pub async fn receive_snapshot(&self, m: Message, snapshot: Box<dyn Snapshot>) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.control_tx
            .send(Control::Snapshot {
                msg: m,
                snapshot,
                done,
            })
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.unwrap_or(Err(Error::Stopped))
    }

    /// Asks the leader to hand leadership over to `target`.
    pub fn transfer_leader(&self, target: u64) {
        self.send_control(Control::TransferLeader(target));
    }

    /// Reports that the last message to `node` could not be delivered.
    pub fn report_unreachable(&self, node: u64) {
        self.send_control(Control::Unreachable(node));
    }

    pub(crate) fn node_heartbeat(&self, from: u64) {
        self.send_control(Control::NodeHeartbeat(from));
    }

    pub(crate) fn node_heartbeat_response(&self, from: u64) {
        self.send_control(Control::NodeHeartbeatResponse(from));
    }

    fn send_control(&self, c: Control) {
        let _ = self.control_tx.try_send(c);
    }

    /// A full status snapshot of the group, taken by its run loop.
    pub async fn status(&self) -> Result<Status> {
        let (tx, rx) = oneshot::channel();
        self.control_tx
            .send(Control::Status(tx))
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)
    }

    /// Whether this node believes it leads the group.
    pub fn is_leader(&self) -> bool {
        self.shared.soft().role == StateRole::Leader
    }

    /// The known leader and the current term.
    pub fn leader_term(&self) -> (u64, u64) {
        let soft = self.shared.soft();
        (soft.leader, soft.term)
    }

    /// The index the state machine has applied up to.
    pub fn applied(&self) -> u64 {
        self.shared.applied.load(Ordering::SeqCst)
    }

    /// The highest index known to be committed.
    pub fn committed(&self) -> u64 {
        self.shared.committed.load(Ordering::SeqCst)
    }

    /// The current members of the group.
    pub fn peers(&self) -> Vec<Peer> {
        self.shared.peers()
    }

    /// How many inbound messages were dropped so far.
    pub fn dropped_messages(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// The id of the local node.
    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Whether the tasks of the group have exited.
    pub fn is_stopped(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Stops the group and waits for its tasks to exit. Pending futures
    /// resolve with `Stopped`. Calling it again is a no-op.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let mut done = self.done_rx.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Initializes an empty store from the group's config.
fn bootstrap(storage: &dyn Storage, group: &GroupConfig) -> Result<()> {
    let state = storage.initial_state()?;
    if !state.initialized() {
        let voters = group
            .peers()
            .iter()
            .filter(|p| p.peer_type == PeerType::Voter)
            .map(|p| p.id);
        let learners = group
            .peers()
            .iter()
            .filter(|p| p.peer_type == PeerType::NonVoting)
            .map(|p| p.id);
        storage.set_conf_state(&ConfState::from((voters, learners)))?;
    }
    let mut hs = state.hard_state;
    if hs.term < *group.term() {
        hs.term = *group.term();
        hs.vote = INVALID_ID;
        storage.set_hard_state(&hs)?;
    }
    Ok(())
}

/// The members of `cs`, taking their metadata from `changed` first, then
/// from `known`.
fn peers_of(cs: &ConfState, known: &[Peer], changed: &[Peer]) -> Vec<Peer> {
    let mut ids: Vec<u64> = cs
        .voters
        .iter()
        .chain(&cs.voters_outgoing)
        .chain(&cs.learners)
        .chain(&cs.learners_next)
        .copied()
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids.into_iter()
        .map(|id| {
            let mut peer = changed
                .iter()
                .chain(known)
                .find(|p| p.id == id)
                .cloned()
                .unwrap_or_else(|| Peer::voter(id));
            peer.peer_type = if cs.learners.contains(&id) {
                PeerType::NonVoting
            } else {
                PeerType::Voter
            };
            peer
        })
        .collect()
}

struct PendingProposal {
    term: u64,
    member_change: bool,
    promise: Promise<Bytes>,
}

/// The run loop of a group.
struct Runner {
    group_id: u64,
    raw_node: RawNode<Arc<dyn Storage>>,
    storage: Arc<dyn Storage>,
    sm: Arc<dyn StateMachine>,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    apply_tx: mpsc::Sender<ApplyItem>,
    fatal_tx: FatalSender,
    propose_rx: mpsc::Receiver<Proposal>,
    read_index_rx: mpsc::Receiver<Promise<()>>,
    tick_rx: mpsc::Receiver<()>,
    recv_rx: mpsc::Receiver<Message>,
    control_rx: mpsc::Receiver<Control>,
    stop_rx: watch::Receiver<bool>,
    // Proposals waiting for their entry to commit, by log index.
    proposals: BTreeMap<u64, PendingProposal>,
    reads: HashMap<Bytes, Vec<Promise<()>>>,
    read_seq: u64,
    prev_leader: u64,
    retain_logs: u64,
    max_batch: usize,
    logger: Logger,
}

impl Runner {
    async fn run(mut self, applier: JoinHandle<()>, done_tx: watch::Sender<bool>) {
        self.publish();
        if let Err(e) = self.run_loop().await {
            if e != Error::Stopped {
                report_fatal(
                    &self.shared,
                    self.sm.as_ref(),
                    &self.fatal_tx,
                    self.group_id,
                    e,
                    &self.logger,
                );
            }
        }
        let logger = self.logger.clone();
        // Drops the pending promises and closes the apply mailbox.
        drop(self);
        let _ = applier.await;
        info!(logger, "group stopped");
        let _ = done_tx.send(true);
    }

    async fn run_loop(&mut self) -> Result<()> {
        loop {
            while self.raw_node.has_ready() {
                self.handle_ready().await?;
            }
            if *self.stop_rx.borrow() {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = self.stop_rx.changed() => return Ok(()),
                Some(c) = self.control_rx.recv() => self.handle_control(c).await?,
                Some(m) = self.recv_rx.recv() => self.step(m)?,
                Some(()) = self.tick_rx.recv() => {
                    self.raw_node.tick();
                }
                Some(p) = self.propose_rx.recv() => self.handle_proposals(p)?,
                Some(r) = self.read_index_rx.recv() => self.handle_reads(r)?,
                else => return Ok(()),
            }
        }
    }

    fn step(&mut self, m: Message) -> Result<()> {
        match self.raw_node.step(m) {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                debug!(self.logger, "ignored message"; "error" => %e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn is_leader(&self) -> bool {
        self.raw_node.raft.state == StateRole::Leader
    }

    fn handle_proposals(&mut self, first: Proposal) -> Result<()> {
        let mut batch = vec![first];
        while batch.len() < self.max_batch {
            match self.propose_rx.try_recv() {
                Ok(p) => batch.push(p),
                Err(_) => break,
            }
        }
        if !self.is_leader() {
            for mut p in batch {
                p.promise.fail(Error::NotLeader);
            }
            return Ok(());
        }

        let mut data = vec![];
        let mut promises = vec![];
        for p in batch {
            match p.kind {
                ProposalKind::Command(cmd) => {
                    data.push(cmd);
                    promises.push(p.promise);
                }
                ProposalKind::MemberChange(cc) => {
                    self.propose_commands(mem::take(&mut data), mem::take(&mut promises))?;
                    self.propose_member_change(cc, p.promise)?;
                }
            }
        }
        self.propose_commands(data, promises)
    }

    fn propose_commands(&mut self, data: Vec<Bytes>, promises: Vec<Promise<Bytes>>) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let count = data.len() as u64;
        let term = self.raw_node.raft.term;
        match self.raw_node.propose(data) {
            Ok(last) if last > 0 => {
                let first = last + 1 - count;
                for (i, promise) in promises.into_iter().enumerate() {
                    self.proposals.insert(
                        first + i as u64,
                        PendingProposal {
                            term,
                            member_change: false,
                            promise,
                        },
                    );
                }
                Ok(())
            }
            Ok(_) => {
                fail_all(promises, || Error::NotLeader);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                debug!(self.logger, "dropped proposals"; "count" => count, "error" => %e);
                fail_all(promises, || Error::ProposalDropped);
                Ok(())
            }
        }
    }

    fn propose_member_change(&mut self, cc: ConfChange, mut promise: Promise<Bytes>) -> Result<()> {
        if self.raw_node.raft.has_pending_conf() {
            promise.fail(Error::ProposalDropped);
            return Ok(());
        }
        let checked = {
            let changer = Changer::new(self.raw_node.raft.prs());
            if cc.leave_joint() {
                changer.leave_joint()
            } else if let Some(auto_leave) = cc.enter_joint() {
                changer.enter_joint(auto_leave, &cc.changes)
            } else {
                changer.simple(&cc.changes)
            }
        };
        if let Err(e) = checked {
            promise.fail(Error::ConfChangeError(e.to_string()));
            return Ok(());
        }
        let term = self.raw_node.raft.term;
        match self.raw_node.propose_conf_change(&cc) {
            Ok(index) if index > 0 => {
                self.proposals.insert(
                    index,
                    PendingProposal {
                        term,
                        member_change: true,
                        promise,
                    },
                );
                Ok(())
            }
            Ok(_) => {
                promise.fail(Error::NotLeader);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(_) => {
                promise.fail(Error::ProposalDropped);
                Ok(())
            }
        }
    }

    fn handle_reads(&mut self, first: Promise<()>) -> Result<()> {
        let mut batch = vec![first];
        while batch.len() < self.max_batch {
            match self.read_index_rx.try_recv() {
                Ok(p) => batch.push(p),
                Err(_) => break,
            }
        }
        if !self.is_leader() {
            fail_all(batch, || Error::NotLeader);
            return Ok(());
        }
        // One barrier serves the whole batch.
        self.read_seq += 1;
        let ctx = Bytes::copy_from_slice(&self.read_seq.to_be_bytes());
        match self.raw_node.read_index(ctx.clone()) {
            Ok(()) => {
                self.reads.insert(ctx, batch);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(_) => {
                fail_all(batch, || Error::ProposalDropped);
                Ok(())
            }
        }
    }

    async fn handle_control(&mut self, c: Control) -> Result<()> {
        match c {
            Control::Snapshot {
                msg,
                snapshot,
                done,
            } => return self.restore_snapshot(msg, snapshot, done).await,
            Control::SnapshotStatus { to, status } => self.raw_node.report_snapshot(to, status),
            Control::Unreachable(to) => self.raw_node.report_unreachable(to),
            Control::TransferLeader(target) => self.raw_node.transfer_leader(target),
            Control::NodeHeartbeat(from) => self.raw_node.raft.on_node_heartbeat(from),
            Control::NodeHeartbeatResponse(from) => {
                self.raw_node.raft.on_node_heartbeat_response(from)
            }
            Control::Status(tx) => {
                let mut status = self.raw_node.status();
                status.group_id = self.group_id;
                status.applied = self.shared.applied.load(Ordering::SeqCst);
                status.pending_proposals = self.proposals.len();
                status.dropped_messages = self.shared.dropped.load(Ordering::Relaxed);
                status.restoring = self.shared.restoring.load(Ordering::SeqCst);
                let _ = tx.send(status);
            }
        }
        Ok(())
    }

    async fn restore_snapshot(
        &mut self,
        msg: Message,
        snapshot: Box<dyn Snapshot>,
        done: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        let meta = match msg.snapshot.clone() {
            Some(meta) => meta,
            None => {
                let _ = done.send(Err(Error::Store(StorageError::SnapshotOutOfDate)));
                return Ok(());
            }
        };
        self.step(msg)?;
        if self.raw_node.snap().map_or(true, |s| s.index != meta.index) {
            // Stale or refused, the response is already queued.
            let _ = done.send(Ok(()));
            return Ok(());
        }

        info!(
            self.logger,
            "installing snapshot";
            "index" => meta.index,
            "term" => meta.term,
        );
        self.shared.restoring.store(true, Ordering::SeqCst);
        let covered: Vec<u64> = self.proposals.range(..=meta.index).map(|(i, _)| *i).collect();
        for index in covered {
            if let Some(mut p) = self.proposals.remove(&index) {
                p.promise.fail(Error::NotLeader);
            }
        }

        let (tx, rx) = oneshot::channel();
        let sent = self
            .apply_tx
            .send(ApplyItem::Restore {
                meta: meta.clone(),
                snapshot,
                done: tx,
            })
            .await;
        let res = match sent {
            Ok(()) => tokio::select! {
                _ = self.stop_rx.changed() => Err(Error::Stopped),
                res = rx => res.unwrap_or(Err(Error::Stopped)),
            },
            Err(_) => Err(Error::Stopped),
        };
        self.shared.restoring.store(false, Ordering::SeqCst);

        match res {
            Ok(()) => {
                self.storage.set_conf_state(&meta.conf_state)?;
                let peers = peers_of(&meta.conf_state, &self.shared.peers(), &meta.peers);
                self.shared.set_peers(peers);
                let _ = done.send(Ok(()));
                Ok(())
            }
            Err(Error::Stopped) => {
                let _ = done.send(Err(Error::Stopped));
                Ok(())
            }
            Err(e) => {
                let _ = done.send(Err(Error::StateMachine(e.to_string())));
                Err(e)
            }
        }
    }

    async fn handle_ready(&mut self) -> Result<()> {
        let mut rd = self.raw_node.ready()?;

        #[cfg(feature = "failpoints")]
        fail::fail_point!("before_persist_ready", |_| Err(Error::InvariantViolated(
            "failpoint before_persist_ready".to_owned()
        )));
        self.raw_node.persist(&rd)?;

        if let Some(ss) = rd.ss() {
            let (leader, role) = (ss.leader_id, ss.raft_state);
            self.on_soft_state(leader, role).await?;
        }
        self.publish();

        for m in mem::take(&mut rd.messages) {
            self.send(m).await?;
        }

        for rs in rd.take_read_states() {
            match self.reads.remove(&rs.request_ctx) {
                Some(promises) => {
                    for promise in promises {
                        self.dispatch(ApplyItem::Read {
                            index: rs.index,
                            promise,
                        })
                        .await?;
                    }
                }
                None => debug!(self.logger, "stale read state"; "index" => rs.index),
            }
        }

        let committed = rd.committed_entries.clone();
        for entry in committed {
            self.apply_entry(entry).await?;
        }

        self.raw_node.advance(rd)?;
        self.shared
            .committed
            .store(self.raw_node.raft.raft_log.committed, Ordering::SeqCst);
        self.maybe_compact()
    }

    async fn on_soft_state(&mut self, leader: u64, role: StateRole) -> Result<()> {
        if leader != self.prev_leader {
            info!(
                self.logger,
                "leader changed";
                "leader" => leader,
                "term" => self.raw_node.raft.term,
            );
            self.prev_leader = leader;
            self.dispatch(ApplyItem::LeaderChange(leader)).await?;
        }
        if role != StateRole::Leader {
            for (_, mut p) in mem::take(&mut self.proposals) {
                p.promise.fail(Error::NotLeader);
            }
            for (_, promises) in self.reads.drain() {
                fail_all(promises, || Error::NotLeader);
            }
        }
        Ok(())
    }

    fn publish(&self) {
        let raft = &self.raw_node.raft;
        self.shared.set_soft(SoftInfo {
            leader: raft.leader_id,
            term: raft.term,
            role: raft.state,
        });
    }

    async fn send(&mut self, mut m: Message) -> Result<()> {
        m.group_id = self.group_id;
        if m.msg_type == MessageType::MsgSnapshot {
            // The image is taken by the apply task, from the applied state.
            return self.dispatch(ApplyItem::SendSnapshot(m)).await;
        }
        self.transport.send(m);
        Ok(())
    }

    async fn dispatch(&self, item: ApplyItem) -> Result<()> {
        self.apply_tx.send(item).await.map_err(|_| Error::Stopped)
    }

    /// Takes the proposal waiting at `index`, failing older ones that can no
    /// longer commit.
    fn take_proposal(&mut self, index: u64, term: u64) -> Option<PendingProposal> {
        while let Some(entry) = self.proposals.first_entry() {
            let key = *entry.key();
            if key > index {
                return None;
            }
            let mut p = entry.remove();
            if key == index && p.term == term {
                return Some(p);
            }
            p.promise.fail(Error::NotLeader);
        }
        None
    }

    async fn apply_entry(&mut self, entry: Entry) -> Result<()> {
        let pending = self.take_proposal(entry.index, entry.term);
        match entry.entry_type {
            EntryType::EntryNormal => {
                let promise = match pending {
                    Some(mut p) if p.member_change => {
                        // The change was refused when it was appended.
                        p.promise.fail(Error::ProposalDropped);
                        None
                    }
                    Some(p) => Some(p.promise),
                    None => None,
                };
                self.dispatch(ApplyItem::Entry { entry, promise }).await
            }
            EntryType::EntryConfChange => {
                let cc = ConfChange::decode_from(&entry.data)?;
                let result = match self.raw_node.apply_conf_change(&cc) {
                    Ok(cs) => {
                        self.storage.set_conf_state(&cs)?;
                        let changed: Vec<Peer> = cc
                            .changes
                            .iter()
                            .filter(|c| c.change_type != ConfChangeType::RemoveNode)
                            .map(|c| c.peer.clone())
                            .collect();
                        let peers = peers_of(&cs, &self.shared.peers(), &changed);
                        info!(
                            self.logger,
                            "membership changed";
                            "index" => entry.index,
                            "conf_state" => ?cs,
                        );
                        self.shared.set_peers(peers);
                        Ok(cs)
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(
                            self.logger,
                            "refused committed membership change";
                            "index" => entry.index,
                            "error" => %e,
                        );
                        Err(Error::ConfChangeError(e.to_string()))
                    }
                };
                self.dispatch(ApplyItem::MemberChange {
                    index: entry.index,
                    cc,
                    result,
                    promise: pending.map(|p| p.promise),
                })
                .await
            }
        }
    }

    fn maybe_compact(&mut self) -> Result<()> {
        let applied = self.shared.applied.load(Ordering::SeqCst);
        if applied <= self.retain_logs {
            return Ok(());
        }
        let to = applied - self.retain_logs;
        if to > self.raw_node.raft.raft_log.first_index() {
            self.raw_node.compact(to)?;
        }
        Ok(())
    }
}

fn fail_all<T>(promises: Vec<Promise<T>>, err: impl Fn() -> Error) {
    for mut p in promises {
        p.fail(err());
    }
}

/// The apply task of a group.
struct Applier {
    group_id: u64,
    sm: Arc<dyn StateMachine>,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    control_tx: mpsc::Sender<Control>,
    fatal_tx: FatalSender,
    rx: mpsc::Receiver<ApplyItem>,
    stop_rx: watch::Receiver<bool>,
    applied: u64,
    conf_state: ConfState,
    // Reads waiting for the state machine to reach their index.
    reads: Vec<(u64, Promise<()>)>,
    logger: Logger,
}

impl Applier {
    async fn run(mut self) {
        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            let item = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => break,
                item = self.rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            if let Err(e) = self.handle(item) {
                report_fatal(
                    &self.shared,
                    self.sm.as_ref(),
                    &self.fatal_tx,
                    self.group_id,
                    e,
                    &self.logger,
                );
                break;
            }
        }
    }

    fn handle(&mut self, item: ApplyItem) -> Result<()> {
        match item {
            ApplyItem::Entry { entry, promise } => {
                // Empty entries are appended by new leaders.
                let res = if entry.data.is_empty() {
                    Ok(Bytes::new())
                } else {
                    self.sm.apply(&entry.data, entry.index)
                };
                if let Err(e) = &res {
                    warn!(self.logger, "failed to apply"; "index" => entry.index, "error" => %e);
                }
                self.set_applied(entry.index)?;
                if let Some(mut promise) = promise {
                    promise.complete(res);
                }
            }
            ApplyItem::MemberChange {
                index,
                cc,
                result,
                promise,
            } => {
                let res = result.and_then(|cs| {
                    self.conf_state = cs;
                    self.sm.apply_member_change(&cc, index)
                });
                self.set_applied(index)?;
                if let Some(mut promise) = promise {
                    promise.complete(res);
                }
            }
            ApplyItem::Read { index, mut promise } => {
                if index <= self.applied {
                    promise.respond(());
                } else {
                    self.reads.push((index, promise));
                }
            }
            ApplyItem::LeaderChange(leader) => self.sm.handle_leader_change(leader),
            ApplyItem::SendSnapshot(m) => self.send_snapshot(m),
            ApplyItem::Restore {
                meta,
                snapshot,
                done,
            } => {
                let peers = peers_of(&meta.conf_state, &self.shared.peers(), &meta.peers);
                match self.sm.apply_snapshot(&peers, snapshot) {
                    Ok(()) => {
                        self.conf_state = meta.conf_state;
                        self.set_applied(meta.index)?;
                        let _ = done.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = done.send(Err(e));
                    }
                }
            }
        }
        Ok(())
    }

    fn set_applied(&mut self, index: u64) -> Result<()> {
        self.applied = index;
        self.storage.set_applied_index(index)?;
        self.shared.applied.store(index, Ordering::SeqCst);
        let applied = self.applied;
        self.reads.retain_mut(|(i, p)| {
            if *i <= applied {
                p.respond(());
                false
            } else {
                true
            }
        });
        Ok(())
    }

    fn send_snapshot(&self, mut m: Message) {
        let to = m.to;
        let image = self.sm.snapshot().and_then(|snap| {
            let index = snap.applied_index();
            if index == 0 {
                return Err(Error::Store(StorageError::SnapshotTemporarilyUnavailable));
            }
            let term = self.storage.term(index)?;
            Ok((snap, index, term))
        });
        let (snap, index, term) = match image {
            Ok(image) => image,
            Err(e) => {
                warn!(self.logger, "failed to take snapshot"; "to" => to, "error" => %e);
                let _ = self.control_tx.try_send(Control::SnapshotStatus {
                    to,
                    status: SnapshotStatus::Failure,
                });
                return;
            }
        };
        m.snapshot = Some(SnapshotMetadata {
            index,
            term,
            conf_state: self.conf_state.clone(),
            peers: self.shared.peers(),
        });
        info!(self.logger, "sending snapshot"; "to" => to, "index" => index, "term" => term);

        let transport = self.transport.clone();
        let control_tx = self.control_tx.clone();
        let logger = self.logger.clone();
        tokio::task::spawn_blocking(move || {
            let status = match transport.send_snapshot(m, snap) {
                Ok(()) => SnapshotStatus::Finish,
                Err(e) => {
                    warn!(logger, "failed to send snapshot"; "to" => to, "error" => %e);
                    SnapshotStatus::Failure
                }
            };
            let _ = control_tx.blocking_send(Control::SnapshotStatus { to, status });
        });
    }
}
