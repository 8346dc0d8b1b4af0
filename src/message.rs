// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! Plain data types exchanged between peers and persisted by stores.

use std::fmt;

use bytes::Bytes;

macro_rules! wire_enum {
    ($(#[$meta:meta])* pub enum $name:ident { $($(#[$vmeta:meta])* $variant:ident = $val:literal,)+ }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $val,)+
        }

        impl $name {
            /// Maps a wire tag back to its variant.
            pub fn from_u8(v: u8) -> Option<$name> {
                match v {
                    $($val => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_enum! {
    /// The kind of a log entry.
    pub enum EntryType {
        /// An opaque application command.
        EntryNormal = 0,
        /// An encoded `ConfChange`.
        EntryConfChange = 1,
    }
}

impl Default for EntryType {
    fn default() -> EntryType {
        EntryType::EntryNormal
    }
}

wire_enum! {
    /// The kind of a `Message`.
    pub enum MessageType {
        /// Local: start an election.
        MsgHup = 0,
        /// Local: leader heartbeat timer fired.
        MsgBeat = 1,
        /// Local: append proposed entries.
        MsgPropose = 2,
        MsgAppend = 3,
        MsgAppendResponse = 4,
        MsgRequestVote = 5,
        MsgRequestVoteResponse = 6,
        MsgSnapshot = 7,
        MsgHeartbeat = 8,
        MsgHeartbeatResponse = 9,
        /// Local: a peer could not be reached.
        MsgUnreachable = 10,
        /// Local: result of sending a snapshot.
        MsgSnapStatus = 11,
        /// Local: leader checks it still hears from a quorum.
        MsgCheckQuorum = 12,
        MsgTransferLeader = 13,
        /// Tells the transfer target to campaign at once, ignoring its lease.
        MsgTimeoutNow = 14,
        MsgReadIndex = 15,
        MsgReadIndexResp = 16,
        MsgRequestPreVote = 17,
        MsgRequestPreVoteResponse = 18,
    }
}

impl Default for MessageType {
    fn default() -> MessageType {
        MessageType::MsgHup
    }
}

wire_enum! {
    /// A single membership operation.
    pub enum ConfChangeType {
        AddNode = 0,
        RemoveNode = 1,
        AddLearnerNode = 2,
        /// Refresh the metadata (priority, replica id) of a known peer.
        UpdateNode = 3,
    }
}

impl Default for ConfChangeType {
    fn default() -> ConfChangeType {
        ConfChangeType::AddNode
    }
}

wire_enum! {
    /// How a multi-operation change moves through joint consensus.
    pub enum ConfChangeTransition {
        /// Use joint consensus only when required, leaving it automatically.
        Auto = 0,
        /// Always enter joint consensus, leave it automatically.
        Implicit = 1,
        /// Always enter joint consensus, wait for an explicit leave request.
        Explicit = 2,
    }
}

impl Default for ConfChangeTransition {
    fn default() -> ConfChangeTransition {
        ConfChangeTransition::Auto
    }
}

wire_enum! {
    /// Whether a peer counts toward quorum.
    pub enum PeerType {
        Voter = 0,
        NonVoting = 1,
    }
}

impl Default for PeerType {
    fn default() -> PeerType {
        PeerType::Voter
    }
}

/// One position in the replicated log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub entry_type: EntryType,
    pub term: u64,
    pub index: u64,
    pub data: Bytes,
}

impl Entry {
    /// Creates a normal entry carrying `data`.
    pub fn new(index: u64, term: u64, data: impl Into<Bytes>) -> Entry {
        Entry {
            entry_type: EntryType::EntryNormal,
            term,
            index,
            data: data.into(),
        }
    }
}

/// The persistent state of a raft peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HardState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

/// A flat description of a membership configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfState {
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
    /// Non-empty only while the configuration is joint.
    pub voters_outgoing: Vec<u64>,
    /// Voters in the outgoing half that become learners on leaving joint.
    pub learners_next: Vec<u64>,
    pub auto_leave: bool,
}

impl<Iter1, Iter2> From<(Iter1, Iter2)> for ConfState
where
    Iter1: IntoIterator<Item = u64>,
    Iter2: IntoIterator<Item = u64>,
{
    fn from((voters, learners): (Iter1, Iter2)) -> Self {
        ConfState {
            voters: voters.into_iter().collect(),
            learners: learners.into_iter().collect(),
            ..Default::default()
        }
    }
}

impl ConfState {
    /// Compares two states as sets, ignoring the order of ids.
    pub fn eq_ignoring_order(&self, other: &ConfState) -> bool {
        fn sorted(ids: &[u64]) -> Vec<u64> {
            let mut v = ids.to_vec();
            v.sort_unstable();
            v
        }
        sorted(&self.voters) == sorted(&other.voters)
            && sorted(&self.learners) == sorted(&other.learners)
            && sorted(&self.voters_outgoing) == sorted(&other.voters_outgoing)
            && sorted(&self.learners_next) == sorted(&other.learners_next)
            && self.auto_leave == other.auto_leave
    }

    /// Whether `id` appears anywhere in the configuration.
    pub fn contains(&self, id: u64) -> bool {
        self.voters
            .iter()
            .chain(&self.learners)
            .chain(&self.voters_outgoing)
            .chain(&self.learners_next)
            .any(|v| *v == id)
    }
}

/// A member of a group.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Peer {
    /// The node id, as used in `Message::from` and `Message::to`.
    pub id: u64,
    /// The id of this replica of the group on that node.
    pub replica_id: u64,
    pub peer_type: PeerType,
    pub priority: u64,
}

impl Peer {
    /// Creates a voter with default priority.
    pub fn voter(id: u64) -> Peer {
        Peer {
            id,
            replica_id: id,
            peer_type: PeerType::Voter,
            priority: 0,
        }
    }

    /// Creates a non-voting peer with default priority.
    pub fn learner(id: u64) -> Peer {
        Peer {
            peer_type: PeerType::NonVoting,
            ..Peer::voter(id)
        }
    }
}

/// Describes the point of the log a snapshot captures.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub index: u64,
    pub term: u64,
    pub conf_state: ConfState,
    pub peers: Vec<Peer>,
}

/// A single membership operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfChangeSingle {
    pub change_type: ConfChangeType,
    pub peer: Peer,
}

impl ConfChangeSingle {
    /// The node id the operation is about.
    #[inline]
    pub fn node_id(&self) -> u64 {
        self.peer.id
    }
}

/// Creates a change of `change_type` for a default peer `id`.
pub fn new_conf_change_single(id: u64, change_type: ConfChangeType) -> ConfChangeSingle {
    let peer = match change_type {
        ConfChangeType::AddLearnerNode => Peer::learner(id),
        _ => Peer::voter(id),
    };
    ConfChangeSingle { change_type, peer }
}

/// A membership change request, the payload of `EntryConfChange` entries.
///
/// An empty `Auto` change is the request to leave a joint configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfChange {
    pub transition: ConfChangeTransition,
    pub changes: Vec<ConfChangeSingle>,
    pub context: Bytes,
}

impl ConfChange {
    /// A change applying `changes`, entering joint consensus only if needed.
    pub fn new(changes: Vec<ConfChangeSingle>) -> ConfChange {
        ConfChange {
            changes,
            ..Default::default()
        }
    }

    /// The request to leave a joint configuration.
    pub fn leave() -> ConfChange {
        ConfChange::default()
    }

    /// Returns `Some(auto_leave)` if the change has to go through joint consensus.
    pub fn enter_joint(&self) -> Option<bool> {
        if self.transition != ConfChangeTransition::Auto || self.changes.len() > 1 {
            match self.transition {
                ConfChangeTransition::Auto | ConfChangeTransition::Implicit => Some(true),
                ConfChangeTransition::Explicit => Some(false),
            }
        } else {
            None
        }
    }

    /// Whether this is the request to leave a joint configuration.
    pub fn leave_joint(&self) -> bool {
        self.transition == ConfChangeTransition::Auto && self.changes.is_empty()
    }
}

/// The transport envelope.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub to: u64,
    pub from: u64,
    /// Zero for node level messages such as coalesced heartbeats.
    pub group_id: u64,
    pub term: u64,
    pub log_term: u64,
    pub index: u64,
    pub entries: Vec<Entry>,
    pub commit: u64,
    pub snapshot: Option<SnapshotMetadata>,
    pub reject: bool,
    pub reject_hint: u64,
    pub context: Bytes,
    pub priority: u64,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}->{} group {} term {} index {} entries {}",
            self.msg_type,
            self.from,
            self.to,
            self.group_id,
            self.term,
            self.index,
            self.entries.len()
        )
    }
}

/// Whether the message type is a local event that never crosses the network.
pub fn is_local_msg(t: MessageType) -> bool {
    matches!(
        t,
        MessageType::MsgHup
            | MessageType::MsgBeat
            | MessageType::MsgUnreachable
            | MessageType::MsgSnapStatus
            | MessageType::MsgCheckQuorum
    )
}

/// Whether the message type answers a request from another peer.
pub fn is_response_msg(t: MessageType) -> bool {
    matches!(
        t,
        MessageType::MsgAppendResponse
            | MessageType::MsgRequestVoteResponse
            | MessageType::MsgHeartbeatResponse
            | MessageType::MsgUnreachable
            | MessageType::MsgRequestPreVoteResponse
    )
}

/// Maps vote and pre-vote message types to their correspond responses.
pub fn vote_resp_msg_type(t: MessageType) -> MessageType {
    match t {
        MessageType::MsgRequestVote => MessageType::MsgRequestVoteResponse,
        MessageType::MsgRequestPreVote => MessageType::MsgRequestPreVoteResponse,
        _ => MessageType::MsgRequestVoteResponse,
    }
}
