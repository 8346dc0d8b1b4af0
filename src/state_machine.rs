// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! The application a group hands committed commands to.

use bytes::Bytes;

use crate::errors::{Error, Result};
use crate::message::{ConfChange, Peer};

/// A point-in-time image of a state machine, read as a sequence of chunks.
///
/// The iterator is forward only: once consumed it cannot be restarted and a
/// fresh snapshot has to be requested.
pub trait Snapshot: Iterator<Item = Result<Bytes>> + Send {
    /// The index of the last entry the image includes.
    fn applied_index(&self) -> u64;
}

/// The application state machine of one group.
///
/// Every method is called from the group's apply task, in log order.
pub trait StateMachine: Send + Sync {
    /// Applies a committed command and returns the response for its proposer.
    fn apply(&self, command: &[u8], index: u64) -> Result<Bytes>;

    /// Observes a committed membership change.
    fn apply_member_change(&self, cc: &ConfChange, index: u64) -> Result<Bytes>;

    /// Takes a snapshot of everything applied so far.
    fn snapshot(&self) -> Result<Box<dyn Snapshot>>;

    /// Replaces the whole state with the one in `snapshot`.
    fn apply_snapshot(&self, peers: &[Peer], snapshot: Box<dyn Snapshot>) -> Result<()>;

    /// Called when the group's leader changes, with `INVALID_ID` when it
    /// lost its leader.
    fn handle_leader_change(&self, leader: u64);

    /// Called once when the group hits an unrecoverable error and stops.
    fn handle_fatal(&self, err: &Error);
}

/// A snapshot held in memory.
#[derive(Debug)]
pub struct MemSnapshot {
    applied_index: u64,
    chunks: std::vec::IntoIter<Bytes>,
}

impl MemSnapshot {
    /// Creates a snapshot made of `chunks` taken at `applied_index`.
    pub fn new(applied_index: u64, chunks: Vec<Bytes>) -> MemSnapshot {
        MemSnapshot {
            applied_index,
            chunks: chunks.into_iter(),
        }
    }
}

impl Iterator for MemSnapshot {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Result<Bytes>> {
        self.chunks.next().map(Ok)
    }
}

impl Snapshot for MemSnapshot {
    fn applied_index(&self) -> u64 {
        self.applied_index
    }
}
