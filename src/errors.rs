// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::error;
use std::{cmp, io, result};

use thiserror::Error;

/// The base error type for multiraft.
#[derive(Debug, Error)]
pub enum Error {
    /// An IO error occurred
    #[error("{0}")]
    Io(#[from] io::Error),
    /// A storage error occurred.
    #[error("{0}")]
    Store(#[from] StorageError),
    /// A wire message failed to decode.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// Raft cannot step the local message.
    #[error("raft: cannot step raft local message")]
    StepLocalMsg,
    /// The raft peer is not found and thus cannot step.
    #[error("raft: cannot step as peer not found")]
    StepPeerNotFound,
    /// The proposal of changes was dropped.
    #[error("raft: proposal dropped")]
    ProposalDropped,
    /// This node does not believe itself to be the leader of the group.
    #[error("raft: not leader")]
    NotLeader,
    /// The group or the server is shutting down.
    #[error("raft: stopped")]
    Stopped,
    /// The configuration is invalid.
    #[error("{0}")]
    ConfigInvalid(String),
    /// The membership change was refused before taking effect.
    #[error("{0}")]
    ConfChangeError(String),
    /// A group with this id is already registered.
    #[error("raft group {0} already exists")]
    RaftExists(u64),
    /// No group with this id is registered.
    #[error("raft group {0} does not exist")]
    RaftNotExists(u64),
    /// A state that can never be reached by a correct peer was observed.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),
    /// The application state machine failed.
    #[error("state machine: {0}")]
    StateMachine(String),
}

impl Error {
    /// Whether the group can no longer make progress after observing this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Io(_) | Error::Codec(_) | Error::InvariantViolated(_) => true,
            Error::Store(e) => !matches!(
                e,
                StorageError::LogNotFound(_)
                    | StorageError::Compacted
                    | StorageError::SnapshotOutOfDate
                    | StorageError::SnapshotTemporarilyUnavailable
            ),
            _ => false,
        }
    }
}

impl cmp::PartialEq for Error {
    #[allow(clippy::match_same_arms)]
    fn eq(&self, other: &Error) -> bool {
        match (self, other) {
            (Error::StepPeerNotFound, Error::StepPeerNotFound) => true,
            (Error::ProposalDropped, Error::ProposalDropped) => true,
            (Error::NotLeader, Error::NotLeader) => true,
            (Error::Stopped, Error::Stopped) => true,
            (Error::Store(e1), Error::Store(e2)) => e1 == e2,
            (Error::Codec(e1), Error::Codec(e2)) => e1 == e2,
            (Error::Io(e1), Error::Io(e2)) => e1.kind() == e2.kind(),
            (Error::StepLocalMsg, Error::StepLocalMsg) => true,
            (Error::ConfigInvalid(e1), Error::ConfigInvalid(e2)) => e1 == e2,
            (Error::ConfChangeError(e1), Error::ConfChangeError(e2)) => e1 == e2,
            (Error::RaftExists(g1), Error::RaftExists(g2)) => g1 == g2,
            (Error::RaftNotExists(g1), Error::RaftNotExists(g2)) => g1 == g2,
            (Error::InvariantViolated(e1), Error::InvariantViolated(e2)) => e1 == e2,
            (Error::StateMachine(e1), Error::StateMachine(e2)) => e1 == e2,
            _ => false,
        }
    }
}

/// An error with the storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The log entry at this index is no longer retained, or never existed.
    /// A peer asking for it has to be caught up with a snapshot.
    #[error("log entry {0} not found")]
    LogNotFound(u64),
    /// The key has never been written.
    #[error("key not found")]
    KeyNotFound,
    /// The storage was compacted and not accessible
    #[error("log compacted")]
    Compacted,
    /// The log is not available.
    #[error("log unavailable")]
    Unavailable,
    /// The snapshot is out of date.
    #[error("snapshot out of date")]
    SnapshotOutOfDate,
    /// The snapshot is being created.
    #[error("snapshot is temporarily unavailable")]
    SnapshotTemporarilyUnavailable,
    /// Stored bytes could not be interpreted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),
    /// Some other error occurred.
    #[error("unknown error {0}")]
    Other(#[from] Box<dyn error::Error + Sync + Send>),
}

impl cmp::PartialEq for StorageError {
    #[allow(clippy::match_same_arms)]
    fn eq(&self, other: &StorageError) -> bool {
        matches!(
            (self, other),
            (StorageError::KeyNotFound, StorageError::KeyNotFound)
                | (StorageError::Compacted, StorageError::Compacted)
                | (StorageError::Unavailable, StorageError::Unavailable)
                | (StorageError::SnapshotOutOfDate, StorageError::SnapshotOutOfDate)
                | (
                    StorageError::SnapshotTemporarilyUnavailable,
                    StorageError::SnapshotTemporarilyUnavailable,
                )
        ) || match (self, other) {
            (StorageError::LogNotFound(i1), StorageError::LogNotFound(i2)) => i1 == i2,
            (StorageError::Corrupted(e1), StorageError::Corrupted(e2)) => e1 == e2,
            _ => false,
        }
    }
}

impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> StorageError {
        StorageError::Other(Box::new(e))
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Error {
        Error::Store(e.into())
    }
}

/// An error decoding wire bytes.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CodecError {
    /// The buffer ended before the value was complete.
    #[error("truncated buffer: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },
    /// An enum tag was outside its known range.
    #[error("unknown {0} tag {1}")]
    UnknownTag(&'static str, u8),
    /// A variable-length integer did not fit into 64 bits.
    #[error("varint overflow")]
    Overflow,
}

/// A result type that wraps up the raft errors.
pub type Result<T> = result::Result<T, Error>;
