// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! The network between the nodes of a cluster.

use crate::errors::Result;
use crate::message::Message;
use crate::state_machine::Snapshot;

/// Delivers messages to other nodes.
///
/// The receiving side hands them to `Server::receive_message` and
/// `Server::receive_snapshot`. Retrying and reconnecting are up to the
/// implementation: a lost message is recovered by the protocol itself.
pub trait Transport: Send + Sync {
    /// Sends `m` to node `m.to`. Fire and forget.
    fn send(&self, m: Message);

    /// Streams a snapshot to node `m.to`, returning once it was installed or
    /// failed. Called from a blocking thread.
    fn send_snapshot(&self, m: Message, snapshot: Box<dyn Snapshot>) -> Result<()>;
}
