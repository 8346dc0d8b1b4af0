// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

// Copyright 2015 The etcd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/*!

## Creating a multi-raft node

A [`Server`] hosts any number of independent raft groups on one node. Every
group has its own log, its own state machine and its own leader, while the
groups share one ticker and one heartbeat per peer node.

```rust,no_run
use std::sync::Arc;

use bytes::Bytes;
use multiraft::prelude::*;
use multiraft::{default_logger, GroupConfig, MemStorage, Server, ServerConfig};

struct Nowhere;

impl Transport for Nowhere {
    fn send(&self, _: Message) {}

    fn send_snapshot(&self, _: Message, _: Box<dyn Snapshot>) -> multiraft::Result<()> {
        Ok(())
    }
}

# struct Echo;
# impl StateMachine for Echo {
#     fn apply(&self, cmd: &[u8], _: u64) -> multiraft::Result<Bytes> { Ok(Bytes::copy_from_slice(cmd)) }
#     fn apply_member_change(&self, _: &ConfChange, _: u64) -> multiraft::Result<Bytes> { Ok(Bytes::new()) }
#     fn snapshot(&self) -> multiraft::Result<Box<dyn Snapshot>> { Ok(Box::new(MemSnapshot::new(0, vec![]))) }
#     fn apply_snapshot(&self, _: &[Peer], _: Box<dyn Snapshot>) -> multiraft::Result<()> { Ok(()) }
#     fn handle_leader_change(&self, _: u64) {}
#     fn handle_fatal(&self, _: &multiraft::Error) {}
# }
# #[tokio::main]
# async fn main() -> multiraft::Result<()> {
let logger = default_logger();
let server = Server::start(ServerConfig::new(1), Arc::new(Nowhere), &logger)?;

let mut group = GroupConfig::new(
    1,
    vec![Peer::voter(1)],
    Arc::new(MemStorage::new()),
    Arc::new(Echo),
);
group.set_leader(1);
server.create(group)?;

let resp = server.propose(1, Bytes::from_static(b"put k v")).await?;
assert_eq!(&resp[..], b"put k v");
server.stop().await;
# Ok(())
# }
```

The transport delivers the messages of other nodes to
[`Server::receive_message`] and streamed snapshots to
[`Server::receive_snapshot`].

## Driving a single raft

The consensus algorithm itself is available as [`RawNode`], to drive by
hand: tick it, step it with messages, and handle its [`Ready`] by persisting
entries, sending messages and applying committed entries before calling
[`RawNode::advance`].

*/

#![deny(clippy::all)]
#![warn(missing_docs)]
#![recursion_limit = "128"]
#![allow(clippy::uninlined_format_args)]

#[macro_use]
extern crate getset;
#[macro_use]
extern crate slog;

pub mod codec;
mod confchange;
mod config;
mod driver;
mod errors;
mod future;
mod log_unstable;
pub mod message;
mod quorum;
mod raft;
mod raft_log;
pub mod raw_node;
mod read_only;
mod server;
mod state_machine;
mod status;
pub mod storage;
mod tracker;
mod transport;
pub mod util;

pub use crate::confchange::{Changer, MapChange, MapChangeType};
pub use crate::config::{Config, GroupConfig, ServerConfig};
pub use crate::driver::Driver;
pub use crate::errors::{CodecError, Error, Result, StorageError};
pub use crate::future::{Future, Promise};
pub use crate::log_unstable::Unstable;
pub use crate::quorum::joint::Configuration as JointConfig;
pub use crate::quorum::majority::Configuration as MajorityConfig;
pub use crate::message::vote_resp_msg_type;
pub use crate::raft::{Raft, SoftState, StateRole};
pub use crate::raft_log::RaftLog;
pub use crate::raw_node::{RawNode, Ready, SnapshotStatus};
pub use crate::read_only::{ReadOnlyOption, ReadState};
pub use crate::server::Server;
pub use crate::state_machine::{MemSnapshot, Snapshot, StateMachine};
pub use crate::status::Status;
pub use crate::storage::{MemStorage, RaftState, SledStorage, Storage};
pub use crate::tracker::{Inflights, Progress, ProgressState, ProgressTracker};
pub use crate::transport::Transport;
pub use crate::util::NO_LIMIT;

pub mod prelude {
    //! A "prelude" for crates using the `multiraft` crate.
    //!
    //! This prelude is similar to the standard library's prelude in that you'll
    //! almost always want to import its entire contents, but unlike the standard
    //! library's prelude you'll have to do so manually:
    //!
    //! ```
    //! use multiraft::prelude::*;
    //! ```
    //!
    //! The prelude may grow over time as additional items see ubiquitous use.

    pub use crate::message::{
        new_conf_change_single, ConfChange, ConfChangeSingle, ConfChangeTransition,
        ConfChangeType, ConfState, Entry, EntryType, HardState, Message, MessageType, Peer,
        PeerType, SnapshotMetadata,
    };

    pub use crate::config::{Config, GroupConfig, ServerConfig};
    pub use crate::raft::Raft;

    pub use crate::storage::{RaftState, Storage};

    pub use crate::raw_node::{RawNode, Ready, SnapshotStatus};

    pub use crate::tracker::Progress;

    pub use crate::status::Status;

    pub use crate::read_only::{ReadOnlyOption, ReadState};

    pub use crate::state_machine::{MemSnapshot, Snapshot, StateMachine};

    pub use crate::transport::Transport;
}

/// The default logger we fall back to when passed `None` in external facing constructors.
///
/// Writes to the terminal through an async drain, filtered by `RUST_LOG`. When
/// `MULTIRAFT_STDLOG` is set, records go to the `log` facade instead.
#[cfg(feature = "default-logger")]
pub fn default_logger() -> slog::Logger {
    use slog::Drain;
    use std::sync::OnceLock;

    static LOGGER: OnceLock<slog::Logger> = OnceLock::new();

    let logger = LOGGER.get_or_init(|| {
        if std::env::var_os("MULTIRAFT_STDLOG").is_some() {
            return slog::Logger::root(slog_stdlog::StdLog.fuse(), o!());
        }
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_envlogger::new(drain);
        let drain = slog_async::Async::new(drain)
            .chan_size(4096)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
            .fuse();
        slog::Logger::root(drain, o!())
    });
    if let Some(case) = std::thread::current()
        .name()
        .and_then(|v| v.split(':').last())
    {
        logger.new(o!("case" => case.to_string()))
    } else {
        logger.new(o!())
    }
}

/// A constant represents invalid id of raft.
pub const INVALID_ID: u64 = 0;
/// A constant represents invalid index of raft log.
pub const INVALID_INDEX: u64 = 0;

/// Get the majority number of given nodes count.
#[inline]
pub fn majority(total: usize) -> usize {
    (total / 2) + 1
}

type DefaultHashBuilder = std::hash::BuildHasherDefault<fxhash::FxHasher>;
type HashMap<K, V> = std::collections::HashMap<K, V, DefaultHashBuilder>;
type HashSet<K> = std::collections::HashSet<K, DefaultHashBuilder>;
