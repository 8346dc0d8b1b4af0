// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

/*!

This module contains various testing harness utilities for multiraft.

It drives bare [`Raft`](multiraft::Raft) state machines over a simulated
network, without tasks or timers, so every message can be observed.

*/

mod interface;
mod network;

pub use self::{interface::Interface, network::Network};
