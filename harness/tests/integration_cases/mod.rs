// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

mod test_membership_changes;
mod test_raft;
mod test_raft_snap;
