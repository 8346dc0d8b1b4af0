// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

mod test_membership;
mod test_server;
mod test_sled_storage;
mod test_snapshot;
