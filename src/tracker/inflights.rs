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

use std::collections::VecDeque;

/// A sliding window over the last indexes of appends sent to a peer and not
/// yet acknowledged. Indexes are added in increasing order.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Inflights {
    window: VecDeque<u64>,
    cap: usize,
}

impl Inflights {
    /// Creates a new buffer for inflight messages.
    pub fn new(cap: usize) -> Inflights {
        Inflights {
            window: VecDeque::new(),
            cap,
        }
    }

    /// Returns true if the inflights is full.
    #[inline]
    pub fn full(&self) -> bool {
        self.window.len() >= self.cap
    }

    /// Adds an inflight into inflights. Callers check `full` first.
    pub fn add(&mut self, inflight: u64) {
        debug_assert!(!self.full(), "cannot add into a full inflights");
        debug_assert!(self.window.back().map_or(true, |last| *last <= inflight));
        if self.window.capacity() == 0 {
            self.window.reserve(self.cap);
        }
        self.window.push_back(inflight);
    }

    /// Frees the inflights smaller or equal to the given `to` flight.
    pub fn free_to(&mut self, to: u64) {
        while self.window.front().map_or(false, |first| *first <= to) {
            self.window.pop_front();
        }
    }

    /// Frees the first buffer entry.
    #[inline]
    pub fn free_first_one(&mut self) {
        self.window.pop_front();
    }

    /// Frees all inflights and releases the buffer.
    #[inline]
    pub fn reset(&mut self) {
        self.window = VecDeque::new();
    }

    /// Number of inflight messages.
    #[inline]
    pub fn count(&self) -> usize {
        self.window.len()
    }

    /// The maximum number of inflight messages.
    #[inline]
    pub fn cap(&self) -> usize {
        self.cap
    }
}
