// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

pub mod joint;
pub mod majority;

use std::fmt::{self, Debug, Display, Formatter};

use crate::HashMap;

/// VoteResult indicates the outcome of a vote.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum VoteResult {
    /// Pending indicates that the decision of the vote depends on future
    /// votes, i.e. neither "yes" or "no" has reached quorum yet.
    Pending,
    /// Lost indicates that the quorum has voted "no".
    Lost,
    /// Won indicates that the quorum has voted "yes".
    Won,
}

impl Display for VoteResult {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VoteResult::Won => write!(f, "VoteWon"),
            VoteResult::Lost => write!(f, "VoteLost"),
            VoteResult::Pending => write!(f, "VotePending"),
        }
    }
}

impl Debug for VoteResult {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Looks up the highest log index a voter is known to have matched.
pub trait AckedIndexer {
    /// `None` if nothing is known about `voter_id`.
    fn acked_index(&self, voter_id: u64) -> Option<u64>;
}

/// A plain map from voter id to its matched index.
pub type AckIndexer = HashMap<u64, u64>;

impl AckedIndexer for AckIndexer {
    #[inline]
    fn acked_index(&self, voter: u64) -> Option<u64> {
        self.get(&voter).cloned()
    }
}
