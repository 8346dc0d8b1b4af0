// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use crate::codec::Codec;
use crate::message::Entry;

/// A number to represent that there is no limit.
pub const NO_LIMIT: u64 = u64::MAX;

/// Truncates the list of entries down to a specific byte-length of
/// all entries together.
///
/// # Examples
///
/// ```
/// use multiraft::{util::limit_size, prelude::*};
///
/// let template = Entry::new(1, 1, "*".repeat(100).into_bytes());
///
/// // Make a bunch of entries that are ~100 bytes long
/// let mut entries = vec![template.clone(); 5];
///
/// assert_eq!(entries.len(), 5);
/// limit_size(&mut entries, Some(250));
/// assert_eq!(entries.len(), 2);
///
/// // `entries` will always have at least 1 entry
/// limit_size(&mut entries, Some(0));
/// assert_eq!(entries.len(), 1);
/// ```
pub fn limit_size(entries: &mut Vec<Entry>, max: Option<u64>) {
    if entries.len() <= 1 {
        return;
    }
    let max = match max {
        None | Some(NO_LIMIT) => return,
        Some(max) => max,
    };

    let mut size = 0;
    let limit = entries
        .iter()
        .take_while(|&e| {
            if size == 0 {
                size += e.encoded_len() as u64;
                true
            } else {
                size += e.encoded_len() as u64;
                size <= max
            }
        })
        .count();

    entries.truncate(limit);
}

/// The in-memory footprint used to account unstable entries.
#[inline]
pub fn entry_approximate_size(e: &Entry) -> usize {
    e.encoded_len()
}

/// Check whether `ents` continues `prev` without a gap.
pub fn is_continuous_ents(prev: &[Entry], ents: &[Entry]) -> bool {
    match (prev.last(), ents.first()) {
        (Some(last), Some(first)) => last.index + 1 == first.index,
        _ => true,
    }
}
