// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! Binary encoding of messages, entries and persisted metadata.
//!
//! Every record starts with a fixed-size header of big-endian integers,
//! followed by its variable-length payload. Decoding never panics: a
//! buffer that ends early yields `CodecError::Truncated`.
//!
//! Heartbeats for many groups headed to the same node are coalesced into a
//! single message whose context is the delta-encoded, sorted list of group
//! ids, see [`encode_heartbeat_context`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::CodecError;
use crate::message::{
    ConfChange, ConfChangeSingle, ConfChangeTransition, ConfChangeType, ConfState, Entry,
    EntryType, HardState, Message, MessageType, Peer, PeerType, SnapshotMetadata,
};

type Result<T> = std::result::Result<T, CodecError>;

/// type(1) term(8) index(8) data_len(4)
pub const ENTRY_HEADER_SIZE: usize = 21;

/// type(1) to, from, group_id, term, log_term, index, commit, reject_hint,
/// priority (9 * 8) reject(1) entry_count(4) context_len(4) has_snapshot(1)
pub const MESSAGE_HEADER_SIZE: usize = 83;

/// term(8) vote(8) commit(8)
pub const HARD_STATE_SIZE: usize = 24;

const MAX_VARINT_LEN: usize = 10;

/// A value with a binary wire form.
pub trait Codec: Sized {
    /// Appends the encoded form of `self` to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Reads one value from the front of `buf`, advancing it.
    fn decode(buf: &mut Bytes) -> Result<Self>;

    /// The exact number of bytes `encode` writes.
    fn encoded_len(&self) -> usize;

    /// Encodes into a fresh buffer.
    fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes a value that spans the whole slice.
    fn decode_from(data: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(data);
        Self::decode(&mut buf)
    }
}

#[inline]
fn ensure(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

#[inline]
fn get_u8(buf: &mut Bytes) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

#[inline]
fn get_u32(buf: &mut Bytes) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

#[inline]
fn get_u64(buf: &mut Bytes) -> Result<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

#[inline]
fn get_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes> {
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

fn put_ids(buf: &mut BytesMut, ids: &[u64]) {
    buf.put_u32(ids.len() as u32);
    for id in ids {
        buf.put_u64(*id);
    }
}

fn get_ids(buf: &mut Bytes) -> Result<Vec<u64>> {
    let n = get_u32(buf)? as usize;
    ensure(buf, n.saturating_mul(8))?;
    Ok((0..n).map(|_| buf.get_u64()).collect())
}

/// Writes `v` as an unsigned LEB128 varint.
pub fn put_uvarint(buf: &mut BytesMut, mut v: u64) {
    while v >= 0x80 {
        buf.put_u8((v as u8) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

/// Reads one unsigned LEB128 varint from the front of `buf`.
pub fn get_uvarint(buf: &mut Bytes) -> Result<u64> {
    let mut v = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let b = get_u8(buf)?;
        if i == MAX_VARINT_LEN - 1 && b > 1 {
            return Err(CodecError::Overflow);
        }
        v |= u64::from(b & 0x7f) << (7 * i);
        if b < 0x80 {
            return Ok(v);
        }
    }
    Err(CodecError::Overflow)
}

/// Encodes the set of group ids heartbeat-ed to one peer.
///
/// Ids are sorted and deduplicated, then each is written as the uvarint delta
/// from its predecessor (the first from zero), so the payload grows with the
/// number of groups and not with a per-group message.
pub fn encode_heartbeat_context(ids: &[u64]) -> Bytes {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut buf = BytesMut::with_capacity(sorted.len() * 2);
    let mut prev = 0;
    for id in sorted {
        put_uvarint(&mut buf, id - prev);
        prev = id;
    }
    buf.freeze()
}

/// Reverses [`encode_heartbeat_context`] with prefix sums.
pub fn decode_heartbeat_context(data: &[u8]) -> Result<Vec<u64>> {
    let mut buf = Bytes::copy_from_slice(data);
    let mut ids = Vec::new();
    let mut prev = 0u64;
    while buf.has_remaining() {
        let delta = get_uvarint(&mut buf)?;
        prev = prev.checked_add(delta).ok_or(CodecError::Overflow)?;
        ids.push(prev);
    }
    Ok(ids)
}

impl Codec for Entry {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.entry_type as u8);
        buf.put_u64(self.term);
        buf.put_u64(self.index);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
    }

    fn decode(buf: &mut Bytes) -> Result<Entry> {
        ensure(buf, ENTRY_HEADER_SIZE)?;
        let tag = buf.get_u8();
        let entry_type = EntryType::from_u8(tag).ok_or(CodecError::UnknownTag("entry", tag))?;
        let term = buf.get_u64();
        let index = buf.get_u64();
        let len = buf.get_u32() as usize;
        let data = get_bytes(buf, len)?;
        Ok(Entry {
            entry_type,
            term,
            index,
            data,
        })
    }

    fn encoded_len(&self) -> usize {
        ENTRY_HEADER_SIZE + self.data.len()
    }
}

impl Codec for HardState {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.term);
        buf.put_u64(self.vote);
        buf.put_u64(self.commit);
    }

    fn decode(buf: &mut Bytes) -> Result<HardState> {
        ensure(buf, HARD_STATE_SIZE)?;
        Ok(HardState {
            term: buf.get_u64(),
            vote: buf.get_u64(),
            commit: buf.get_u64(),
        })
    }

    fn encoded_len(&self) -> usize {
        HARD_STATE_SIZE
    }
}

impl Codec for ConfState {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.auto_leave as u8);
        put_ids(buf, &self.voters);
        put_ids(buf, &self.learners);
        put_ids(buf, &self.voters_outgoing);
        put_ids(buf, &self.learners_next);
    }

    fn decode(buf: &mut Bytes) -> Result<ConfState> {
        let auto_leave = get_u8(buf)? != 0;
        Ok(ConfState {
            voters: get_ids(buf)?,
            learners: get_ids(buf)?,
            voters_outgoing: get_ids(buf)?,
            learners_next: get_ids(buf)?,
            auto_leave,
        })
    }

    fn encoded_len(&self) -> usize {
        1 + 16
            + 8 * (self.voters.len()
                + self.learners.len()
                + self.voters_outgoing.len()
                + self.learners_next.len())
    }
}

/// id(8) replica_id(8) type(1) priority(8)
const PEER_SIZE: usize = 25;

impl Codec for Peer {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.id);
        buf.put_u64(self.replica_id);
        buf.put_u8(self.peer_type as u8);
        buf.put_u64(self.priority);
    }

    fn decode(buf: &mut Bytes) -> Result<Peer> {
        ensure(buf, PEER_SIZE)?;
        let id = buf.get_u64();
        let replica_id = buf.get_u64();
        let tag = buf.get_u8();
        let peer_type = PeerType::from_u8(tag).ok_or(CodecError::UnknownTag("peer", tag))?;
        Ok(Peer {
            id,
            replica_id,
            peer_type,
            priority: buf.get_u64(),
        })
    }

    fn encoded_len(&self) -> usize {
        PEER_SIZE
    }
}

impl Codec for SnapshotMetadata {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.index);
        buf.put_u64(self.term);
        self.conf_state.encode(buf);
        buf.put_u32(self.peers.len() as u32);
        for p in &self.peers {
            p.encode(buf);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<SnapshotMetadata> {
        let index = get_u64(buf)?;
        let term = get_u64(buf)?;
        let conf_state = ConfState::decode(buf)?;
        let n = get_u32(buf)? as usize;
        ensure(buf, n.saturating_mul(PEER_SIZE))?;
        let mut peers = Vec::with_capacity(n);
        for _ in 0..n {
            peers.push(Peer::decode(buf)?);
        }
        Ok(SnapshotMetadata {
            index,
            term,
            conf_state,
            peers,
        })
    }

    fn encoded_len(&self) -> usize {
        16 + self.conf_state.encoded_len() + 4 + PEER_SIZE * self.peers.len()
    }
}

impl Codec for ConfChange {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.transition as u8);
        buf.put_u32(self.changes.len() as u32);
        for cc in &self.changes {
            buf.put_u8(cc.change_type as u8);
            cc.peer.encode(buf);
        }
        buf.put_u32(self.context.len() as u32);
        buf.put_slice(&self.context);
    }

    fn decode(buf: &mut Bytes) -> Result<ConfChange> {
        let tag = get_u8(buf)?;
        let transition = ConfChangeTransition::from_u8(tag)
            .ok_or(CodecError::UnknownTag("conf change transition", tag))?;
        let n = get_u32(buf)? as usize;
        ensure(buf, n.saturating_mul(1 + PEER_SIZE))?;
        let mut changes = Vec::with_capacity(n);
        for _ in 0..n {
            let tag = buf.get_u8();
            let change_type = ConfChangeType::from_u8(tag)
                .ok_or(CodecError::UnknownTag("conf change type", tag))?;
            let peer = Peer::decode(buf)?;
            changes.push(ConfChangeSingle { change_type, peer });
        }
        let len = get_u32(buf)? as usize;
        let context = get_bytes(buf, len)?;
        Ok(ConfChange {
            transition,
            changes,
            context,
        })
    }

    fn encoded_len(&self) -> usize {
        1 + 4 + self.changes.len() * (1 + PEER_SIZE) + 4 + self.context.len()
    }
}

impl Codec for Message {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.msg_type as u8);
        buf.put_u64(self.to);
        buf.put_u64(self.from);
        buf.put_u64(self.group_id);
        buf.put_u64(self.term);
        buf.put_u64(self.log_term);
        buf.put_u64(self.index);
        buf.put_u64(self.commit);
        buf.put_u64(self.reject_hint);
        buf.put_u64(self.priority);
        buf.put_u8(self.reject as u8);
        buf.put_u32(self.entries.len() as u32);
        buf.put_u32(self.context.len() as u32);
        buf.put_u8(self.snapshot.is_some() as u8);
        for e in &self.entries {
            e.encode(buf);
        }
        buf.put_slice(&self.context);
        if let Some(meta) = &self.snapshot {
            meta.encode(buf);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Message> {
        ensure(buf, MESSAGE_HEADER_SIZE)?;
        let tag = buf.get_u8();
        let msg_type = MessageType::from_u8(tag).ok_or(CodecError::UnknownTag("message", tag))?;
        let mut m = Message {
            msg_type,
            to: buf.get_u64(),
            from: buf.get_u64(),
            group_id: buf.get_u64(),
            term: buf.get_u64(),
            log_term: buf.get_u64(),
            index: buf.get_u64(),
            commit: buf.get_u64(),
            reject_hint: buf.get_u64(),
            priority: buf.get_u64(),
            reject: buf.get_u8() != 0,
            ..Default::default()
        };
        let entry_count = buf.get_u32() as usize;
        let context_len = buf.get_u32() as usize;
        let has_snapshot = buf.get_u8() != 0;
        ensure(buf, entry_count.saturating_mul(ENTRY_HEADER_SIZE))?;
        m.entries.reserve(entry_count);
        for _ in 0..entry_count {
            m.entries.push(Entry::decode(buf)?);
        }
        m.context = get_bytes(buf, context_len)?;
        if has_snapshot {
            m.snapshot = Some(SnapshotMetadata::decode(buf)?);
        }
        Ok(m)
    }

    fn encoded_len(&self) -> usize {
        MESSAGE_HEADER_SIZE
            + self.entries.iter().map(Codec::encoded_len).sum::<usize>()
            + self.context.len()
            + self.snapshot.as_ref().map_or(0, Codec::encoded_len)
    }
}
