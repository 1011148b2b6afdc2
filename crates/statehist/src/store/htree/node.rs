//! History tree nodes and their block encoding.
//!
//! ## Binary Layout
//!
//! ```text
//! Offset  Size    Field
//! ------  ----    -----
//! 0x00    1       kind (1 = core, 2 = leaf)
//! 0x01    1       closed flag
//! 0x02    4       sequence number (u32 LE)
//! 0x06    4       parent sequence number (i32 LE, -1 for the root)
//! 0x0A    8       node start (i64 LE)
//! 0x12    8       node end (i64 LE)
//! 0x1A    4       interval count (u32 LE)
//! 0x1E    2       child count (u16 LE)
//! 0x20    12*C    core only: C = max_children slots of (seq u32, start i64)
//! ...     N       intervals, in insertion (end time) order
//! ...     pad     zeroes up to block_size - 4
//! end-4   4       block CRC32 (u32 LE) of everything before it
//! ```

use crate::error::{Result, StateError};
use crate::interval::{Quark, StateInterval, Timestamp};
use crate::store::htree::config::HistoryTreeConfig;
use std::io::{Cursor, Read, Write};

/// Size of the fixed node header.
pub const NODE_HEADER_SIZE: usize = 32;

/// Size of the block checksum.
pub const NODE_TRAILER_SIZE: usize = 4;

/// Size of one child slot in a core node.
pub const CHILD_ENTRY_SIZE: usize = 4 + 8;

/// Position of a node in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    /// Inner node with children.
    Core = 1,
    /// Bottom node.
    Leaf = 2,
}

impl NodeKind {
    /// Creates a NodeKind from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Core),
            2 => Some(Self::Leaf),
            _ => None,
        }
    }
}

/// Link from a core node to one of its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildLink {
    /// Sequence number of the child.
    pub seq: u32,
    /// Start time of the child.
    pub start: Timestamp,
}

/// One node of the history tree.
///
/// A node covers `[start, end]` and holds the intervals that start at or
/// after `start` and were inserted while it was on the latest branch. Once
/// closed it is immutable and lives on disk.
#[derive(Debug, Clone)]
pub struct HtNode {
    kind: NodeKind,
    seq: u32,
    parent: Option<u32>,
    start: Timestamp,
    end: Timestamp,
    closed: bool,
    intervals: Vec<StateInterval>,
    children: Vec<ChildLink>,
    used_bytes: usize,
}

impl HtNode {
    /// Creates an empty open node.
    pub fn new(kind: NodeKind, seq: u32, parent: Option<u32>, start: Timestamp) -> Self {
        Self {
            kind,
            seq,
            parent,
            start,
            end: start,
            closed: false,
            intervals: Vec::new(),
            children: Vec::new(),
            used_bytes: 0,
        }
    }

    /// Node kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Sequence number, which also locates the block on disk.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Parent sequence number, `None` for the root.
    pub fn parent(&self) -> Option<u32> {
        self.parent
    }

    /// Start time.
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// End time; only meaningful once closed.
    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Returns true once the node was closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stored intervals, sorted by end time.
    pub fn intervals(&self) -> &[StateInterval] {
        &self.intervals
    }

    /// Child links, sorted by start time.
    pub fn children(&self) -> &[ChildLink] {
        &self.children
    }

    pub(crate) fn set_parent(&mut self, parent: u32) {
        self.parent = Some(parent);
    }

    fn capacity(&self, config: &HistoryTreeConfig) -> usize {
        match self.kind {
            NodeKind::Core => config.core_capacity(),
            NodeKind::Leaf => config.leaf_capacity(),
        }
    }

    /// Bytes still available for intervals.
    pub fn free_space(&self, config: &HistoryTreeConfig) -> usize {
        self.capacity(config).saturating_sub(self.used_bytes)
    }

    /// Appends an interval; the caller checked [`free_space`](Self::free_space).
    pub fn add_interval(&mut self, interval: StateInterval) {
        debug_assert!(!self.closed);
        self.used_bytes += interval.encoded_size();
        self.intervals.push(interval);
    }

    /// Registers a new child starting at `start`.
    pub fn link_child(&mut self, seq: u32, start: Timestamp) {
        debug_assert_eq!(self.kind, NodeKind::Core);
        self.children.push(ChildLink { seq, start });
    }

    /// Closes the node at `end`.
    ///
    /// An empty node closed right after being opened gets `end = start - 1`
    /// and covers nothing.
    pub fn close(&mut self, end: Timestamp) {
        self.end = end.max(self.start - 1);
        self.closed = true;
    }

    /// Index of the first interval that could cover `t`.
    fn first_candidate(&self, t: Timestamp) -> usize {
        self.intervals.partition_point(|interval| interval.end() < t)
    }

    /// Returns the interval of `quark` covering `t` stored in this node.
    pub fn find(&self, t: Timestamp, quark: Quark) -> Option<&StateInterval> {
        self.intervals[self.first_candidate(t)..]
            .iter()
            .find(|interval| interval.quark() == quark && interval.start() <= t)
    }

    /// Copies every interval of this node covering `t` into `states`.
    pub fn collect(&self, t: Timestamp, states: &mut [Option<StateInterval>]) {
        for interval in &self.intervals[self.first_candidate(t)..] {
            if interval.start() > t {
                continue;
            }
            if let Some(slot) = states.get_mut(interval.quark() as usize) {
                *slot = Some(interval.clone());
            }
        }
    }

    /// Returns the child whose time range contains `t`.
    pub fn child_at(&self, t: Timestamp) -> Option<u32> {
        let index = self.children.partition_point(|child| child.start <= t);
        index.checked_sub(1).map(|i| self.children[i].seq)
    }

    /// Encodes the node into a block of exactly `config.block_size` bytes.
    pub fn to_block(&self, config: &HistoryTreeConfig) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(config.block_size);
        buf.write_all(&[self.kind as u8, self.closed as u8])?;
        buf.write_all(&self.seq.to_le_bytes())?;
        let parent = self.parent.map_or(-1, |p| p as i32);
        buf.write_all(&parent.to_le_bytes())?;
        buf.write_all(&self.start.to_le_bytes())?;
        buf.write_all(&self.end.to_le_bytes())?;
        buf.write_all(&(self.intervals.len() as u32).to_le_bytes())?;
        buf.write_all(&(self.children.len() as u16).to_le_bytes())?;

        if self.kind == NodeKind::Core {
            for slot in 0..config.max_children {
                match self.children.get(slot) {
                    Some(child) => {
                        buf.write_all(&child.seq.to_le_bytes())?;
                        buf.write_all(&child.start.to_le_bytes())?;
                    }
                    None => buf.write_all(&[0u8; CHILD_ENTRY_SIZE])?,
                }
            }
        }

        for interval in &self.intervals {
            interval.write_to(&mut buf)?;
        }

        let body_size = config.block_size - NODE_TRAILER_SIZE;
        if buf.len() > body_size {
            return Err(StateError::IntervalTooLarge {
                size: buf.len(),
                capacity: body_size,
            });
        }
        buf.resize(body_size, 0);
        let crc = crc32fast::hash(&buf);
        buf.write_all(&crc.to_le_bytes())?;
        Ok(buf)
    }

    /// Decodes a block written by [`to_block`](Self::to_block).
    ///
    /// # Errors
    ///
    /// Returns `StateError::ChecksumMismatch` if the block CRC does not match.
    pub fn from_block(block: &[u8], config: &HistoryTreeConfig) -> Result<Self> {
        if block.len() != config.block_size {
            return Err(StateError::Decode(format!(
                "node block of {} bytes, expected {}",
                block.len(),
                config.block_size
            )));
        }
        let body = &block[..block.len() - NODE_TRAILER_SIZE];
        let expected = u32::from_le_bytes(
            block[block.len() - NODE_TRAILER_SIZE..]
                .try_into()
                .map_err(|_| StateError::Decode("truncated block trailer".to_string()))?,
        );
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(StateError::ChecksumMismatch { expected, actual });
        }

        let mut reader = Cursor::new(body);
        let mut buf1 = [0u8; 1];
        let mut buf2 = [0u8; 2];
        let mut buf4 = [0u8; 4];
        let mut buf8 = [0u8; 8];

        reader.read_exact(&mut buf1)?;
        let kind = NodeKind::from_u8(buf1[0])
            .ok_or_else(|| StateError::Decode(format!("unknown node kind {}", buf1[0])))?;
        reader.read_exact(&mut buf1)?;
        let closed = buf1[0] != 0;
        reader.read_exact(&mut buf4)?;
        let seq = u32::from_le_bytes(buf4);
        reader.read_exact(&mut buf4)?;
        let parent = i32::from_le_bytes(buf4);
        let parent = (parent >= 0).then_some(parent as u32);
        reader.read_exact(&mut buf8)?;
        let start = i64::from_le_bytes(buf8);
        reader.read_exact(&mut buf8)?;
        let end = i64::from_le_bytes(buf8);
        reader.read_exact(&mut buf4)?;
        let interval_count = u32::from_le_bytes(buf4) as usize;
        reader.read_exact(&mut buf2)?;
        let child_count = u16::from_le_bytes(buf2) as usize;

        let mut children = Vec::with_capacity(child_count);
        if kind == NodeKind::Core {
            if child_count > config.max_children {
                return Err(StateError::Decode(format!(
                    "node {} has {} children, max is {}",
                    seq, child_count, config.max_children
                )));
            }
            for slot in 0..config.max_children {
                reader.read_exact(&mut buf4)?;
                reader.read_exact(&mut buf8)?;
                if slot < child_count {
                    children.push(ChildLink {
                        seq: u32::from_le_bytes(buf4),
                        start: i64::from_le_bytes(buf8),
                    });
                }
            }
        }

        let data_start = reader.position() as usize;
        let mut intervals = Vec::with_capacity(interval_count);
        for _ in 0..interval_count {
            intervals.push(StateInterval::read_from(&mut reader)?);
        }
        let used_bytes = reader.position() as usize - data_start;

        Ok(Self {
            kind,
            seq,
            parent,
            start,
            end,
            closed,
            intervals,
            children,
            used_bytes,
        })
    }
}
