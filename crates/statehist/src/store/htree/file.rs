//! History file header and block I/O.
//!
//! ## File Layout
//!
//! ```text
//! +------------------+
//! | Header (64 B)    |
//! +------------------+
//! | Node 0 block     |  offset = 64 + seq * block_size
//! | Node 1 block     |
//! | ...              |
//! +------------------+
//! | Attribute tree   |  written once the history is finished
//! | + CRC32 (4 B)    |
//! +------------------+
//! ```
//!
//! ## Header Layout
//!
//! ```text
//! Offset  Size    Field
//! ------  ----    -----
//! 0x00    4       magic "SHTF"
//! 0x04    2       format version (u16 LE)
//! 0x06    4       provider version (u32 LE)
//! 0x0A    4       block size (u32 LE)
//! 0x0E    4       max children (u32 LE)
//! 0x12    4       node count (u32 LE)
//! 0x16    4       root sequence number (u32 LE)
//! 0x1A    8       tree start (i64 LE)
//! 0x22    8       tree end (i64 LE)
//! 0x2A    8       attribute section offset (u64 LE)
//! 0x32    4       attribute section size (u32 LE, without CRC)
//! 0x36    1       finished flag
//! 0x37    5       reserved
//! 0x3C    4       header CRC32 (u32 LE)
//! ```

use crate::attribute::AttributeTree;
use crate::error::{Result, StateError};
use crate::interval::Timestamp;
use crate::store::htree::config::HistoryTreeConfig;
use crate::store::htree::node::HtNode;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Magic bytes identifying a history file.
pub const HISTORY_MAGIC: [u8; 4] = *b"SHTF";

/// Current file format version.
pub const HISTORY_FORMAT_VERSION: u16 = 1;

/// Size of the file header in bytes.
pub const HEADER_SIZE: usize = 64;

/// History file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Version of the provider that built the history.
    pub provider_version: u32,
    /// Node block size.
    pub block_size: u32,
    /// Maximum children per core node.
    pub max_children: u32,
    /// Number of node blocks in the file.
    pub node_count: u32,
    /// Sequence number of the root node.
    pub root_seq: u32,
    /// Start of the history.
    pub tree_start: Timestamp,
    /// End of the history.
    pub tree_end: Timestamp,
    /// Offset of the attribute section.
    pub attr_offset: u64,
    /// Size of the attribute section, excluding its CRC.
    pub attr_size: u32,
    /// Whether the history was completely built.
    pub finished: bool,
}

fn le_array<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[offset..offset + N]);
    out
}

impl FileHeader {
    /// Header of a history that is still being built.
    pub fn unfinished(config: &HistoryTreeConfig) -> Self {
        Self {
            provider_version: config.provider_version,
            block_size: config.block_size as u32,
            max_children: config.max_children as u32,
            node_count: 0,
            root_seq: 0,
            tree_start: config.tree_start,
            tree_end: config.tree_start,
            attr_offset: 0,
            attr_size: 0,
            finished: false,
        }
    }

    /// Tree configuration described by this header.
    pub fn config(&self) -> HistoryTreeConfig {
        HistoryTreeConfig::default()
            .with_block_size(self.block_size as usize)
            .with_max_children(self.max_children as usize)
            .with_provider_version(self.provider_version)
            .with_tree_start(self.tree_start)
    }

    /// Writes the header using little-endian byte order.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&HISTORY_MAGIC);
        buf.extend_from_slice(&HISTORY_FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.provider_version.to_le_bytes());
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.extend_from_slice(&self.max_children.to_le_bytes());
        buf.extend_from_slice(&self.node_count.to_le_bytes());
        buf.extend_from_slice(&self.root_seq.to_le_bytes());
        buf.extend_from_slice(&self.tree_start.to_le_bytes());
        buf.extend_from_slice(&self.tree_end.to_le_bytes());
        buf.extend_from_slice(&self.attr_offset.to_le_bytes());
        buf.extend_from_slice(&self.attr_size.to_le_bytes());
        buf.push(self.finished as u8);
        buf.resize(HEADER_SIZE - 4, 0);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        writer.write_all(&buf)?;
        Ok(())
    }

    /// Reads and validates a header.
    ///
    /// # Errors
    ///
    /// - `StateError::InvalidMagic` if the magic bytes don't match
    /// - `StateError::UnsupportedVersion` for a newer format version
    /// - `StateError::ChecksumMismatch` if the header CRC is wrong
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        let magic: [u8; 4] = le_array(&buf, 0);
        if magic != HISTORY_MAGIC {
            return Err(StateError::InvalidMagic(magic));
        }
        let version = u16::from_le_bytes(le_array(&buf, 4));
        if version > HISTORY_FORMAT_VERSION {
            return Err(StateError::UnsupportedVersion(version as u32));
        }
        let expected = u32::from_le_bytes(le_array(&buf, HEADER_SIZE - 4));
        let actual = crc32fast::hash(&buf[..HEADER_SIZE - 4]);
        if expected != actual {
            return Err(StateError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            provider_version: u32::from_le_bytes(le_array(&buf, 0x06)),
            block_size: u32::from_le_bytes(le_array(&buf, 0x0A)),
            max_children: u32::from_le_bytes(le_array(&buf, 0x0E)),
            node_count: u32::from_le_bytes(le_array(&buf, 0x12)),
            root_seq: u32::from_le_bytes(le_array(&buf, 0x16)),
            tree_start: i64::from_le_bytes(le_array(&buf, 0x1A)),
            tree_end: i64::from_le_bytes(le_array(&buf, 0x22)),
            attr_offset: u64::from_le_bytes(le_array(&buf, 0x2A)),
            attr_size: u32::from_le_bytes(le_array(&buf, 0x32)),
            finished: buf[0x36] != 0,
        })
    }
}

/// Bounded cache of decoded closed nodes, evicted in insertion order.
#[derive(Debug)]
struct NodeCache {
    capacity: usize,
    nodes: HashMap<u32, Arc<HtNode>>,
    order: VecDeque<u32>,
}

impl NodeCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            nodes: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, seq: u32) -> Option<Arc<HtNode>> {
        self.nodes.get(&seq).cloned()
    }

    fn insert(&mut self, node: Arc<HtNode>) {
        if self.capacity == 0 {
            return;
        }
        let seq = node.seq();
        if self.nodes.insert(seq, node).is_none() {
            self.order.push_back(seq);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.nodes.remove(&evicted);
            }
        }
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.order.clear();
    }
}

/// Block-level access to a history file.
#[derive(Debug)]
pub struct NodeIo {
    file: Mutex<File>,
    cache: Mutex<NodeCache>,
    config: HistoryTreeConfig,
}

impl NodeIo {
    /// Wraps an open read-write file.
    pub fn new(file: File, config: HistoryTreeConfig) -> Self {
        Self {
            file: Mutex::new(file),
            cache: Mutex::new(NodeCache::new(config.node_cache_size)),
            config,
        }
    }

    /// Tree configuration used to encode blocks.
    pub fn config(&self) -> &HistoryTreeConfig {
        &self.config
    }

    fn block_offset(&self, seq: u32) -> u64 {
        HEADER_SIZE as u64 + seq as u64 * self.config.block_size as u64
    }

    /// Offset right after the last of `node_count` blocks.
    pub fn end_of_nodes(&self, node_count: u32) -> u64 {
        self.block_offset(node_count)
    }

    /// Writes a closed node to its block and caches it.
    pub fn write_node(&self, node: HtNode) -> Result<()> {
        let block = node.to_block(&self.config)?;
        {
            let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
            file.seek(SeekFrom::Start(self.block_offset(node.seq())))?;
            file.write_all(&block)?;
        }
        trace!(seq = node.seq(), start = node.start(), end = node.end(), "node written");
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(Arc::new(node));
        Ok(())
    }

    /// Reads a closed node, going through the cache.
    ///
    /// # Errors
    ///
    /// Returns `StateError::ChecksumMismatch` for a damaged block and
    /// `StateError::Decode` if the block holds another node.
    pub fn read_node(&self, seq: u32) -> Result<Arc<HtNode>> {
        if let Some(node) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(seq) {
            return Ok(node);
        }

        let mut block = vec![0u8; self.config.block_size];
        {
            let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
            file.seek(SeekFrom::Start(self.block_offset(seq)))?;
            file.read_exact(&mut block)?;
        }
        let node = HtNode::from_block(&block, &self.config)?;
        if node.seq() != seq {
            return Err(StateError::Decode(format!(
                "block {} holds node {}",
                seq,
                node.seq()
            )));
        }

        let node = Arc::new(node);
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(Arc::clone(&node));
        Ok(node)
    }

    /// Writes the attribute section at `offset`, returning its size.
    pub fn write_attributes(&self, offset: u64, attributes: &AttributeTree) -> Result<u32> {
        let mut buf = Vec::new();
        attributes.write_to(&mut buf)?;
        let size = u32::try_from(buf.len()).map_err(|_| {
            StateError::InvalidArgument(format!("attribute section of {} bytes", buf.len()))
        })?;
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&buf)?;
        Ok(size)
    }

    /// Reads the attribute section described by the header.
    pub fn read_attributes(&self, offset: u64, size: u32) -> Result<AttributeTree> {
        let mut buf = vec![0u8; size as usize + 4];
        {
            let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
        }
        let (body, trailer) = buf.split_at(size as usize);
        let expected = u32::from_le_bytes(le_array(trailer, 0));
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(StateError::ChecksumMismatch { expected, actual });
        }
        AttributeTree::read_from(&mut &body[..])
    }

    /// Rewrites the file header.
    pub fn write_header(&self, header: &FileHeader) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(0))?;
        header.write_to(&mut *file)?;
        Ok(())
    }

    /// Flushes all written data to disk.
    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.sync_all()?;
        Ok(())
    }

    /// Drops every cached node.
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::htree::node::NodeKind;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn header() -> FileHeader {
        FileHeader {
            provider_version: 2,
            block_size: 4096,
            max_children: 8,
            node_count: 12,
            root_seq: 11,
            tree_start: -5,
            tree_end: 1_000_000,
            attr_offset: 64 + 12 * 4096,
            attr_size: 321,
            finished: true,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let mut buf = Vec::new();
        header().write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(FileHeader::read_from(&mut &buf[..]).unwrap(), header());
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut buf = Vec::new();
        header().write_to(&mut buf).unwrap();
        buf[0] = b'X';
        assert!(matches!(
            FileHeader::read_from(&mut &buf[..]),
            Err(StateError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_header_detects_corruption() {
        let mut buf = Vec::new();
        header().write_to(&mut buf).unwrap();
        buf[0x1A] ^= 0x01;
        assert!(matches!(
            FileHeader::read_from(&mut &buf[..]),
            Err(StateError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_node_and_attribute_io() {
        let dir = TempDir::new().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("test.ht"))
            .unwrap();
        let config = HistoryTreeConfig::default()
            .with_block_size(512)
            .with_max_children(4)
            .with_node_cache_size(0);
        let io = NodeIo::new(file, config);

        let mut node = HtNode::new(NodeKind::Leaf, 3, Some(0), 10);
        node.close(20);
        io.write_node(node).unwrap();
        let read = io.read_node(3).unwrap();
        assert_eq!((read.start(), read.end()), (10, 20));

        let mut tree = AttributeTree::new();
        tree.get_or_add(crate::interval::ROOT_ATTRIBUTE, &["CPUs", "0"])
            .unwrap();
        let offset = io.end_of_nodes(4);
        let size = io.write_attributes(offset, &tree).unwrap();
        let read = io.read_attributes(offset, size).unwrap();
        assert_eq!(read.len(), 2);
    }
}
