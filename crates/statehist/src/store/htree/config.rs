//! History tree configuration.

use crate::error::{Result, StateError};
use crate::interval::Timestamp;
use crate::store::htree::node::{CHILD_ENTRY_SIZE, NODE_HEADER_SIZE, NODE_TRAILER_SIZE};

/// Default size of one node block: 64 KiB.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Default maximum number of children per core node.
pub const DEFAULT_MAX_CHILDREN: usize = 50;

/// Default number of closed nodes kept decoded in memory.
pub const DEFAULT_NODE_CACHE_SIZE: usize = 256;

/// Smallest interval encoding (null value), used to validate block sizes.
const MIN_INTERVAL_SIZE: usize = 21;

/// Configuration for a history tree file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTreeConfig {
    /// Size in bytes of every node block on disk.
    ///
    /// Larger blocks mean a shallower tree but more bytes read per node.
    /// Default: 64 KiB.
    pub block_size: usize,

    /// Maximum number of children of a core node. Default: 50.
    pub max_children: usize,

    /// Version of the provider that produced the history.
    ///
    /// A stored history is only reopened if this matches.
    pub provider_version: u32,

    /// Start time of the history.
    pub tree_start: Timestamp,

    /// Number of closed nodes kept decoded in memory. Default: 256.
    pub node_cache_size: usize,
}

impl Default for HistoryTreeConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_children: DEFAULT_MAX_CHILDREN,
            provider_version: 0,
            tree_start: 0,
            node_cache_size: DEFAULT_NODE_CACHE_SIZE,
        }
    }
}

impl HistoryTreeConfig {
    /// Creates a new configuration with custom block size.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Creates a new configuration with custom max children.
    pub fn with_max_children(mut self, max_children: usize) -> Self {
        self.max_children = max_children;
        self
    }

    /// Creates a new configuration with custom provider version.
    pub fn with_provider_version(mut self, version: u32) -> Self {
        self.provider_version = version;
        self
    }

    /// Creates a new configuration with custom tree start.
    pub fn with_tree_start(mut self, tree_start: Timestamp) -> Self {
        self.tree_start = tree_start;
        self
    }

    /// Creates a new configuration with custom node cache size.
    pub fn with_node_cache_size(mut self, size: usize) -> Self {
        self.node_cache_size = size;
        self
    }

    /// Bytes available for intervals in a leaf node.
    pub fn leaf_capacity(&self) -> usize {
        self.block_size
            .saturating_sub(NODE_HEADER_SIZE + NODE_TRAILER_SIZE)
    }

    /// Bytes available for intervals in a core node.
    pub fn core_capacity(&self) -> usize {
        self.leaf_capacity()
            .saturating_sub(self.max_children * CHILD_ENTRY_SIZE)
    }

    /// Checks that the configuration can hold at least one interval per node.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidArgument` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.max_children < 2 {
            return Err(StateError::InvalidArgument(format!(
                "max_children must be at least 2, got {}",
                self.max_children
            )));
        }
        if self.max_children > u16::MAX as usize {
            return Err(StateError::InvalidArgument(format!(
                "max_children must fit in 16 bits, got {}",
                self.max_children
            )));
        }
        if u32::try_from(self.block_size).is_err() {
            return Err(StateError::InvalidArgument(format!(
                "block_size {} too large",
                self.block_size
            )));
        }
        if self.core_capacity() < MIN_INTERVAL_SIZE {
            return Err(StateError::InvalidArgument(format!(
                "block_size {} too small for {} children",
                self.block_size, self.max_children
            )));
        }
        Ok(())
    }
}
