//! On-disk history tree backend.
//!
//! The history tree is a time-partitioned tree of fixed-size node blocks.
//! Every node covers a time range `[start, end]`; the children of a core node
//! cover consecutive, non-overlapping sub-ranges of it. An interval is stored
//! in the deepest node of the *latest branch* (root to rightmost leaf) that
//! starts at or before the interval's start.
//!
//! ```text
//!                     [root 0 .. 99]
//!          /                |                 \
//!   [0 .. 39]          [40 .. 79]          [80 .. 99]   <- latest branch
//!     closed             closed              open
//! ```
//!
//! Only the latest branch is mutable and held in memory. When its leaf runs
//! out of space, a sibling branch is started at `tree_end + 1` and the full
//! nodes are closed and written to disk. When the root itself has no room for
//! another child, a new root is placed above it and the tree grows one level.
//!
//! A point query descends from the root, checking each node on the path for
//! an interval that covers the requested time.

pub mod config;
pub mod file;
pub mod node;

pub use config::HistoryTreeConfig;
pub use file::{FileHeader, NodeIo};
pub use node::{HtNode, NodeKind};

use crate::attribute::AttributeTree;
use crate::error::{Result, StateError};
use crate::interval::{Quark, StateInterval, Timestamp};
use crate::store::HistoryBackend;
use std::fs::{self, OpenOptions};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// A node reached during a descent: either part of the in-memory latest
/// branch or a closed node loaded from disk.
enum NodeRef<'a> {
    Branch(&'a HtNode),
    Stored(Arc<HtNode>),
}

impl Deref for NodeRef<'_> {
    type Target = HtNode;

    fn deref(&self) -> &HtNode {
        match self {
            Self::Branch(node) => node,
            Self::Stored(node) => node,
        }
    }
}

/// The history tree proper. Not synchronized; see [`HistoryTreeBackend`].
#[derive(Debug)]
pub struct HistoryTree {
    config: HistoryTreeConfig,
    io: NodeIo,
    /// Root first, leaf last. Empty for a tree reopened from disk.
    latest_branch: Vec<HtNode>,
    root_seq: u32,
    node_count: u32,
    tree_end: Timestamp,
    finished: bool,
}

impl HistoryTree {
    /// Creates a new, empty history file at `path`, truncating any existing one.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidArgument` for an unusable configuration,
    /// or an I/O error if the file cannot be created.
    pub fn create(path: &Path, config: HistoryTreeConfig) -> Result<Self> {
        config.validate()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let io = NodeIo::new(file, config.clone());
        io.write_header(&FileHeader::unfinished(&config))?;

        debug!(
            "Created history tree {} (block size {}, max children {})",
            path.display(),
            config.block_size,
            config.max_children
        );

        let root = HtNode::new(NodeKind::Leaf, 0, None, config.tree_start);
        Ok(Self {
            tree_end: config.tree_start,
            config,
            io,
            latest_branch: vec![root],
            root_seq: 0,
            node_count: 1,
            finished: false,
        })
    }

    /// Opens a finished history file.
    ///
    /// # Errors
    ///
    /// - `StateError::UnsupportedVersion` if the file was built by another
    ///   provider version
    /// - `StateError::Decode` if the file was never finished
    /// - `StateError::ChecksumMismatch` for a damaged header or attribute section
    pub fn open(path: &Path, provider_version: u32) -> Result<(Self, AttributeTree)> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let header = FileHeader::read_from(&mut file)?;
        if !header.finished {
            return Err(StateError::Decode(format!(
                "history file {} was not completely built",
                path.display()
            )));
        }
        if header.provider_version != provider_version {
            return Err(StateError::UnsupportedVersion(header.provider_version));
        }
        let config = header.config();
        config.validate()?;

        let io = NodeIo::new(file, config.clone());
        let attributes = io.read_attributes(header.attr_offset, header.attr_size)?;

        debug!(
            "Opened history tree {} ({} nodes, [{}, {}])",
            path.display(),
            header.node_count,
            header.tree_start,
            header.tree_end
        );

        let tree = Self {
            config,
            io,
            latest_branch: Vec::new(),
            root_seq: header.root_seq,
            node_count: header.node_count,
            tree_end: header.tree_end,
            finished: true,
        };
        Ok((tree, attributes))
    }

    /// Start of the history.
    pub fn start_time(&self) -> Timestamp {
        self.config.tree_start
    }

    /// Latest end time of any inserted interval.
    pub fn end_time(&self) -> Timestamp {
        self.tree_end
    }

    /// Number of nodes allocated so far.
    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    /// Depth of the latest branch; 0 for a reopened tree.
    pub fn depth(&self) -> usize {
        self.latest_branch.len()
    }

    /// Largest encoded interval an empty core node can hold.
    pub fn max_interval_size(&self) -> usize {
        self.config.core_capacity()
    }

    /// Inserts a closed interval.
    ///
    /// Intervals must arrive in non-decreasing end time order.
    ///
    /// # Errors
    ///
    /// Returns `StateError::IntervalTooLarge` if the interval cannot fit in an
    /// empty core node.
    pub fn insert(&mut self, interval: StateInterval) -> Result<()> {
        if self.finished {
            return Err(StateError::InvalidArgument(
                "history tree is already finished".to_string(),
            ));
        }
        let size = interval.encoded_size();
        let capacity = self.max_interval_size();
        if size > capacity {
            return Err(StateError::IntervalTooLarge { size, capacity });
        }
        self.tree_end = self.tree_end.max(interval.end());
        let leaf = self.latest_branch.len() - 1;
        self.insert_at(interval, leaf)
    }

    fn insert_at(&mut self, interval: StateInterval, index: usize) -> Result<()> {
        let node = &self.latest_branch[index];
        if interval.start() < node.start() {
            if index == 0 {
                return Err(StateError::TimeRangeInvalid {
                    time: interval.start(),
                    start: node.start(),
                    end: self.tree_end,
                });
            }
            return self.insert_at(interval, index - 1);
        }
        if node.free_space(&self.config) < interval.encoded_size() {
            self.add_sibling(index)?;
            let leaf = self.latest_branch.len() - 1;
            return self.insert_at(interval, leaf);
        }
        self.latest_branch[index].add_interval(interval);
        Ok(())
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.node_count;
        self.node_count += 1;
        seq
    }

    /// Closes the nodes from `index` down to the leaf and starts a new branch
    /// from their parent.
    fn add_sibling(&mut self, index: usize) -> Result<()> {
        if index == 0 {
            return self.add_new_root();
        }
        let parent = index - 1;
        if self.latest_branch[parent].children().len() >= self.config.max_children {
            return self.add_sibling(parent);
        }

        let depth = self.latest_branch.len();
        let split = self.tree_end;
        for mut node in self.latest_branch.drain(index..).collect::<Vec<_>>() {
            node.close(split);
            self.io.write_node(node)?;
        }
        for level in index..depth {
            self.push_branch_node(level, depth, split + 1);
        }

        debug!("History tree split at {} from depth {}", split, index);
        Ok(())
    }

    /// Appends a fresh node at `level` of the latest branch, linked to the
    /// node above it.
    fn push_branch_node(&mut self, level: usize, depth: usize, start: Timestamp) {
        let seq = self.next_seq();
        let kind = if level == depth - 1 {
            NodeKind::Leaf
        } else {
            NodeKind::Core
        };
        let parent = &mut self.latest_branch[level - 1];
        parent.link_child(seq, start);
        let parent_seq = parent.seq();
        self.latest_branch
            .push(HtNode::new(kind, seq, Some(parent_seq), start));
    }

    /// Places a new root above the current one and starts a branch under it.
    fn add_new_root(&mut self) -> Result<()> {
        let split = self.tree_end;
        let old_depth = self.latest_branch.len();
        let new_root_seq = self.next_seq();

        let mut closed = std::mem::take(&mut self.latest_branch);
        if let Some(old_root) = closed.first_mut() {
            old_root.set_parent(new_root_seq);
        }
        let mut new_root = HtNode::new(
            NodeKind::Core,
            new_root_seq,
            None,
            self.config.tree_start,
        );
        new_root.link_child(self.root_seq, self.config.tree_start);
        for mut node in closed {
            node.close(split);
            self.io.write_node(node)?;
        }

        self.root_seq = new_root_seq;
        self.latest_branch.push(new_root);
        let depth = old_depth + 1;
        for level in 1..depth {
            self.push_branch_node(level, depth, split + 1);
        }

        info!("History tree grew a new root, depth is now {}", depth);
        Ok(())
    }

    fn root(&self) -> Result<NodeRef<'_>> {
        match self.latest_branch.first() {
            Some(root) => Ok(NodeRef::Branch(root)),
            None => Ok(NodeRef::Stored(self.io.read_node(self.root_seq)?)),
        }
    }

    fn node(&self, seq: u32) -> Result<NodeRef<'_>> {
        match self.latest_branch.iter().find(|node| node.seq() == seq) {
            Some(node) => Ok(NodeRef::Branch(node)),
            None => Ok(NodeRef::Stored(self.io.read_node(seq)?)),
        }
    }

    /// Returns the interval of `quark` covering `t`, if one was inserted.
    pub fn query_single(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>> {
        let mut current = self.root()?;
        loop {
            if let Some(interval) = current.find(t, quark) {
                return Ok(Some(interval.clone()));
            }
            match current.child_at(t) {
                Some(seq) if current.kind() == NodeKind::Core => current = self.node(seq)?,
                _ => return Ok(None),
            }
        }
    }

    /// Fills `states` with every inserted interval covering `t`, in a single
    /// root-to-leaf descent.
    pub fn query_full(&self, t: Timestamp, states: &mut [Option<StateInterval>]) -> Result<()> {
        let mut current = self.root()?;
        loop {
            current.collect(t, states);
            match current.child_at(t) {
                Some(seq) if current.kind() == NodeKind::Core => current = self.node(seq)?,
                _ => return Ok(()),
            }
        }
    }

    /// Closes the latest branch at `end_time`, then writes the attribute
    /// section and the final header.
    pub fn finish(&mut self, end_time: Timestamp, attributes: &AttributeTree) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.tree_end = self.tree_end.max(end_time);
        for node in &mut self.latest_branch {
            node.close(self.tree_end);
            self.io.write_node(node.clone())?;
        }

        let attr_offset = self.io.end_of_nodes(self.node_count);
        let attr_size = self.io.write_attributes(attr_offset, attributes)?;
        let header = FileHeader {
            node_count: self.node_count,
            root_seq: self.root_seq,
            tree_end: self.tree_end,
            attr_offset,
            attr_size,
            finished: true,
            ..FileHeader::unfinished(&self.config)
        };
        self.io.write_header(&header)?;
        self.io.sync()?;
        self.finished = true;

        info!(
            "History tree finished at {} with {} nodes",
            self.tree_end, self.node_count
        );
        Ok(())
    }

    /// Returns true once [`finish`](Self::finish) completed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// [`HistoryBackend`] storing intervals in a history tree file.
#[derive(Debug)]
pub struct HistoryTreeBackend {
    path: PathBuf,
    start_time: Timestamp,
    tree: RwLock<HistoryTree>,
    max_interval_size: usize,
    disposed: AtomicBool,
}

impl HistoryTreeBackend {
    /// Creates a backend writing a new history file at `path`.
    pub fn create(path: impl AsRef<Path>, config: HistoryTreeConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tree = HistoryTree::create(&path, config)?;
        Ok(Self::with_tree(path, tree))
    }

    /// Opens a finished history file built by `provider_version`, returning
    /// the backend and the persisted attribute tree.
    pub fn open(path: impl AsRef<Path>, provider_version: u32) -> Result<(Self, AttributeTree)> {
        let path = path.as_ref().to_path_buf();
        let (tree, attributes) = HistoryTree::open(&path, provider_version)?;
        Ok((Self::with_tree(path, tree), attributes))
    }

    fn with_tree(path: PathBuf, tree: HistoryTree) -> Self {
        Self {
            path,
            start_time: tree.start_time(),
            max_interval_size: tree.max_interval_size(),
            tree: RwLock::new(tree),
            disposed: AtomicBool::new(false),
        }
    }

    /// Location of the history file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of nodes in the tree.
    pub fn node_count(&self) -> u32 {
        self.tree.read().unwrap_or_else(|e| e.into_inner()).node_count()
    }

    /// Depth of the latest branch.
    pub fn depth(&self) -> usize {
        self.tree.read().unwrap_or_else(|e| e.into_inner()).depth()
    }

    fn check_alive(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StateError::StoreDisposed);
        }
        Ok(())
    }
}

impl HistoryBackend for HistoryTreeBackend {
    fn start_time(&self) -> Timestamp {
        self.start_time
    }

    fn end_time(&self) -> Timestamp {
        self.tree.read().unwrap_or_else(|e| e.into_inner()).end_time()
    }

    fn max_interval_size(&self) -> Option<usize> {
        Some(self.max_interval_size)
    }

    fn insert_past_state(&self, interval: StateInterval) -> Result<()> {
        self.check_alive()?;
        self.tree
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(interval)
    }

    fn finished_building(&self, end_time: Timestamp, attributes: &AttributeTree) -> Result<()> {
        self.check_alive()?;
        self.tree
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .finish(end_time, attributes)
    }

    fn do_query(&self, t: Timestamp, states: &mut [Option<StateInterval>]) -> Result<()> {
        self.check_alive()?;
        self.tree
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .query_full(t, states)
    }

    fn do_single_query(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>> {
        self.check_alive()?;
        if quark < 0 {
            return Ok(None);
        }
        self.tree
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .query_single(t, quark)
    }

    fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let tree = self.tree.read().unwrap_or_else(|e| e.into_inner());
        tree.io.clear_cache();
        if !tree.is_finished() {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(
                    "Failed to remove incomplete history file {}: {:?}",
                    self.path.display(),
                    e
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::ROOT_ATTRIBUTE;
    use crate::value::StateValue;
    use tempfile::TempDir;

    fn small_config() -> HistoryTreeConfig {
        HistoryTreeConfig::default()
            .with_block_size(256)
            .with_max_children(3)
    }

    /// Inserts `count` consecutive intervals of length 10 for each of `quarks`.
    fn fill(tree: &mut HistoryTree, quarks: i32, count: i64) {
        for i in 0..count {
            for q in 0..quarks {
                let interval =
                    StateInterval::new(i * 10, i * 10 + 9, q, StateValue::Long(i * 100 + q as i64))
                        .unwrap();
                tree.insert(interval).unwrap();
            }
        }
    }

    #[test]
    fn test_single_leaf_queries() {
        let dir = TempDir::new().unwrap();
        let mut tree = HistoryTree::create(&dir.path().join("a.ht"), small_config()).unwrap();
        fill(&mut tree, 1, 3);
        assert_eq!(tree.node_count(), 1);

        let found = tree.query_single(15, 0).unwrap().unwrap();
        assert_eq!((found.start(), found.end()), (10, 19));
        assert!(tree.query_single(15, 1).unwrap().is_none());
    }

    #[test]
    fn test_splits_and_new_roots_keep_queries_exact() {
        let dir = TempDir::new().unwrap();
        let mut tree = HistoryTree::create(&dir.path().join("b.ht"), small_config()).unwrap();
        fill(&mut tree, 3, 200);
        assert!(tree.node_count() > 10);
        assert!(tree.depth() >= 3);

        for i in 0..200i64 {
            for q in 0..3 {
                let t = i * 10 + 5;
                let found = tree.query_single(t, q).unwrap().unwrap();
                assert_eq!(found.start(), i * 10);
                assert_eq!(found.value(), &StateValue::Long(i * 100 + q as i64));
            }
        }
    }

    #[test]
    fn test_full_query_matches_single_queries() {
        let dir = TempDir::new().unwrap();
        let mut tree = HistoryTree::create(&dir.path().join("c.ht"), small_config()).unwrap();
        fill(&mut tree, 4, 80);

        for t in [0, 9, 10, 333, 555, 799] {
            let mut states = vec![None; 4];
            tree.query_full(t, &mut states).unwrap();
            for q in 0..4 {
                assert_eq!(states[q as usize], tree.query_single(t, q).unwrap());
            }
        }
    }

    #[test]
    fn test_long_interval_kept_above_splits() {
        let dir = TempDir::new().unwrap();
        let mut tree = HistoryTree::create(&dir.path().join("d.ht"), small_config()).unwrap();
        fill_from(&mut tree, 0, 150);
        tree.insert(StateInterval::new(0, 1499, 1, StateValue::Int(7)).unwrap())
            .unwrap();
        fill_from(&mut tree, 150, 220);

        for t in [0, 500, 999, 1499] {
            let found = tree.query_single(t, 1).unwrap().unwrap();
            assert_eq!(found.value(), &StateValue::Int(7));
        }
        assert!(tree.query_single(1500, 1).unwrap().is_none());
        let found = tree.query_single(2005, 0).unwrap().unwrap();
        assert_eq!(found.value(), &StateValue::Long(200));
    }

    fn fill_from(tree: &mut HistoryTree, from: i64, to: i64) {
        for i in from..to {
            let start = i * 10;
            let interval = StateInterval::new(start, start + 9, 0, StateValue::Long(i)).unwrap();
            tree.insert(interval).unwrap();
        }
    }

    #[test]
    fn test_interval_too_large() {
        let dir = TempDir::new().unwrap();
        let mut tree = HistoryTree::create(&dir.path().join("e.ht"), small_config()).unwrap();
        let big = "x".repeat(1024);
        let result = tree.insert(StateInterval::new(0, 1, 0, StateValue::from(big)).unwrap());
        assert!(matches!(result, Err(StateError::IntervalTooLarge { .. })));
    }

    #[test]
    fn test_finish_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.ht");
        let mut attributes = AttributeTree::new();
        attributes.get_or_add(ROOT_ATTRIBUTE, &["A"]).unwrap();
        attributes.get_or_add(ROOT_ATTRIBUTE, &["B"]).unwrap();

        {
            let mut tree =
                HistoryTree::create(&path, small_config().with_provider_version(4)).unwrap();
            fill(&mut tree, 2, 120);
            tree.finish(1199, &attributes).unwrap();
        }

        assert!(matches!(
            HistoryTree::open(&path, 5),
            Err(StateError::UnsupportedVersion(4))
        ));

        let (tree, read_attributes) = HistoryTree::open(&path, 4).unwrap();
        assert_eq!(read_attributes.len(), 2);
        assert_eq!(tree.end_time(), 1199);
        for i in (0..120i64).step_by(7) {
            let found = tree.query_single(i * 10 + 3, 1).unwrap().unwrap();
            assert_eq!(found.value(), &StateValue::Long(i * 100 + 1));
        }
    }

    #[test]
    fn test_unfinished_file_not_reopened_and_removed_on_dispose() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("g.ht");
        let backend = HistoryTreeBackend::create(&path, small_config()).unwrap();
        backend
            .insert_past_state(StateInterval::new(0, 9, 0, StateValue::Int(1)).unwrap())
            .unwrap();

        assert!(matches!(
            HistoryTree::open(&path, 0),
            Err(StateError::Decode(_))
        ));

        backend.dispose().unwrap();
        assert!(!path.exists());
        assert!(matches!(
            backend.do_single_query(5, 0),
            Err(StateError::StoreDisposed)
        ));
    }
}
