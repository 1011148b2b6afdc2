//! Attribute tree: the hierarchical namespace of a state system.
//!
//! Attributes are addressed by paths such as `disks/8:0/sectors_read` and are
//! mapped to quarks in first-seen order. The tree only ever grows: quarks are
//! never removed, reused or renumbered, so a quark count observed by a reader
//! is a consistent snapshot of the namespace at that moment.

use crate::error::{Result, StateError};
use crate::interval::{Quark, ROOT_ATTRIBUTE};
use std::collections::HashMap;
use std::io::{Read, Write};

/// Pattern segment matching every child of the current level.
pub const WILDCARD: &str = "*";

/// Pattern segment moving to the parent of the current level.
pub const PARENT: &str = "..";

/// Separator used when rendering full attribute paths.
pub const PATH_SEPARATOR: char = '/';

#[derive(Debug, Clone)]
struct Attribute {
    name: String,
    parent: Quark,
    children: Vec<Quark>,
}

/// Append-only mapping from attribute paths to quarks.
#[derive(Debug, Clone, Default)]
pub struct AttributeTree {
    /// Attributes indexed by quark.
    attributes: Vec<Attribute>,
    /// Children of the root, in creation order.
    root_children: Vec<Quark>,
    /// (parent, name) -> child quark.
    index: HashMap<(Quark, String), Quark>,
}

impl AttributeTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of attributes, i.e. one past the highest quark.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Returns true if no attribute was created yet.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Returns true if `quark` names an existing attribute.
    pub fn contains(&self, quark: Quark) -> bool {
        quark >= 0 && (quark as usize) < self.attributes.len()
    }

    fn attribute(&self, quark: Quark) -> Result<&Attribute> {
        if !self.contains(quark) {
            return Err(StateError::AttributeNotFound(format!("quark {}", quark)));
        }
        Ok(&self.attributes[quark as usize])
    }

    fn children_of(&self, quark: Quark) -> Result<&[Quark]> {
        if quark == ROOT_ATTRIBUTE {
            return Ok(&self.root_children);
        }
        Ok(&self.attribute(quark)?.children)
    }

    fn check_base(&self, base: Quark) -> Result<()> {
        if base == ROOT_ATTRIBUTE || self.contains(base) {
            Ok(())
        } else {
            Err(StateError::AttributeNotFound(format!("quark {}", base)))
        }
    }

    /// Resolves `path` below `base` without creating anything.
    ///
    /// Returns `None` if any segment is missing. An empty path resolves to
    /// `base` itself.
    pub fn get_quark(&self, base: Quark, path: &[&str]) -> Option<Quark> {
        if self.check_base(base).is_err() {
            return None;
        }
        path.iter().try_fold(base, |current, segment| {
            self.index.get(&(current, (*segment).to_string())).copied()
        })
    }

    /// Resolves `path` below `base`, creating missing attributes on the way.
    ///
    /// # Errors
    ///
    /// Returns `StateError::AttributeNotFound` if `base` does not exist.
    pub fn get_or_add(&mut self, base: Quark, path: &[&str]) -> Result<Quark> {
        self.check_base(base)?;
        let mut current = base;
        for segment in path {
            current = match self.index.get(&(current, (*segment).to_string())) {
                Some(&child) => child,
                None => self.add_attribute(current, segment),
            };
        }
        Ok(current)
    }

    fn add_attribute(&mut self, parent: Quark, name: &str) -> Quark {
        let quark = self.attributes.len() as Quark;
        self.attributes.push(Attribute {
            name: name.to_string(),
            parent,
            children: Vec::new(),
        });
        if parent == ROOT_ATTRIBUTE {
            self.root_children.push(quark);
        } else {
            self.attributes[parent as usize].children.push(quark);
        }
        self.index.insert((parent, name.to_string()), quark);
        quark
    }

    /// Returns every quark matching `pattern` below `base`.
    ///
    /// `*` matches any attribute at its level and `..` moves to the parent.
    /// The result is in creation order and contains no duplicates.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidPattern` for an empty pattern and
    /// `StateError::AttributeNotFound` if `base` does not exist.
    pub fn get_quarks(&self, base: Quark, pattern: &[&str]) -> Result<Vec<Quark>> {
        if pattern.is_empty() {
            return Err(StateError::InvalidPattern("empty pattern".to_string()));
        }
        if pattern.iter().any(|segment| segment.is_empty()) {
            return Err(StateError::InvalidPattern(pattern.join("/")));
        }
        self.check_base(base)?;

        let mut current = vec![base];
        for segment in pattern {
            let mut next = Vec::new();
            for &quark in &current {
                match *segment {
                    WILDCARD => next.extend_from_slice(self.children_of(quark)?),
                    PARENT => {
                        if quark != ROOT_ATTRIBUTE {
                            next.push(self.attribute(quark)?.parent);
                        }
                    }
                    name => {
                        if let Some(&child) = self.index.get(&(quark, name.to_string())) {
                            next.push(child);
                        }
                    }
                }
            }
            next.sort_unstable();
            next.dedup();
            current = next;
        }
        current.retain(|&quark| quark != ROOT_ATTRIBUTE);
        Ok(current)
    }

    /// Returns the children of `quark`, or its whole subtree if `recursive`.
    pub fn sub_attributes(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>> {
        let mut result = Vec::new();
        let mut pending = vec![quark];
        while let Some(current) = pending.pop() {
            let children = self.children_of(current)?;
            result.extend_from_slice(children);
            if recursive {
                pending.extend_from_slice(children);
            }
        }
        result.sort_unstable();
        Ok(result)
    }

    /// Returns the last path segment of `quark`.
    pub fn name(&self, quark: Quark) -> Result<&str> {
        Ok(&self.attribute(quark)?.name)
    }

    /// Returns the parent of `quark`; top-level attributes return the root.
    pub fn parent(&self, quark: Quark) -> Result<Quark> {
        if quark == ROOT_ATTRIBUTE {
            return Ok(ROOT_ATTRIBUTE);
        }
        Ok(self.attribute(quark)?.parent)
    }

    /// Returns the path segments from the root down to `quark`.
    pub fn path_segments(&self, quark: Quark) -> Result<Vec<&str>> {
        let mut segments = Vec::new();
        let mut current = quark;
        while current != ROOT_ATTRIBUTE {
            let attribute = self.attribute(current)?;
            segments.push(attribute.name.as_str());
            current = attribute.parent;
        }
        segments.reverse();
        Ok(segments)
    }

    /// Returns the full path of `quark` joined with `/`.
    pub fn full_path(&self, quark: Quark) -> Result<String> {
        let segments = self.path_segments(quark)?;
        Ok(segments.join(&PATH_SEPARATOR.to_string()))
    }

    /// Writes the tree to a writer.
    ///
    /// Format:
    /// - attribute_count: u32
    /// - per attribute, in quark order: parent: i32, name_len: u16, name: UTF-8
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.attributes.len() as u32).to_le_bytes())?;
        for attribute in &self.attributes {
            writer.write_all(&attribute.parent.to_le_bytes())?;
            let name = attribute.name.as_bytes();
            let len = u16::try_from(name.len()).map_err(|_| {
                StateError::InvalidArgument(format!("attribute name of {} bytes", name.len()))
            })?;
            writer.write_all(&len.to_le_bytes())?;
            writer.write_all(name)?;
        }
        Ok(())
    }

    /// Reads a tree written by [`write_to`](Self::write_to).
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf4)?;
        let count = u32::from_le_bytes(buf4) as usize;

        let mut tree = Self::new();
        let mut buf2 = [0u8; 2];
        for quark in 0..count {
            reader.read_exact(&mut buf4)?;
            let parent = i32::from_le_bytes(buf4);
            reader.read_exact(&mut buf2)?;
            let len = u16::from_le_bytes(buf2) as usize;
            let mut name = vec![0u8; len];
            reader.read_exact(&mut name)?;
            let name = String::from_utf8(name)
                .map_err(|e| StateError::Decode(format!("Invalid UTF-8 in attribute name: {}", e)))?;

            // Parents are always created before their children.
            if parent != ROOT_ATTRIBUTE && (parent < 0 || parent as usize >= quark) {
                return Err(StateError::Decode(format!(
                    "attribute {} has invalid parent {}",
                    quark, parent
                )));
            }
            tree.add_attribute(parent, &name);
        }
        Ok(tree)
    }
}
