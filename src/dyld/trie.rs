//! Program trie parsing for dyld caches.
//!
//! The program trie is a compact prefix tree mapping executable paths to
//! offsets into the prebuilt-loader-set pool. It shares the node encoding
//! of Mach-O export tries: each node carries a ULEB128 terminal-info size,
//! an optional terminal payload, and a list of edges (null-terminated label
//! plus ULEB128 child offset relative to the trie start).
//!
//! This module treats the terminal payload as opaque; for the program trie
//! the payload is a single ULEB128 pool offset, decoded by the caller.

use crate::error::{Error, Result};
use crate::util::read_uleb128_fast;

/// A terminal entry in a path trie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrieEntry {
    /// Full path accumulated along the edges from the root.
    pub name: String,
    /// Offset of the terminal payload within the trie buffer.
    pub offset: usize,
}

/// Parser for the program trie of a dyld shared cache.
pub struct ProgramTrie<'a> {
    data: &'a [u8],
}

impl<'a> ProgramTrie<'a> {
    /// Creates a new parser for the given trie data.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Enumerates every terminal node in the trie.
    ///
    /// Entries are delivered in pre-order, i.e. in the order the edges are
    /// stored; this ordering is stable for a given trie.
    pub fn parse_all(&self) -> Result<Vec<TrieEntry>> {
        let mut entries = Vec::new();
        if !self.data.is_empty() {
            self.visit(0, String::new(), &mut entries)?;
        }
        Ok(entries)
    }

    /// Walks the trie along `path`.
    ///
    /// Returns the offset of the matched node's terminal payload, or `None`
    /// if the trie has no terminal node for `path`.
    pub fn lookup(&self, path: &str) -> Result<Option<usize>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        self.lookup_recursive(0, path, 0)
    }

    /// Reads a ULEB128 at the given offset within the trie buffer.
    fn read_uleb(&self, offset: usize) -> Result<(u64, usize)> {
        if offset >= self.data.len() {
            return Err(Error::InvalidUleb128 { offset });
        }
        read_uleb128_fast(&self.data[offset..]).ok_or(Error::InvalidUleb128 { offset })
    }

    /// Recursive node visitor for enumeration.
    fn visit(&self, offset: usize, prefix: String, entries: &mut Vec<TrieEntry>) -> Result<()> {
        if offset >= self.data.len() {
            return Err(Error::InvalidTrie { offset });
        }

        let (terminal_size, uleb_len) = self.read_uleb(offset)?;
        let mut cursor = offset + uleb_len;

        // Terminal node: the payload starts right after the size
        if terminal_size > 0 {
            entries.push(TrieEntry {
                name: prefix.clone(),
                offset: cursor,
            });
        }
        cursor += terminal_size as usize;

        if cursor >= self.data.len() {
            return Ok(());
        }

        let child_count = self.data[cursor] as usize;
        cursor += 1;

        for _ in 0..child_count {
            // Edge label (null-terminated string)
            let label_start = cursor;
            while cursor < self.data.len() && self.data[cursor] != 0 {
                cursor += 1;
            }
            let label = String::from_utf8_lossy(&self.data[label_start..cursor]);
            cursor += 1; // Skip null terminator

            // Child offset, relative to the trie start
            let (child_offset, uleb_len) = self.read_uleb(cursor)?;
            cursor += uleb_len;

            self.visit(child_offset as usize, format!("{}{}", prefix, label), entries)?;
        }

        Ok(())
    }

    /// Recursive path walker.
    fn lookup_recursive(&self, offset: usize, path: &str, matched: usize) -> Result<Option<usize>> {
        if offset >= self.data.len() {
            return Err(Error::InvalidTrie { offset });
        }

        let (terminal_size, uleb_len) = self.read_uleb(offset)?;
        let mut cursor = offset + uleb_len;

        // Full path consumed and this node is terminal
        if matched == path.len() && terminal_size > 0 {
            return Ok(Some(cursor));
        }
        cursor += terminal_size as usize;

        if cursor >= self.data.len() {
            return Ok(None);
        }

        let child_count = self.data[cursor] as usize;
        cursor += 1;

        let remaining = &path.as_bytes()[matched..];

        for _ in 0..child_count {
            let label_start = cursor;
            while cursor < self.data.len() && self.data[cursor] != 0 {
                cursor += 1;
            }
            let label = &self.data[label_start..cursor];
            cursor += 1;

            let (child_offset, uleb_len) = self.read_uleb(cursor)?;
            cursor += uleb_len;

            if remaining.starts_with(label) {
                return self.lookup_recursive(child_offset as usize, path, matched + label.len());
            }
        }

        Ok(None)
    }
}
