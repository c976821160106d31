//! Index of file-read tool results, used to spot duplicate reads.
//!
//! Agents re-read the same file many times over a long session. When a later
//! read returns exactly the content an earlier one did, the earlier copy is
//! dead weight in the context window. The [`FileReadIndex`] remembers a
//! content hash for each read so the store can find those earlier copies
//! without rescanning message bodies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One recorded file read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReadEntry {
    pub message_index: usize,
    pub block_index: usize,
    /// FNV-1a hash of the content.
    pub content_hash: u64,
    pub content_len: usize,
}

impl FileReadEntry {
    fn same_content(&self, other: &FileReadEntry) -> bool {
        self.content_hash == other.content_hash && self.content_len == other.content_len
    }
}

/// Per-path history of file reads, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReadIndex {
    reads: BTreeMap<String, Vec<FileReadEntry>>,
}

impl FileReadIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a read of `path` and return the earlier reads of the same path
    /// whose content is identical, newest first.
    ///
    /// Only entries with `message_index > floor` and within `lookback`
    /// messages of the new read are considered; anything older is either
    /// already elided or out of the bounded scan window.
    pub fn record(
        &mut self,
        path: &str,
        message_index: usize,
        block_index: usize,
        content: &str,
        floor: usize,
        lookback: usize,
    ) -> Vec<FileReadEntry> {
        let entry = FileReadEntry {
            message_index,
            block_index,
            content_hash: fnv1a(content),
            content_len: content.len(),
        };
        let oldest = message_index.saturating_sub(lookback);

        let list = self.reads.entry(path.to_string()).or_default();
        let duplicates = list
            .iter()
            .rev()
            .filter(|e| e.message_index < message_index)
            .take_while(|e| e.message_index > floor && e.message_index >= oldest)
            .filter(|e| e.same_content(&entry))
            .copied()
            .collect();

        list.retain(|e| !(e.message_index == message_index && e.block_index == block_index));
        let pos = list.partition_point(|e| {
            (e.message_index, e.block_index) < (message_index, block_index)
        });
        list.insert(pos, entry);
        duplicates
    }

    /// Drop every read at or below `floor`. Those messages are elided and can
    /// never be deduplicated again. Returns how many entries were dropped.
    pub fn forget_through(&mut self, floor: usize) -> usize {
        let mut dropped = 0;
        self.reads.retain(|_, list| {
            let before = list.len();
            list.retain(|e| e.message_index > floor);
            dropped += before - list.len();
            !list.is_empty()
        });
        dropped
    }

    /// All recorded reads of `path`, oldest first.
    pub fn reads_of(&self, path: &str) -> &[FileReadEntry] {
        self.reads.get(path).map_or(&[], |v| v.as_slice())
    }

    /// Number of distinct paths read.
    pub fn len(&self) -> usize {
        self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }
}

/// FNV-1a 64-bit hash.
pub(crate) fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
