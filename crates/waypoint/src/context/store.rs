//! Per-task context state: overlay, truncation range, and file-read index.
//!
//! The [`ContextStore`] is the only place overlay updates are written. It
//! knows the bounds of the raw history (synced by the manager before every
//! write) so out-of-range updates fail fast with
//! [`ContextError::InvalidIndex`] instead of silently rendering nowhere.

use crate::config::ContextConfig;
use crate::context::file_reads::FileReadIndex;
use crate::context::overlay::{ContextOverlay, ContextUpdate, UpdateType};
use crate::context::planner::TruncationRange;
use crate::error::ContextError;
use crate::Message;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Everything the store persists, in one serializable value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub overlay: ContextOverlay,
    #[serde(default)]
    pub range: Option<TruncationRange>,
    #[serde(default)]
    pub file_reads: FileReadIndex,
}

/// Non-destructive overlay of edits on top of raw conversation history.
#[derive(Debug)]
pub struct ContextStore {
    overlay: ContextOverlay,
    range: Option<TruncationRange>,
    file_reads: FileReadIndex,
    /// Number of blocks in each known message, indexed by message index.
    block_counts: Vec<usize>,
    tail_keep: usize,
    dedup_lookback: usize,
    dirty: bool,
}

impl ContextStore {
    pub fn new(config: &ContextConfig) -> Self {
        Self::from_snapshot(StoreSnapshot::default(), config)
    }

    pub fn from_snapshot(snapshot: StoreSnapshot, config: &ContextConfig) -> Self {
        Self {
            overlay: snapshot.overlay,
            range: snapshot.range,
            file_reads: snapshot.file_reads,
            block_counts: Vec::new(),
            tail_keep: config.tail_keep,
            dedup_lookback: config.dedup_lookback,
            dirty: false,
        }
    }

    /// Learn the current bounds of the raw history. Bounds only grow: raw
    /// messages are append-only.
    pub fn sync_bounds(&mut self, history: &[Message]) {
        if history.len() < self.block_counts.len() {
            return;
        }
        self.block_counts = history.iter().map(|m| m.blocks.len()).collect();
    }

    /// Number of messages the store knows about.
    pub fn message_count(&self) -> usize {
        self.block_counts.len()
    }

    /// Append an update for `(message_index, block_index)`.
    pub fn record_update(
        &mut self,
        message_index: usize,
        block_index: usize,
        update_type: UpdateType,
        value: impl Into<String>,
        timestamp: i64,
    ) -> Result<(), ContextError> {
        let in_bounds = self
            .block_counts
            .get(message_index)
            .is_some_and(|&blocks| block_index < blocks);
        if !in_bounds {
            return Err(ContextError::InvalidIndex {
                message_index,
                block_index,
                message_count: self.block_counts.len(),
            });
        }

        self.overlay.insert(ContextUpdate {
            timestamp,
            update_type,
            value: value.into(),
            message_index,
            block_index,
        });
        self.dirty = true;
        Ok(())
    }

    /// Render the effective history for `raw` under `range`.
    ///
    /// Messages inside `range` are dropped, except index 0 and the last
    /// `tail_keep` messages. Every kept block is rendered through its latest
    /// overlay update.
    pub fn effective_messages(
        &self,
        raw: &[Message],
        range: Option<TruncationRange>,
    ) -> Vec<Message> {
        let tail_start = raw.len().saturating_sub(self.tail_keep);
        raw.iter()
            .filter(|m| {
                m.index == 0
                    || m.index >= tail_start
                    || range.is_none_or(|r| !r.contains(m.index))
            })
            .map(|m| self.render(m))
            .collect()
    }

    /// Render one message through the overlay.
    fn render(&self, message: &Message) -> Message {
        Message {
            index: message.index,
            role: message.role,
            blocks: message
                .blocks
                .iter()
                .enumerate()
                .map(|(b, block)| self.overlay.render_block(message.index, b, block))
                .collect(),
        }
    }

    /// Discard updates older than `cutoff` (epoch ms), keeping the latest
    /// update per block. Returns the number discarded.
    pub fn prune_older_than(&mut self, cutoff: i64) -> usize {
        let removed = self.overlay.prune_older_than(cutoff);
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    /// Record that message `message_index` holds a file-read result for
    /// `path`, and replace earlier identical reads with a placeholder that
    /// points at this one.
    ///
    /// Returns how many earlier blocks were replaced.
    pub fn record_file_read(
        &mut self,
        history: &[Message],
        message_index: usize,
        path: &str,
        timestamp: i64,
    ) -> Result<usize, ContextError> {
        self.sync_bounds(history);
        let Some(message) = history.get(message_index) else {
            return Err(ContextError::InvalidIndex {
                message_index,
                block_index: 0,
                message_count: history.len(),
            });
        };

        let floor = self.range.map_or(0, |r| r.end);
        let mut replaced = 0;
        for (block_index, block) in message.blocks.iter().enumerate() {
            let crate::ContentBlock::ToolResult { content, meta, .. } = block else {
                continue;
            };
            if meta.read_path() != Some(path) {
                continue;
            }
            let duplicates = self.file_reads.record(
                path,
                message_index,
                block_index,
                content,
                floor,
                self.dedup_lookback,
            );
            for dup in duplicates {
                if self.overlay.is_replaced(dup.message_index, dup.block_index) {
                    continue;
                }
                // The index only holds hashes; confirm the bodies really match.
                let verbatim = history
                    .get(dup.message_index)
                    .and_then(|m| m.blocks.get(dup.block_index))
                    .is_some_and(|b| {
                        matches!(b, crate::ContentBlock::ToolResult { content: earlier, .. } if earlier == content)
                    });
                if !verbatim {
                    continue;
                }
                self.record_update(
                    dup.message_index,
                    dup.block_index,
                    UpdateType::Replace,
                    duplicate_read_placeholder(path, message_index),
                    timestamp,
                )?;
                replaced += 1;
            }
        }

        if replaced > 0 {
            debug!("dedup: replaced {replaced} earlier read(s) of {path} (now at message {message_index})");
        }
        self.dirty = true;
        Ok(replaced)
    }

    pub fn range(&self) -> Option<TruncationRange> {
        self.range
    }

    /// Adopt `range` if it covers the current one. Coverage never shrinks, so
    /// a smaller or disjoint range is ignored. Returns whether it changed.
    pub fn extend_range(&mut self, range: TruncationRange) -> bool {
        if range.start == 0 {
            return false;
        }
        match self.range {
            Some(current) if !range.covers(&current) || range == current => false,
            _ => {
                self.range = Some(range);
                let dropped = self.file_reads.forget_through(range.end);
                if dropped > 0 {
                    debug!("forgot {dropped} file read(s) now inside the truncated range");
                }
                self.dirty = true;
                true
            }
        }
    }

    pub fn overlay(&self) -> &ContextOverlay {
        &self.overlay
    }

    /// Full retained update history for one block, oldest first.
    pub fn updates_for(&self, message_index: usize, block_index: usize) -> &[ContextUpdate] {
        self.overlay.updates_for(message_index, block_index)
    }

    pub fn tail_keep(&self) -> usize {
        self.tail_keep
    }

    /// Whether anything changed since the last [`take_dirty`](Self::take_dirty).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear and return the dirty flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Re-mark the store dirty (e.g. after a failed flush).
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            overlay: self.overlay.clone(),
            range: self.range,
            file_reads: self.file_reads.clone(),
        }
    }

    /// Serialize the persisted state to JSON.
    pub fn serialize(&self) -> Result<String, ContextError> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    /// Rebuild a store from [`serialize`](Self::serialize) output.
    pub fn deserialize(json: &str, config: &ContextConfig) -> Result<Self, ContextError> {
        let snapshot: StoreSnapshot = serde_json::from_str(json)?;
        Ok(Self::from_snapshot(snapshot, config))
    }
}

fn duplicate_read_placeholder(path: &str, later_index: usize) -> String {
    format!(
        "[Duplicate file read: the contents of '{path}' were read again in message \
         {later_index} and are shown there.]"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContentBlock, MessageRole};

    fn config(tail_keep: usize) -> ContextConfig {
        ContextConfig::default().with_tail_keep(tail_keep)
    }

    fn history(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(i, format!("user {i}"))
                } else {
                    Message::assistant(i, format!("assistant {i}"))
                }
            })
            .collect()
    }

    fn indices(messages: &[Message]) -> Vec<usize> {
        messages.iter().map(|m| m.index).collect()
    }

    fn with_file_read(mut messages: Vec<Message>, at: usize, path: &str, content: &str) -> Vec<Message> {
        messages[at] = Message {
            index: at,
            role: MessageRole::User,
            blocks: vec![ContentBlock::file_read(format!("call-{at}"), path, content)],
        };
        messages
    }

    #[test]
    fn record_update_rejects_out_of_bounds() {
        let mut store = ContextStore::new(&config(10));
        let raw = history(3);
        store.sync_bounds(&raw);

        let err = store
            .record_update(3, 0, UpdateType::Replace, "x", 1)
            .unwrap_err();
        assert!(matches!(err, ContextError::InvalidIndex { message_index: 3, .. }));

        let err = store
            .record_update(1, 1, UpdateType::Replace, "x", 1)
            .unwrap_err();
        assert!(matches!(err, ContextError::InvalidIndex { block_index: 1, .. }));

        store.record_update(2, 0, UpdateType::Replace, "ok", 1).unwrap();
        assert!(store.is_dirty());
    }

    #[test]
    fn effective_history_omits_range_but_keeps_head_and_tail() {
        let store = ContextStore::new(&config(10));
        let raw = history(40);
        let range = Some(TruncationRange { start: 1, end: 11 });
        let effective = store.effective_messages(&raw, range);
        let expected: Vec<usize> = std::iter::once(0).chain(12..40).collect();
        assert_eq!(indices(&effective), expected);
    }

    #[test]
    fn tail_is_kept_even_inside_range() {
        let store = ContextStore::new(&config(4));
        let raw = history(12);
        let range = Some(TruncationRange { start: 1, end: 11 });
        assert_eq!(indices(&store.effective_messages(&raw, range)), [0, 8, 9, 10, 11]);
    }

    #[test]
    fn kept_blocks_render_latest_update() {
        let mut store = ContextStore::new(&config(10));
        let raw = history(5);
        store.sync_bounds(&raw);
        store.record_update(3, 0, UpdateType::Replace, "first", 10).unwrap();
        store.record_update(3, 0, UpdateType::Replace, "second", 20).unwrap();
        store.record_update(0, 0, UpdateType::Note, "[note]", 30).unwrap();

        let effective = store.effective_messages(&raw, None);
        assert_eq!(effective[3].blocks[0].body(), "second");
        assert_eq!(effective[0].blocks[0].body(), "user 0\n\n[note]");
        assert_eq!(effective[1].blocks[0].body(), "assistant 1");
        // Raw history is untouched.
        assert_eq!(raw[3].blocks[0].body(), "assistant 3");
        assert_eq!(store.updates_for(3, 0).len(), 2);
    }

    #[test]
    fn duplicate_file_read_becomes_placeholder() {
        let mut store = ContextStore::new(&config(10));
        let raw = history(30);
        let raw = with_file_read(raw, 5, "src/lib.rs", "pub fn lib() {}");
        let raw = with_file_read(raw, 20, "src/lib.rs", "pub fn lib() {}");

        assert_eq!(store.record_file_read(&raw, 5, "src/lib.rs", 100).unwrap(), 0);
        assert_eq!(store.record_file_read(&raw, 20, "src/lib.rs", 200).unwrap(), 1);

        let effective = store.effective_messages(&raw, None);
        let old = effective[5].blocks[0].body();
        assert!(old.starts_with("[Duplicate file read"));
        assert!(old.contains("message 20"));
        assert_eq!(effective[20].blocks[0].body(), "pub fn lib() {}");
    }

    #[test]
    fn modified_file_is_not_deduplicated() {
        let mut store = ContextStore::new(&config(10));
        let raw = history(30);
        let raw = with_file_read(raw, 5, "a.rs", "v1");
        let raw = with_file_read(raw, 20, "a.rs", "v2");
        store.record_file_read(&raw, 5, "a.rs", 1).unwrap();
        assert_eq!(store.record_file_read(&raw, 20, "a.rs", 2).unwrap(), 0);
        assert!(store.overlay().is_empty());
    }

    #[test]
    fn dedup_does_not_scan_into_elided_range() {
        let mut store = ContextStore::new(&config(4));
        let raw = history(30);
        let raw = with_file_read(raw, 4, "a.rs", "same");
        let raw = with_file_read(raw, 22, "a.rs", "same");
        store.record_file_read(&raw, 4, "a.rs", 1).unwrap();
        assert!(store.extend_range(TruncationRange { start: 1, end: 9 }));
        assert_eq!(store.record_file_read(&raw, 22, "a.rs", 2).unwrap(), 0);
    }

    #[test]
    fn extending_range_forgets_elided_reads() {
        let mut store = ContextStore::new(&config(4));
        let raw = history(30);
        let raw = with_file_read(raw, 4, "a.rs", "one");
        let raw = with_file_read(raw, 14, "a.rs", "two");
        store.record_file_read(&raw, 4, "a.rs", 1).unwrap();
        store.record_file_read(&raw, 14, "a.rs", 2).unwrap();

        assert!(store.extend_range(TruncationRange { start: 1, end: 9 }));
        let reads = store.snapshot().file_reads;
        let kept: Vec<_> = reads.reads_of("a.rs").iter().map(|e| e.message_index).collect();
        assert_eq!(kept, [14]);
    }

    #[test]
    fn dedup_compares_bodies_not_just_hashes() {
        let mut store = ContextStore::new(&config(10));
        let indexed = with_file_read(history(30), 5, "a.rs", "same");
        store.record_file_read(&indexed, 5, "a.rs", 1).unwrap();

        // Message 5 no longer holds the indexed text, so nothing is replaced.
        let raw = with_file_read(history(30), 5, "a.rs", "other");
        let raw = with_file_read(raw, 20, "a.rs", "same");
        assert_eq!(store.record_file_read(&raw, 20, "a.rs", 2).unwrap(), 0);
        assert!(!store.overlay().is_replaced(5, 0));
    }

    #[test]
    fn file_read_for_unknown_message_is_invalid() {
        let mut store = ContextStore::new(&config(4));
        let raw = history(3);
        let err = store.record_file_read(&raw, 7, "a.rs", 1).unwrap_err();
        assert!(matches!(err, ContextError::InvalidIndex { .. }));
    }

    #[test]
    fn range_never_shrinks() {
        let mut store = ContextStore::new(&config(10));
        assert!(store.extend_range(TruncationRange { start: 1, end: 11 }));
        assert!(!store.extend_range(TruncationRange { start: 1, end: 5 }));
        assert!(!store.extend_range(TruncationRange { start: 3, end: 20 }));
        assert!(!store.extend_range(TruncationRange { start: 0, end: 30 }));
        assert!(store.extend_range(TruncationRange { start: 1, end: 21 }));
        assert_eq!(store.range(), Some(TruncationRange { start: 1, end: 21 }));
    }

    #[test]
    fn prune_keeps_latest_per_block() {
        let mut store = ContextStore::new(&config(10));
        let raw = history(4);
        store.sync_bounds(&raw);
        store.record_update(2, 0, UpdateType::Replace, "a", 10).unwrap();
        store.record_update(2, 0, UpdateType::Replace, "b", 20).unwrap();
        store.take_dirty();
        assert_eq!(store.prune_older_than(1_000), 1);
        assert!(store.is_dirty());
        assert_eq!(store.effective_messages(&raw, None)[2].blocks[0].body(), "b");
    }

    #[test]
    fn serialize_round_trip_renders_identically() {
        let cfg = config(4);
        let mut store = ContextStore::new(&cfg);
        let raw = history(20);
        let raw = with_file_read(raw, 6, "x.rs", "body");
        let raw = with_file_read(raw, 10, "x.rs", "body");
        store.sync_bounds(&raw);
        store.record_update(3, 0, UpdateType::Replace, "r", 5).unwrap();
        store.record_update(0, 0, UpdateType::Note, "n", 6).unwrap();
        store.record_file_read(&raw, 6, "x.rs", 7).unwrap();
        store.record_file_read(&raw, 10, "x.rs", 8).unwrap();
        store.extend_range(TruncationRange { start: 1, end: 3 });

        let json = store.serialize().unwrap();
        let restored = ContextStore::deserialize(&json, &cfg).unwrap();

        assert_eq!(restored.snapshot(), store.snapshot());
        for range in [None, store.range(), Some(TruncationRange { start: 1, end: 13 })] {
            assert_eq!(
                restored.effective_messages(&raw, range),
                store.effective_messages(&raw, range)
            );
        }
        assert_eq!(restored.serialize().unwrap(), json);
    }
}
