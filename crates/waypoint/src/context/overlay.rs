//! Sparse, append-only edit log layered over raw conversation history.
//!
//! The raw history is never mutated. Every edit is a [`ContextUpdate`] filed
//! under `(message_index, block_index)`; rendering takes the latest update
//! for each block. Older updates stay in the log for audit until pruned.

use crate::ContentBlock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How an update is rendered against the original block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    /// The value is rendered instead of the original content.
    Replace,
    /// The value is rendered after the original content.
    Note,
}

/// A single non-destructive edit to one content block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextUpdate {
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    pub update_type: UpdateType,
    pub value: String,
    pub message_index: usize,
    pub block_index: usize,
}

impl ContextUpdate {
    /// Render this update against the original block.
    pub fn render(&self, original: &ContentBlock) -> ContentBlock {
        match self.update_type {
            UpdateType::Replace => original.with_body(self.value.clone()),
            UpdateType::Note => {
                original.with_body(format!("{}\n\n{}", original.body(), self.value))
            }
        }
    }
}

/// `message_index → block_index → updates`, each list ordered by timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextOverlay {
    updates: BTreeMap<usize, BTreeMap<usize, Vec<ContextUpdate>>>,
}

impl ContextOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// File an update under its block, keeping the list ordered by timestamp.
    /// Updates with equal timestamps keep insertion order.
    pub fn insert(&mut self, update: ContextUpdate) {
        let list = self
            .updates
            .entry(update.message_index)
            .or_default()
            .entry(update.block_index)
            .or_default();
        let pos = list.partition_point(|u| u.timestamp <= update.timestamp);
        list.insert(pos, update);
    }

    /// The authoritative update for a block: the one with the latest timestamp.
    pub fn latest(&self, message_index: usize, block_index: usize) -> Option<&ContextUpdate> {
        self.updates
            .get(&message_index)?
            .get(&block_index)?
            .last()
    }

    /// Every retained update for a block, oldest first.
    pub fn updates_for(&self, message_index: usize, block_index: usize) -> &[ContextUpdate] {
        self.updates
            .get(&message_index)
            .and_then(|blocks| blocks.get(&block_index))
            .map_or(&[], |list| list.as_slice())
    }

    /// Whether the block's latest update replaces its content.
    pub fn is_replaced(&self, message_index: usize, block_index: usize) -> bool {
        self.latest(message_index, block_index)
            .is_some_and(|u| u.update_type == UpdateType::Replace)
    }

    /// Render `block` at `(message_index, block_index)` with its latest update.
    pub fn render_block(
        &self,
        message_index: usize,
        block_index: usize,
        block: &ContentBlock,
    ) -> ContentBlock {
        match self.latest(message_index, block_index) {
            Some(update) => update.render(block),
            None => block.clone(),
        }
    }

    /// Drop updates older than `cutoff` (epoch ms). The latest update for a
    /// block is always kept, whatever its age. Returns how many were dropped.
    pub fn prune_older_than(&mut self, cutoff: i64) -> usize {
        let mut removed = 0;
        for blocks in self.updates.values_mut() {
            for list in blocks.values_mut() {
                let last = list.len().saturating_sub(1);
                let before = list.len();
                let mut i = 0;
                list.retain(|u| {
                    let keep = i == last || u.timestamp >= cutoff;
                    i += 1;
                    keep
                });
                removed += before - list.len();
            }
        }
        removed
    }

    /// Total updates across all blocks.
    pub fn len(&self) -> usize {
        self.updates
            .values()
            .flat_map(|blocks| blocks.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate `(message_index, block_index, updates)` in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, &[ContextUpdate])> {
        self.updates.iter().flat_map(|(&m, blocks)| {
            blocks
                .iter()
                .map(move |(&b, list)| (m, b, list.as_slice()))
        })
    }
}
