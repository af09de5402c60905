// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hwpipe contributors
//
// The channel table. Dual structure: an id→channel map for O(1) command
// dispatch, and an insertion-order traversal list the wake scheduler walks
// with a restartable cursor.

use std::collections::HashMap;
use std::sync::Arc;

use crate::channel::Channel;

/// Indexes live channels by id and keeps the insertion-order traversal list
/// the wake scheduler scans.
///
/// The traversal list is implemented as a vector of ids plus a cursor index
/// rather than an intrusive doubly linked list: the two are equivalent as
/// long as the restart semantics hold, and a vector needs no extra
/// per-channel link fields.
pub struct ChannelTable {
    by_id: HashMap<u64, Arc<Channel>>,
    order: Vec<u64>,
    /// Current scan position into `order` — the "head" the wake scheduler
    /// advances past signaled channels and restarts to `0` (the saved head)
    /// once the scan reaches the end.
    cursor: usize,
    max_channels: Option<usize>,
}

impl ChannelTable {
    pub fn new(max_channels: Option<usize>) -> Self {
        Self {
            by_id: HashMap::new(),
            order: Vec::new(),
            cursor: 0,
            max_channels,
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn lookup(&self, id: u64) -> Option<Arc<Channel>> {
        self.by_id.get(&id).cloned()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Returns `false` if `id` is already present or the table is at
    /// capacity — both surface as `PIPE_ERROR_INVAL` to the caller.
    pub fn insert(&mut self, channel: Arc<Channel>) -> bool {
        let id = channel.id();
        if self.by_id.contains_key(&id) {
            return false;
        }
        if let Some(max) = self.max_channels {
            if self.by_id.len() >= max {
                return false;
            }
        }
        self.order.push(id);
        self.by_id.insert(id, channel);
        true
    }

    /// Unlink and remove `id`. Returns the removed channel, or `None` if it
    /// was not present in the traversal list — the caller reports that as
    /// `PIPE_ERROR_INVAL`.
    pub fn remove(&mut self, id: u64) -> Option<Arc<Channel>> {
        let pos = self.order.iter().position(|&x| x == id)?;
        self.order.remove(pos);
        // `Vec::remove` shifts every later element left by one; the cursor
        // must shift with it to keep pointing at the same logical
        // successor — the saved-head restart relies on this.
        if pos < self.cursor {
            self.cursor -= 1;
        }
        self.by_id.remove(&id)
    }

    /// Scan forward from the current cursor for the next channel with a
    /// nonzero wake mask, without consuming it. Returns `None` once the
    /// list is exhausted from the current position.
    pub fn peek_signaled(&self) -> Option<Arc<Channel>> {
        for &id in &self.order[self.cursor..] {
            if let Some(ch) = self.by_id.get(&id) {
                if !ch.wanted().is_empty() {
                    return Some(ch.clone());
                }
            }
        }
        None
    }

    /// Advance the cursor past the channel most recently returned by
    /// `peek_signaled`.
    pub fn advance_past(&mut self, id: u64) {
        if let Some(pos) = self.order[self.cursor..].iter().position(|&x| x == id) {
            self.cursor = self.cursor + pos + 1;
        }
    }

    /// Restart the cursor to the saved head.
    pub fn restart_cursor(&mut self) {
        self.cursor = 0;
    }
}
