// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hwpipe contributors
//
// The wake scheduler: selects the next signaled channel to surface to the
// guest during a drain round, and owns the IRQ discipline.

use crate::capabilities::IrqLine;
use crate::status::WakeFlags;
use crate::table::ChannelTable;

/// Fast-path cache slots plus the low/high drain protocol built on top of
/// [`ChannelTable`]'s traversal cursor.
///
/// `cache_pipe` is the single-entry fast path a host `wake()` callback
/// populates directly, short-circuiting the list scan.
/// `cache_pipe_64bit` is the "channel selected for the current drain pair":
/// it is set whenever a `CHANNEL` (low) read resolves a channel — whether
/// through the fast path or the list scan — and is what the paired
/// `CHANNEL_HIGH` read consumes. Between the two reads, the device holds the
/// selected channel in `cache_pipe_64bit`.
#[derive(Default)]
pub struct Scheduler {
    cache_pipe: Option<u64>,
    cache_pipe_64bit: Option<u64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host wake fast path: remember the most recently woken channel so the
    /// next low read finds it in O(1).
    pub fn cache_wake(&mut self, id: u64) {
        self.cache_pipe = Some(id);
    }

    /// Drop any fast-path references to `id` before it is freed.
    pub fn forget(&mut self, id: u64) {
        if self.cache_pipe == Some(id) {
            self.cache_pipe = None;
        }
        if self.cache_pipe_64bit == Some(id) {
            self.cache_pipe_64bit = None;
        }
    }

    /// `CHANNEL` register read (low 32 bits): resolve the next signaled
    /// channel, latch its wake mask, and return its low bits. Returns
    /// `(low_bits, wakes)`.
    pub fn drain_low(&mut self, table: &mut ChannelTable, irq: &dyn IrqLine) -> (u32, WakeFlags) {
        if let Some(id) = self.cache_pipe.take() {
            if let Some(ch) = table.lookup(id) {
                let wakes = ch.get_and_clear_wanted();
                self.cache_pipe_64bit = Some(id);
                return (low32(id), wakes);
            }
            // Channel vanished between the wake and the drain (e.g. a racing
            // CLOSE already unlinked it) — fall through to the list scan.
        }

        if let Some(ch) = table.peek_signaled() {
            let id = ch.id();
            let wakes = ch.get_and_clear_wanted();
            table.advance_past(id);
            self.cache_pipe_64bit = Some(id);
            return (low32(id), wakes);
        }

        let had_entries = !table.is_empty();
        table.restart_cursor();
        self.cache_pipe_64bit = None;
        if had_entries {
            irq.set(false);
        }
        (0, WakeFlags::empty())
    }

    /// `CHANNEL_HIGH` register read (high 32 bits): return the high bits of
    /// the channel the paired low read just selected, without consuming it.
    ///
    /// Known protocol limitation, preserved deliberately: a high-half drain
    /// read of 0 always terminates the guest's polling loop, even for a live
    /// channel whose high bits are legitimately zero. This is not fixed
    /// here.
    pub fn drain_high(&mut self, table: &ChannelTable) -> u32 {
        if let Some(id) = self.cache_pipe_64bit {
            return high32(id);
        }
        // Defensive fallback for a `CHANNEL_HIGH` read with no preceding
        // `CHANNEL` read this round: same traversal logic, but the found
        // channel is only cached, never consumed.
        if let Some(ch) = table.peek_signaled() {
            let id = ch.id();
            self.cache_pipe_64bit = Some(id);
            return high32(id);
        }
        0
    }
}

fn low32(id: u64) -> u32 {
    (id & 0xFFFF_FFFF) as u32
}

fn high32(id: u64) -> u32 {
    (id >> 32) as u32
}
