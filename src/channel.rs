// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hwpipe contributors
//
// The channel record ("HwPipe" in the source this core is modeled on).

use std::sync::Mutex;

use crate::capabilities::ServiceHandler;
use crate::status::WakeFlags;

/// Per-channel wake state guarded by the channel's own lock.
struct ChannelState {
    wanted: WakeFlags,
    closed: bool,
}

/// One logical pipe between a guest channel id and a host service instance.
///
/// `handler` and `state` are declared in this order deliberately: Rust drops
/// struct fields top-to-bottom, so the handler is dropped — and with it any
/// re-entrant call into `HostCallbacks` during its own teardown — while
/// `state`'s `Mutex` is still live. Destruction releases the handler first,
/// then the lock, in that order.
pub struct Channel {
    id: u64,
    handler: Mutex<Box<dyn ServiceHandler>>,
    state: Mutex<ChannelState>,
}

impl Channel {
    /// Construct a channel around an already-instantiated handler. Service
    /// name resolution happens one level up, in the command engine's `OPEN`
    /// handling.
    pub fn new(id: u64, handler: Box<dyn ServiceHandler>) -> Self {
        Self {
            id,
            handler: Mutex::new(handler),
            state: Mutex::new(ChannelState {
                wanted: WakeFlags::empty(),
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Atomically read and clear the pending wake mask.
    pub fn get_and_clear_wanted(&self) -> WakeFlags {
        let mut state = self.state.lock().unwrap();
        std::mem::replace(&mut state.wanted, WakeFlags::empty())
    }

    /// Peek the pending wake mask without clearing it — used by the
    /// scheduler's scan, which only consumes a channel once it has decided
    /// to surface it to the guest.
    pub fn wanted(&self) -> WakeFlags {
        self.state.lock().unwrap().wanted
    }

    /// OR-fold `bits` into the pending wake mask.
    pub fn set_wanted(&self, bits: WakeFlags) {
        self.state.lock().unwrap().wanted |= bits;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Mark the channel closed from the host side. Idempotent: returns
    /// `true` only the first time, when the channel was not already closed.
    pub fn mark_closed(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            false
        } else {
            state.closed = true;
            true
        }
    }

    /// Run `f` against the handler with the channel lock released: the
    /// device never holds the channel lock across a handler method call.
    pub fn with_handler<R>(&self, f: impl FnOnce(&mut dyn ServiceHandler) -> R) -> R {
        let mut handler = self.handler.lock().unwrap();
        f(&mut **handler)
    }
}
