// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hwpipe contributors
//
// Host-side collaborator traits. These are consumed, not implemented, by
// the device core — a hypervisor embedding this crate supplies concrete
// implementations backed by its own guest-memory mapper, interrupt
// controller, and service directory.

use std::io::{IoSlice, IoSliceMut};
use std::sync::{Arc, Weak};

use crate::status::WakeFlags;

/// Maps guest physical memory into host-addressable buffers for the
/// duration of a single `READ_BUFFER`/`WRITE_BUFFER` command.
///
/// Implementations must honor the "partial success is failure" rule: if
/// fewer than `size` bytes can be mapped, the device treats the whole
/// operation as `PIPE_ERROR_INVAL` and still calls [`GuestMemory::unmap`] on
/// whatever was mapped.
pub trait GuestMemory: Send + Sync {
    /// Map `size` bytes of guest physical memory starting at `phys`.
    /// Returns the host pointer and the number of bytes actually mapped,
    /// or `None` if the range could not be mapped at all.
    ///
    /// # Safety
    /// The returned pointer is valid for reads (and writes, if `is_write`)
    /// for `mapped_len` bytes until the matching [`GuestMemory::unmap`] call.
    unsafe fn map(&self, phys: u64, size: u32, is_write: bool) -> Option<(*mut u8, usize)>;

    /// Release a mapping obtained from [`GuestMemory::map`]. `dirty` marks
    /// whether the host wrote through the mapping (set equal to the
    /// operation's direction); `access_len` is how many bytes of the mapping
    /// were actually touched.
    ///
    /// # Safety
    /// `ptr`/`len` must be exactly the pair most recently returned by a live
    /// `map` call on `self` that has not yet been unmapped.
    unsafe fn unmap(&self, ptr: *mut u8, len: usize, dirty: bool, access_len: usize);
}

/// A single guest interrupt line with two levels.
pub trait IrqLine: Send + Sync {
    /// Assert (`true`) or deassert (`false`) the line.
    fn set(&self, level: bool);
}

/// Per-channel service instance bound at `OPEN` time.
///
/// All methods must be non-blocking: the device calls these with its
/// per-channel lock released but expects to return to the guest promptly.
/// No suspension points.
pub trait ServiceHandler: Send {
    /// Read up to the total length of `bufs` from the service into the
    /// guest-destined buffer. Returns the number of bytes read, or a
    /// negative `crate::status` code.
    fn recv(&mut self, bufs: &mut [IoSliceMut<'_>]) -> i32;

    /// Write the guest-sourced buffer to the service. Returns the number of
    /// bytes written, or a negative `crate::status` code.
    fn send(&mut self, bufs: &[IoSlice<'_>]) -> i32;

    /// Report readiness as a [`WakeFlags`]-shaped status value.
    fn poll(&mut self) -> i32;

    /// Subscribe to future wakes for the bits newly present in `mask`.
    fn wake_on(&mut self, mask: WakeFlags);
}

/// Maps service names to handler factories.
pub trait ServiceRegistry: Send + Sync {
    /// Instantiate the named service for a newly opened channel, or `None`
    /// if no such service exists (surfaced as `PIPE_ERROR_INVAL` by the
    /// caller).
    fn create(&self, name: &str, callbacks: HostCallbacks) -> Option<Box<dyn ServiceHandler>>;
}

/// Upcall handle given to a [`ServiceHandler`] at construction time so it
/// can later signal the device from its own host-side thread.
///
/// Held by the service, not the device: `CLOSE` drops the channel (and with
/// it the handler), and a handler that out-lives its channel simply finds
/// its upcalls become no-ops once the weak reference can no longer upgrade.
#[derive(Clone)]
pub struct HostCallbacks {
    pub(crate) channel_id: u64,
    pub(crate) device: Weak<crate::device::DeviceShared>,
}

impl HostCallbacks {
    pub(crate) fn new(channel_id: u64, device: &Arc<crate::device::DeviceShared>) -> Self {
        Self {
            channel_id,
            device: Arc::downgrade(device),
        }
    }

    /// Host upcall: OR the given flags into the channel's wake mask and
    /// surface it to the guest.
    pub fn signal_wake(&self, flags: WakeFlags) {
        if let Some(device) = self.device.upgrade() {
            crate::device::DeviceShared::wake(&device, self.channel_id, flags);
        }
    }

    /// Host upcall: mark the channel closed from the host side and deliver
    /// a final `WAKE_CLOSED`.
    pub fn close_from_host(&self) {
        if let Some(device) = self.device.upgrade() {
            crate::device::DeviceShared::close(&device, self.channel_id);
        }
    }
}
