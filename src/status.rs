// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hwpipe contributors
//
// Wire-level status codes and wake flags.
// These are protocol values written to MMIO registers, not `Result`s.

use bitflags::bitflags;

/// Operation succeeded; also the literal value `0`.
pub const SUCCESS: i32 = 0;
/// Unknown channel, double `OPEN`, failed guest-memory mapping, or `CLOSE`
/// of an unlinked channel.
pub const PIPE_ERROR_INVAL: i32 = -1;
/// Operation attempted against a channel the host side has already closed.
pub const PIPE_ERROR_IO: i32 = -2;
/// Handler reports "try again" (non-blocking operation would block).
pub const PIPE_ERROR_AGAIN: i32 = -3;
/// Handler or device ran out of resources servicing the request.
pub const PIPE_ERROR_NOMEM: i32 = -4;

bitflags! {
    /// Wake reasons the host surfaces to the guest, and the driver-side
    /// subscriptions the guest can register.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct WakeFlags: u8 {
        /// The host side of the channel has terminated.
        const CLOSED = 1 << 0;
        /// The channel has data the guest can read.
        const READ = 1 << 1;
        /// The channel is ready to accept a write.
        const WRITE = 1 << 2;
    }
}
