// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hwpipe contributors
//
// Host-visible, Rust-level errors. Distinct from `crate::status`, which
// holds guest-visible wire protocol values.

use thiserror::Error;

/// Errors that can occur while constructing a [`crate::Device`].
///
/// Nothing past construction returns a `Result`: once the device exists,
/// every guest-facing and host-facing entry point is infallible from the
/// caller's point of view, with failures either written to the `status`
/// register or logged and dropped.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The configured channel table capacity was zero, which would make the
    /// device unable to ever service an `OPEN` command.
    #[error("channel table capacity must be nonzero")]
    ZeroCapacity,
}
