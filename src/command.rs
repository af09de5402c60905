// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hwpipe contributors
//
// Guest-issued command codes. Latched via the `COMMAND` register and
// interpreted by the command engine.

/// One of the stable wire-level command codes a guest driver may latch into
/// the `COMMAND` register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Open = 1,
    Close = 2,
    Poll = 3,
    WriteBuffer = 4,
    WakeOnWrite = 5,
    ReadBuffer = 6,
    WakeOnRead = 7,
}

impl Command {
    /// Decode a raw command byte latched by the guest. Unknown codes are not
    /// an error at this layer — the caller logs and ignores them.
    pub fn from_wire(value: u32) -> Option<Self> {
        Some(match value {
            1 => Command::Open,
            2 => Command::Close,
            3 => Command::Poll,
            4 => Command::WriteBuffer,
            5 => Command::WakeOnWrite,
            6 => Command::ReadBuffer,
            7 => Command::WakeOnRead,
            _ => return None,
        })
    }
}
