// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hwpipe contributors
//
// The device: MMIO register decode, command engine, and host callback
// bridge wired together around the channel table and wake scheduler.

use std::io::{IoSlice, IoSliceMut};
use std::sync::{Arc, Mutex};

use crate::capabilities::{GuestMemory, HostCallbacks, IrqLine, ServiceRegistry};
use crate::channel::Channel;
use crate::command::Command;
use crate::config::{self, DeviceConfig};
use crate::error::DeviceError;
use crate::registers::{self, AccessParams32, AccessParams64, RegisterSnapshot};
use crate::scheduler::Scheduler;
use crate::status::{self, WakeFlags};
use crate::table::ChannelTable;

/// Guest-to-device register window: the single entry point a hypervisor
/// wires MMIO loads/stores through.
pub struct Device {
    shared: Arc<DeviceShared>,
}

/// State reachable from both the guest-facing MMIO path and the host
/// callback bridge. Lives behind `Arc` so [`HostCallbacks`] can hold a
/// [`std::sync::Weak`] reference back into it.
pub(crate) struct DeviceShared {
    registry: Box<dyn ServiceRegistry>,
    guest_memory: Box<dyn GuestMemory>,
    irq: Box<dyn IrqLine>,
    state: Mutex<DeviceState>,
}

/// Everything the coarse device lock guards: the register snapshot, the
/// channel table (map + traversal list), and the wake scheduler's fast-path
/// cache.
///
/// Held only for the short bookkeeping steps of a command, never across a
/// call into a [`crate::capabilities::ServiceHandler`] or
/// [`ServiceRegistry`] method — bulk transfers release the lock across
/// handler calls, relying only on the channel's own lock there.
struct DeviceState {
    regs: RegisterSnapshot,
    table: ChannelTable,
    scheduler: Scheduler,
}

impl Device {
    /// Construct a device around its three host-supplied capabilities.
    /// Fails only if `config` describes an unusable device.
    pub fn new(
        registry: impl ServiceRegistry + 'static,
        guest_memory: impl GuestMemory + 'static,
        irq: impl IrqLine + 'static,
        config: DeviceConfig,
    ) -> Result<Self, DeviceError> {
        if config.max_channels == Some(0) {
            log::error!("hwpipe: refusing to construct a device with zero channel capacity");
            return Err(DeviceError::ZeroCapacity);
        }
        Ok(Self {
            shared: Arc::new(DeviceShared {
                registry: Box::new(registry),
                guest_memory: Box::new(guest_memory),
                irq: Box::new(irq),
                state: Mutex::new(DeviceState {
                    regs: RegisterSnapshot::default(),
                    table: ChannelTable::new(config.max_channels),
                    scheduler: Scheduler::new(),
                }),
            }),
        })
    }

    /// Size in bytes of the MMIO window this device expects to be mapped
    /// into.
    pub fn mmio_window_size(&self) -> u64 {
        config::MMIO_WINDOW_SIZE
    }

    /// Handle a 32-bit guest load.
    pub fn mmio_read(&self, offset: u64) -> u32 {
        match offset {
            registers::STATUS => self.shared.state.lock().unwrap().regs.status as u32,
            registers::WAKES => self.shared.state.lock().unwrap().regs.wakes.bits() as u32,
            registers::PARAMS_ADDR_LOW => self.shared.state.lock().unwrap().regs.params_addr_low(),
            registers::PARAMS_ADDR_HIGH => self.shared.state.lock().unwrap().regs.params_addr_high(),
            registers::VERSION => config::INTERFACE_VERSION,
            registers::CHANNEL => {
                let mut guard = self.shared.state.lock().unwrap();
                let state = &mut *guard;
                let (low, wakes) = state
                    .scheduler
                    .drain_low(&mut state.table, self.shared.irq.as_ref());
                state.regs.wakes = wakes;
                low
            }
            registers::CHANNEL_HIGH => {
                let mut guard = self.shared.state.lock().unwrap();
                let state = &mut *guard;
                state.scheduler.drain_high(&state.table)
            }
            _ => {
                log::warn!("hwpipe: read from unknown MMIO offset {offset:#x}");
                0
            }
        }
    }

    /// Handle a 32-bit guest store.
    pub fn mmio_write(&self, offset: u64, value: u32) {
        match offset {
            registers::SIZE
            | registers::ADDRESS
            | registers::ADDRESS_HIGH
            | registers::CHANNEL
            | registers::CHANNEL_HIGH
            | registers::PARAMS_ADDR_LOW
            | registers::PARAMS_ADDR_HIGH => {
                let mut state = self.shared.state.lock().unwrap();
                match offset {
                    registers::SIZE => state.regs.size = value,
                    registers::ADDRESS => state.regs.set_address_low(value),
                    registers::ADDRESS_HIGH => state.regs.set_address_high(value),
                    registers::CHANNEL => state.regs.set_channel_low(value),
                    registers::CHANNEL_HIGH => state.regs.set_channel_high(value),
                    registers::PARAMS_ADDR_LOW => state.regs.set_params_addr_low(value),
                    registers::PARAMS_ADDR_HIGH => state.regs.set_params_addr_high(value),
                    _ => unreachable!(),
                }
            }
            registers::COMMAND => self.dispatch_command(value),
            registers::ACCESS_PARAMS => self.dispatch_access_params(),
            _ => log::warn!("hwpipe: write to unknown MMIO offset {offset:#x} (value {value:#x})"),
        }
    }

    // -- host callback bridge ------------------------------------------------

    /// Host upcall: a service has new readable/writable/closed state.
    pub fn wake(&self, channel: u64, flags: WakeFlags) {
        DeviceShared::wake(&self.shared, channel, flags);
    }

    /// Host upcall: a service has terminated.
    pub fn close(&self, channel: u64) {
        DeviceShared::close(&self.shared, channel);
    }

    // -- command engine -------------------------------------------------------

    fn dispatch_command(&self, raw: u32) {
        let Some(cmd) = Command::from_wire(raw) else {
            log::warn!("hwpipe: unknown command code {raw:#x}");
            return;
        };

        if cmd == Command::Open {
            let result = self.do_open();
            self.shared.state.lock().unwrap().regs.status = result;
            return;
        }

        let id = self.shared.state.lock().unwrap().regs.channel;
        let channel = self.shared.state.lock().unwrap().table.lookup(id);
        let Some(channel) = channel else {
            self.shared.state.lock().unwrap().regs.status = status::PIPE_ERROR_INVAL;
            return;
        };
        if channel.is_closed() && cmd != Command::Close {
            self.shared.state.lock().unwrap().regs.status = status::PIPE_ERROR_IO;
            return;
        }

        let result = match cmd {
            Command::Open => unreachable!(),
            Command::Close => self.do_close(id),
            Command::Poll => channel.with_handler(|h| h.poll()),
            Command::ReadBuffer => {
                let (addr, size) = self.latched_buffer_params();
                self.do_buffer(&channel, addr, size, BufferOp::Read)
            }
            Command::WriteBuffer => {
                let (addr, size) = self.latched_buffer_params();
                self.do_buffer(&channel, addr, size, BufferOp::Write)
            }
            Command::WakeOnRead => self.do_wake_on(&channel, WakeFlags::READ),
            Command::WakeOnWrite => self.do_wake_on(&channel, WakeFlags::WRITE),
        };
        self.shared.state.lock().unwrap().regs.status = result;
    }

    fn latched_buffer_params(&self) -> (u64, u32) {
        let state = self.shared.state.lock().unwrap();
        (state.regs.address, state.regs.size)
    }

    /// `OPEN`: the service name is read from guest memory at the latched
    /// `ADDRESS`/`SIZE` registers. Runs entirely without the device lock
    /// held once the registers are latched, since `ServiceRegistry::create`
    /// is a host call; `ChannelTable::insert`'s own duplicate check makes
    /// the final insert race-safe.
    fn do_open(&self) -> i32 {
        let (id, addr, size) = {
            let state = self.shared.state.lock().unwrap();
            (state.regs.channel, state.regs.address, state.regs.size)
        };

        if self.shared.state.lock().unwrap().table.contains(id) {
            return status::PIPE_ERROR_INVAL;
        }

        let name = match self.read_service_name(addr, size) {
            Some(name) => name,
            None => return status::PIPE_ERROR_INVAL,
        };

        let callbacks = HostCallbacks::new(id, &self.shared);
        let Some(handler) = self.shared.registry.create(&name, callbacks) else {
            log::warn!("hwpipe: OPEN for unknown service {name:?}");
            return status::PIPE_ERROR_INVAL;
        };

        let channel = Arc::new(Channel::new(id, handler));
        if !self.shared.state.lock().unwrap().table.insert(channel) {
            return status::PIPE_ERROR_INVAL;
        }
        status::SUCCESS
    }

    fn read_service_name(&self, phys: u64, size: u32) -> Option<String> {
        if size == 0 || size as usize > config::MAX_SERVICE_NAME_LEN {
            return None;
        }
        let region = MappedGuestRegion::map(self.shared.guest_memory.as_ref(), phys, size, false)?;
        let bytes = region.as_slice();
        let end = bytes
            .iter()
            .position(|&b| b == 0 || b == b'\n')
            .unwrap_or(bytes.len());
        if end == 0 {
            return None;
        }
        std::str::from_utf8(&bytes[..end]).ok().map(str::to_owned)
    }

    /// `CLOSE`: unlink from the traversal list, drop fast-path references,
    /// and remove from the table. The caller still holds a strong reference
    /// to `channel`, so the handler is not finalized until this call (and
    /// the device lock it takes internally) has returned.
    fn do_close(&self, id: u64) -> i32 {
        let mut state = self.shared.state.lock().unwrap();
        match state.table.remove(id) {
            Some(_channel) => {
                state.scheduler.forget(id);
                status::SUCCESS
            }
            None => status::PIPE_ERROR_INVAL,
        }
    }

    fn do_wake_on(&self, channel: &Arc<Channel>, bit: WakeFlags) -> i32 {
        channel.set_wanted(bit);
        let mask = channel.wanted();
        channel.with_handler(|h| h.wake_on(mask));
        status::SUCCESS
    }

    /// `READ_BUFFER` / `WRITE_BUFFER`. Never touches the device lock: only
    /// the channel's own handler lock and the guest-memory mapping are
    /// involved.
    fn do_buffer(&self, channel: &Arc<Channel>, phys: u64, size: u32, op: BufferOp) -> i32 {
        if size == 0 {
            return match op {
                BufferOp::Read => channel.with_handler(|h| h.recv(&mut [])),
                BufferOp::Write => channel.with_handler(|h| h.send(&[])),
            };
        }

        let is_write_mapping = matches!(op, BufferOp::Read);
        let mut region = match MappedGuestRegion::map(
            self.shared.guest_memory.as_ref(),
            phys,
            size,
            is_write_mapping,
        ) {
            Some(region) => region,
            None => return status::PIPE_ERROR_INVAL,
        };

        let result = match op {
            BufferOp::Read => {
                let mut iov = [IoSliceMut::new(region.as_mut_slice())];
                channel.with_handler(|h| h.recv(&mut iov))
            }
            BufferOp::Write => {
                let iov = [IoSlice::new(region.as_slice())];
                channel.with_handler(|h| h.send(&iov))
            }
        };
        if result > 0 {
            region.set_access_len(result as usize);
        }
        result
    }

    // -- packed-parameter path: an alternative to the register-by-register
    // buffer commands above ---------------------------------------------

    fn dispatch_access_params(&self) {
        let params_addr = self.shared.state.lock().unwrap().regs.params_addr;

        let mut header = match MappedGuestRegion::map(
            self.shared.guest_memory.as_ref(),
            params_addr,
            AccessParams32::WIRE_SIZE as u32,
            true,
        ) {
            Some(h) => h,
            None => return,
        };

        let params32_bytes: [u8; AccessParams32::WIRE_SIZE] =
            header.as_slice()[..AccessParams32::WIRE_SIZE].try_into().unwrap();
        let params32 = AccessParams32::from_bytes(&params32_bytes);

        if params32.flags == 0 {
            self.run_access_params32(params32, &mut header);
        } else {
            // Detection mismatch: the guest actually wrote the 64-bit shape.
            // Re-map at the full 64-bit size and re-read.
            drop(header);
            let mut header64 = match MappedGuestRegion::map(
                self.shared.guest_memory.as_ref(),
                params_addr,
                AccessParams64::WIRE_SIZE as u32,
                true,
            ) {
                Some(h) => h,
                None => return,
            };
            let params64_bytes: [u8; AccessParams64::WIRE_SIZE] =
                header64.as_slice()[..AccessParams64::WIRE_SIZE].try_into().unwrap();
            let params64 = AccessParams64::from_bytes(&params64_bytes);
            self.run_access_params64(params64, &mut header64);
        }
    }

    fn run_access_params32(&self, mut params: AccessParams32, header: &mut MappedGuestRegion<'_>) {
        let Some(op) = buffer_op_from_wire(params.cmd) else {
            return; // other commands silently ignored via this path
        };
        let result = self.run_access_params_buffer(
            params.channel as u64,
            params.address as u64,
            params.size,
            op,
        );
        params.result = result as u32;
        let bytes = params.to_bytes();
        header.as_mut_slice()[..bytes.len()].copy_from_slice(&bytes);
    }

    fn run_access_params64(&self, mut params: AccessParams64, header: &mut MappedGuestRegion<'_>) {
        let Some(op) = buffer_op_from_wire(params.cmd) else {
            return;
        };
        let result =
            self.run_access_params_buffer(params.channel, params.address, params.size as u32, op);
        params.result = result as u32;
        let bytes = params.to_bytes();
        header.as_mut_slice()[..bytes.len()].copy_from_slice(&bytes);
    }

    fn run_access_params_buffer(&self, channel_id: u64, address: u64, size: u32, op: BufferOp) -> i32 {
        let channel = self.shared.state.lock().unwrap().table.lookup(channel_id);
        let Some(channel) = channel else {
            return status::PIPE_ERROR_INVAL;
        };
        if channel.is_closed() {
            return status::PIPE_ERROR_IO;
        }
        self.do_buffer(&channel, address, size, op)
    }
}

impl DeviceShared {
    /// Shared implementation of [`Device::wake`], also reachable from
    /// [`HostCallbacks::signal_wake`].
    pub(crate) fn wake(shared: &Arc<DeviceShared>, channel: u64, flags: WakeFlags) {
        let found = {
            let state = shared.state.lock().unwrap();
            state.table.lookup(channel)
        };
        let Some(ch) = found else {
            return;
        };
        // A channel already marked closed ignores further wakes — except the
        // CLOSED wake itself, which `DeviceShared::close` delivers right
        // after setting the flag, and which follows this same wake path.
        if ch.is_closed() && !flags.contains(WakeFlags::CLOSED) {
            return;
        }
        ch.set_wanted(flags);
        let mut state = shared.state.lock().unwrap();
        state.scheduler.cache_wake(channel);
        drop(state);
        shared.irq.set(true);
    }

    /// Shared implementation of [`Device::close`], also reachable from
    /// [`HostCallbacks::close_from_host`].
    pub(crate) fn close(shared: &Arc<DeviceShared>, channel: u64) {
        let newly_closed = {
            let state = shared.state.lock().unwrap();
            match state.table.lookup(channel) {
                Some(ch) => ch.mark_closed(),
                None => false,
            }
        };
        if newly_closed {
            Self::wake(shared, channel, WakeFlags::CLOSED);
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BufferOp {
    Read,
    Write,
}

fn buffer_op_from_wire(cmd: u32) -> Option<BufferOp> {
    match Command::from_wire(cmd) {
        Some(Command::ReadBuffer) => Some(BufferOp::Read),
        Some(Command::WriteBuffer) => Some(BufferOp::Write),
        _ => None,
    }
}

/// RAII guard around a [`GuestMemory::map`]/[`GuestMemory::unmap`] pair,
/// guaranteeing the mapping is released on every exit path. A partial
/// mapping is treated as failure and unmapped before returning INVAL.
struct MappedGuestRegion<'a> {
    guest_memory: &'a dyn GuestMemory,
    ptr: *mut u8,
    len: usize,
    dirty: bool,
    access_len: usize,
}

impl<'a> MappedGuestRegion<'a> {
    fn map(guest_memory: &'a dyn GuestMemory, phys: u64, size: u32, is_write: bool) -> Option<Self> {
        let (ptr, mapped_len) = unsafe { guest_memory.map(phys, size, is_write) }?;
        if mapped_len < size as usize {
            unsafe { guest_memory.unmap(ptr, mapped_len, is_write, 0) };
            return None;
        }
        Some(Self {
            guest_memory,
            ptr,
            len: mapped_len,
            dirty: is_write,
            access_len: mapped_len,
        })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    fn set_access_len(&mut self, n: usize) {
        self.access_len = n.min(self.len);
    }
}

impl Drop for MappedGuestRegion<'_> {
    fn drop(&mut self) {
        unsafe {
            self.guest_memory
                .unmap(self.ptr, self.len, self.dirty, self.access_len);
        }
    }
}
