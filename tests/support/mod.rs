// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 hwpipe contributors
//
// Mock implementations of the host-side capability traits, shared by the
// integration tests.

use std::collections::HashMap;
use std::io::{IoSlice, IoSliceMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use hwpipe::capabilities::{GuestMemory, HostCallbacks, IrqLine, ServiceHandler, ServiceRegistry};
use hwpipe::status::WakeFlags;

/// A flat byte arena standing in for guest physical memory. "Physical
/// addresses" are just byte offsets into the arena.
pub struct MockGuestMemory {
    arena: Mutex<Vec<u8>>,
}

impl MockGuestMemory {
    pub fn new(size: usize) -> Self {
        Self {
            arena: Mutex::new(vec![0u8; size]),
        }
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) {
        let mut arena = self.arena.lock().unwrap();
        let start = offset as usize;
        arena[start..start + data.len()].copy_from_slice(data);
    }

    pub fn read_at(&self, offset: u64, len: usize) -> Vec<u8> {
        let arena = self.arena.lock().unwrap();
        let start = offset as usize;
        arena[start..start + len].to_vec()
    }
}

impl GuestMemory for MockGuestMemory {
    unsafe fn map(&self, phys: u64, size: u32, _is_write: bool) -> Option<(*mut u8, usize)> {
        let mut arena = self.arena.lock().unwrap();
        let start = phys as usize;
        let end = start.checked_add(size as usize)?;
        if end > arena.len() {
            return None;
        }
        Some((arena[start..end].as_mut_ptr(), size as usize))
    }

    unsafe fn unmap(&self, _ptr: *mut u8, _len: usize, _dirty: bool, _access_len: usize) {
        // The arena owns the backing storage; nothing to release.
    }
}

/// A single interrupt line that just remembers its current level.
#[derive(Default)]
pub struct MockIrq(AtomicBool);

impl MockIrq {
    pub fn is_asserted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl IrqLine for MockIrq {
    fn set(&self, level: bool) {
        self.0.store(level, Ordering::SeqCst);
    }
}

/// Bounces every `send`d byte back out through `recv`, FIFO, and answers
/// `poll`/`wake_on` honestly against that buffer. Exercises the
/// write-then-read round trip end to end.
pub struct EchoHandler {
    buf: Mutex<Vec<u8>>,
    callbacks: HostCallbacks,
}

impl EchoHandler {
    pub fn new(callbacks: HostCallbacks) -> Self {
        Self {
            buf: Mutex::new(Vec::new()),
            callbacks,
        }
    }
}

impl ServiceHandler for EchoHandler {
    fn recv(&mut self, bufs: &mut [IoSliceMut<'_>]) -> i32 {
        let mut buf = self.buf.lock().unwrap();
        let mut n = 0usize;
        for dst in bufs.iter_mut() {
            let take = dst.len().min(buf.len());
            dst[..take].copy_from_slice(&buf[..take]);
            buf.drain(..take);
            n += take;
            if take < dst.len() {
                break;
            }
        }
        n as i32
    }

    fn send(&mut self, bufs: &[IoSlice<'_>]) -> i32 {
        let mut buf = self.buf.lock().unwrap();
        let mut n = 0usize;
        for src in bufs {
            buf.extend_from_slice(src);
            n += src.len();
        }
        drop(buf);
        self.callbacks.signal_wake(WakeFlags::READ);
        n as i32
    }

    fn poll(&mut self) -> i32 {
        let ready = if self.buf.lock().unwrap().is_empty() {
            WakeFlags::WRITE
        } else {
            WakeFlags::READ | WakeFlags::WRITE
        };
        ready.bits() as i32
    }

    fn wake_on(&mut self, _mask: WakeFlags) {}
}

/// Never accepts an `OPEN`. Exercises the "unknown service" failure path.
pub struct RefusingRegistry;

impl ServiceRegistry for RefusingRegistry {
    fn create(&self, _name: &str, _callbacks: HostCallbacks) -> Option<Box<dyn ServiceHandler>> {
        None
    }
}

/// Resolves a fixed set of service names to freshly constructed handlers.
pub struct EchoRegistry {
    names: HashMap<String, ()>,
}

impl EchoRegistry {
    pub fn new(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| (n.to_string(), ())).collect(),
        }
    }
}

impl ServiceRegistry for EchoRegistry {
    fn create(&self, name: &str, callbacks: HostCallbacks) -> Option<Box<dyn ServiceHandler>> {
        if self.names.contains_key(name) {
            Some(Box::new(EchoHandler::new(callbacks)))
        } else {
            None
        }
    }
}

/// Convenience bundle of a device plus the mocks it was built from, so tests
/// can poke guest memory and the IRQ line directly.
pub struct Harness {
    pub device: hwpipe::Device,
    pub guest_memory: Arc<MockGuestMemory>,
    pub irq: Arc<MockIrq>,
}

pub fn harness(registry: impl ServiceRegistry + 'static) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let guest_memory = Arc::new(MockGuestMemory::new(0x10000));
    let irq = Arc::new(MockIrq::default());
    let device = hwpipe::Device::new(
        registry,
        ArcGuestMemory(guest_memory.clone()),
        ArcIrq(irq.clone()),
        hwpipe::config::DeviceConfig::default(),
    )
    .expect("device construction");
    Harness {
        device,
        guest_memory,
        irq,
    }
}

/// `Device::new` takes its capabilities by value (it boxes them itself), so
/// the harness needs thin `Arc`-forwarding wrappers to keep its own handles
/// to the mocks alive for assertions.
struct ArcGuestMemory(Arc<MockGuestMemory>);
impl GuestMemory for ArcGuestMemory {
    unsafe fn map(&self, phys: u64, size: u32, is_write: bool) -> Option<(*mut u8, usize)> {
        unsafe { self.0.map(phys, size, is_write) }
    }
    unsafe fn unmap(&self, ptr: *mut u8, len: usize, dirty: bool, access_len: usize) {
        unsafe { self.0.unmap(ptr, len, dirty, access_len) }
    }
}

struct ArcIrq(Arc<MockIrq>);
impl IrqLine for ArcIrq {
    fn set(&self, level: bool) {
        self.0.set(level)
    }
}

pub fn write_service_name(h: &Harness, addr: u64, name: &str) {
    h.guest_memory.write_at(addr, name.as_bytes());
}

/// Split a 64-bit register value across its low/high 32-bit halves, the way
/// a real guest driver would issue the two stores.
pub fn write_u64_reg(device: &hwpipe::Device, low_off: u64, high_off: u64, value: u64) {
    device.mmio_write(low_off, (value & 0xFFFF_FFFF) as u32);
    device.mmio_write(high_off, (value >> 32) as u32);
}

/// Issue an `OPEN` for `name` on `channel_id`, staging the name through
/// guest memory at `name_addr` first. Returns the `STATUS` register.
pub fn open_channel(h: &Harness, channel_id: u64, name_addr: u64, name: &str) -> i32 {
    use hwpipe::registers;
    write_service_name(h, name_addr, name);
    write_u64_reg(&h.device, registers::CHANNEL, registers::CHANNEL_HIGH, channel_id);
    write_u64_reg(&h.device, registers::ADDRESS, registers::ADDRESS_HIGH, name_addr);
    h.device.mmio_write(registers::SIZE, name.len() as u32);
    h.device.mmio_write(registers::COMMAND, hwpipe::command::Command::Open as u32);
    h.device.mmio_read(registers::STATUS) as i32
}
