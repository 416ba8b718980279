//! In-memory reference driver.
//!
//! `HostDriver` backs every allocation with a plain `Vec<u8>` and performs
//! real byte copies, with no timing model: the clock only moves if a per-byte
//! cost is configured. It keeps call counters and supports one-shot fault
//! injection so benchmark error paths can be exercised deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::driver::{Context, Driver};
use crate::types::{DeviceId, DevicePtr, Direction, MemoryMode, SimTime};
use crate::{MemcopyError, Result};

/// Address stride between allocations.
const PTR_STRIDE: u64 = 0x1000;

/// Per-operation call counters. Only successful calls are counted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub init: usize,
    pub select_gpu: usize,
    pub allocate: usize,
    pub free: usize,
    pub h2d: usize,
    pub d2h: usize,
    pub d2d: usize,
}

/// One-shot fault, consumed by the first operation it applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    FailAllocation,
    FailH2D,
    FailD2H,
    /// XOR `mask` into byte `index` of the next D2H copy's destination.
    CorruptD2H { index: usize, mask: u8 },
}

struct Allocation {
    device: DeviceId,
    mode: MemoryMode,
    data: Vec<u8>,
}

#[derive(Default)]
struct HostState {
    contexts: HashMap<u64, Option<DeviceId>>,
    allocations: HashMap<DevicePtr, Allocation>,
    faults: Vec<Fault>,
    clock: f64,
    calls: CallCounts,
}

impl HostState {
    fn take_fault(&mut self, pred: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let pos = self.faults.iter().position(pred)?;
        Some(self.faults.remove(pos))
    }

    fn device_of(&self, ctx: &Context) -> Result<DeviceId> {
        self.contexts
            .get(&ctx.id())
            .copied()
            .flatten()
            .ok_or(MemcopyError::NoDeviceSelected(ctx.id()))
    }
}

/// Reference driver: real byte copies into host-side vectors.
pub struct HostDriver {
    devices: u32,
    capacity: Option<u64>,
    seconds_per_byte: f64,
    state: Mutex<HostState>,
    next_ctx: AtomicU64,
    next_ptr: AtomicU64,
}

impl HostDriver {
    /// Driver exposing `devices` devices with unlimited memory.
    pub fn new(devices: u32) -> Self {
        Self {
            devices,
            capacity: None,
            seconds_per_byte: 0.0,
            state: Mutex::new(HostState::default()),
            next_ctx: AtomicU64::new(1),
            next_ptr: AtomicU64::new(1),
        }
    }

    /// Limit each device to `bytes` of live allocations.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Advance the clock by `secs` for every byte copied.
    pub fn with_seconds_per_byte(mut self, secs: f64) -> Self {
        self.seconds_per_byte = secs.max(0.0);
        self
    }

    /// Queue a one-shot fault.
    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    /// Snapshot of the successful-call counters.
    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls
    }

    /// Number of allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Memory mode an allocation was made with, if it is still live.
    pub fn allocation_mode(&self, ptr: DevicePtr) -> Option<MemoryMode> {
        self.state.lock().allocations.get(&ptr).map(|a| a.mode)
    }

    fn check_device(&self, device: DeviceId) -> Result<()> {
        if device.0 < self.devices {
            Ok(())
        } else {
            Err(MemcopyError::NoSuchDevice(device))
        }
    }

    fn charge(&self, state: &mut HostState, bytes: usize) {
        state.clock += bytes as f64 * self.seconds_per_byte;
    }
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new(1)
    }
}

fn transfer_err(direction: Direction, reason: impl Into<String>) -> MemcopyError {
    MemcopyError::Transfer {
        direction,
        reason: reason.into(),
    }
}

fn lookup<'a>(
    allocations: &'a mut HashMap<DevicePtr, Allocation>,
    ptr: DevicePtr,
    device: DeviceId,
    direction: Direction,
) -> Result<&'a mut Allocation> {
    let alloc = allocations
        .get_mut(&ptr)
        .ok_or(MemcopyError::InvalidHandle(ptr))?;
    if alloc.device != device {
        return Err(transfer_err(
            direction,
            format!("{ptr} lives on {}, context is bound to {device}", alloc.device),
        ));
    }
    Ok(alloc)
}

impl Driver for HostDriver {
    fn init(&self) -> Result<Context> {
        let id = self.next_ctx.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.contexts.insert(id, None);
        state.calls.init += 1;
        Ok(Context::new(id))
    }

    fn device_count(&self) -> usize {
        self.devices as usize
    }

    fn select_gpu(&self, ctx: &Context, device: DeviceId) -> Result<()> {
        self.check_device(device)?;
        let mut state = self.state.lock();
        let slot = state
            .contexts
            .get_mut(&ctx.id())
            .ok_or(MemcopyError::InvalidState("unknown context"))?;
        *slot = Some(device);
        state.calls.select_gpu += 1;
        Ok(())
    }

    fn allocate_memory(&self, ctx: &Context, size: u64, mode: MemoryMode) -> Result<DevicePtr> {
        let mut state = self.state.lock();
        let device = state.device_of(ctx)?;
        if state
            .take_fault(|f| matches!(f, Fault::FailAllocation))
            .is_some()
        {
            return Err(MemcopyError::OutOfMemory {
                device,
                requested: size,
                available: 0,
            });
        }
        if let Some(capacity) = self.capacity {
            let used: u64 = state
                .allocations
                .values()
                .filter(|a| a.device == device)
                .map(|a| a.data.len() as u64)
                .sum();
            let available = capacity.saturating_sub(used);
            if size > available {
                return Err(MemcopyError::OutOfMemory {
                    device,
                    requested: size,
                    available,
                });
            }
        }
        let len = usize::try_from(size).map_err(|_| MemcopyError::OutOfMemory {
            device,
            requested: size,
            available: usize::MAX as u64,
        })?;
        let ptr = DevicePtr(self.next_ptr.fetch_add(1, Ordering::Relaxed) * PTR_STRIDE);
        state.allocations.insert(
            ptr,
            Allocation {
                device,
                mode,
                data: vec![0; len],
            },
        );
        state.calls.allocate += 1;
        debug!(%ptr, %device, size, %mode, "host allocation");
        Ok(ptr)
    }

    fn memcopy_h2d(&self, ctx: &Context, dst: DevicePtr, src: &[u8]) -> Result<()> {
        let direction = Direction::HostToDevice;
        let mut state = self.state.lock();
        let device = state.device_of(ctx)?;
        if state.take_fault(|f| matches!(f, Fault::FailH2D)).is_some() {
            return Err(transfer_err(direction, "injected fault"));
        }
        let alloc = lookup(&mut state.allocations, dst, device, direction)?;
        if src.len() > alloc.data.len() {
            return Err(transfer_err(
                direction,
                format!(
                    "copy of {} bytes exceeds allocation of {}",
                    src.len(),
                    alloc.data.len()
                ),
            ));
        }
        alloc.data[..src.len()].copy_from_slice(src);
        self.charge(&mut state, src.len());
        state.calls.h2d += 1;
        Ok(())
    }

    fn memcopy_d2h(&self, ctx: &Context, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        let direction = Direction::DeviceToHost;
        let mut state = self.state.lock();
        let device = state.device_of(ctx)?;
        if state.take_fault(|f| matches!(f, Fault::FailD2H)).is_some() {
            return Err(transfer_err(direction, "injected fault"));
        }
        let alloc = lookup(&mut state.allocations, src, device, direction)?;
        if dst.len() > alloc.data.len() {
            return Err(transfer_err(
                direction,
                format!(
                    "copy of {} bytes exceeds allocation of {}",
                    dst.len(),
                    alloc.data.len()
                ),
            ));
        }
        dst.copy_from_slice(&alloc.data[..dst.len()]);
        if let Some(Fault::CorruptD2H { index, mask }) =
            state.take_fault(|f| matches!(f, Fault::CorruptD2H { .. }))
            && let Some(byte) = dst.get_mut(index)
        {
            *byte ^= mask;
        }
        self.charge(&mut state, dst.len());
        state.calls.d2h += 1;
        Ok(())
    }

    fn memcopy_d2d(&self, ctx: &Context, dst: DevicePtr, src: DevicePtr, len: u64) -> Result<()> {
        let direction = Direction::DeviceToDevice;
        let mut state = self.state.lock();
        let device = state.device_of(ctx)?;
        let len = usize::try_from(len)
            .map_err(|_| transfer_err(direction, "length overflows host address space"))?;
        let bytes = {
            let from = lookup(&mut state.allocations, src, device, direction)?;
            if len > from.data.len() {
                return Err(transfer_err(direction, "source range out of bounds"));
            }
            from.data[..len].to_vec()
        };
        let to = lookup(&mut state.allocations, dst, device, direction)?;
        if len > to.data.len() {
            return Err(transfer_err(direction, "destination range out of bounds"));
        }
        to.data[..len].copy_from_slice(&bytes);
        self.charge(&mut state, len);
        state.calls.d2d += 1;
        Ok(())
    }

    fn free_memory(&self, _ctx: &Context, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state.lock();
        state
            .allocations
            .remove(&ptr)
            .ok_or(MemcopyError::InvalidHandle(ptr))?;
        state.calls.free += 1;
        Ok(())
    }

    fn current_time(&self) -> SimTime {
        SimTime(self.state.lock().clock)
    }
}
