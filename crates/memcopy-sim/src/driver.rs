//! `SimDriver`: the `Driver` implementation backed by the event engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use memcopy_core::{
    Context, DeviceId, DevicePtr, Direction, Driver, MemcopyError, MemoryMode, Result, SimTime,
};
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::config::SimConfig;
use crate::engine::SimEngine;
use crate::instrument::DriverTelemetry;
use crate::memory::DeviceMemory;

/// A chunk landing at its destination.
enum Event {
    H2D {
        ptr: DevicePtr,
        offset: usize,
        data: Vec<u8>,
    },
    D2H {
        ptr: DevicePtr,
        offset: usize,
        len: usize,
    },
    D2D {
        dst: DevicePtr,
        src: DevicePtr,
        offset: usize,
        len: usize,
    },
}

struct Gpu {
    memory: DeviceMemory,
    /// When the host link finishes its last queued chunk.
    link_free_at: SimTime,
    /// When device memory finishes its last queued D2D chunk.
    dram_free_at: SimTime,
}

struct SimState {
    engine: SimEngine<Event>,
    gpus: Vec<Gpu>,
    contexts: HashMap<u64, Option<DeviceId>>,
    telemetry: DriverTelemetry,
}

impl SimState {
    fn bound_device(&self, ctx: &Context) -> Result<DeviceId> {
        self.contexts
            .get(&ctx.id())
            .copied()
            .flatten()
            .ok_or(MemcopyError::NoDeviceSelected(ctx.id()))
    }

    /// The GPU that owns `ptr`, which must be the context's device.
    fn gpu_for(&mut self, ctx: &Context, ptr: DevicePtr, direction: Direction) -> Result<&mut Gpu> {
        let device = self.bound_device(ctx)?;
        let owner = DeviceMemory::owner(ptr).ok_or(MemcopyError::InvalidHandle(ptr))?;
        if owner != device {
            return Err(MemcopyError::Transfer {
                direction,
                reason: format!("{ptr} lives on {owner}, context is bound to {device}"),
            });
        }
        self.gpus
            .get_mut(owner.index())
            .ok_or(MemcopyError::InvalidHandle(ptr))
    }

    fn gpu_of(&mut self, ptr: DevicePtr) -> Result<&mut Gpu> {
        DeviceMemory::owner(ptr)
            .and_then(|d| self.gpus.get_mut(d.index()))
            .ok_or(MemcopyError::InvalidHandle(ptr))
    }

    /// Queue `total` bytes as back-to-back chunks on a serial resource.
    ///
    /// Each chunk occupies the resource for `len * cost_per_byte` seconds and
    /// lands `latency` seconds after it leaves. Returns when the resource is
    /// free again.
    fn schedule_chunks(
        &mut self,
        free_at: SimTime,
        total: usize,
        chunk: usize,
        cost_per_byte: f64,
        latency: f64,
        mut make: impl FnMut(usize, usize) -> Event,
    ) -> SimTime {
        debug_assert!(self.engine.is_idle(), "events left over from an earlier copy");
        let now = self.engine.now();
        let mut start = if free_at > now { free_at } else { now };
        let mut offset = 0;
        while offset < total {
            let len = chunk.min(total - offset);
            let done = start.after(len as f64 * cost_per_byte);
            self.engine.schedule(done.after(latency), make(offset, len));
            start = done;
            offset += len;
        }
        trace!(pending = self.engine.pending(), total, "scheduled chunks");
        start
    }

    /// Fire queued events until the engine is idle.
    ///
    /// On error the remaining events are dropped so they cannot leak into the
    /// next call.
    fn drain(&mut self, mut host: Option<&mut [u8]>) -> Result<()> {
        while let Some((at, event)) = self.engine.next_event() {
            self.telemetry.events += 1;
            trace!(at = at.as_secs(), "chunk landed");
            let applied = match event {
                Event::H2D { ptr, offset, data } => self
                    .gpu_of(ptr)
                    .and_then(|gpu| gpu.memory.write(ptr, offset, &data)),
                Event::D2H { ptr, offset, len } => match host.as_deref_mut() {
                    Some(dst) => self
                        .gpu_of(ptr)
                        .and_then(|gpu| gpu.memory.read(ptr, offset, &mut dst[offset..offset + len])),
                    None => Err(MemcopyError::InvalidState("D2H chunk without a host buffer")),
                },
                Event::D2D {
                    dst,
                    src,
                    offset,
                    len,
                } => self
                    .gpu_of(dst)
                    .and_then(|gpu| gpu.memory.copy(dst, src, offset, len)),
            };
            if let Err(e) = applied {
                self.engine.clear();
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Simulated multi-GPU driver with a per-device host link.
pub struct SimDriver {
    config: SimConfig,
    state: Mutex<SimState>,
    next_ctx: AtomicU64,
}

impl SimDriver {
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;
        let gpus = (0..config.num_gpus)
            .map(|i| Gpu {
                memory: DeviceMemory::new(DeviceId(i), config.memory_per_gpu, config.page_size),
                link_free_at: SimTime::ZERO,
                dram_free_at: SimTime::ZERO,
            })
            .collect();
        info!(
            gpus = config.num_gpus,
            memory_per_gpu = config.memory_per_gpu,
            link_bandwidth = config.link_bandwidth,
            "Initialized simulated driver"
        );
        Ok(Self {
            config,
            state: Mutex::new(SimState {
                engine: SimEngine::new(),
                gpus,
                contexts: HashMap::new(),
                telemetry: DriverTelemetry::default(),
            }),
            next_ctx: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Snapshot telemetry for this driver.
    pub fn telemetry(&self) -> DriverTelemetry {
        let state = self.state.lock();
        DriverTelemetry {
            live_allocations: state
                .gpus
                .iter()
                .map(|g| g.memory.live_allocations() as u64)
                .sum(),
            ..state.telemetry
        }
    }

    /// Bytes currently reserved on `device`.
    pub fn used_bytes(&self, device: DeviceId) -> Option<u64> {
        self.state
            .lock()
            .gpus
            .get(device.index())
            .map(|g| g.memory.used())
    }

    fn link_cost(&self) -> f64 {
        1.0 / self.config.link_bandwidth
    }

    fn chunk(&self) -> usize {
        usize::try_from(self.config.chunk_size).unwrap_or(usize::MAX)
    }
}

fn check_range(direction: Direction, ptr: DevicePtr, len: usize, available: usize) -> Result<()> {
    if len > available {
        return Err(MemcopyError::Transfer {
            direction,
            reason: format!("copy of {len} bytes exceeds allocation {ptr} of {available}"),
        });
    }
    Ok(())
}

impl Driver for SimDriver {
    fn init(&self) -> Result<Context> {
        let id = self.next_ctx.fetch_add(1, Ordering::Relaxed);
        self.state.lock().contexts.insert(id, None);
        Ok(Context::new(id))
    }

    fn device_count(&self) -> usize {
        self.config.num_gpus as usize
    }

    fn select_gpu(&self, ctx: &Context, device: DeviceId) -> Result<()> {
        if device.index() >= self.device_count() {
            return Err(MemcopyError::NoSuchDevice(device));
        }
        let mut state = self.state.lock();
        let slot = state
            .contexts
            .get_mut(&ctx.id())
            .ok_or(MemcopyError::InvalidState("unknown context"))?;
        *slot = Some(device);
        Ok(())
    }

    fn allocate_memory(&self, ctx: &Context, size: u64, mode: MemoryMode) -> Result<DevicePtr> {
        let mut state = self.state.lock();
        let device = state.bound_device(ctx)?;
        let gpu = state
            .gpus
            .get_mut(device.index())
            .ok_or(MemcopyError::NoSuchDevice(device))?;
        let ptr = gpu.memory.allocate(size, mode)?;
        state.telemetry.allocations += 1;
        debug!(%device, %ptr, size, %mode, "allocated device memory");
        Ok(ptr)
    }

    fn memcopy_h2d(&self, ctx: &Context, dst: DevicePtr, src: &[u8]) -> Result<()> {
        let direction = Direction::HostToDevice;
        let (chunk, cost, latency) = (self.chunk(), self.link_cost(), self.config.link_latency);
        let mut state = self.state.lock();
        let gpu = state.gpu_for(ctx, dst, direction)?;
        check_range(direction, dst, src.len(), gpu.memory.len_of(dst)?)?;
        let free_at = gpu.link_free_at;

        let link_free_at = state.schedule_chunks(free_at, src.len(), chunk, cost, latency, |offset, len| {
            Event::H2D {
                ptr: dst,
                offset,
                data: src[offset..offset + len].to_vec(),
            }
        });
        state.gpu_for(ctx, dst, direction)?.link_free_at = link_free_at;
        state.drain(None)?;
        state.telemetry.bytes_h2d += src.len() as u64;
        Ok(())
    }

    fn memcopy_d2h(&self, ctx: &Context, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        let direction = Direction::DeviceToHost;
        let (chunk, cost, latency) = (self.chunk(), self.link_cost(), self.config.link_latency);
        let mut state = self.state.lock();
        let gpu = state.gpu_for(ctx, src, direction)?;
        check_range(direction, src, dst.len(), gpu.memory.len_of(src)?)?;
        let free_at = gpu.link_free_at;

        let link_free_at = state.schedule_chunks(free_at, dst.len(), chunk, cost, latency, |offset, len| {
            Event::D2H {
                ptr: src,
                offset,
                len,
            }
        });
        state.gpu_for(ctx, src, direction)?.link_free_at = link_free_at;
        state.drain(Some(&mut *dst))?;
        state.telemetry.bytes_d2h += dst.len() as u64;
        Ok(())
    }

    fn memcopy_d2d(&self, ctx: &Context, dst: DevicePtr, src: DevicePtr, len: u64) -> Result<()> {
        let direction = Direction::DeviceToDevice;
        let len = usize::try_from(len).map_err(|_| MemcopyError::Transfer {
            direction,
            reason: "length overflows host address space".into(),
        })?;
        // Each byte is read and written once.
        let cost = 2.0 / self.config.dram_bandwidth;
        let chunk = self.chunk();
        let mut state = self.state.lock();
        check_range(direction, src, len, state.gpu_for(ctx, src, direction)?.memory.len_of(src)?)?;
        let gpu = state.gpu_for(ctx, dst, direction)?;
        check_range(direction, dst, len, gpu.memory.len_of(dst)?)?;
        let free_at = gpu.dram_free_at;

        let dram_free_at = state.schedule_chunks(free_at, len, chunk, cost, 0.0, |offset, len| {
            Event::D2D {
                dst,
                src,
                offset,
                len,
            }
        });
        state.gpu_for(ctx, dst, direction)?.dram_free_at = dram_free_at;
        state.drain(None)?;
        state.telemetry.bytes_d2d += len as u64;
        Ok(())
    }

    fn free_memory(&self, _ctx: &Context, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state.lock();
        let gpu = state.gpu_of(ptr)?;
        let mode = gpu.memory.mode_of(ptr)?;
        let bytes = gpu.memory.free(ptr)?;
        state.telemetry.frees += 1;
        debug!(%ptr, bytes, %mode, "freed device memory");
        Ok(())
    }

    fn current_time(&self) -> SimTime {
        self.state.lock().engine.now()
    }
}

impl std::fmt::Debug for SimDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDriver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
