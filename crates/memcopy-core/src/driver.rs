//! Driver trait and Context — pluggable device runtime for copy benchmarks.
//!
//! A `Driver` owns device memory and a clock. Benchmarks never touch device
//! memory directly: they hold a `Context` issued by the driver and go through
//! the narrow capability set below.

use crate::Result;
use crate::types::{DeviceId, DevicePtr, MemoryMode, SimTime};

/// Execution context handed out by [`Driver::init`].
///
/// Carries no state itself; the driver keys per-context state (such as the
/// selected device) by `id`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Context {
    id: u64,
}

impl Context {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Pluggable device runtime.
///
/// Every copy call is synchronous from the caller's point of view: it returns
/// once the (possibly simulated) transfer has completed. `current_time` reads
/// the driver's clock and must never go backwards.
pub trait Driver: Send + Sync {
    /// Create a fresh execution context.
    fn init(&self) -> Result<Context>;

    /// Number of devices this driver exposes.
    fn device_count(&self) -> usize;

    /// Bind subsequent operations on `ctx` to `device`.
    fn select_gpu(&self, ctx: &Context, device: DeviceId) -> Result<()>;

    /// Reserve `size` bytes on the context's selected device.
    fn allocate_memory(&self, ctx: &Context, size: u64, mode: MemoryMode) -> Result<DevicePtr>;

    /// Copy `src.len()` bytes from host memory into `dst`.
    fn memcopy_h2d(&self, ctx: &Context, dst: DevicePtr, src: &[u8]) -> Result<()>;

    /// Copy `dst.len()` bytes from `src` into host memory.
    fn memcopy_d2h(&self, ctx: &Context, dst: &mut [u8], src: DevicePtr) -> Result<()>;

    /// Copy `len` bytes between two allocations on the same device.
    fn memcopy_d2d(&self, ctx: &Context, dst: DevicePtr, src: DevicePtr, len: u64) -> Result<()>;

    /// Release an allocation. Must be called exactly once per allocation.
    fn free_memory(&self, ctx: &Context, ptr: DevicePtr) -> Result<()>;

    /// Current reading of the driver's clock.
    fn current_time(&self) -> SimTime;
}

/// Which driver the binary uses when none is requested explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultDriver {
    Sim,
    Host,
}

/// Environment variable consulted by [`default_driver`].
pub const DRIVER_ENV: &str = "MEMCOPY_DRIVER";

/// Determine the default driver: `MEMCOPY_DRIVER` env var, then the simulator.
pub fn default_driver() -> DefaultDriver {
    default_driver_from(std::env::var(DRIVER_ENV).ok().as_deref())
}

/// Resolve a driver name (`"sim"` or `"host"`, case-insensitive).
///
/// Unrecognized or missing values fall back to the simulator.
pub fn default_driver_from(value: Option<&str>) -> DefaultDriver {
    match value.map(str::to_lowercase).as_deref() {
        Some("host") => DefaultDriver::Host,
        _ => DefaultDriver::Sim,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_driver_from() {
        assert_eq!(default_driver_from(None), DefaultDriver::Sim);
        assert_eq!(default_driver_from(Some("HOST")), DefaultDriver::Host);
        assert_eq!(default_driver_from(Some("sim")), DefaultDriver::Sim);
        assert_eq!(default_driver_from(Some("metal")), DefaultDriver::Sim);
    }

    #[test]
    fn test_context_id() {
        assert_eq!(Context::new(7).id(), 7);
    }
}
