//! Host/device memory copy benchmark core.
//!
//! `memcopy-core` provides the foundational types (`DeviceId`, `DevicePtr`,
//! `SimTime`), the driver-agnostic [`Driver`] interface, and the copy
//! benchmarks that run a payload through a driver and verify it comes back
//! byte-for-byte.
//!
//! # Drivers
//!
//! - [`HostDriver`]: in-memory reference driver, real byte copies, no timing
//!   model. Used as the correctness oracle in tests.
//! - `memcopy-sim`: discrete-event simulated GPU driver with a link model.

pub mod benchmark;
pub mod device_copy;
pub mod driver;
pub mod host_driver;
pub mod payload;
pub mod runner;
pub mod types;
pub mod verify;

pub use benchmark::{
    CopyBenchmark, MemcopyBenchmark, RoundTrip, Stage, Transfer, TransferTiming, WARMUP_BYTES,
    warmup,
};
pub use device_copy::{DeviceCopy, DeviceCopyBenchmark};
pub use driver::{Context, DefaultDriver, Driver, default_driver};
pub use host_driver::{CallCounts, Fault, HostDriver};
pub use payload::{ByteSource, SeededSource, ThreadRngSource};
pub use runner::{Benchmark, Runner, RunnerConfig};
pub use types::{DeviceId, DevicePtr, Direction, MemoryMode, SimTime};
pub use verify::verify_bytes;

pub type Result<T> = std::result::Result<T, MemcopyError>;

#[derive(thiserror::Error, Debug)]
pub enum MemcopyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Benchmark not configured: {0} must be set before run")]
    NotConfigured(&'static str),

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("No such device: {0}")]
    NoSuchDevice(DeviceId),

    #[error("No device selected on context {0}")]
    NoDeviceSelected(u64),

    #[error("Out of device memory on {device}: requested {requested} bytes, {available} available")]
    OutOfMemory {
        device: DeviceId,
        requested: u64,
        available: u64,
    },

    #[error("Out of host memory: cannot stage a {requested}-byte payload")]
    HostOutOfMemory { requested: u64 },

    #[error("Invalid device memory handle: {0}")]
    InvalidHandle(DevicePtr),

    #[error("{direction} transfer failed: {reason}")]
    Transfer { direction: Direction, reason: String },

    #[error("Size mismatch: expected {expected} bytes, got {got}")]
    SizeMismatch { expected: u64, got: u64 },

    #[error("error at {index}, expected {expected:02x}, but get {actual:02x}")]
    Mismatch { index: u64, expected: u8, actual: u8 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
