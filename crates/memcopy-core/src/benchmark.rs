//! Copy benchmarks: shared lifecycle plus the host/device round trip.
//!
//! A [`MemcopyBenchmark`] stages a pseudo-random payload, allocates the
//! device buffers its [`Transfer`] asks for, runs the transfer on the
//! driver's clock, and frees the buffers on every exit path. Device
//! allocations never outlive a single `run` call. [`CopyBenchmark`] is the
//! H2D-then-D2H round trip that reports the simulated H2D time.

use std::io::{self, Write};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::driver::{Context, Driver};
use crate::payload::{ByteSource, ThreadRngSource};
use crate::runner::Benchmark;
use crate::types::{DeviceId, DevicePtr, MemoryMode};
use crate::verify::verify_bytes;
use crate::{MemcopyError, Result};

/// Payload size of the warmup round trip (48 f32 values).
pub const WARMUP_BYTES: u64 = 48 * 4;

/// Lifecycle of a benchmark object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Constructed, possibly configured, no completed run to verify.
    Idle,
    /// The last run completed; buffers are available.
    Ran,
    /// Verification happened (pass or fail). Terminal.
    Verified,
}

/// Simulated durations of one run, in seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransferTiming {
    pub bytes: u64,
    pub h2d: f64,
    pub d2h: f64,
    /// Only set by the device-to-device benchmark.
    pub d2d: Option<f64>,
}

/// The device-side phase of a copy benchmark.
///
/// `transfer` receives `BUFFERS` freshly allocated device buffers, each the
/// size of the payload. It must copy `source` in and fill `returned` from the
/// device. Freeing the buffers is the caller's job.
pub trait Transfer: Send {
    /// Short label used in logs and benchmark names.
    const LABEL: &'static str;

    /// Number of device buffers to allocate.
    const BUFFERS: usize;

    fn transfer(
        &self,
        driver: &dyn Driver,
        ctx: &Context,
        buffers: &[DevicePtr],
        source: &[u8],
        returned: &mut [u8],
        output: &mut dyn Write,
    ) -> Result<TransferTiming>;
}

/// H2D into one buffer, timed, then D2H back out of it.
#[derive(Clone, Copy, Debug, Default)]
pub struct RoundTrip;

impl Transfer for RoundTrip {
    const LABEL: &'static str = "h2d";
    const BUFFERS: usize = 1;

    fn transfer(
        &self,
        driver: &dyn Driver,
        ctx: &Context,
        buffers: &[DevicePtr],
        source: &[u8],
        returned: &mut [u8],
        output: &mut dyn Write,
    ) -> Result<TransferTiming> {
        let &[ptr] = buffers else {
            return Err(MemcopyError::InvalidState("round trip needs one device buffer"));
        };
        let size = source.len() as u64;

        let start = driver.current_time();
        driver.memcopy_h2d(ctx, ptr, source)?;
        let h2d_done = driver.current_time();
        let h2d = h2d_done - start;
        writeln!(output, "engine time for {size} byte size H2D: {h2d:.6}")?;

        driver.memcopy_d2h(ctx, returned, ptr)?;
        let d2h = driver.current_time() - h2d_done;
        debug!(size, h2d, d2h, "round trip complete");

        Ok(TransferTiming {
            bytes: size,
            h2d,
            d2h,
            d2d: None,
        })
    }
}

/// Host/device round trip reporting the H2D time.
pub type CopyBenchmark = MemcopyBenchmark<RoundTrip>;

/// Free every pointer in `ptrs`, then hand back `outcome`.
///
/// All frees are attempted even if some fail. An error in `outcome` takes
/// precedence over a free error, which is then only logged.
pub(crate) fn release<T>(
    driver: &dyn Driver,
    ctx: &Context,
    ptrs: &[DevicePtr],
    outcome: Result<T>,
) -> Result<T> {
    let mut free_err = None;
    for &ptr in ptrs {
        if let Err(e) = driver.free_memory(ctx, ptr) {
            warn!(%ptr, error = %e, "failed to free device memory");
            free_err.get_or_insert(e);
        }
    }
    let value = outcome?;
    match free_err {
        Some(e) => Err(e),
        None => Ok(value),
    }
}

/// Zeroed host buffer of `size` bytes, or `HostOutOfMemory` if the
/// allocation cannot be made.
pub(crate) fn host_buffer(size: u64) -> Result<Vec<u8>> {
    let oom = || MemcopyError::HostOutOfMemory { requested: size };
    let len = usize::try_from(size).map_err(|_| oom())?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| oom())?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Record exactly one device out of `gpus`.
pub(crate) fn single_device(gpus: &[DeviceId]) -> Result<DeviceId> {
    match gpus {
        [one] => Ok(*one),
        [] => Err(MemcopyError::Config(
            "memory copy benchmark needs exactly one GPU, none given".into(),
        )),
        many => Err(MemcopyError::Config(format!(
            "memory copy benchmark only supports a single GPU, got {}",
            many.len()
        ))),
    }
}

/// One payload pushed through one device by a [`Transfer`], then verified.
pub struct MemcopyBenchmark<T> {
    transfer: T,
    driver: Arc<dyn Driver>,
    context: Context,
    device: Option<DeviceId>,
    byte_size: Option<u64>,
    memory_mode: MemoryMode,
    source: Vec<u8>,
    returned: Vec<u8>,
    bytes: Box<dyn ByteSource>,
    output: Box<dyn Write + Send>,
    stage: Stage,
}

impl<T: Transfer + Default> MemcopyBenchmark<T> {
    /// Bind a new benchmark to a fresh context on `driver`.
    pub fn new(driver: Arc<dyn Driver>) -> Result<Self> {
        Self::with_transfer(driver, T::default())
    }
}

impl<T: Transfer> MemcopyBenchmark<T> {
    fn with_transfer(driver: Arc<dyn Driver>, transfer: T) -> Result<Self> {
        let context = driver.init()?;
        Ok(Self {
            transfer,
            driver,
            context,
            device: None,
            byte_size: None,
            memory_mode: MemoryMode::Device,
            source: Vec::new(),
            returned: Vec::new(),
            bytes: Box::new(ThreadRngSource),
            output: Box::new(io::stdout()),
            stage: Stage::Idle,
        })
    }

    /// Replace the payload byte source.
    pub fn with_byte_source(mut self, bytes: Box<dyn ByteSource>) -> Self {
        self.bytes = bytes;
        self
    }

    /// Replace the sink that receives the timing and pass lines.
    pub fn with_output(mut self, output: Box<dyn Write + Send>) -> Self {
        self.output = output;
        self
    }

    /// Select the target device. Exactly one id must be given.
    pub fn select_gpu(&mut self, gpus: &[DeviceId]) -> Result<()> {
        self.device = Some(single_device(gpus)?);
        Ok(())
    }

    /// Request unified-memory allocations. Does not change the copy sequence.
    pub fn set_unified_memory(&mut self) {
        self.memory_mode = MemoryMode::Unified;
    }

    pub fn set_byte_size(&mut self, bytes: u64) {
        self.byte_size = Some(bytes);
    }

    pub fn byte_size(&self) -> Option<u64> {
        self.byte_size
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    pub fn memory_mode(&self) -> MemoryMode {
        self.memory_mode
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Payload generated by the last completed run.
    pub fn source(&self) -> &[u8] {
        &self.source
    }

    /// Bytes read back by the last completed run.
    pub fn returned(&self) -> &[u8] {
        &self.returned
    }

    /// Stage a fresh payload, allocate, transfer, free.
    ///
    /// A failed run discards both host buffers and leaves the benchmark
    /// `Idle`, so a stale or half-filled payload is never verified.
    pub fn run(&mut self) -> Result<TransferTiming> {
        if self.stage == Stage::Verified {
            return Err(MemcopyError::InvalidState(
                "benchmark already verified; construct a new one to run again",
            ));
        }
        let outcome = self.attempt();
        match outcome {
            Ok(_) => self.stage = Stage::Ran,
            Err(_) => {
                self.source = Vec::new();
                self.returned = Vec::new();
                self.stage = Stage::Idle;
            }
        }
        outcome
    }

    fn attempt(&mut self) -> Result<TransferTiming> {
        let device = self.device.ok_or(MemcopyError::NotConfigured("device"))?;
        let size = self
            .byte_size
            .ok_or(MemcopyError::NotConfigured("byte size"))?;

        self.driver.select_gpu(&self.context, device)?;

        self.source = host_buffer(size)?;
        self.bytes.fill(&mut self.source);
        self.returned = host_buffer(size)?;

        let mut buffers = Vec::with_capacity(T::BUFFERS);
        for _ in 0..T::BUFFERS {
            match self
                .driver
                .allocate_memory(&self.context, size, self.memory_mode)
            {
                Ok(ptr) => {
                    debug!(
                        benchmark = T::LABEL,
                        %device,
                        %ptr,
                        size,
                        mode = %self.memory_mode,
                        "allocated payload buffer"
                    );
                    buffers.push(ptr);
                }
                Err(e) => return release(self.driver.as_ref(), &self.context, &buffers, Err(e)),
            }
        }

        let outcome = self.transfer.transfer(
            self.driver.as_ref(),
            &self.context,
            &buffers,
            &self.source,
            &mut self.returned,
            &mut *self.output,
        );
        release(self.driver.as_ref(), &self.context, &buffers, outcome)
    }

    /// Compare the payload with what came back. Terminal either way.
    pub fn verify(&mut self) -> Result<()> {
        match self.stage {
            Stage::Idle => return Err(MemcopyError::InvalidState("verify called before run")),
            Stage::Verified => return Err(MemcopyError::InvalidState("benchmark already verified")),
            Stage::Ran => {}
        }
        self.stage = Stage::Verified;
        verify_bytes(&self.source, &self.returned)?;
        info!(benchmark = T::LABEL, bytes = self.source.len(), "round trip verified");
        writeln!(self.output, "Passed!")?;
        Ok(())
    }

    /// Drop both host buffers. An unverified run has nothing left to
    /// compare afterwards, so the benchmark goes back to `Idle`.
    pub fn release_buffers(&mut self) {
        self.source = Vec::new();
        self.returned = Vec::new();
        if self.stage == Stage::Ran {
            self.stage = Stage::Idle;
        }
    }
}

impl<T: Transfer> std::fmt::Debug for MemcopyBenchmark<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcopyBenchmark")
            .field("transfer", &T::LABEL)
            .field("device", &self.device)
            .field("byte_size", &self.byte_size)
            .field("memory_mode", &self.memory_mode)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

impl<T: Transfer> Benchmark for MemcopyBenchmark<T> {
    fn name(&self) -> String {
        format!("{}/{}", T::LABEL, self.byte_size.unwrap_or(0))
    }

    fn select_gpu(&mut self, gpus: &[DeviceId]) -> Result<()> {
        MemcopyBenchmark::select_gpu(self, gpus)
    }

    fn set_unified_memory(&mut self) {
        MemcopyBenchmark::set_unified_memory(self)
    }

    fn run(&mut self) -> Result<()> {
        MemcopyBenchmark::run(self).map(|_| ())
    }

    fn verify(&mut self) -> Result<()> {
        MemcopyBenchmark::verify(self)
    }

    fn release_buffers(&mut self) {
        MemcopyBenchmark::release_buffers(self)
    }
}

/// Silent, untimed round trip of [`WARMUP_BYTES`] with verification.
pub fn warmup(driver: Arc<dyn Driver>, device: DeviceId) -> Result<()> {
    let mut bench = CopyBenchmark::new(driver)?.with_output(Box::new(io::sink()));
    bench.select_gpu(&[device])?;
    bench.set_byte_size(WARMUP_BYTES);
    bench.run()?;
    bench.verify()?;
    debug!(%device, bytes = WARMUP_BYTES, "warmup complete");
    Ok(())
}
