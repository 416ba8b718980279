//! Benchmark runner harness.
//!
//! The runner owns the invocation-wide settings (target devices, unified
//! memory, whether to verify) and drives each registered benchmark through
//! select → run → verify, releasing each benchmark's host buffers before
//! moving on. It stops at the first error.

use tracing::info;

use crate::Result;
use crate::types::DeviceId;

/// Lifecycle every registered benchmark implements.
pub trait Benchmark {
    /// Short label used in logs.
    fn name(&self) -> String;

    fn select_gpu(&mut self, gpus: &[DeviceId]) -> Result<()>;

    fn set_unified_memory(&mut self);

    fn run(&mut self) -> Result<()>;

    fn verify(&mut self) -> Result<()>;

    /// Drop host-side payload buffers once the runner is done with this
    /// benchmark.
    fn release_buffers(&mut self) {}
}

/// Invocation-wide settings applied to every benchmark.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerConfig {
    pub gpus: Vec<DeviceId>,
    pub unified_memory: bool,
    pub verify: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            gpus: vec![DeviceId(0)],
            unified_memory: false,
            verify: true,
        }
    }
}

pub struct Runner {
    config: RunnerConfig,
    benchmarks: Vec<Box<dyn Benchmark>>,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            benchmarks: Vec::new(),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn add_benchmark(&mut self, benchmark: Box<dyn Benchmark>) {
        self.benchmarks.push(benchmark);
    }

    pub fn len(&self) -> usize {
        self.benchmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.benchmarks.is_empty()
    }

    /// Run every benchmark in registration order.
    ///
    /// Device selection for all benchmarks happens before any of them runs,
    /// so a bad device list fails before simulated work starts.
    pub fn run(&mut self) -> Result<()> {
        for b in self.benchmarks.iter_mut() {
            b.select_gpu(&self.config.gpus)?;
            if self.config.unified_memory {
                b.set_unified_memory();
            }
        }

        for b in self.benchmarks.iter_mut() {
            let name = b.name();
            info!(benchmark = %name, "running");
            b.run()?;
            if self.config.verify {
                b.verify()?;
            }
            b.release_buffers();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("benchmarks", &self.benchmarks.len())
            .finish()
    }
}
