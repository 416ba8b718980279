//! Discrete-event simulated GPU driver.
//!
//! `SimDriver` implements [`memcopy_core::Driver`] on top of a small event
//! engine. Every copy is split into fixed-size chunks that are serialized on
//! the device's host link (H2D/D2H) or on its local memory (D2D); each chunk
//! lands as an event, and the bytes move when the event fires. Copy calls
//! drain the queue before returning, so they are synchronous for the caller
//! while the clock advances by the modelled transfer time.

pub mod config;
pub mod driver;
pub mod engine;
pub mod instrument;
pub mod memory;

use std::sync::Arc;

pub use config::SimConfig;
pub use driver::SimDriver;
pub use engine::SimEngine;
pub use instrument::DriverTelemetry;
pub use memory::DeviceMemory;

/// Build a shared simulated driver from `config`.
pub fn sim_driver(config: SimConfig) -> memcopy_core::Result<Arc<SimDriver>> {
    Ok(Arc::new(SimDriver::new(config)?))
}
