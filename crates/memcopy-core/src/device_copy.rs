//! Device-to-device copy benchmark.
//!
//! Stages the payload into one allocation, times a D2D copy into a second
//! allocation on the same device, then reads the second one back.

use std::io::Write;

use tracing::debug;

use crate::benchmark::{MemcopyBenchmark, Transfer, TransferTiming};
use crate::driver::{Context, Driver};
use crate::types::DevicePtr;
use crate::{MemcopyError, Result};

/// H2D into the first buffer, timed D2D into the second, D2H from the second.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceCopy;

impl Transfer for DeviceCopy {
    const LABEL: &'static str = "d2d";
    const BUFFERS: usize = 2;

    fn transfer(
        &self,
        driver: &dyn Driver,
        ctx: &Context,
        buffers: &[DevicePtr],
        source: &[u8],
        returned: &mut [u8],
        output: &mut dyn Write,
    ) -> Result<TransferTiming> {
        let &[first, second] = buffers else {
            return Err(MemcopyError::InvalidState("D2D copy needs two device buffers"));
        };
        let size = source.len() as u64;

        let t0 = driver.current_time();
        driver.memcopy_h2d(ctx, first, source)?;
        let t1 = driver.current_time();

        driver.memcopy_d2d(ctx, second, first, size)?;
        let t2 = driver.current_time();
        let d2d = t2 - t1;
        writeln!(output, "engine time for {size} byte size D2D: {d2d:.6}")?;

        driver.memcopy_d2h(ctx, returned, second)?;
        let t3 = driver.current_time();
        debug!(%first, %second, size, d2d, "device copy complete");

        Ok(TransferTiming {
            bytes: size,
            h2d: t1 - t0,
            d2h: t3 - t2,
            d2d: Some(d2d),
        })
    }
}

/// Device-to-device copy reporting the D2D time.
pub type DeviceCopyBenchmark = MemcopyBenchmark<DeviceCopy>;
