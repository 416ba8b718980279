//! Copy benchmarks end to end on the simulated driver.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use memcopy_core::{
    CopyBenchmark, DeviceCopyBenchmark, DeviceId, Driver, MemcopyError, MemoryMode, Runner,
    RunnerConfig, SeededSource, warmup,
};
use memcopy_sim::{SimConfig, SimDriver, sim_driver};
use proptest::prelude::*;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn copy_bench(driver: &Arc<SimDriver>, size: u64, out: &Captured) -> CopyBenchmark {
    let mut b = CopyBenchmark::new(driver.clone())
        .unwrap()
        .with_byte_source(Box::new(SeededSource::new(99)))
        .with_output(Box::new(out.clone()));
    b.set_byte_size(size);
    b
}

#[test]
fn two_mib_h2d_on_gpu0() {
    let _ = tracing_subscriber::fmt::try_init();
    let driver = sim_driver(SimConfig::default()).unwrap();
    let out = Captured::default();
    let mut b = copy_bench(&driver, 2_097_152, &out);
    b.select_gpu(&[DeviceId(0)]).unwrap();

    let timing = b.run().unwrap();
    b.verify().unwrap();

    // 2 MiB over 16 GB/s plus one link latency.
    let expected = 2_097_152.0 / 16.0e9 + 1.0e-6;
    assert!((timing.h2d - expected).abs() < 1e-12, "h2d {}", timing.h2d);
    assert!(timing.d2h > 0.0);

    let text = out.text();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("engine time for 2097152 byte size H2D: "));
    assert_eq!(lines[1], "Passed!");

    let telemetry = driver.telemetry();
    telemetry.assert_balanced();
    assert_eq!(telemetry.bytes_h2d, 2_097_152);
    assert_eq!(telemetry.bytes_d2h, 2_097_152);
}

#[test]
fn zero_byte_benchmark_passes() {
    let driver = sim_driver(SimConfig::default()).unwrap();
    let out = Captured::default();
    let mut b = copy_bench(&driver, 0, &out);
    b.select_gpu(&[DeviceId(0)]).unwrap();

    let timing = b.run().unwrap();
    assert_eq!(timing.h2d, 0.0);
    b.verify().unwrap();
    assert!(out.text().ends_with("Passed!\n"));
    driver.telemetry().assert_balanced();
}

#[test]
fn clock_is_monotonic_across_runs() {
    let driver = sim_driver(SimConfig::default()).unwrap();
    let mut last = driver.current_time();
    for size in [1u64, 4096, 100_000, 1 << 20] {
        let mut b = copy_bench(&driver, size, &Captured::default());
        b.select_gpu(&[DeviceId(0)]).unwrap();
        let timing = b.run().unwrap();
        assert!(timing.h2d > 0.0);
        let now = driver.current_time();
        assert!(now >= last);
        last = now;
    }
}

#[test]
fn allocation_failure_surfaces_out_of_memory() {
    let driver = sim_driver(SimConfig::default().with_memory_per_gpu(1 << 20)).unwrap();
    let mut b = copy_bench(&driver, 2 << 20, &Captured::default());
    b.select_gpu(&[DeviceId(0)]).unwrap();
    assert!(matches!(b.run(), Err(MemcopyError::OutOfMemory { .. })));
    driver.telemetry().assert_balanced();
}

#[test]
fn unified_memory_is_informational() {
    let driver = sim_driver(SimConfig::default()).unwrap();
    let mut b = copy_bench(&driver, 10_000, &Captured::default());
    b.select_gpu(&[DeviceId(0)]).unwrap();
    b.set_unified_memory();
    assert_eq!(b.memory_mode(), MemoryMode::Unified);
    b.run().unwrap();
    b.verify().unwrap();
    let t = driver.telemetry();
    assert_eq!((t.bytes_h2d, t.bytes_d2h), (10_000, 10_000));
}

#[test]
fn second_gpu_is_selectable() {
    let driver = sim_driver(SimConfig::default().with_num_gpus(2)).unwrap();
    let mut b = copy_bench(&driver, 4096, &Captured::default());
    b.select_gpu(&[DeviceId(1)]).unwrap();
    b.run().unwrap();
    b.verify().unwrap();
    assert_eq!(driver.used_bytes(DeviceId(1)), Some(0));
}

#[test]
fn device_copy_benchmark_round_trip() {
    let driver = sim_driver(SimConfig::default()).unwrap();
    let out = Captured::default();
    let mut b = DeviceCopyBenchmark::new(driver.clone())
        .unwrap()
        .with_output(Box::new(out.clone()));
    b.select_gpu(&[DeviceId(0)]).unwrap();
    b.set_byte_size(1 << 16);

    let timing = b.run().unwrap();
    b.verify().unwrap();
    assert!(timing.d2d.unwrap() > 0.0);
    assert!(out.text().starts_with("engine time for 65536 byte size D2D: "));

    let t = driver.telemetry();
    assert_eq!(t.allocations, 2);
    t.assert_balanced();
}

#[test]
fn runner_drives_sweep() {
    let driver = sim_driver(SimConfig::default()).unwrap();
    let out = Captured::default();
    let mut runner = Runner::new(RunnerConfig::default());
    for size in [1024u64, 2048, 4096] {
        runner.add_benchmark(Box::new(copy_bench(&driver, size, &out)));
    }
    runner.run().unwrap();

    let text = out.text();
    let timing_lines = text.lines().filter(|l| l.starts_with("engine time")).count();
    let passes = text.lines().filter(|l| *l == "Passed!").count();
    assert_eq!((timing_lines, passes), (3, 3));
    driver.telemetry().assert_balanced();
}

#[test]
fn warmup_leaves_no_allocations() {
    let driver = sim_driver(SimConfig::default()).unwrap();
    warmup(driver.clone(), DeviceId(0)).unwrap();
    let t = driver.telemetry();
    t.assert_balanced();
    assert_eq!(t.bytes_h2d, 192);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn sim_round_trip_is_identity(
        size in 0u64..200_000,
        chunk in prop_oneof![Just(512u64), Just(4096), Just(65_536)],
        seed in any::<u64>(),
    ) {
        let driver = sim_driver(SimConfig::default().with_chunk_size(chunk)).unwrap();
        let mut b = CopyBenchmark::new(driver.clone())
            .unwrap()
            .with_byte_source(Box::new(SeededSource::new(seed)))
            .with_output(Box::new(io::sink()));
        b.select_gpu(&[DeviceId(0)]).unwrap();
        b.set_byte_size(size);
        let timing = b.run().unwrap();
        prop_assert!(timing.h2d >= 0.0);
        prop_assert_eq!(b.source(), b.returned());
        prop_assert!(b.verify().is_ok());
        let t = driver.telemetry();
        prop_assert_eq!(t.allocations, t.frees);
        prop_assert_eq!(t.live_allocations, 0);
    }
}
