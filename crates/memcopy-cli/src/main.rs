use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use memcopy_core::driver::{DefaultDriver, default_driver};
use memcopy_core::{
    Benchmark, DeviceCopy, DeviceId, Driver, HostDriver, MemcopyBenchmark, MemcopyError,
    RoundTrip, Runner, RunnerConfig, SeededSource, Transfer, warmup,
};
use memcopy_sim::{SimConfig, SimDriver};
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "memcopy")]
#[command(about = "Host/device memory copy benchmarks on a simulated GPU", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Host-to-device then device-to-host round trip, timing the H2D copy.
    H2d(BenchArgs),
    /// Device-to-device copy between two allocations, timing the D2D copy.
    D2d(BenchArgs),
    /// Print the effective simulator configuration as JSON.
    Config(DriverArgs),
}

#[derive(Args, Debug)]
struct BenchArgs {
    /// Payload size in bytes.
    #[arg(long, default_value_t = 2 * 1024 * 1024)]
    bytes: u64,

    /// Target GPU ids, comma separated. Copy benchmarks accept exactly one.
    #[arg(long, value_delimiter = ',', default_value = "0")]
    gpus: Vec<DeviceId>,

    /// Allocate device memory in unified mode.
    #[arg(long)]
    unified_memory: bool,

    /// Verify the round-tripped bytes after each run.
    #[arg(long)]
    verify: bool,

    /// Run one benchmark per size, doubling from --bytes up to this size.
    #[arg(long)]
    sweep_max: Option<u64>,

    /// Do an untimed 192-byte round trip before measuring.
    #[arg(long)]
    warmup: bool,

    /// Seed the payload generator for reproducible payloads.
    #[arg(long)]
    seed: Option<u64>,

    #[command(flatten)]
    driver: DriverArgs,
}

#[derive(Args, Debug)]
struct DriverArgs {
    /// Driver to run against. Defaults to $MEMCOPY_DRIVER, then `sim`.
    #[arg(long, value_enum)]
    driver: Option<DriverKind>,

    /// JSON file overriding simulator parameters.
    #[arg(long)]
    sim_config: Option<PathBuf>,

    /// Number of simulated devices (overrides the config file).
    #[arg(long)]
    num_gpus: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DriverKind {
    Sim,
    Host,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    H2d,
    D2d,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Bench(#[from] MemcopyError),
    #[error("invalid sweep: {0}")]
    Sweep(String),
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.cmd {
        Cmd::H2d(args) => bench(Kind::H2d, args),
        Cmd::D2d(args) => bench(Kind::D2d, args),
        Cmd::Config(args) => print_config(&args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "benchmark failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn sim_config(args: &DriverArgs) -> Result<SimConfig, CliError> {
    let mut config = match &args.sim_config {
        Some(path) => SimConfig::from_json_file(path)?,
        None => SimConfig::default(),
    };
    if let Some(n) = args.num_gpus {
        config = config.with_num_gpus(n);
    }
    config.validate()?;
    Ok(config)
}

fn build_driver(args: &DriverArgs) -> Result<Arc<dyn Driver>, CliError> {
    let kind = args.driver.unwrap_or(match default_driver() {
        DefaultDriver::Sim => DriverKind::Sim,
        DefaultDriver::Host => DriverKind::Host,
    });
    let config = sim_config(args)?;
    info!(driver = ?kind, gpus = config.num_gpus, "Selected driver");
    Ok(match kind {
        DriverKind::Sim => Arc::new(SimDriver::new(config)?),
        DriverKind::Host => Arc::new(HostDriver::new(config.num_gpus)),
    })
}

/// Payload sizes for one invocation: `start`, doubled until it passes `max`.
fn sweep_sizes(start: u64, max: Option<u64>) -> Result<Vec<u64>, CliError> {
    let Some(max) = max else {
        return Ok(vec![start]);
    };
    if start == 0 {
        return Err(CliError::Sweep("starting size must be positive".into()));
    }
    if max < start {
        return Err(CliError::Sweep(format!(
            "max {max} is smaller than starting size {start}"
        )));
    }
    let mut sizes = Vec::new();
    let mut size = Some(start);
    while let Some(s) = size.filter(|&s| s <= max) {
        sizes.push(s);
        size = s.checked_mul(2);
    }
    Ok(sizes)
}

fn make_benchmark<T: Transfer + Default + 'static>(
    driver: &Arc<dyn Driver>,
    size: u64,
    seed: Option<u64>,
) -> Result<Box<dyn Benchmark>, CliError> {
    let mut b = MemcopyBenchmark::<T>::new(Arc::clone(driver))?;
    if let Some(seed) = seed {
        b = b.with_byte_source(Box::new(SeededSource::new(seed)));
    }
    b.set_byte_size(size);
    Ok(Box::new(b))
}

fn bench(kind: Kind, args: BenchArgs) -> Result<(), CliError> {
    let sizes = sweep_sizes(args.bytes, args.sweep_max)?;
    let driver = build_driver(&args.driver)?;
    let config = RunnerConfig {
        gpus: args.gpus,
        unified_memory: args.unified_memory,
        verify: args.verify,
    };

    if args.warmup {
        if let [device] = config.gpus[..] {
            warmup(Arc::clone(&driver), device)?;
        } else {
            return Err(MemcopyError::Config(format!(
                "memory copy benchmark only supports a single GPU, got {}",
                config.gpus.len()
            ))
            .into());
        }
    }

    let mut runner = Runner::new(config);
    for (i, &size) in sizes.iter().enumerate() {
        let seed = args.seed.map(|s| s.wrapping_add(i as u64));
        runner.add_benchmark(match kind {
            Kind::H2d => make_benchmark::<RoundTrip>(&driver, size, seed)?,
            Kind::D2d => make_benchmark::<DeviceCopy>(&driver, size, seed)?,
        });
    }
    runner.run()?;
    Ok(())
}

fn print_config(args: &DriverArgs) -> Result<(), CliError> {
    println!("{}", sim_config(args)?.to_json()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_single_size() {
        assert_eq!(sweep_sizes(0, None).unwrap(), vec![0]);
        assert_eq!(sweep_sizes(48, None).unwrap(), vec![48]);
    }

    #[test]
    fn test_sweep_doubles_to_max() {
        assert_eq!(
            sweep_sizes(1024, Some(8192)).unwrap(),
            vec![1024, 2048, 4096, 8192]
        );
        assert_eq!(sweep_sizes(1000, Some(3000)).unwrap(), vec![1000, 2000]);
    }

    #[test]
    fn test_sweep_rejects_bad_ranges() {
        assert!(sweep_sizes(0, Some(10)).is_err());
        assert!(sweep_sizes(10, Some(5)).is_err());
    }

    #[test]
    fn test_sweep_stops_before_overflow() {
        let sizes = sweep_sizes(u64::MAX / 2 + 1, Some(u64::MAX)).unwrap();
        assert_eq!(sizes, vec![u64::MAX / 2 + 1]);
    }

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::try_parse_from(["memcopy", "h2d"]).unwrap();
        let Cmd::H2d(args) = cli.cmd else {
            panic!("expected h2d");
        };
        assert_eq!(args.bytes, 2_097_152);
        assert_eq!(args.gpus, vec![DeviceId(0)]);
        assert!(!args.unified_memory);
        assert!(!args.verify);
    }

    #[test]
    fn test_parse_gpu_list() {
        let cli = Cli::try_parse_from([
            "memcopy",
            "d2d",
            "--gpus",
            "0,1",
            "--driver",
            "host",
            "--verify",
        ])
        .unwrap();
        let Cmd::D2d(args) = cli.cmd else {
            panic!("expected d2d");
        };
        assert_eq!(args.gpus, vec![DeviceId(0), DeviceId(1)]);
        assert_eq!(args.driver.driver, Some(DriverKind::Host));
        assert!(args.verify);
    }

    #[test]
    fn test_multi_gpu_rejected_before_work() {
        let cli = Cli::try_parse_from([
            "memcopy", "h2d", "--gpus", "0,1", "--driver", "host", "--num-gpus", "2", "--bytes",
            "64",
        ])
        .unwrap();
        let Cmd::H2d(args) = cli.cmd else {
            panic!("expected h2d");
        };
        let err = bench(Kind::H2d, args).unwrap_err();
        assert!(matches!(err, CliError::Bench(MemcopyError::Config(_))));
    }

    #[test]
    fn test_host_sweep_runs() {
        let cli = Cli::try_parse_from([
            "memcopy",
            "h2d",
            "--driver",
            "host",
            "--bytes",
            "16",
            "--sweep-max",
            "64",
            "--verify",
            "--warmup",
            "--seed",
            "5",
        ])
        .unwrap();
        let Cmd::H2d(args) = cli.cmd else {
            panic!("expected h2d");
        };
        bench(Kind::H2d, args).unwrap();
    }
}
