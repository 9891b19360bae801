use anyhow::{Context, Result};
use clap::Parser;
use gputrace::annotation::AnnotationStack;
use gputrace::cli::{Cli, Command, DiagnoseArgs, OutputFormat, SimulateArgs};
use gputrace::collector::InMemoryCollector;
use gputrace::config::TracerConfig;
use gputrace::driver::records::ActivityKind;
use gputrace::driver::sim::{SimulatedDriver, SimulatedDriverConfig};
use gputrace::driver::{DriverApi, DriverCallArgs, MemoryType};
use gputrace::output::{self, TraceSummary};
use gputrace::tracer::{Tracer, TracerOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const KERNELS: [&str; 4] = ["gemm_f16", "softmax", "layer_norm", "reduce_sum"];

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(args: &SimulateArgs) -> Result<TracerConfig> {
    let mut config = match &args.config {
        Some(path) => TracerConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => TracerConfig::default(),
    };
    if let Some(max) = args.max_callback_events {
        config.collector.max_callback_api_events = max;
    }
    if args.no_activity {
        config.tracer.activities_selected.clear();
    } else if config.tracer.activities_selected.is_empty() {
        config.tracer.activities_selected = vec![
            ActivityKind::ConcurrentKernel,
            ActivityKind::Memcpy,
            ActivityKind::Memcpy2,
            ActivityKind::Memset,
            ActivityKind::Memory,
        ];
    }
    if args.sync_devices {
        config.tracer.sync_devices_before_stop = true;
    }
    Ok(config)
}

/// One worker thread's share of the synthetic workload
fn run_worker(driver: &SimulatedDriver, worker: usize, args: &SimulateArgs, seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let device = u32::try_from(worker).unwrap_or(0) % args.devices.max(1);
    let stream = u32::try_from(worker).unwrap_or(0) + 1;
    let ctx = driver
        .create_context(device)
        .with_context(|| format!("Failed to create context on device {device}"))?;
    let (_, scratch) = driver.mem_alloc(ctx, 1 << 20)?;

    for step in 0..args.launches {
        let _scope = AnnotationStack::scoped(&format!("{}:{step}", args.annotation));
        let bytes = rng.gen_range(256..=64 * 1024u64);

        driver.memcpy(
            ctx,
            DriverApi::MemcpyHtoDAsync,
            DriverCallArgs::Memcpy { byte_count: bytes },
            stream,
        )?;
        let kernel = KERNELS[rng.gen_range(0..KERNELS.len())];
        let grid = [rng.gen_range(1..=256), 1, 1];
        driver.launch_kernel(ctx, kernel, grid, [128, 1, 1], stream)?;

        if rng.gen_bool(0.25) {
            driver.memset(
                ctx,
                DriverApi::MemsetD32Async,
                DriverCallArgs::Memset { count: bytes / 4 },
                stream,
            )?;
        }
        if rng.gen_bool(0.1) {
            driver.memcpy(
                ctx,
                DriverApi::Memcpy2D,
                DriverCallArgs::Memcpy2D {
                    width_in_bytes: 256,
                    height: 64,
                    src_memory_type: MemoryType::Device,
                    dst_memory_type: MemoryType::Device,
                },
                stream,
            )?;
        }
        driver.memcpy(
            ctx,
            DriverApi::MemcpyDtoHAsync,
            DriverCallArgs::Memcpy { byte_count: bytes },
            stream,
        )?;
    }

    driver.mem_free(ctx, scratch)?;
    Ok(())
}

fn simulate(args: &SimulateArgs) -> Result<()> {
    let config = load_config(args)?;
    let driver = Arc::new(SimulatedDriver::new(SimulatedDriverConfig {
        num_devices: args.devices.max(1),
        auto_flush_records: 64,
        ..Default::default()
    }));
    let tracer = Tracer::with_buffer_pool(driver.clone(), config.buffer_pool.clone());
    let collector = Arc::new(InMemoryCollector::new(config.collector.clone()));

    tracer
        .enable(config.tracer.clone(), collector.clone())
        .context("Failed to enable tracer")?;

    let base_seed = args.seed.unwrap_or_else(rand::random);
    tracing::debug!(base_seed, threads = args.threads, "starting workload");
    let workload = std::thread::scope(|scope| -> Result<()> {
        let workers: Vec<_> = (0..args.threads)
            .map(|worker| {
                let driver = driver.as_ref();
                scope.spawn(move || run_worker(driver, worker, args, base_seed.wrapping_add(worker as u64)))
            })
            .collect();
        for worker in workers {
            worker
                .join()
                .map_err(|_| anyhow::anyhow!("workload thread panicked"))??;
        }
        Ok(())
    });

    let disabled = tracer.disable().context("Failed to disable tracer");
    workload?;
    disabled?;

    let events = collector.events();
    let summary = TraceSummary::new(&events, &tracer.stats(), collector.drop_reports());
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match args.format {
        OutputFormat::Text => {
            output::write_text(&events, &mut out)?;
            summary.write_text(&mut out)?;
        }
        OutputFormat::Json => {
            output::write_json_lines(&events, &mut out)?;
            output::write_summary_json(&summary, &mut out)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn diagnose(args: &DiagnoseArgs) -> Result<()> {
    let driver = Arc::new(SimulatedDriver::new(SimulatedDriverConfig {
        num_devices: if args.no_gpu { 0 } else { 1 },
        require_privileges: args.unprivileged,
        ..Default::default()
    }));
    let tracer = Tracer::new(driver);

    if tracer.is_available() {
        // A short empty session surfaces privilege problems
        let probe = tracer.enable(TracerOptions::default(), Arc::new(InMemoryCollector::default()));
        match probe {
            Ok(()) => tracer.disable()?,
            Err(err) => tracing::debug!(error = %err, "probe session failed"),
        }
    }

    if let Some(message) = tracer.error_if_any() {
        anyhow::bail!("{message}");
    }
    println!("ok");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(cli.debug);

    match cli.command {
        Command::Simulate(args) => simulate(&args),
        Command::Diagnose(args) => diagnose(&args),
    }
}
