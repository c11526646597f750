//! CLI entry point for lab_daq.
//!
//! ```bash
//! lab_daq run --config config/default.toml --test-mode --duration 30s
//! lab_daq check --config config/lab.toml --show
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lab_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use lab_daq::diagnostics::{init_tracing, FanoutSink, MemorySink, Severity, TracingSink};
use lab_daq::manager::DeviceManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "lab_daq")]
#[command(about = "Polls laboratory instruments and reports their readings", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize all devices and poll until stopped
    Run {
        /// Synthesize readings instead of talking to hardware
        #[arg(long)]
        test_mode: bool,

        /// Stop after this long (e.g. "30s"); runs until Ctrl-C otherwise
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        duration: Option<Duration>,

        /// Interval between reading summaries
        #[arg(
            long,
            default_value = "5s",
            value_parser = humantime_serde::re::humantime::parse_duration
        )]
        report_every: Duration,
    },

    /// Validate the configuration and list the devices
    Check {
        /// Print the effective configuration as TOML
        #[arg(long)]
        show: bool,
    },
}

enum Step {
    Stop,
    Report,
    Continue,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let force_test_mode = matches!(cli.command, Commands::Run { test_mode: true, .. });
    let settings = Settings::load_with(&cli.config, force_test_mode)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| settings.application.log_level.clone());
    init_tracing(&level, cli.json);

    match cli.command {
        Commands::Check { show } => {
            check(&settings);
            if show {
                println!("{}", settings.to_toml().context("rendering configuration")?);
            }
            Ok(())
        }
        Commands::Run {
            duration,
            report_every,
            ..
        } => run(settings, duration, report_every).await,
    }
}

fn check(settings: &Settings) {
    info!(
        name = %settings.application.name,
        devices = settings.devices.len(),
        "configuration valid"
    );
    for device in &settings.devices {
        info!(
            device = %device.name,
            kind = %device.kind,
            enabled = device.enabled,
            interval = ?device.interval,
            channels = device.channels.len(),
            "device"
        );
    }
}

async fn run(settings: Settings, duration: Option<Duration>, report_every: Duration) -> Result<()> {
    let history = MemorySink::new();
    let sink = FanoutSink::new(vec![Arc::new(TracingSink), Arc::new(history.clone())]);
    let mut manager = DeviceManager::new(settings.controller_options(), Arc::new(sink));
    for spec in settings.device_specs() {
        let name = spec.name.clone();
        manager
            .add_device(spec)
            .with_context(|| format!("building device '{name}'"))?;
    }
    if settings.application.test_mode {
        warn!("test mode: readings are synthesized");
    }

    manager.initialize_all();

    let deadline = duration.map(|duration| Instant::now() + duration);
    let mut report = tokio::time::interval(report_every);
    report.tick().await;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let step = tokio::select! {
            _ = &mut ctrl_c => Step::Stop,
            _ = until(deadline) => Step::Stop,
            _ = report.tick() => Step::Report,
            _ = manager.dispatch_next(report_every) => Step::Continue,
        };
        match step {
            Step::Stop => break,
            Step::Report => report_readings(&manager),
            Step::Continue => {}
        }
    }

    report_readings(&manager);
    info!("shutting down");
    manager.close_all();
    info!(
        warnings = history.count(Severity::Warning),
        errors = history.count(Severity::Error),
        "run finished"
    );
    Ok(())
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn report_readings(manager: &DeviceManager) {
    for device in manager.devices().iter().filter(|device| device.enabled()) {
        if !device.initialized() {
            info!(device = device.name(), "not initialized");
            continue;
        }
        for channel in device.initialized_channels() {
            match channel.charge() {
                Some(charge) => info!(
                    device = device.name(),
                    channel = %channel.name,
                    value = channel.value,
                    corrected = channel.background_corrected(),
                    charge,
                    "reading"
                ),
                None => info!(
                    device = device.name(),
                    channel = %channel.name,
                    value = channel.value,
                    corrected = channel.background_corrected(),
                    "reading"
                ),
            }
        }
    }
    info!(dispatched = manager.dispatched(), "updates dispatched");
}
