//! A synthetic load generator for exercising an APM pipeline.
//!
//! Every second (or exactly once, in job mode), `hello-apm` simulates a web request: a trace made of a cache lookup
//! and a template render, followed by a request counter sent over DogStatsD.

#![deny(warnings)]
#![deny(missing_docs)]

use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use apm_tracer::{trace_channel, AgentExporter, ApmLayer, ExporterConfig, TraceReceiver, TracerSettings};
use clap::Parser as _;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _, util::TryInitError, EnvFilter,
    Layer as _,
};

mod config;
use self::config::Cli;

mod driver;
use self::driver::Driver;

mod ecs;
use self::ecs::ECS_METADATA_URL;

mod metrics;
use self::metrics::statsd_client;

mod workload;
use self::workload::WebRequestWorkload;

const TRACE_QUEUE_CAPACITY: usize = 1024;
const TRACER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let tracer_settings = TracerSettings::new(cli.service.clone())
        .with_env(cli.env().map(str::to_string))
        .with_version(cli.service_version.clone());
    let (trace_sink, trace_receiver) = trace_channel(TRACE_QUEUE_CAPACITY);

    if let Err(e) = initialize_logging(cli.log_level(), ApmLayer::new(tracer_settings, trace_sink)) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run(cli, trace_receiver).await {
        Ok(()) => info!("hello-apm stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli, trace_receiver: TraceReceiver) -> anyhow::Result<()> {
    info!(service = %cli.service, "hello-apm starting...");

    let agent_host = if cli.ecs_host {
        let client = ecs::metadata_client()?;
        ecs::fetch_ecs_host(&client, ECS_METADATA_URL)
            .await
            .context("Failed to get ECS hostname.")?
    } else {
        cli.agent_host.clone()
    };

    let statsd = statsd_client(&cli.statsd_addr, &cli.statsd_tags()).context("Failed to create DogStatsD client.")?;

    let exporter_config = ExporterConfig::new(agent_host, cli.trace_agent_port);
    let tracer = AgentExporter::new(exporter_config, trace_receiver)
        .context("Failed to start tracer.")?
        .spawn();

    let shutdown = CancellationToken::new();
    spawn_signal_handlers(shutdown.clone()).context("Failed to configure signal handlers.")?;

    let driver = Driver::new(cli.run_mode(), WebRequestWorkload::new(Arc::new(statsd)));
    let summary = driver.run(shutdown).await;
    info!(dispatched = summary.dispatched, "Driver stopped.");

    // Requests still in flight are abandoned, but whatever has already been traced gets flushed.
    tracer.shutdown(TRACER_SHUTDOWN_TIMEOUT).await;

    Ok(())
}

fn initialize_logging(default_level: LevelFilter, apm_layer: ApmLayer) -> Result<(), TryInitError> {
    let level_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_ansi(true)
        .with_target(true)
        .with_filter(level_filter);

    tracing_subscriber::registry().with(fmt_layer).with(apm_layer).try_init()
}

/// Logs a message to standard error and exits the process with a non-zero exit code.
fn fatal_and_exit(message: String) {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

#[cfg(unix)]
fn spawn_signal_handlers(shutdown: CancellationToken) -> anyhow::Result<()> {
    use tokio::{
        select,
        signal::unix::{signal, SignalKind},
    };

    let mut sigint_handler = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler.")?;
    let mut sigterm_handler = signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler.")?;

    tokio::spawn(async move {
        select! {
            _ = sigint_handler.recv() => {
                info!("Received SIGINT, shutting down...");
            }
            _ = sigterm_handler.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }

        shutdown.cancel();
    });

    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_handlers(shutdown: CancellationToken) -> anyhow::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down...");
            shutdown.cancel();
        }
    });

    Ok(())
}
