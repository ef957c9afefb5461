use std::time::Duration;

use clap::{ArgAction, Parser};
use tracing::level_filters::LevelFilter;

use crate::driver::RunMode;

/// Emits a steady stream of fake web request traces and request counters, for exercising an APM pipeline.
#[derive(Debug, Parser)]
#[command(about, version)]
pub struct Cli {
    /// Enable verbose output. (Specify twice for more verbosity.)
    #[arg(short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Service name to set in the tracer.
    #[arg(long = "service", visible_alias = "tracer-service", default_value = "hello-apm")]
    pub service: String,

    /// `<host>:<port>` of the DogStatsD server.
    #[arg(long, default_value = "localhost:8125")]
    pub statsd_addr: String,

    /// Set the trace agent host from the ECS instance metadata.
    ///
    /// The instance's private IPv4 address is fetched from the EC2 metadata service at startup, and takes precedence
    /// over `--agent-host`. Failing to fetch it is fatal.
    #[arg(long)]
    pub ecs_host: bool,

    /// Run as a one-shot job instead of looping forever.
    #[arg(long)]
    pub job: bool,

    /// Amount of time to wait before emitting the job trace (e.g. `500ms`, `1m30s`).
    #[arg(long, value_parser = parse_duration, default_value = "0")]
    pub job_start_delay: Duration,

    /// Amount of time to wait after emitting the job trace, before exiting.
    #[arg(long, value_parser = parse_duration, default_value = "0")]
    pub job_exit_delay: Duration,

    /// Environment name, added as the `env` tag on metrics and traces.
    #[arg(long, env = "DD_ENV")]
    pub env: Option<String>,

    /// Service version, added as the `version` tag on traces.
    #[arg(long, env = "DD_VERSION")]
    pub service_version: Option<String>,

    /// Host of the trace agent.
    #[arg(long, env = "DD_AGENT_HOST", default_value = "localhost")]
    pub agent_host: String,

    /// Port of the trace agent.
    #[arg(long, env = "DD_TRACE_AGENT_PORT", default_value_t = 8126)]
    pub trace_agent_port: u16,
}

impl Cli {
    /// Gets the configured log level based on the user-supplied verbosity level.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    /// Gets the run mode: one-shot job, or looping forever.
    pub fn run_mode(&self) -> RunMode {
        if self.job {
            RunMode::Job {
                start_delay: self.job_start_delay,
                exit_delay: self.job_exit_delay,
            }
        } else {
            RunMode::Loop
        }
    }

    /// Gets the environment name, if one was set and is non-empty.
    pub fn env(&self) -> Option<&str> {
        self.env.as_deref().filter(|env| !env.is_empty())
    }

    /// Gets the constant tags to attach to every metric.
    pub fn statsd_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![("service", self.service.clone())];
        if let Some(env) = self.env() {
            tags.push(("env", env.to_string()));
        }
        tags
    }
}

/// Parses a duration written like `300ms`, `1.5s`, or `1h15m`.
///
/// A duration is a sequence of decimal numbers, each with a unit suffix. Valid units are `ns`, `us` (or `µs`), `ms`,
/// `s`, `m`, and `h`. The special value `0` requires no unit.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos = 0.0;
    let mut chars = s.chars().peekable();

    while chars.peek().is_some() {
        let mut number = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_digit() || *c == '.') {
            number.push(c);
        }
        if number.is_empty() {
            return Err(format!("invalid duration '{}': expected a number", s));
        }
        let value = number
            .parse::<f64>()
            .map_err(|_| format!("invalid duration '{}': invalid number '{}'", s, number))?;

        let mut unit = String::new();
        while let Some(c) = chars.next_if(|c| c.is_alphabetic()) {
            unit.push(c);
        }

        let unit_nanos = match unit.as_str() {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("invalid duration '{}': missing unit after '{}'", s, number)),
            _ => return Err(format!("invalid duration '{}': unknown unit '{}'", s, unit)),
        };

        total_nanos += value * unit_nanos;
    }

    let total_nanos = total_nanos.round();
    if !total_nanos.is_finite() || total_nanos >= u64::MAX as f64 {
        return Err(format!("invalid duration '{}': overflow", s));
    }

    Ok(Duration::from_nanos(total_nanos as u64))
}
