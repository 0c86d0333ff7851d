//! Command-line interface for chatstack.
use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::{
    config::{
        ConfigResolver, Configuration, Overrides, ReadinessMode, load_environment,
        load_settings, parse_duration,
    },
    constants::DEFAULT_LOG_LINES,
    error::ConfigError,
    services::Mode,
};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };
            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" | "err" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => return Err(format!("invalid log level '{trimmed}'")),
        };
        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for chatstack.
#[derive(Parser)]
#[command(name = "chatstack", version, author)]
#[command(
    about = "Launches and supervises a registry, inference worker and gateway as one stack",
    long_about = None
)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for chatstack.
#[derive(Subcommand)]
pub enum Commands {
    /// Launch the stack in the foreground and supervise it until shutdown.
    Up {
        /// Gateway to deploy in front of the worker.
        #[arg(short, long, default_value_t = Mode::Api)]
        mode: Mode,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Print the resolved launch sequence without starting anything.
    Plan {
        /// Gateway to deploy in front of the worker.
        #[arg(short, long, default_value_t = Mode::Api)]
        mode: Mode,

        /// Emit the plan as JSON.
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Show the tail of a service's log file.
    Logs {
        /// Service name (`registry`, `worker`, `api` or `web`).
        service: String,

        /// Number of lines to show.
        #[arg(short = 'n', long, default_value_t = DEFAULT_LOG_LINES)]
        lines: usize,

        #[command(flatten)]
        config: ConfigArgs,
    },
}

/// Options shared by every command that needs a resolved configuration.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// YAML settings file (defaults to `chatstack.yaml` when present).
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Dotenv file (defaults to `.env` when present).
    #[arg(long, value_name = "PATH")]
    pub env_file: Option<PathBuf>,

    /// Bind address for every service.
    #[arg(long)]
    pub host: Option<String>,

    #[arg(long, value_name = "PORT")]
    pub registry_port: Option<u16>,

    #[arg(long, value_name = "PORT")]
    pub worker_port: Option<u16>,

    #[arg(long, value_name = "PORT")]
    pub api_port: Option<u16>,

    #[arg(long, value_name = "PORT")]
    pub web_port: Option<u16>,

    /// Model loaded by the worker (local path or hub id).
    #[arg(long)]
    pub model_path: Option<String>,

    /// Name the worker registers the model under.
    #[arg(long)]
    pub model_name: Option<String>,

    /// Maximum concurrent requests handled by the worker.
    #[arg(long, value_name = "N")]
    pub worker_concurrency: Option<u32>,

    /// Key required by the REST gateway. Never printed.
    #[arg(long, value_name = "KEY")]
    pub api_key: Option<String>,

    /// Directory for per-service log files.
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Interpreter used to run the service modules.
    #[arg(long, value_name = "PROGRAM")]
    pub python: Option<String>,

    /// Working directory of every service.
    #[arg(long, value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// How to decide that a service is ready: `delay` or `probe`.
    #[arg(long, value_name = "MODE")]
    pub readiness: Option<ReadinessMode>,

    /// Wait after launching the registry (delay readiness).
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub registry_delay: Option<Duration>,

    /// Wait after launching the worker (delay readiness).
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub worker_delay: Option<Duration>,

    /// Upper bound for readiness probes.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub probe_timeout: Option<Duration>,

    /// Time services get to exit before they are killed.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub grace_period: Option<Duration>,
}

impl ConfigArgs {
    /// Explicit overrides carried by the flags.
    pub fn overrides(&self) -> Overrides {
        Overrides {
            host: self.host.clone(),
            registry_port: self.registry_port,
            worker_port: self.worker_port,
            api_port: self.api_port,
            web_port: self.web_port,
            model_path: self.model_path.clone(),
            model_name: self.model_name.clone(),
            worker_concurrency: self.worker_concurrency,
            api_key: self.api_key.clone(),
            log_dir: self.log_dir.clone(),
            python: self.python.clone(),
            working_dir: self.working_dir.clone(),
            readiness: self.readiness,
            registry_delay: self.registry_delay,
            worker_delay: self.worker_delay,
            probe_timeout: self.probe_timeout,
            grace_period: self.grace_period,
        }
    }

    /// Loads the environment and settings file, then resolves the configuration.
    pub fn resolve(&self) -> Result<Configuration, ConfigError> {
        let env = load_environment(self.env_file.as_deref())?;
        let settings = load_settings(self.config.as_deref())?;
        ConfigResolver::new()
            .with_env(env)
            .with_settings(settings)
            .resolve(&self.overrides())
    }
}

/// Parses command-line arguments.
pub fn parse_args() -> Cli {
    Cli::parse()
}
