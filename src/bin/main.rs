use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chatstack::{
    cli::{Cli, Commands, ConfigArgs, parse_args},
    constants::{EXIT_CLEAN, EXIT_CONFIG_ERROR, EXIT_UNCLEAN},
    error::StackError,
    launcher::CommandLauncher,
    logs::service_log,
    readiness::PolicyGate,
    services::{self, LaunchPlan, Mode},
    signals::SignalHandler,
    supervisor::Supervisor,
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    let code = match run(args.command) {
        Ok(code) => code,
        Err(err @ StackError::Config(_)) => {
            error!("{err}");
            EXIT_CONFIG_ERROR
        }
        Err(err) => {
            error!("{err}");
            EXIT_UNCLEAN
        }
    };

    ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(command: Commands) -> Result<i32, StackError> {
    match command {
        Commands::Up { mode, config } => up(mode, &config),
        Commands::Plan { mode, json, config } => {
            let configuration = config.resolve()?;
            let descriptors = services::build(&configuration, mode);
            if json {
                let redacted: Vec<_> = descriptors.iter().map(|d| d.redacted()).collect();
                println!("{}", serde_json::to_string_pretty(&redacted)?);
            } else {
                print!("{}", LaunchPlan(&descriptors));
            }
            Ok(EXIT_CLEAN)
        }
        Commands::Logs {
            service,
            lines,
            config,
        } => {
            let configuration = config.resolve()?;
            for line in service_log(&configuration.log_dir, &service, lines)? {
                println!("{line}");
            }
            Ok(EXIT_CLEAN)
        }
    }
}

fn up(mode: Mode, config: &ConfigArgs) -> Result<i32, StackError> {
    // Must happen before any thread is spawned so every thread inherits the mask.
    let signals = SignalHandler::block()?;

    let configuration = config.resolve()?;
    info!("Resolved configuration: {configuration:?}");
    let descriptors = services::build(&configuration, mode);

    let gate = PolicyGate::new()?;
    let supervisor = Supervisor::new(CommandLauncher, gate, configuration.grace_period);
    signals.forward_to(supervisor.events());

    info!("Starting {mode} stack with {} services", descriptors.len());
    let report = supervisor.run(&descriptors);
    report.log_summary();
    Ok(report.exit_code())
}
