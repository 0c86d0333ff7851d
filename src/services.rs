//! Translates a resolved [`Configuration`] into the ordered list of services to launch.
use std::{fmt, path::PathBuf, time::Duration};

use serde::Serialize;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::{
    config::{Configuration, ReadinessMode},
    constants::{
        API_MODULE, REDACTED, REGISTRY_MODULE, REGISTRY_PROBE_PATH, WEB_MODULE,
        WORKER_MODULE,
    },
    logs::log_path,
};

/// Front-end the stack is deployed with.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr, Display, Serialize,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// OpenAI-compatible REST gateway.
    #[default]
    Api,
    /// Interactive web UI.
    Web,
}

/// Role of a service within the stack; determines its default readiness policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ServiceClass {
    Registry,
    Worker,
    Gateway,
}

/// What a readiness probe connects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeTarget {
    /// Plain TCP connect to `host:port`.
    Tcp(String),
    /// HTTP GET expecting a 2xx response.
    Http(String),
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeTarget::Tcp(address) => write!(f, "tcp://{address}"),
            ProbeTarget::Http(url) => write!(f, "{url}"),
        }
    }
}

/// How long to hold back dependents after a service is launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessPolicy {
    /// Dependents may start immediately.
    Immediate,
    /// Wait a fixed amount of time.
    Delay(Duration),
    /// Poll `target` until it answers, failing after `timeout`.
    Probe {
        target: ProbeTarget,
        timeout: Duration,
    },
}

impl fmt::Display for ReadinessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessPolicy::Immediate => write!(f, "immediate"),
            ReadinessPolicy::Delay(delay) => write!(f, "delay {delay:?}"),
            ReadinessPolicy::Probe { target, timeout } => {
                write!(f, "probe {target} (timeout {timeout:?})")
            }
        }
    }
}

/// One service to launch.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct ServiceDescriptor {
    /// Unique name, also used for the log file.
    pub name: String,
    /// Role within the stack.
    pub class: ServiceClass,
    /// Executable to run.
    pub program: String,
    /// Arguments passed to `program`, in order.
    pub args: Vec<String>,
    /// Working directory of the child.
    pub working_dir: PathBuf,
    /// `host:port` the service exposes once ready.
    pub address: String,
    /// Gate applied before dependents launch.
    pub readiness: ReadinessPolicy,
    /// File receiving the combined stdout/stderr stream.
    pub log_path: PathBuf,
}

impl ServiceDescriptor {
    /// Arguments with secret values replaced, safe to log or print.
    pub fn display_args(&self) -> Vec<String> {
        let mut redacted = Vec::with_capacity(self.args.len());
        let mut hide_next = false;
        for arg in &self.args {
            if hide_next {
                redacted.push(REDACTED.to_string());
                hide_next = false;
            } else {
                hide_next = arg == "--api-key";
                redacted.push(arg.clone());
            }
        }
        redacted
    }

    /// Full command line with secrets redacted.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.display_args());
        parts.join(" ")
    }

    /// Copy of the descriptor with secret arguments redacted, for printing.
    pub fn redacted(&self) -> Self {
        Self {
            args: self.display_args(),
            ..self.clone()
        }
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("program", &self.program)
            .field("args", &self.display_args())
            .field("working_dir", &self.working_dir)
            .field("address", &self.address)
            .field("readiness", &self.readiness)
            .field("log_path", &self.log_path)
            .finish()
    }
}

/// Builds the launch sequence for `mode`: registry, worker, then the gateway.
///
/// The output is a deterministic function of its inputs, argument order included.
pub fn build(config: &Configuration, mode: Mode) -> Vec<ServiceDescriptor> {
    vec![registry(config), worker(config), gateway(config, mode)]
}

fn module_args(module: &str, config: &Configuration, port: u16) -> Vec<String> {
    vec![
        "-m".to_string(),
        module.to_string(),
        "--host".to_string(),
        config.host.clone(),
        "--port".to_string(),
        port.to_string(),
    ]
}

fn descriptor(
    config: &Configuration,
    name: &str,
    class: ServiceClass,
    args: Vec<String>,
    port: u16,
    readiness: ReadinessPolicy,
) -> ServiceDescriptor {
    ServiceDescriptor {
        name: name.to_string(),
        class,
        program: config.python.clone(),
        args,
        working_dir: config.working_dir.clone(),
        address: config.connect_address(port),
        readiness,
        log_path: log_path(&config.log_dir, name),
    }
}

fn registry(config: &Configuration) -> ServiceDescriptor {
    let readiness = match config.readiness {
        ReadinessMode::Delay => ReadinessPolicy::Delay(config.registry_delay),
        ReadinessMode::Probe => ReadinessPolicy::Probe {
            target: ProbeTarget::Http(format!(
                "{}{REGISTRY_PROBE_PATH}",
                config.registry_url()
            )),
            timeout: config.probe_timeout,
        },
    };

    descriptor(
        config,
        "registry",
        ServiceClass::Registry,
        module_args(REGISTRY_MODULE, config, config.registry_port),
        config.registry_port,
        readiness,
    )
}

fn worker(config: &Configuration) -> ServiceDescriptor {
    let mut args = module_args(WORKER_MODULE, config, config.worker_port);
    args.extend([
        "--worker-address".to_string(),
        config.worker_url(),
        "--controller-address".to_string(),
        config.registry_url(),
        "--model-path".to_string(),
        config.model_path.clone(),
        "--model-names".to_string(),
        config.model_name.clone(),
        "--limit-worker-concurrency".to_string(),
        config.worker_concurrency.to_string(),
    ]);

    let readiness = match config.readiness {
        ReadinessMode::Delay => ReadinessPolicy::Delay(config.worker_delay),
        ReadinessMode::Probe => ReadinessPolicy::Probe {
            target: ProbeTarget::Tcp(config.connect_address(config.worker_port)),
            timeout: config.probe_timeout,
        },
    };

    descriptor(
        config,
        "worker",
        ServiceClass::Worker,
        args,
        config.worker_port,
        readiness,
    )
}

fn gateway(config: &Configuration, mode: Mode) -> ServiceDescriptor {
    match mode {
        Mode::Api => {
            let mut args = module_args(API_MODULE, config, config.api_port);
            args.extend(["--controller-address".to_string(), config.registry_url()]);
            if let Some(key) = &config.api_key {
                args.extend(["--api-key".to_string(), key.clone()]);
            }
            descriptor(
                config,
                "api",
                ServiceClass::Gateway,
                args,
                config.api_port,
                ReadinessPolicy::Immediate,
            )
        }
        Mode::Web => {
            let mut args = module_args(WEB_MODULE, config, config.web_port);
            args.extend(["--controller-url".to_string(), config.registry_url()]);
            descriptor(
                config,
                "web",
                ServiceClass::Gateway,
                args,
                config.web_port,
                ReadinessPolicy::Immediate,
            )
        }
    }
}

/// Human-readable rendering of a launch sequence, with secrets redacted.
pub struct LaunchPlan<'a>(pub &'a [ServiceDescriptor]);

impl fmt::Display for LaunchPlan<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, service) in self.0.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            writeln!(f, "{}. {} ({})", index + 1, service.name, service.class)?;
            writeln!(f, "   command:   {}", service.command_line())?;
            writeln!(f, "   cwd:       {}", service.working_dir.display())?;
            writeln!(f, "   address:   {}", service.address)?;
            writeln!(f, "   readiness: {}", service.readiness)?;
            writeln!(f, "   log:       {}", service.log_path.display())?;
        }
        Ok(())
    }
}
