//! Configuration management for chatstack.
//!
//! A run is configured from four layers, highest precedence first: explicit
//! command-line overrides, `CHATSTACK_*` environment variables (optionally seeded
//! from a dotenv file), a YAML settings file, and built-in defaults. Resolution is
//! a pure function of those inputs; only the `load_*` helpers touch the filesystem.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    env,
    ffi::OsString,
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::debug;

use crate::{
    constants::{
        DEFAULT_API_PORT, DEFAULT_ENV_FILE, DEFAULT_GRACE_PERIOD, DEFAULT_HOST,
        DEFAULT_LOG_DIR, DEFAULT_MODEL_NAME, DEFAULT_MODEL_PATH, DEFAULT_PROBE_TIMEOUT,
        DEFAULT_PYTHON, DEFAULT_REGISTRY_DELAY, DEFAULT_REGISTRY_PORT,
        DEFAULT_SETTINGS_FILE, DEFAULT_WEB_PORT, DEFAULT_WORKER_CONCURRENCY,
        DEFAULT_WORKER_DELAY, DEFAULT_WORKER_PORT, ENV_PREFIX, REDACTED,
    },
    error::ConfigError,
};

/// How the orchestrator decides a freshly launched service can take dependents.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr, Display, Serialize,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessMode {
    /// Wait a fixed, per-service delay.
    #[default]
    Delay,
    /// Poll the service's address until it answers or the probe times out.
    Probe,
}

/// Fully resolved settings for one run. Built once, never mutated afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct Configuration {
    /// Address every service binds to.
    pub host: String,
    /// Registry (controller) port.
    pub registry_port: u16,
    /// Inference worker port.
    pub worker_port: u16,
    /// REST gateway port.
    pub api_port: u16,
    /// Web UI port.
    pub web_port: u16,
    /// Model loaded by the worker.
    pub model_path: String,
    /// Name the model is registered under.
    pub model_name: String,
    /// Concurrent request limit of the worker.
    pub worker_concurrency: u32,
    /// Bearer token required by the REST gateway, if any.
    pub api_key: Option<String>,
    /// Directory receiving one log file per service.
    pub log_dir: PathBuf,
    /// Interpreter used to run service modules.
    pub python: String,
    /// Working directory of every child process.
    pub working_dir: PathBuf,
    /// Readiness strategy between launches.
    pub readiness: ReadinessMode,
    /// Fixed wait after the registry starts.
    pub registry_delay: Duration,
    /// Fixed wait after the worker starts.
    pub worker_delay: Duration,
    /// Upper bound for a readiness probe.
    pub probe_timeout: Duration,
    /// Time between `SIGTERM` and `SIGKILL` while draining.
    pub grace_period: Duration,
}

impl Configuration {
    /// Host other services should use to reach this one. Wildcard bind addresses
    /// are not connectable, so they are advertised as `localhost`.
    pub fn connect_host(&self) -> &str {
        match self.host.trim() {
            "" | "0.0.0.0" | "::" | "[::]" => "localhost",
            host => host,
        }
    }

    /// `host:port` pair for `port` on the connect host. IPv6 literals are
    /// bracketed so the result is usable as a socket address and URL authority.
    pub fn connect_address(&self, port: u16) -> String {
        let host = self.connect_host();
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        }
    }

    /// Base URL of the registry.
    pub fn registry_url(&self) -> String {
        format!("http://{}", self.connect_address(self.registry_port))
    }

    /// Base URL the worker advertises to the registry.
    pub fn worker_url(&self) -> String {
        format!("http://{}", self.connect_address(self.worker_port))
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            registry_port: DEFAULT_REGISTRY_PORT,
            worker_port: DEFAULT_WORKER_PORT,
            api_port: DEFAULT_API_PORT,
            web_port: DEFAULT_WEB_PORT,
            model_path: DEFAULT_MODEL_PATH.to_string(),
            model_name: DEFAULT_MODEL_NAME.to_string(),
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            api_key: None,
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            python: DEFAULT_PYTHON.to_string(),
            working_dir: PathBuf::from("."),
            readiness: ReadinessMode::Delay,
            registry_delay: DEFAULT_REGISTRY_DELAY,
            worker_delay: DEFAULT_WORKER_DELAY,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("host", &self.host)
            .field("registry_port", &self.registry_port)
            .field("worker_port", &self.worker_port)
            .field("api_port", &self.api_port)
            .field("web_port", &self.web_port)
            .field("model_path", &self.model_path)
            .field("model_name", &self.model_name)
            .field("worker_concurrency", &self.worker_concurrency)
            .field("api_key", &self.api_key.as_ref().map(|_| REDACTED))
            .field("log_dir", &self.log_dir)
            .field("python", &self.python)
            .field("working_dir", &self.working_dir)
            .field("readiness", &self.readiness)
            .field("registry_delay", &self.registry_delay)
            .field("worker_delay", &self.worker_delay)
            .field("probe_timeout", &self.probe_timeout)
            .field("grace_period", &self.grace_period)
            .finish()
    }
}

/// Values supplied explicitly by the caller (usually the command line).
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub registry_port: Option<u16>,
    pub worker_port: Option<u16>,
    pub api_port: Option<u16>,
    pub web_port: Option<u16>,
    pub model_path: Option<String>,
    pub model_name: Option<String>,
    pub worker_concurrency: Option<u32>,
    pub api_key: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub python: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub readiness: Option<ReadinessMode>,
    pub registry_delay: Option<Duration>,
    pub worker_delay: Option<Duration>,
    pub probe_timeout: Option<Duration>,
    pub grace_period: Option<Duration>,
}

/// Structure of the YAML settings file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub host: Option<String>,
    pub registry_port: Option<u16>,
    pub worker_port: Option<u16>,
    pub api_port: Option<u16>,
    pub web_port: Option<u16>,
    pub model_path: Option<String>,
    pub model_name: Option<String>,
    pub worker_concurrency: Option<u32>,
    pub api_key: Option<String>,
    pub log_dir: Option<String>,
    pub python: Option<String>,
    pub working_dir: Option<String>,
    pub readiness: Option<String>,
    pub registry_delay: Option<String>,
    pub worker_delay: Option<String>,
    pub probe_timeout: Option<String>,
    pub grace_period: Option<String>,
}

impl Settings {
    /// Parses settings from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Expands `${VAR}` and `$VAR` references in every string value.
    fn expand(&self, vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
            .map_err(|err| ConfigError::invalid("settings", "", err.to_string()))?;
        let expand = |value: &Option<String>| -> Result<Option<String>, ConfigError> {
            let Some(input) = value else {
                return Ok(None);
            };
            for caps in re.captures_iter(input) {
                if !vars.contains_key(&caps[1]) {
                    return Err(ConfigError::MissingVariable(caps[1].to_string()));
                }
            }
            let expanded = re.replace_all(input, |caps: &regex::Captures| {
                vars.get(&caps[1]).cloned().unwrap_or_default()
            });
            Ok(Some(expanded.into_owned()))
        };

        Ok(Self {
            host: expand(&self.host)?,
            registry_port: self.registry_port,
            worker_port: self.worker_port,
            api_port: self.api_port,
            web_port: self.web_port,
            model_path: expand(&self.model_path)?,
            model_name: expand(&self.model_name)?,
            worker_concurrency: self.worker_concurrency,
            api_key: expand(&self.api_key)?,
            log_dir: expand(&self.log_dir)?,
            python: expand(&self.python)?,
            working_dir: expand(&self.working_dir)?,
            readiness: expand(&self.readiness)?,
            registry_delay: expand(&self.registry_delay)?,
            worker_delay: expand(&self.worker_delay)?,
            probe_timeout: expand(&self.probe_timeout)?,
            grace_period: expand(&self.grace_period)?,
        })
    }
}

/// Produces a [`Configuration`] from overrides, an environment snapshot and settings.
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    env: HashMap<String, String>,
    settings: Settings,
}

impl ConfigResolver {
    /// Resolver with no environment and no settings file; only defaults apply.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the given environment snapshot (full variable names).
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = vars
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self
    }

    /// Uses the given settings file contents.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Resolves every field, applying precedence and validation.
    pub fn resolve(&self, overrides: &Overrides) -> Result<Configuration, ConfigError> {
        let file = self.settings.expand(&self.env)?;

        let file_readiness = parse_file(&file.readiness, "readiness", parse_readiness)?;
        let file_registry_delay =
            parse_file(&file.registry_delay, "registry_delay", parse_duration)?;
        let file_worker_delay =
            parse_file(&file.worker_delay, "worker_delay", parse_duration)?;
        let file_probe_timeout =
            parse_file(&file.probe_timeout, "probe_timeout", parse_duration)?;
        let file_grace_period =
            parse_file(&file.grace_period, "grace_period", parse_duration)?;

        let config = Configuration {
            host: self
                .layered(overrides.host.clone(), "HOST", parse_string, file.host)?
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            registry_port: self
                .layered(
                    overrides.registry_port,
                    "CONTROLLER_PORT",
                    parse_port,
                    file.registry_port,
                )?
                .unwrap_or(DEFAULT_REGISTRY_PORT),
            worker_port: self
                .layered(
                    overrides.worker_port,
                    "MODEL_WORKER_PORT",
                    parse_port,
                    file.worker_port,
                )?
                .unwrap_or(DEFAULT_WORKER_PORT),
            api_port: self
                .layered(overrides.api_port, "API_PORT", parse_port, file.api_port)?
                .unwrap_or(DEFAULT_API_PORT),
            web_port: self
                .layered(overrides.web_port, "GRADIO_PORT", parse_port, file.web_port)?
                .unwrap_or(DEFAULT_WEB_PORT),
            model_path: self
                .layered(
                    overrides.model_path.clone(),
                    "DEFAULT_MODEL_PATH",
                    parse_string,
                    file.model_path,
                )?
                .unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string()),
            model_name: self
                .layered(
                    overrides.model_name.clone(),
                    "MODEL_NAME",
                    parse_string,
                    file.model_name,
                )?
                .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
            worker_concurrency: self
                .layered(
                    overrides.worker_concurrency,
                    "WORKER_CONCURRENCY",
                    parse_concurrency,
                    file.worker_concurrency,
                )?
                .unwrap_or(DEFAULT_WORKER_CONCURRENCY),
            api_key: self
                .layered(overrides.api_key.clone(), "API_KEY", parse_string, file.api_key)?
                .filter(|key| !key.trim().is_empty()),
            log_dir: self
                .layered(
                    overrides.log_dir.clone(),
                    "LOG_DIR",
                    parse_path,
                    file.log_dir.map(PathBuf::from),
                )?
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            python: self
                .layered(overrides.python.clone(), "PYTHON", parse_string, file.python)?
                .unwrap_or_else(|| DEFAULT_PYTHON.to_string()),
            working_dir: self
                .layered(
                    overrides.working_dir.clone(),
                    "WORKING_DIR",
                    parse_path,
                    file.working_dir.map(PathBuf::from),
                )?
                .unwrap_or_else(|| PathBuf::from(".")),
            readiness: self
                .layered(overrides.readiness, "READINESS", parse_readiness, file_readiness)?
                .unwrap_or_default(),
            registry_delay: self
                .layered(
                    overrides.registry_delay,
                    "REGISTRY_DELAY",
                    parse_duration,
                    file_registry_delay,
                )?
                .unwrap_or(DEFAULT_REGISTRY_DELAY),
            worker_delay: self
                .layered(
                    overrides.worker_delay,
                    "WORKER_DELAY",
                    parse_duration,
                    file_worker_delay,
                )?
                .unwrap_or(DEFAULT_WORKER_DELAY),
            probe_timeout: self
                .layered(
                    overrides.probe_timeout,
                    "PROBE_TIMEOUT",
                    parse_duration,
                    file_probe_timeout,
                )?
                .unwrap_or(DEFAULT_PROBE_TIMEOUT),
            grace_period: self
                .layered(
                    overrides.grace_period,
                    "GRACE_PERIOD",
                    parse_duration,
                    file_grace_period,
                )?
                .unwrap_or(DEFAULT_GRACE_PERIOD),
        };

        validate(&config)?;
        Ok(config)
    }

    /// Picks the caller override, else the environment, else the settings value.
    fn layered<T>(
        &self,
        explicit: Option<T>,
        key: &str,
        parse: fn(&str) -> Result<T, String>,
        file: Option<T>,
    ) -> Result<Option<T>, ConfigError> {
        if explicit.is_some() {
            return Ok(explicit);
        }

        let env_key = format!("{ENV_PREFIX}{key}");
        if let Some(raw) = self.env.get(&env_key)
            && !raw.trim().is_empty()
        {
            return parse(raw.trim())
                .map(Some)
                .map_err(|reason| ConfigError::invalid(env_key, raw.as_str(), reason));
        }

        Ok(file)
    }
}

fn parse_file<T>(
    value: &Option<String>,
    key: &str,
    parse: fn(&str) -> Result<T, String>,
) -> Result<Option<T>, ConfigError> {
    value
        .as_deref()
        .map(|raw| parse(raw).map_err(|reason| ConfigError::invalid(key, raw, reason)))
        .transpose()
}

fn validate(config: &Configuration) -> Result<(), ConfigError> {
    let required = [
        ("host", &config.host),
        ("model_path", &config.model_path),
        ("model_name", &config.model_name),
        ("python", &config.python),
    ];
    for (key, value) in required {
        if value.trim().is_empty() {
            return Err(ConfigError::invalid(key, value.as_str(), "must not be empty"));
        }
    }

    let ports = [
        ("registry_port", config.registry_port),
        ("worker_port", config.worker_port),
        ("api_port", config.api_port),
        ("web_port", config.web_port),
    ];
    for (index, (first, port)) in ports.iter().enumerate() {
        if *port == 0 {
            return Err(ConfigError::invalid(*first, "0", "port must be non-zero"));
        }
        if let Some((second, _)) = ports[index + 1..].iter().find(|(_, other)| other == port)
        {
            return Err(ConfigError::DuplicatePort {
                port: *port,
                first: *first,
                second: *second,
            });
        }
    }

    if config.worker_concurrency == 0 {
        return Err(ConfigError::invalid(
            "worker_concurrency",
            "0",
            "must be at least 1",
        ));
    }

    Ok(())
}

fn parse_string(raw: &str) -> Result<String, String> {
    Ok(raw.to_string())
}

fn parse_path(raw: &str) -> Result<PathBuf, String> {
    Ok(PathBuf::from(raw))
}

fn parse_port(raw: &str) -> Result<u16, String> {
    match raw.parse::<u16>() {
        Ok(0) => Err("port must be non-zero".into()),
        Ok(port) => Ok(port),
        Err(_) => Err("expected a port number between 1 and 65535".into()),
    }
}

fn parse_concurrency(raw: &str) -> Result<u32, String> {
    match raw.parse::<u32>() {
        Ok(0) => Err("must be at least 1".into()),
        Ok(limit) => Ok(limit),
        Err(_) => Err("expected a positive integer".into()),
    }
}

fn parse_readiness(raw: &str) -> Result<ReadinessMode, String> {
    raw.trim()
        .parse::<ReadinessMode>()
        .map_err(|_| "expected 'delay' or 'probe'".to_string())
}

/// Parses a user-facing duration in the format `<number>[ms|s|m|h]`; a bare
/// number is taken as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let value = raw.trim();
    if value.is_empty() {
        return Err("duration cannot be empty".into());
    }

    let (amount, millis) = if let Some(stripped) = value.strip_suffix("ms") {
        (stripped, 1)
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped, 1_000)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped, 60_000)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped, 3_600_000)
    } else {
        (value, 1_000)
    };

    let amount: u64 = amount
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration '{raw}'"))?;

    Ok(Duration::from_millis(amount.saturating_mul(millis)))
}

/// Parses dotenv content into key/value pairs.
pub fn parse_env_file(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let mut value = value.trim();

            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }

            if !key.is_empty() {
                vars.insert(key.to_string(), value.to_string());
            }
        }
    }
    vars
}

/// Snapshot of the process environment layered over an optional dotenv file.
///
/// An explicit `env_file` must exist; otherwise `.env` is read when present.
pub fn load_environment(env_file: Option<&Path>) -> Result<HashMap<String, String>, ConfigError> {
    let mut vars = match env_file {
        Some(path) => read_file(path).map(|content| parse_env_file(&content))?,
        None if Path::new(DEFAULT_ENV_FILE).exists() => {
            parse_env_file(&read_file(Path::new(DEFAULT_ENV_FILE))?)
        }
        None => HashMap::new(),
    };
    vars.extend(utf8_vars(env::vars_os()));
    Ok(vars)
}

/// Keeps the entries whose key and value are valid UTF-8; nothing the resolver
/// reads can be spelled any other way.
fn utf8_vars<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => Some((key, value)),
            (key, _) => {
                debug!("Skipping non UTF-8 environment variable {key:?}");
                None
            }
        })
}

/// Loads the YAML settings file.
///
/// An explicit path must exist; otherwise `chatstack.yaml` is read when present.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    match path {
        Some(path) => Settings::from_yaml(&read_file(path)?),
        None if Path::new(DEFAULT_SETTINGS_FILE).exists() => {
            Settings::from_yaml(&read_file(Path::new(DEFAULT_SETTINGS_FILE))?)
        }
        None => Ok(Settings::default()),
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}
