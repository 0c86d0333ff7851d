//! Constants and default values for chatstack.
//!
//! Defaults mirror the settings the wrapped services ship with, so an empty
//! configuration brings up a working local stack.

use std::time::Duration;

// ============================================================================
// Configuration Defaults
// ============================================================================

/// Bind address shared by every service.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Port of the registry (controller).
pub const DEFAULT_REGISTRY_PORT: u16 = 21001;

/// Port of the inference worker.
pub const DEFAULT_WORKER_PORT: u16 = 21002;

/// Port of the OpenAI-compatible REST gateway.
pub const DEFAULT_API_PORT: u16 = 8000;

/// Port of the web UI gateway.
pub const DEFAULT_WEB_PORT: u16 = 7860;

/// Model loaded by the worker.
pub const DEFAULT_MODEL_PATH: &str = "mistralai/Mistral-7B-Instruct-v0.1";

/// Name the worker registers its model under.
pub const DEFAULT_MODEL_NAME: &str = "yeongjopt-mistral-7b";

/// Maximum concurrent requests per worker.
pub const DEFAULT_WORKER_CONCURRENCY: u32 = 5;

/// Directory holding one log file per service.
pub const DEFAULT_LOG_DIR: &str = "./logs";

/// Interpreter used to run the service modules.
pub const DEFAULT_PYTHON: &str = "python3";

/// Fixed wait after launching the registry.
pub const DEFAULT_REGISTRY_DELAY: Duration = Duration::from_secs(5);

/// Fixed wait after launching the worker; model loading dominates.
pub const DEFAULT_WORKER_DELAY: Duration = Duration::from_secs(30);

/// Upper bound for active readiness probes.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(300);

/// Time services get to exit after `SIGTERM` before they are killed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Settings file picked up from the working directory when no `--config` is given.
pub const DEFAULT_SETTINGS_FILE: &str = "chatstack.yaml";

/// Dotenv file picked up from the working directory when no `--env-file` is given.
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Prefix of environment keys consulted by the resolver.
pub const ENV_PREFIX: &str = "CHATSTACK_";

// ============================================================================
// Service Modules
// ============================================================================

/// Module implementing the registry.
pub const REGISTRY_MODULE: &str = "fastchat.serve.controller";

/// Module implementing the inference worker.
pub const WORKER_MODULE: &str = "fastchat.serve.model_worker";

/// Module implementing the REST gateway.
pub const API_MODULE: &str = "fastchat.serve.openai_api_server";

/// Module implementing the web UI.
pub const WEB_MODULE: &str = "fastchat.serve.gradio_web_server";

/// Every service name a stack can contain. Log files exist only for these.
pub const SERVICE_NAMES: [&str; 4] = ["registry", "worker", "api", "web"];

/// Registry endpoint answering plain GET requests once it is serving.
pub const REGISTRY_PROBE_PATH: &str = "/test_connection";

// ============================================================================
// Process Management Timing
// ============================================================================

/// Interval between readiness checks while a launch is gated.
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connect timeout for a single readiness probe attempt.
pub const PROBE_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// How long to wait for reaping after `SIGKILL` before giving up on a handle.
pub const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Logging and Output Constants
// ============================================================================

/// Number of log lines attached to failure reports.
pub const FAILURE_LOG_EXCERPT_LINES: usize = 20;

/// Default number of lines shown by `chatstack logs`.
pub const DEFAULT_LOG_LINES: usize = 50;

/// Placeholder printed instead of the API key.
pub const REDACTED: &str = "********";

// ============================================================================
// Exit Codes
// ============================================================================

/// Intentional shutdown with every service exiting cleanly.
pub const EXIT_CLEAN: i32 = 0;

/// Requested shutdown that did not drain cleanly, or an internal error.
pub const EXIT_UNCLEAN: i32 = 1;

/// Configuration could not be resolved; nothing was launched.
pub const EXIT_CONFIG_ERROR: i32 = 2;

/// A service failed to launch or never became ready.
pub const EXIT_LAUNCH_FAILURE: i32 = 3;

/// A running service terminated on its own.
pub const EXIT_UNEXPECTED_EXIT: i32 = 4;

/// Base added to the signal number for signal-triggered shutdowns.
pub const EXIT_SIGNAL_BASE: i32 = 128;
