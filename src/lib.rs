//! Chatstack brings up a three-tier chat serving stack (a model registry, an
//! inference worker and a gateway) as child processes, in dependency order, and
//! supervises them as one unit: if any service dies, or the operator interrupts,
//! everything that was started is stopped in reverse order.

/// CLI interface.
pub mod cli;

/// Configuration resolution.
pub mod config;

/// Defaults, timing and exit codes.
pub mod constants;

/// Error handling.
pub mod error;

/// Process launching.
pub mod launcher;

/// Per-service log files.
pub mod logs;

/// Readiness gating.
pub mod readiness;

/// Service descriptors for each deployment mode.
pub mod services;

/// Signal interception.
pub mod signals;

/// Stack supervision.
pub mod supervisor;
