//! Launch, monitor and drain the service stack.
//!
//! The supervisor walks a fixed state machine:
//!
//! ```text
//! Launching ──all ready──▶ Running ──exit / signal / request──▶ Draining ──▶ Terminated
//!     └────────launch failure / readiness timeout / signal───────────▲
//! ```
//!
//! Every input (child exits, signals, programmatic shutdown requests) arrives on a
//! single event channel consumed by the thread that calls [`Supervisor::run`], so
//! the first shutdown trigger wins and later ones cannot start a second drain.
use std::{
    fmt,
    path::PathBuf,
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    time::{Duration, Instant},
};

use nix::sys::signal::Signal;
use strum_macros::Display;
use tracing::{debug, error, info, warn};

use crate::{
    constants::{
        EXIT_CLEAN, EXIT_LAUNCH_FAILURE, EXIT_SIGNAL_BASE, EXIT_UNCLEAN, EXIT_UNEXPECTED_EXIT,
        FAILURE_LOG_EXCERPT_LINES, KILL_REAP_TIMEOUT,
    },
    launcher::{ExitOutcome, Launcher, ProcessHandle},
    logs::tail_lines,
    readiness::{GateOutcome, ReadinessGate, await_ready},
    services::ServiceDescriptor,
};

/// Input to the supervisor's event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A launched service terminated.
    Exited {
        service: String,
        outcome: ExitOutcome,
    },
    /// The orchestrator received a termination signal.
    Signal(i32),
    /// Shutdown requested through a [`ShutdownTrigger`].
    ShutdownRequested,
}

/// Lifecycle of a supervisor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SupervisorState {
    Launching,
    Running,
    Draining,
    Terminated,
}

/// Why the stack was shut down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    /// A service could not be started, or exited before the stack was up.
    LaunchFailed { service: String, reason: String },
    /// A readiness probe did not succeed within its timeout.
    ReadinessTimeout { service: String },
    /// A service exited while the stack was running.
    UnexpectedExit {
        service: String,
        outcome: ExitOutcome,
    },
    /// The orchestrator received a termination signal.
    Signal(i32),
    /// Shutdown was requested programmatically.
    Requested,
}

impl ShutdownCause {
    /// Service that originated the shutdown, if any.
    pub fn service(&self) -> Option<&str> {
        match self {
            ShutdownCause::LaunchFailed { service, .. }
            | ShutdownCause::ReadinessTimeout { service }
            | ShutdownCause::UnexpectedExit { service, .. } => Some(service),
            ShutdownCause::Signal(_) | ShutdownCause::Requested => None,
        }
    }

    /// Whether the cause is a failure rather than an operator decision.
    pub fn is_failure(&self) -> bool {
        self.service().is_some()
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::LaunchFailed { service, reason } => {
                write!(f, "service '{service}' failed to launch: {reason}")
            }
            ShutdownCause::ReadinessTimeout { service } => {
                write!(f, "service '{service}' did not become ready in time")
            }
            ShutdownCause::UnexpectedExit { service, outcome } => {
                write!(f, "service '{service}' exited unexpectedly ({outcome})")
            }
            ShutdownCause::Signal(signal) => match Signal::try_from(*signal) {
                Ok(name) => write!(f, "received {name}"),
                Err(_) => write!(f, "received signal {signal}"),
            },
            ShutdownCause::Requested => write!(f, "shutdown requested"),
        }
    }
}

/// Handle for requesting a shutdown from outside the supervisor thread.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    events: Sender<Event>,
}

impl ShutdownTrigger {
    /// Asks the supervisor to drain the stack. Repeated requests are ignored.
    pub fn request_shutdown(&self) {
        if self.events.send(Event::ShutdownRequested).is_err() {
            debug!("Shutdown requested after the supervisor finished");
        }
    }
}

/// Final state of one launched service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReport {
    pub name: String,
    pub pid: u32,
    /// `None` when the process could not be confirmed stopped.
    pub outcome: Option<ExitOutcome>,
    /// Whether the service had to be killed after the grace period.
    pub forced: bool,
}

/// Summary of a finished supervisor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub cause: ShutdownCause,
    /// Launched services, in launch order.
    pub services: Vec<ServiceReport>,
    /// Tail of the originating service's log for failure causes.
    pub log_excerpt: Vec<String>,
}

impl RunReport {
    /// True when every launched service stopped within the grace period.
    pub fn drained_cleanly(&self) -> bool {
        self.services.iter().all(|service| {
            !service.forced && service.outcome.as_ref().is_some_and(ExitOutcome::is_clean)
        })
    }

    /// Process exit code reflecting the shutdown cause.
    pub fn exit_code(&self) -> i32 {
        match &self.cause {
            ShutdownCause::Requested if self.drained_cleanly() => EXIT_CLEAN,
            ShutdownCause::Requested => EXIT_UNCLEAN,
            ShutdownCause::LaunchFailed { .. } | ShutdownCause::ReadinessTimeout { .. } => {
                EXIT_LAUNCH_FAILURE
            }
            ShutdownCause::UnexpectedExit { .. } => EXIT_UNEXPECTED_EXIT,
            ShutdownCause::Signal(signal) => EXIT_SIGNAL_BASE + signal,
        }
    }

    /// Writes the outcome of the run to the log.
    pub fn log_summary(&self) {
        for service in &self.services {
            match &service.outcome {
                Some(outcome) if service.forced => warn!(
                    "Service '{}' (PID {}) was killed after the grace period: {outcome}",
                    service.name, service.pid
                ),
                Some(outcome) => info!(
                    "Service '{}' (PID {}) stopped: {outcome}",
                    service.name, service.pid
                ),
                None => error!(
                    "Service '{}' (PID {}) could not be confirmed stopped",
                    service.name, service.pid
                ),
            }
        }

        if self.cause.is_failure() {
            error!("Stack shut down: {}", self.cause);
            if !self.log_excerpt.is_empty() {
                error!("Last log lines:\n{}", self.log_excerpt.join("\n"));
            }
        } else {
            info!("Stack shut down: {}", self.cause);
        }
    }
}

struct Slot {
    handle: ProcessHandle,
    outcome: Option<ExitOutcome>,
    terminate_sent: bool,
    forced: bool,
}

impl Slot {
    fn is_live(&self) -> bool {
        self.outcome.is_none()
    }
}

/// Brings up a list of services in order and tears them down in reverse.
pub struct Supervisor<L: Launcher, G: ReadinessGate> {
    launcher: L,
    gate: G,
    grace_period: Duration,
    state: SupervisorState,
    slots: Vec<Slot>,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
}

impl<L: Launcher, G: ReadinessGate> Supervisor<L, G> {
    pub fn new(launcher: L, gate: G, grace_period: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            launcher,
            gate,
            grace_period,
            state: SupervisorState::Launching,
            slots: Vec::new(),
            events_tx,
            events_rx,
        }
    }

    /// Sender for the supervisor's event channel.
    pub fn events(&self) -> Sender<Event> {
        self.events_tx.clone()
    }

    pub fn trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            events: self.events(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Launches `descriptors` in order, supervises them until a shutdown trigger,
    /// then drains everything that was started.
    pub fn run(mut self, descriptors: &[ServiceDescriptor]) -> RunReport {
        let cause = match self.launch_all(descriptors) {
            Some(cause) => cause,
            None => {
                self.transition(SupervisorState::Running);
                info!("All {} services are up", self.slots.len());
                self.monitor()
            }
        };

        self.drain(&cause);
        self.transition(SupervisorState::Terminated);

        let log_excerpt = self.log_excerpt(&cause, descriptors);
        let services = self
            .slots
            .into_iter()
            .map(|slot| ServiceReport {
                name: slot.handle.name().to_string(),
                pid: slot.handle.pid(),
                outcome: slot.outcome,
                forced: slot.forced,
            })
            .collect();

        RunReport {
            cause,
            services,
            log_excerpt,
        }
    }

    fn transition(&mut self, next: SupervisorState) {
        debug!("Supervisor {} -> {next}", self.state);
        self.state = next;
    }

    fn launch_all(&mut self, descriptors: &[ServiceDescriptor]) -> Option<ShutdownCause> {
        for descriptor in descriptors {
            if let Ok(event) = self.events_rx.try_recv() {
                return Some(self.launch_interrupted(event));
            }

            info!("Starting service '{}'", descriptor.name);
            match self.launcher.launch(descriptor, self.events()) {
                Ok(handle) => self.slots.push(Slot {
                    handle,
                    outcome: None,
                    terminate_sent: false,
                    forced: false,
                }),
                Err(err) => {
                    error!("{err}");
                    return Some(ShutdownCause::LaunchFailed {
                        service: err.service().to_string(),
                        reason: err.to_string(),
                    });
                }
            }

            match await_ready(&self.gate, descriptor, &self.events_rx) {
                GateOutcome::Ready => info!("Service '{}' is ready", descriptor.name),
                GateOutcome::TimedOut => {
                    error!(
                        "Service '{}' did not become ready ({})",
                        descriptor.name, descriptor.readiness
                    );
                    return Some(ShutdownCause::ReadinessTimeout {
                        service: descriptor.name.clone(),
                    });
                }
                GateOutcome::Interrupted(event) => return Some(self.launch_interrupted(event)),
            }
        }
        None
    }

    fn launch_interrupted(&mut self, event: Event) -> ShutdownCause {
        match event {
            Event::Exited { service, outcome } => {
                self.record_exit(&service, outcome.clone());
                error!("Service '{service}' exited during startup ({outcome})");
                ShutdownCause::LaunchFailed {
                    reason: format!("exited during startup ({outcome})"),
                    service,
                }
            }
            Event::Signal(signal) => ShutdownCause::Signal(signal),
            Event::ShutdownRequested => ShutdownCause::Requested,
        }
    }

    fn monitor(&mut self) -> ShutdownCause {
        loop {
            match self.events_rx.recv() {
                Ok(Event::Exited { service, outcome }) => {
                    if !self.record_exit(&service, outcome.clone()) {
                        continue;
                    }
                    error!("Service '{service}' exited unexpectedly ({outcome})");
                    return ShutdownCause::UnexpectedExit { service, outcome };
                }
                Ok(Event::Signal(signal)) => return ShutdownCause::Signal(signal),
                Ok(Event::ShutdownRequested) => return ShutdownCause::Requested,
                // The supervisor owns a sender, so the channel cannot close here.
                Err(_) => return ShutdownCause::Requested,
            }
        }
    }

    /// Stores `outcome` for the live slot named `service`. Returns false for
    /// unknown or already finished services.
    fn record_exit(&mut self, service: &str, outcome: ExitOutcome) -> bool {
        match self
            .slots
            .iter_mut()
            .find(|slot| slot.handle.name() == service && slot.is_live())
        {
            Some(slot) => {
                debug!("Service '{service}' finished: {outcome}");
                slot.outcome = Some(outcome);
                true
            }
            None => {
                debug!("Ignoring exit of untracked service '{service}'");
                false
            }
        }
    }

    fn has_live(&self) -> bool {
        self.slots.iter().any(Slot::is_live)
    }

    fn drain(&mut self, cause: &ShutdownCause) {
        self.transition(SupervisorState::Draining);
        info!("Shutting down stack: {cause}");

        for slot in self.slots.iter_mut().rev() {
            if !slot.is_live() {
                // The leader is gone but processes it forked may still hold the group.
                if let Err(err) = slot.handle.signal_group(Signal::SIGTERM) {
                    warn!("Failed to signal group of '{}': {err}", slot.handle.name());
                }
                continue;
            }
            if slot.terminate_sent {
                continue;
            }
            slot.terminate_sent = true;
            info!(
                "Stopping service '{}' (PID {})",
                slot.handle.name(),
                slot.handle.pid()
            );
            if let Err(err) = slot.handle.terminate() {
                warn!("Failed to terminate '{}': {err}", slot.handle.name());
            }
        }

        let escalate_early = self.collect_exits(self.grace_period, true);
        if self.has_live() {
            if escalate_early {
                warn!("Second termination signal received; killing remaining services");
            }
            for slot in self.slots.iter_mut().rev().filter(|slot| slot.is_live()) {
                warn!(
                    "Service '{}' (PID {}) is still running; sending SIGKILL",
                    slot.handle.name(),
                    slot.handle.pid()
                );
                slot.forced = true;
                if let Err(err) = slot.handle.kill() {
                    warn!("Failed to kill '{}': {err}", slot.handle.name());
                }
            }

            self.collect_exits(KILL_REAP_TIMEOUT, false);
        }

        for slot in self.slots.iter().rev() {
            if let Err(err) = slot.handle.signal_group(Signal::SIGKILL) {
                warn!("Failed to sweep group of '{}': {err}", slot.handle.name());
            }
        }
    }

    /// Records exits until every slot is done or `timeout` elapses. When
    /// `interruptible`, a signal cuts the wait short and `true` is returned.
    fn collect_exits(&mut self, timeout: Duration, interruptible: bool) -> bool {
        let deadline = Instant::now() + timeout;
        while self.has_live() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.events_rx.recv_timeout(remaining) {
                Ok(Event::Exited { service, outcome }) => {
                    self.record_exit(&service, outcome);
                }
                Ok(Event::Signal(_)) if interruptible => return true,
                Ok(Event::Signal(_)) | Ok(Event::ShutdownRequested) => {
                    debug!("Shutdown already in progress");
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        false
    }

    fn log_excerpt(&self, cause: &ShutdownCause, descriptors: &[ServiceDescriptor]) -> Vec<String> {
        let Some(service) = cause.service() else {
            return Vec::new();
        };
        let path: Option<PathBuf> = self
            .slots
            .iter()
            .find(|slot| slot.handle.name() == service)
            .map(|slot| slot.handle.log_path().to_path_buf())
            .or_else(|| {
                descriptors
                    .iter()
                    .find(|descriptor| descriptor.name == service)
                    .map(|descriptor| descriptor.log_path.clone())
            });

        match path.map(|path| tail_lines(&path, FAILURE_LOG_EXCERPT_LINES)) {
            Some(Ok(lines)) => lines,
            Some(Err(err)) => {
                debug!("No log excerpt for '{service}': {err}");
                Vec::new()
            }
            None => Vec::new(),
        }
    }
}
