//! Starts service descriptors as child processes.
//!
//! Every child runs in its own process group so the whole tree it forks can be
//! signalled at once, and its stdout/stderr are appended to a single log file so a
//! chatty service can never block on a full pipe. A dedicated waiter thread per
//! child reports termination to the supervisor's event channel exactly once.
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::{
    fmt, io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
    },
    thread,
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::LaunchError, logs::open_sink, services::ServiceDescriptor, supervisor::Event,
};

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited on its own with a status code.
    Code(i32),
    /// Killed by a signal nobody in the orchestrator asked for.
    Signal(i32),
    /// Killed after the supervisor requested termination.
    Terminated,
    /// The exit status could not be collected.
    WaitFailed(String),
}

impl ExitOutcome {
    /// Maps a raw exit status, knowing whether termination had been requested.
    pub fn from_status(status: ExitStatus, termination_requested: bool) -> Self {
        if let Some(code) = status.code() {
            return ExitOutcome::Code(code);
        }
        match status.signal() {
            Some(_) if termination_requested => ExitOutcome::Terminated,
            Some(signal) => ExitOutcome::Signal(signal),
            None => ExitOutcome::WaitFailed(format!("unrecognised exit status {status:?}")),
        }
    }

    /// Whether the process ended the way an orderly shutdown expects.
    pub fn is_clean(&self) -> bool {
        matches!(self, ExitOutcome::Code(0) | ExitOutcome::Terminated)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Code(code) => write!(f, "exit code {code}"),
            ExitOutcome::Signal(signal) => match Signal::try_from(*signal) {
                Ok(name) => write!(f, "signal {name}"),
                Err(_) => write!(f, "signal {signal}"),
            },
            ExitOutcome::Terminated => write!(f, "terminated on request"),
            ExitOutcome::WaitFailed(reason) => write!(f, "wait failed: {reason}"),
        }
    }
}

/// Ability to stop a launched process.
pub trait ProcessControl: Send {
    /// Asks the process to exit (`SIGTERM`).
    fn terminate(&self) -> io::Result<()>;
    /// Forces the process to exit (`SIGKILL`).
    fn kill(&self) -> io::Result<()>;
    /// Sends `signal` to whatever is left of the process group, even after the
    /// leader has been reaped. An empty group is not an error.
    fn signal_group(&self, signal: Signal) -> io::Result<()>;
}

/// A running child process, owned by the supervisor.
pub struct ProcessHandle {
    name: String,
    pid: u32,
    log_path: PathBuf,
    control: Box<dyn ProcessControl>,
}

impl ProcessHandle {
    pub fn new(
        name: impl Into<String>,
        pid: u32,
        log_path: impl Into<PathBuf>,
        control: Box<dyn ProcessControl>,
    ) -> Self {
        Self {
            name: name.into(),
            pid,
            log_path: log_path.into(),
            control,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub(crate) fn terminate(&self) -> io::Result<()> {
        self.control.terminate()
    }

    pub(crate) fn kill(&self) -> io::Result<()> {
        self.control.kill()
    }

    pub(crate) fn signal_group(&self, signal: Signal) -> io::Result<()> {
        self.control.signal_group(signal)
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("log_path", &self.log_path)
            .finish()
    }
}

/// Starts one service. The returned handle's completion is reported on `events`.
pub trait Launcher {
    fn launch(
        &self,
        descriptor: &ServiceDescriptor,
        events: Sender<Event>,
    ) -> Result<ProcessHandle, LaunchError>;
}

/// Launches descriptors as real OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLauncher;

impl Launcher for CommandLauncher {
    fn launch(
        &self,
        descriptor: &ServiceDescriptor,
        events: Sender<Event>,
    ) -> Result<ProcessHandle, LaunchError> {
        let name = descriptor.name.clone();
        let command_line = descriptor.command_line();
        debug!("Launching service '{name}' with command: `{command_line}`");

        let sink_error = |source: io::Error| LaunchError::LogSink {
            service: name.clone(),
            path: descriptor.log_path.clone(),
            source,
        };
        let stdout = open_sink(&descriptor.log_path, &format!("starting {name}: {command_line}"))
            .map_err(sink_error)?;
        let stderr = stdout.try_clone().map_err(sink_error)?;

        let mut cmd = Command::new(&descriptor.program);
        cmd.args(&descriptor.args)
            .current_dir(&descriptor.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0);

        // Ensure the service gets SIGTERM if the orchestrator dies (Linux only).
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM, 0, 0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|source| {
            error!("Failed to start service '{name}': {source}");
            LaunchError::Spawn {
                service: name.clone(),
                source,
            }
        })?;

        let pid = child.id();
        info!("Service '{name}' started with PID {pid}");

        let termination_requested = Arc::new(AtomicBool::new(false));
        let waiter_flag = Arc::clone(&termination_requested);
        let service = name.clone();
        thread::spawn(move || {
            let outcome = match child.wait() {
                Ok(status) => {
                    ExitOutcome::from_status(status, waiter_flag.load(Ordering::SeqCst))
                }
                Err(err) => ExitOutcome::WaitFailed(err.to_string()),
            };
            debug!("Service '{service}' (PID {pid}) finished: {outcome}");
            let _ = events.send(Event::Exited { service, outcome });
        });

        let control = ChildControl {
            name: name.clone(),
            pid: Pid::from_raw(pid as i32),
            termination_requested,
        };

        Ok(ProcessHandle::new(
            name,
            pid,
            descriptor.log_path.clone(),
            Box::new(control),
        ))
    }
}

/// Signals a child's process group, falling back to the child itself.
struct ChildControl {
    name: String,
    pid: Pid,
    termination_requested: Arc<AtomicBool>,
}

impl ChildControl {
    fn send(&self, sig: Signal) -> io::Result<()> {
        self.termination_requested.store(true, Ordering::SeqCst);

        // Each child leads its own group, so the group id equals its PID.
        match signal::killpg(self.pid, sig) {
            Ok(()) => return Ok(()),
            Err(Errno::ESRCH) => {}
            Err(Errno::EPERM) => {
                warn!(
                    "Insufficient permissions to signal process group {} for '{}'. Falling back to direct signal",
                    self.pid, self.name
                );
            }
            Err(err) => return Err(err.into()),
        }

        match signal::kill(self.pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl ProcessControl for ChildControl {
    fn terminate(&self) -> io::Result<()> {
        debug!("Sending SIGTERM to '{}' (PID {})", self.name, self.pid);
        self.send(Signal::SIGTERM)
    }

    fn kill(&self) -> io::Result<()> {
        debug!("Sending SIGKILL to '{}' (PID {})", self.name, self.pid);
        self.send(Signal::SIGKILL)
    }

    // No fallback to the PID here: once the leader is reaped its PID may belong
    // to an unrelated process, while the group id stays reserved as long as any
    // member is alive.
    fn signal_group(&self, signal: Signal) -> io::Result<()> {
        match signal::killpg(self.pid, signal) {
            Ok(()) => {
                debug!("Sent {signal} to process group {} of '{}'", self.pid, self.name);
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
