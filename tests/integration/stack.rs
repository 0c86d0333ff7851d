#[path = "common/mod.rs"]
mod common;

use std::{fs, path::Path, thread, time::Duration};

use chatstack::{
    config::Configuration,
    constants::{EXIT_CLEAN, EXIT_LAUNCH_FAILURE, EXIT_UNEXPECTED_EXIT},
    launcher::{CommandLauncher, ExitOutcome},
    readiness::PolicyGate,
    services::{self, Mode},
    supervisor::{ShutdownCause, Supervisor},
};
use common::{
    fake_python, is_process_alive, launch_args, launched_services, wait_for_child_pid_file,
    wait_for_pid_file, wait_for_process_exit,
};
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use tempfile::tempdir;

fn configuration(dir: &Path) -> Configuration {
    Configuration {
        python: fake_python(dir).display().to_string(),
        working_dir: dir.to_path_buf(),
        log_dir: dir.join("logs"),
        registry_delay: Duration::from_millis(200),
        worker_delay: Duration::from_millis(200),
        grace_period: Duration::from_secs(5),
        ..Configuration::default()
    }
}

fn supervisor(config: &Configuration) -> Supervisor<CommandLauncher, PolicyGate> {
    let gate = PolicyGate::new().expect("failed to build probe client");
    Supervisor::new(CommandLauncher, gate, config.grace_period)
}

#[test]
fn stack_launches_in_order_and_drains_on_request() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config = configuration(dir);
    let descriptors = services::build(&config, Mode::Api);
    let supervisor = supervisor(&config);
    let trigger = supervisor.trigger();

    let watched = dir.to_path_buf();
    let requester = thread::spawn(move || {
        let pids: Vec<u32> = ["registry", "worker", "api"]
            .iter()
            .map(|service| wait_for_pid_file(&watched, service))
            .collect();
        trigger.request_shutdown();
        pids
    });

    let report = supervisor.run(&descriptors);
    let pids = requester.join().expect("requester thread panicked");

    assert_eq!(launched_services(dir), vec!["registry", "worker", "api"]);
    let api_args = launch_args(dir, "api").expect("api launch recorded");
    assert!(api_args.contains("--controller-address http://localhost:21001"));
    assert!(!api_args.contains("--api-key"));

    assert_eq!(report.cause, ShutdownCause::Requested);
    assert!(report.drained_cleanly());
    assert_eq!(report.exit_code(), EXIT_CLEAN);
    assert!(
        report
            .services
            .iter()
            .all(|service| service.outcome == Some(ExitOutcome::Terminated))
    );

    assert!(pids.iter().all(|pid| !is_process_alive(*pid)));

    let registry_log =
        fs::read_to_string(dir.join("logs/registry.log")).expect("registry log exists");
    assert!(registry_log.contains("starting registry"));
    assert!(registry_log.contains("registry listening on 21001"));
}

#[test]
fn killed_worker_takes_the_stack_down() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config = configuration(dir);
    let descriptors = services::build(&config, Mode::Api);
    let supervisor = supervisor(&config);

    let watched = dir.to_path_buf();
    let killer = thread::spawn(move || {
        let registry = wait_for_pid_file(&watched, "registry");
        let api = wait_for_pid_file(&watched, "api");
        let worker = wait_for_pid_file(&watched, "worker");
        kill(Pid::from_raw(worker as i32), Signal::SIGKILL).expect("failed to kill worker");
        (registry, api)
    });

    let report = supervisor.run(&descriptors);
    let (registry, api) = killer.join().expect("killer thread panicked");

    assert_eq!(
        report.cause,
        ShutdownCause::UnexpectedExit {
            service: "worker".into(),
            outcome: ExitOutcome::Signal(libc::SIGKILL),
        }
    );
    assert_eq!(report.exit_code(), EXIT_UNEXPECTED_EXIT);
    assert_eq!(report.services[2].name, "api");
    assert_eq!(report.services[0].outcome, Some(ExitOutcome::Terminated));
    assert_eq!(report.services[2].outcome, Some(ExitOutcome::Terminated));
    assert!(report.services.iter().all(|service| !service.forced));

    let api_args = launch_args(dir, "api").expect("api launch recorded");
    assert!(!api_args.contains("--api-key"));

    // Outcomes are only recorded once the children have been reaped.
    assert!(!is_process_alive(registry));
    assert!(!is_process_alive(api));
}

#[test]
fn processes_forked_by_a_dead_service_are_stopped() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    fs::write(dir.join("worker.spawn"), "").expect("failed to write spawn marker");
    let config = configuration(dir);
    let descriptors = services::build(&config, Mode::Api);
    let supervisor = supervisor(&config);

    let watched = dir.to_path_buf();
    let killer = thread::spawn(move || {
        wait_for_pid_file(&watched, "api");
        let worker = wait_for_pid_file(&watched, "worker");
        let orphan = wait_for_child_pid_file(&watched, "worker");
        // Only the worker itself dies; its own child keeps running.
        kill(Pid::from_raw(worker as i32), Signal::SIGKILL).expect("failed to kill worker");
        orphan
    });

    let report = supervisor.run(&descriptors);
    let orphan = killer.join().expect("killer thread panicked");

    assert_eq!(report.cause.service(), Some("worker"));
    assert!(
        wait_for_process_exit(orphan, Duration::from_secs(10)),
        "process {orphan} forked by the worker outlived the stack"
    );
}

#[test]
fn missing_interpreter_is_a_launch_failure() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config = Configuration {
        python: dir.join("no-such-python").display().to_string(),
        ..configuration(dir)
    };
    let descriptors = services::build(&config, Mode::Api);

    let report = supervisor(&config).run(&descriptors);

    assert!(matches!(
        report.cause,
        ShutdownCause::LaunchFailed { ref service, .. } if service == "registry"
    ));
    assert!(report.services.is_empty());
    assert_eq!(report.exit_code(), EXIT_LAUNCH_FAILURE);
}

#[test]
fn worker_crash_during_startup_reports_its_log() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    fs::write(dir.join("worker.crash"), "").expect("failed to write crash marker");
    let config = Configuration {
        worker_delay: Duration::from_secs(30),
        ..configuration(dir)
    };
    let descriptors = services::build(&config, Mode::Api);

    let report = supervisor(&config).run(&descriptors);

    assert!(matches!(
        report.cause,
        ShutdownCause::LaunchFailed { ref service, .. } if service == "worker"
    ));
    assert_eq!(report.exit_code(), EXIT_LAUNCH_FAILURE);
    assert_eq!(launched_services(dir), vec!["registry", "worker"]);
    assert!(report.log_excerpt.iter().any(|line| line == "worker: boom"));
    assert_eq!(report.services[0].outcome, Some(ExitOutcome::Terminated));
    assert_eq!(report.services[1].outcome, Some(ExitOutcome::Code(7)));
}
