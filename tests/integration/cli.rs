#[path = "common/mod.rs"]
mod common;

use std::{
    ffi::OsStr,
    fs,
    os::unix::ffi::OsStrExt,
    path::Path,
    process::{Command as StdCommand, Stdio},
};

use assert_cmd::Command;
use common::{fake_python, is_process_alive, launched_services, wait_for_pid_file};
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use predicates::{prelude::*, str::contains};
use tempfile::tempdir;

fn chatstack(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("chatstack"));
    cmd.current_dir(dir);
    cmd
}

fn stack_args(dir: &Path) -> Vec<String> {
    vec![
        "--python".into(),
        fake_python(dir).display().to_string(),
        "--log-dir".into(),
        dir.join("logs").display().to_string(),
        "--registry-delay".into(),
        "200ms".into(),
        "--worker-delay".into(),
        "200ms".into(),
        "--grace-period".into(),
        "5s".into(),
    ]
}

#[test]
fn plan_lists_services_in_launch_order() {
    let temp = tempdir().expect("failed to create tempdir");

    let output = chatstack(temp.path())
        .arg("plan")
        .output()
        .expect("failed to run plan");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let registry = stdout.find("1. registry").expect("registry listed");
    let worker = stdout.find("2. worker").expect("worker listed");
    let api = stdout.find("3. api").expect("api listed");
    assert!(registry < worker && worker < api);
    assert!(stdout.contains("fastchat.serve.openai_api_server"));
    assert!(!stdout.contains("--api-key"));
}

#[test]
fn plan_json_redacts_api_key() {
    let temp = tempdir().expect("failed to create tempdir");

    let output = chatstack(temp.path())
        .args(["plan", "--json", "--api-key", "sk-very-secret"])
        .output()
        .expect("failed to run plan");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("sk-very-secret"));

    let plan: serde_json::Value = serde_json::from_str(&stdout).expect("plan is JSON");
    let services = plan.as_array().expect("plan is a list");
    assert_eq!(services.len(), 3);
    let args: Vec<&str> = services[2]["args"]
        .as_array()
        .expect("args list")
        .iter()
        .filter_map(|arg| arg.as_str())
        .collect();
    assert!(args.contains(&"--api-key"));
    assert!(args.contains(&"********"));
}

#[test]
fn plan_web_mode_uses_web_gateway() {
    let temp = tempdir().expect("failed to create tempdir");

    chatstack(temp.path())
        .args(["plan", "--mode", "web", "--web-port", "9001"])
        .assert()
        .success()
        .stdout(contains("3. web (gateway)"))
        .stdout(contains("fastchat.serve.gradio_web_server"))
        .stdout(contains("--port 9001"));
}

#[test]
fn settings_file_and_env_are_layered() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    fs::write(
        dir.join("chatstack.yaml"),
        "model_name: from-settings\napi_port: 8100\n",
    )
    .expect("failed to write settings");
    fs::write(dir.join(".env"), "CHATSTACK_API_PORT=8200\n").expect("failed to write env");

    chatstack(dir)
        .arg("plan")
        .assert()
        .success()
        .stdout(contains("--model-names from-settings"))
        .stdout(contains("--port 8200"));
}

#[test]
fn invalid_environment_value_is_a_config_error() {
    let temp = tempdir().expect("failed to create tempdir");

    chatstack(temp.path())
        .arg("up")
        .env("CHATSTACK_API_PORT", "eighty")
        .assert()
        .code(2)
        .stderr(contains("CHATSTACK_API_PORT"));

    assert!(!temp.path().join("logs").exists());
}

#[test]
fn non_utf8_environment_is_ignored() {
    let temp = tempdir().expect("failed to create tempdir");

    chatstack(temp.path())
        .arg("plan")
        .env("UNRELATED_VAR", OsStr::from_bytes(b"caf\xe9"))
        .env("CHATSTACK_API_PORT", "8300")
        .assert()
        .success()
        .stdout(contains("--port 8300"));
}

#[test]
fn duplicate_ports_are_rejected() {
    let temp = tempdir().expect("failed to create tempdir");

    chatstack(temp.path())
        .args(["plan", "--api-port", "21001"])
        .assert()
        .code(2)
        .stderr(contains("21001"));
}

#[test]
fn missing_interpreter_exits_with_launch_failure() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();

    chatstack(dir)
        .args(["up", "--python"])
        .arg(dir.join("no-such-python"))
        .args(["--log-dir"])
        .arg(dir.join("logs"))
        .assert()
        .code(3)
        .stderr(contains("registry"));
}

#[test]
fn logs_command_prints_service_log() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    fs::create_dir_all(dir.join("logs")).expect("failed to create log dir");
    fs::write(dir.join("logs/worker.log"), "one\ntwo\nthree\n").expect("failed to write log");

    let output = chatstack(dir)
        .args(["logs", "worker", "--lines", "2", "--log-dir", "logs"])
        .output()
        .expect("failed to run logs");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "two\nthree\n");

    chatstack(dir)
        .args(["logs", "api", "--log-dir", "logs"])
        .assert()
        .failure()
        .stderr(contains("api"));
}

#[test]
fn logs_command_only_reads_service_logs() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    fs::create_dir_all(dir.join("logs")).expect("failed to create log dir");
    fs::write(dir.join("x.log"), "outside\n").expect("failed to write file");

    chatstack(dir)
        .args(["logs", "../x", "--log-dir", "logs"])
        .assert()
        .failure()
        .stdout(contains("outside").not())
        .stderr(contains("Unknown service"));
}

#[test]
fn sigterm_drains_stack_and_exits_with_signal_code() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();

    let mut child = StdCommand::new(assert_cmd::cargo::cargo_bin!("chatstack"))
        .current_dir(dir)
        .arg("up")
        .args(stack_args(dir))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start chatstack");

    let pids: Vec<u32> = ["registry", "worker", "api"]
        .iter()
        .map(|service| wait_for_pid_file(dir, service))
        .collect();

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).expect("failed to signal");
    let status = child.wait().expect("failed to wait for chatstack");

    assert_eq!(status.code(), Some(128 + libc::SIGTERM));
    assert_eq!(launched_services(dir), vec!["registry", "worker", "api"]);

    assert!(pids.iter().all(|pid| !is_process_alive(*pid)));
}

#[test]
fn worker_death_exits_with_unexpected_exit_code() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();

    let mut child = StdCommand::new(assert_cmd::cargo::cargo_bin!("chatstack"))
        .current_dir(dir)
        .args(["up", "--mode", "web"])
        .args(stack_args(dir))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start chatstack");

    let registry = wait_for_pid_file(dir, "registry");
    let web = wait_for_pid_file(dir, "web");
    let worker = wait_for_pid_file(dir, "worker");
    kill(Pid::from_raw(worker as i32), Signal::SIGKILL).expect("failed to kill worker");

    let status = child.wait().expect("failed to wait for chatstack");
    assert_eq!(status.code(), Some(4));

    assert!(!is_process_alive(registry));
    assert!(!is_process_alive(web));

    let worker_log =
        fs::read_to_string(dir.join("logs/worker.log")).expect("worker log exists");
    assert!(worker_log.contains("worker listening on 21002"));
}
