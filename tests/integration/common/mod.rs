#![allow(dead_code)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

/// Writes an executable stand-in for the python interpreter into `dir`.
///
/// The script maps the `-m <module>` argument to a service name, appends its full
/// argument list to `launches.log`, records its PID in `<name>.pid` and then sleeps.
/// If `<name>.crash` exists it writes to stderr and exits with status 7 instead.
/// If `<name>.spawn` exists it first forks a background `sleep` of its own and
/// records that PID in `<name>.child.pid`.
pub fn fake_python(dir: &Path) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
case "$2" in
  *controller) name=registry ;;
  *model_worker) name=worker ;;
  *openai_api_server) name=api ;;
  *gradio_web_server) name=web ;;
  *) name=unknown ;;
esac
echo "$name $*" >> "{dir}/launches.log"
if [ -f "{dir}/$name.crash" ]; then
  echo "$name: boom" >&2
  exit 7
fi
echo "$name listening on $6"
if [ -f "{dir}/$name.spawn" ]; then
  sleep 60 &
  echo "$!" > "{dir}/$name.child.pid.tmp"
  mv "{dir}/$name.child.pid.tmp" "{dir}/$name.child.pid"
fi
echo "$$" > "{dir}/$name.pid.tmp"
mv "{dir}/$name.pid.tmp" "{dir}/$name.pid"
exec sleep 60
"#,
        dir = dir.display()
    );

    let path = dir.join("fake-python");
    fs::write(&path, script).expect("failed to write fake interpreter");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .expect("failed to mark fake interpreter executable");
    path
}

/// Service names in the order they were launched.
pub fn launched_services(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("launches.log"))
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.split_whitespace().next().map(str::to_string))
        .collect()
}

/// Full argument list the named service was launched with.
pub fn launch_args(dir: &Path, service: &str) -> Option<String> {
    fs::read_to_string(dir.join("launches.log"))
        .ok()?
        .lines()
        .find_map(|line| {
            line.strip_prefix(service)
                .and_then(|rest| rest.strip_prefix(' '))
                .map(str::to_string)
        })
}

pub fn wait_for_pid_file(dir: &Path, service: &str) -> u32 {
    read_pid_file(dir, &format!("{service}.pid"))
}

/// PID written by a process the named service forked for itself.
pub fn wait_for_child_pid_file(dir: &Path, service: &str) -> u32 {
    read_pid_file(dir, &format!("{service}.child.pid"))
}

fn read_pid_file(dir: &Path, file: &str) -> u32 {
    let path = dir.join(file);
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(content) = fs::read_to_string(&path)
            && let Ok(pid) = content.trim().parse::<u32>()
        {
            return pid;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for PID file {}", path.display());
        }

        thread::sleep(Duration::from_millis(100));
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system.process(Pid::from_u32(pid)).is_some()
}

/// Waits until `pid` is gone or left only as a zombie nobody has reaped yet.
pub fn wait_for_process_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let running = system.process(Pid::from_u32(pid)).is_some_and(|process| {
            !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
        });
        if !running {
            return true;
        }

        if Instant::now() >= deadline {
            return false;
        }

        thread::sleep(Duration::from_millis(100));
    }
}
