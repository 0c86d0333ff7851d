//! Per-service log files.
use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use crate::{constants::SERVICE_NAMES, error::LogsError};

/// Location of the combined stdout/stderr log for `service` under `log_dir`.
pub fn log_path(log_dir: &Path, service: &str) -> PathBuf {
    log_dir.join(format!("{service}.log"))
}

/// Opens (creating if needed) the append-only log sink at `path` and writes a
/// banner line marking the start of a new run.
pub fn open_sink(path: &Path, banner: &str) -> io::Result<File> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir)?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(
        file,
        "==> {} {banner}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
    )?;
    Ok(file)
}

/// Returns the last `lines` lines of the file at `path`. Bytes that are not
/// valid UTF-8 are replaced rather than ending the read.
pub fn tail_lines(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut tail = VecDeque::with_capacity(lines.min(1024));
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        if lines == 0 {
            continue;
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        if tail.len() == lines {
            tail.pop_front();
        }
        tail.push_back(String::from_utf8_lossy(&buf).into_owned());
    }

    Ok(tail.into())
}

/// Reads the last `lines` lines of a service's log.
pub fn service_log(
    log_dir: &Path,
    service: &str,
    lines: usize,
) -> Result<Vec<String>, LogsError> {
    if !SERVICE_NAMES.contains(&service) {
        return Err(LogsError::UnknownService(service.to_string()));
    }

    let path = log_path(log_dir, service);
    if !path.exists() {
        return Err(LogsError::NotFound {
            service: service.to_string(),
            path,
        });
    }
    Ok(tail_lines(&path, lines)?)
}
