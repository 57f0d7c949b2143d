//! Multipass CLI backend
//!
//! Runs the `multipass` binary as a child process and normalizes its JSON
//! output into [`VmRecord`]s. Every child is spawned with `kill_on_drop`, so a
//! caller that gives up on a call (timeout) also ends the process.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::backend::{BackendError, BackendRequest, LaunchSpec, ProgressSink, VirtBackend};
use super::record::{VmRecord, VmStatus};

const BINARY_NAME: &str = "multipass";

/// stderr fragments that mean the daemon, not the command, is the problem
const UNAVAILABLE_MARKERS: &[&str] = &[
    "cannot connect to the multipass socket",
    "multipassd",
    "connection refused",
];

/// Backend that drives a local Multipass installation
#[derive(Debug, Clone, Default)]
pub struct MultipassBackend {
    /// Explicit binary path; `PATH` is searched when unset or missing
    binary: Option<PathBuf>,
}

impl MultipassBackend {
    /// Create a new Multipass backend
    ///
    /// # Arguments
    /// * `binary` - Optional explicit path to the `multipass` executable
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }

    /// Locate the multipass executable
    pub fn resolve_binary(&self) -> Result<PathBuf, BackendError> {
        if let Some(path) = &self.binary {
            if path.is_file() {
                return Ok(path.clone());
            }
            warn!(path = %path.display(), "configured multipass binary not found, searching PATH");
        }
        find_in_path(BINARY_NAME).ok_or_else(|| {
            BackendError::Unavailable(
                "multipass was not found; make sure it is installed and on PATH".to_string(),
            )
        })
    }

    /// Run multipass with `args`, streaming stdout segments to `progress`.
    ///
    /// Returns the complete stdout on success.
    async fn run(
        &self,
        args: &[String],
        progress: Option<ProgressSink>,
    ) -> Result<String, BackendError> {
        let binary = self.resolve_binary()?;
        let command_line = format!("multipass {}", args.join(" "));
        debug!(command = %command_line, "running backend command");

        let mut child = Command::new(&binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    BackendError::Unavailable(format!("cannot run {}: {}", binary.display(), e))
                }
                _ => BackendError::CommandFailed {
                    command: command_line.clone(),
                    message: e.to_string(),
                },
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (stdout, stderr) = tokio::join!(pump_lines(stdout, progress), pump_lines(stderr, None));
        let status = child.wait().await.map_err(|e| BackendError::CommandFailed {
            command: command_line.clone(),
            message: e.to_string(),
        })?;

        let stdout = stdout.map_err(|e| BackendError::CommandFailed {
            command: command_line.clone(),
            message: e.to_string(),
        })?;
        let stderr = stderr.unwrap_or_default();

        if status.success() {
            debug!(command = %command_line, "backend command succeeded");
            return Ok(stdout);
        }

        let message = if stderr.trim().is_empty() {
            format!("exited with {}", status)
        } else {
            stderr.trim().to_string()
        };
        let lowered = message.to_ascii_lowercase();
        if UNAVAILABLE_MARKERS.iter().any(|m| lowered.contains(m)) {
            return Err(BackendError::Unavailable(message));
        }
        Err(BackendError::CommandFailed {
            command: command_line,
            message,
        })
    }
}

#[async_trait]
impl VirtBackend for MultipassBackend {
    async fn list(&self) -> Result<Vec<VmRecord>, BackendError> {
        let detailed = self.run(&args(&["info", "--all", "--format", "json"]), None).await;
        match detailed {
            Ok(output) => parse_inventory(&output),
            // Older/newer releases disagree on `info --all`; `list` always works.
            Err(BackendError::CommandFailed { message, .. }) => {
                debug!(error = %message, "info --all failed, falling back to list");
                let output = self.run(&args(&["list", "--format", "json"]), None).await?;
                parse_inventory(&output)
            }
            Err(e) => Err(e),
        }
    }

    async fn info(&self, name: &str) -> Result<VmRecord, BackendError> {
        let output = self
            .run(&args(&["info", name, "--format", "json"]), None)
            .await?;
        parse_inventory(&output)?
            .into_iter()
            .find(|r| r.name == name)
            .ok_or_else(|| BackendError::Parse(format!("no info returned for '{}'", name)))
    }

    async fn apply(
        &self,
        request: &BackendRequest,
        progress: ProgressSink,
    ) -> Result<(), BackendError> {
        self.run(&request_args(request), Some(progress))
            .await
            .map(|_| ())
    }

    async fn version(&self) -> Result<String, BackendError> {
        let output = self.run(&args(&["version"]), None).await?;
        Ok(output.lines().next().unwrap_or_default().trim().to_string())
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Command-line arguments for a mutating request
pub fn request_args(request: &BackendRequest) -> Vec<String> {
    match request {
        BackendRequest::Create(spec) => launch_args(spec),
        BackendRequest::Start(name) => args(&["start", name.as_str()]),
        BackendRequest::Stop(name) => args(&["stop", name.as_str()]),
        BackendRequest::Delete { name, purge } => {
            let mut a = args(&["delete", name.as_str()]);
            if *purge {
                a.push("--purge".to_string());
            }
            a
        }
    }
}

fn launch_args(spec: &LaunchSpec) -> Vec<String> {
    let mut a = vec!["launch".to_string()];
    if let Some(image) = &spec.image {
        a.push(image.clone());
    }
    a.extend(["--name".to_string(), spec.name.clone()]);
    if let Some(cpus) = spec.cpus {
        a.extend(["--cpus".to_string(), cpus.to_string()]);
    }
    if let Some(memory) = spec.memory_mb {
        a.extend(["--memory".to_string(), format!("{}M", memory)]);
    }
    if let Some(disk) = spec.disk_gb {
        a.extend(["--disk".to_string(), format!("{}G", disk)]);
    }
    a
}

/// Read a child pipe to the end, forwarding `\r`/`\n` separated segments.
async fn pump_lines<R: AsyncRead + Unpin>(
    reader: Option<R>,
    progress: Option<ProgressSink>,
) -> std::io::Result<String> {
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };
    let mut collected = Vec::new();
    let mut pending = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
        let Some(sink) = &progress else { continue };
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                send_segment(sink, &mut pending).await;
            } else {
                pending.push(byte);
            }
        }
    }
    if let Some(sink) = &progress {
        send_segment(sink, &mut pending).await;
    }
    Ok(String::from_utf8_lossy(&collected).into_owned())
}

async fn send_segment(sink: &ProgressSink, pending: &mut Vec<u8>) {
    if pending.is_empty() {
        return;
    }
    let line = String::from_utf8_lossy(pending).trim().to_string();
    pending.clear();
    if !line.is_empty() {
        // The executor may have stopped listening; the command still runs to the end.
        let _ = sink.send(line).await;
    }
}

/// Normalize `multipass info --format json` or `multipass list --format json`
/// output into name-ordered records. Deleted instances are skipped.
pub fn parse_inventory(json: &str) -> Result<Vec<VmRecord>, BackendError> {
    let value: Value = serde_json::from_str(json.trim())
        .map_err(|e| BackendError::Parse(format!("invalid JSON: {}", e)))?;

    let mut records = Vec::new();
    if let Some(info) = value.get("info").and_then(Value::as_object) {
        for (name, details) in info {
            records.push(record_from_info(name, details));
        }
    } else if let Some(list) = value.get("list").and_then(Value::as_array) {
        for entry in list {
            if let Some(record) = record_from_list(entry) {
                records.push(record);
            }
        }
    } else {
        return Err(BackendError::Parse(
            "expected an 'info' object or a 'list' array".to_string(),
        ));
    }

    records.retain(|r| r.status != VmStatus::Deleting);
    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
}

fn record_from_info(name: &str, details: &Value) -> VmRecord {
    let status = VmStatus::from_backend(details["state"].as_str().unwrap_or("Unknown"));
    let cpus = as_u64(&details["cpu_count"]).unwrap_or(0) as u32;
    let memory_mb = as_u64(&details["memory"]["total"]).unwrap_or(0) / (1024 * 1024);
    let disk_bytes: u64 = details["disks"]
        .as_object()
        .map(|disks| disks.values().filter_map(|d| as_u64(&d["total"])).sum())
        .unwrap_or(0);
    let disk_gb = (disk_bytes as f64 / (1024.0 * 1024.0 * 1024.0)).round() as u64;

    VmRecord {
        name: name.to_string(),
        status,
        ip_address: first_ip(&details["ipv4"]),
        cpus,
        memory_mb,
        disk_gb,
        release: release_of(details),
    }
}

fn record_from_list(entry: &Value) -> Option<VmRecord> {
    let name = entry["name"].as_str()?;
    let mut record = VmRecord::new(
        name,
        VmStatus::from_backend(entry["state"].as_str().unwrap_or("Unknown")),
    );
    record.ip_address = first_ip(&entry["ipv4"]);
    record.release = release_of(entry);
    Some(record)
}

fn first_ip(value: &Value) -> Option<String> {
    value
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .find(|ip| !ip.is_empty() && *ip != "N/A")
        .map(str::to_string)
}

fn release_of(value: &Value) -> Option<String> {
    value["release"]
        .as_str()
        .or_else(|| value["image_release"].as_str())
        .filter(|s| !s.is_empty() && *s != "N/A")
        .map(str::to_string)
}

/// Multipass reports sizes as numbers in some fields and strings in others
fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
