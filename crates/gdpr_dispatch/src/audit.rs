#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const AUDIT_RECENT_CAPACITY: usize = 4_096;
pub const AUDIT_CONNECT_TIMEOUT_MS_DEFAULT: u64 = 1_000;
pub const AUDIT_REQUEST_TIMEOUT_MS_DEFAULT: u64 = 3_000;
/// Status the audit service answers a stored entry with.
pub const AUDIT_CREATED: u16 = 201;

/// Provenance of one dispatcher call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub querier: String,
    pub query: String,
    pub result: String,
}

impl AuditEntry {
    pub fn new(
        querier: impl Into<String>,
        query: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            querier: querier.into(),
            query: query.into(),
            result: result.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditHttpConfig {
    pub endpoint: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl AuditHttpConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout_ms: AUDIT_CONNECT_TIMEOUT_MS_DEFAULT,
            request_timeout_ms: AUDIT_REQUEST_TIMEOUT_MS_DEFAULT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditSinkRuntime {
    Disabled,
    /// Keeps the most recent entries in memory.
    Recording,
    /// Appends one JSON object per line.
    JsonLines(PathBuf),
    Http(AuditHttpConfig),
    AlwaysFail,
}

impl AuditSinkRuntime {
    /// `http(s)://` posts to the audit service, `file://<path>` appends
    /// JSON lines, `none` disables, and an absent endpoint records in memory.
    pub fn from_endpoint(endpoint: Option<&str>) -> Self {
        match endpoint.map(str::trim) {
            None | Some("") => AuditSinkRuntime::Recording,
            Some("none") => AuditSinkRuntime::Disabled,
            Some(e) if e.starts_with("http://") || e.starts_with("https://") => {
                AuditSinkRuntime::Http(AuditHttpConfig::new(e))
            }
            Some(e) => AuditSinkRuntime::JsonLines(PathBuf::from(
                e.strip_prefix("file://").unwrap_or(e),
            )),
        }
    }
}

/// Fire-and-forget sink. Delivery failures are logged and counted, never
/// retried, and never reach the caller.
#[derive(Debug)]
pub struct AuditSink {
    runtime: AuditSinkRuntime,
    agent: Option<ureq::Agent>,
    recent: Mutex<VecDeque<AuditEntry>>,
    file_lock: Mutex<()>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl AuditSink {
    pub fn new(runtime: AuditSinkRuntime) -> Self {
        let agent = match &runtime {
            AuditSinkRuntime::Http(config) => Some(
                ureq::AgentBuilder::new()
                    .timeout_connect(Duration::from_millis(config.connect_timeout_ms))
                    .timeout_read(Duration::from_millis(config.request_timeout_ms))
                    .timeout_write(Duration::from_millis(config.request_timeout_ms))
                    .build(),
            ),
            _ => None,
        };
        Self {
            runtime,
            agent,
            recent: Mutex::new(VecDeque::new()),
            file_lock: Mutex::new(()),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn runtime(&self) -> &AuditSinkRuntime {
        &self.runtime
    }

    pub fn record(&self, entry: AuditEntry) {
        let outcome = match &self.runtime {
            AuditSinkRuntime::Disabled => return,
            AuditSinkRuntime::Recording => {
                let mut recent = self.recent.lock();
                if recent.len() == AUDIT_RECENT_CAPACITY {
                    recent.pop_front();
                }
                recent.push_back(entry);
                Ok(())
            }
            AuditSinkRuntime::JsonLines(path) => self.append_line(path, &entry),
            AuditSinkRuntime::Http(config) => self.post(config, &entry),
            AuditSinkRuntime::AlwaysFail => Err("audit sink forced failure".to_string()),
        };
        match outcome {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(reason) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(reason = %reason, "audit entry dropped");
            }
        }
    }

    /// Most recent `count` entries, oldest first. Sinks that do not retain
    /// entries return nothing.
    pub fn recent(&self, count: usize) -> Vec<AuditEntry> {
        match &self.runtime {
            AuditSinkRuntime::Recording => {
                let recent = self.recent.lock();
                let skip = recent.len().saturating_sub(count);
                recent.iter().skip(skip).cloned().collect()
            }
            AuditSinkRuntime::JsonLines(path) => {
                let _guard = self.file_lock.lock();
                tail_json_lines(path, count)
            }
            _ => Vec::new(),
        }
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn append_line(&self, path: &Path, entry: &AuditEntry) -> Result<(), String> {
        let line = serde_json::to_string(entry).map_err(|e| format!("encode failed: {e}"))?;
        let _guard = self.file_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| format!("open {} failed: {e}", path.display()))?;
        writeln!(file, "{line}").map_err(|e| format!("write {} failed: {e}", path.display()))
    }

    fn post(&self, config: &AuditHttpConfig, entry: &AuditEntry) -> Result<(), String> {
        let Some(agent) = self.agent.as_ref() else {
            return Err("audit agent missing".to_string());
        };
        let payload = serde_json::to_string(entry).map_err(|e| format!("encode failed: {e}"))?;
        match agent
            .post(&config.endpoint)
            .set("content-type", "application/json")
            .send_string(&payload)
        {
            Ok(resp) if resp.status() == AUDIT_CREATED => Ok(()),
            Ok(resp) => Err(format!("audit answered http {}", resp.status())),
            Err(ureq::Error::Status(code, _)) => Err(format!("audit answered http {code}")),
            Err(ureq::Error::Transport(err)) => Err(format!("audit transport error: {err}")),
        }
    }
}

fn tail_json_lines(path: &Path, count: usize) -> Vec<AuditEntry> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let entries: Vec<AuditEntry> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    let skip = entries.len().saturating_sub(count);
    entries.into_iter().skip(skip).collect()
}
