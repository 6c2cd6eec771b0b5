//! Append-only access log with size-triggered rotation.
//!
//! One record per proxied connection, one line per record. Appends are
//! serialized by a mutex and flushed immediately; rotation renames the
//! current file to a timestamped sibling and starts a fresh one. Write
//! and rotation failures never propagate to connection handling; they
//! are counted and the last error is retained for diagnostics.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Local, SecondsFormat, Utc};

/// Outcome tag for one proxied connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessAction {
    Allowed,
    Blocked,
    CacheHit,
    AuthFailed,
    Error,
}

impl AccessAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "ALLOWED",
            Self::Blocked => "BLOCKED",
            Self::CacheHit => "CACHE_HIT",
            Self::AuthFailed => "AUTH_FAILED",
            Self::Error => "ERROR",
        }
    }
}

/// One access-log record. `upstream_status` of zero renders as `-`;
/// a non-empty `blocked_rule` renders as a trailing `[BLOCKED: rule]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub client_port: u16,
    pub dest_host: String,
    pub dest_port: u16,
    pub method: String,
    pub target: String,
    pub action: AccessAction,
    pub upstream_status: u16,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
    pub blocked_rule: String,
}

#[derive(Debug)]
struct LoggerState {
    file: File,
    current_size: u64,
}

/// Serialized, rotating access logger.
#[derive(Debug)]
pub struct AccessLogger {
    path: PathBuf,
    max_bytes: u64,
    state: Mutex<LoggerState>,
    write_error_count: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl AccessLogger {
    /// Opens (or creates) the log file in append mode. `max_size_mb` is
    /// the rotation threshold in MiB.
    pub fn open(path: impl Into<PathBuf>, max_size_mb: u64) -> io::Result<Self> {
        Self::open_with_max_bytes(path, max_size_mb.saturating_mul(1024 * 1024))
    }

    fn open_with_max_bytes(path: impl Into<PathBuf>, max_bytes: u64) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata().map(|meta| meta.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_bytes,
            state: Mutex::new(LoggerState { file, current_size }),
            write_error_count: AtomicU64::new(0),
            last_error: Mutex::new(None),
        })
    }

    /// Appends one record, rotating first if the file has reached the
    /// size threshold. Failures are swallowed: the proxy must keep
    /// serving even when its log disk is misbehaving.
    pub fn log(&self, record: &AccessRecord) {
        if let Err(error) = self.append(record) {
            self.write_error_count.fetch_add(1, Ordering::Relaxed);
            *self.last_error.lock().expect("access log lock poisoned") = Some(error.to_string());
            eprintln!("access log write failed: {error}");
        }
    }

    pub fn flush(&self) -> io::Result<()> {
        let mut state = self.state.lock().expect("access log lock poisoned");
        state.file.flush()
    }

    pub fn write_error_count(&self) -> u64 {
        self.write_error_count.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("access log lock poisoned").clone()
    }

    fn append(&self, record: &AccessRecord) -> io::Result<()> {
        let mut state = self.state.lock().expect("access log lock poisoned");

        if state.current_size >= self.max_bytes {
            if let Err(error) = self.rotate(&mut state) {
                // Keep appending to the old file; rotation retries on the
                // next record.
                eprintln!("access log rotation failed: {error}");
            }
        }

        let line = format_record(record);
        state.file.write_all(line.as_bytes())?;
        state.file.write_all(b"\n")?;
        state.file.flush()?;
        let _ = state.file.sync_data();
        state.current_size += line.len() as u64 + 1;
        Ok(())
    }

    fn rotate(&self, state: &mut LoggerState) -> io::Result<()> {
        state.file.flush()?;

        let suffix = Local::now().format("%Y%m%d-%H%M%S");
        let mut rotated: OsString = self.path.clone().into_os_string();
        rotated.push(format!(".{suffix}"));
        fs::rename(&self.path, PathBuf::from(rotated))?;

        state.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        state.current_size = 0;
        Ok(())
    }
}

fn format_record(record: &AccessRecord) -> String {
    let timestamp = record.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
    let status = if record.upstream_status > 0 {
        record.upstream_status.to_string()
    } else {
        "-".to_string()
    };

    let mut line = format!(
        "{timestamp} {}:{} -> {}:{} \"{} {} HTTP/1.1\" {} {} {} {}",
        record.client_ip,
        record.client_port,
        record.dest_host,
        record.dest_port,
        record.method,
        record.target,
        record.action.as_str(),
        status,
        record.bytes_upstream,
        record.bytes_downstream,
    );
    if !record.blocked_rule.is_empty() {
        line.push_str(&format!(" [BLOCKED: {}]", record.blocked_rule));
    }
    line
}
