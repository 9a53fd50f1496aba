//! Local notification channel for operators.
//!
//! Anomalies and persistence failures are mirrored to `tracing` and, when
//! `LOG_FILE` is set, appended as JSON lines to a size-rotated file. Nothing
//! here is allowed to fail the intake path: write errors are counted and
//! logged, then dropped.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::classifier::FieldMap;
use crate::config::RotationConfig;
use crate::store::{EventId, StoreError};

/// Bumped whenever the notification line layout changes.
pub const NOTIFICATION_SCHEMA_VERSION: u32 = 1;

/// Append-only line writer with size-based rotation into `<path>.1..N`.
///
/// Compressing a rotated backup happens on its own thread so the caller
/// holding the writer lock only pays for the renames.
pub struct RotatingWriter {
    path: PathBuf,
    file: fs::File,
    rotation: RotationConfig,
    compressing: Option<JoinHandle<io::Result<()>>>,
}

impl RotatingWriter {
    pub fn open(path: impl AsRef<Path>, rotation: RotationConfig) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            rotation,
            compressing: None,
        })
    }

    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        if let Some(limit) = self.rotation.max_bytes {
            if self.current_size().is_some_and(|len| len >= limit) {
                self.rotate()?;
            }
        }
        writeln!(self.file, "{}", line)
    }

    pub fn current_size(&self) -> Option<u64> {
        self.path.metadata().ok().map(|m| m.len())
    }

    /// Block until the last backup handed to the compression thread is
    /// written out.
    pub fn wait_for_compression(&mut self) -> io::Result<()> {
        match self.compressing.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| io::Error::other("compression thread panicked"))?,
            None => Ok(()),
        }
    }

    fn backup_path(&self, idx: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", idx));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        // Backups are shifted by name, so the previous one must be finished.
        if let Err(e) = self.wait_for_compression() {
            tracing::warn!(error = %e, "failed to compress rotated notification log");
        }
        let keep = self.rotation.keep;
        if keep > 0 {
            for idx in (1..keep).rev() {
                let from = self.backup_path(idx);
                if from.exists() {
                    fs::rename(&from, self.backup_path(idx + 1))?;
                }
                let from_gz = gz_path(&from);
                if from_gz.exists() {
                    fs::rename(&from_gz, gz_path(&self.backup_path(idx + 1)))?;
                }
            }
            let newest = self.backup_path(1);
            fs::rename(&self.path, &newest)?;
            if self.rotation.compress {
                let handle = thread::Builder::new()
                    .name("notify-gzip".into())
                    .spawn(move || compress_in_place(&newest))?;
                self.compressing = Some(handle);
            }
        }
        self.file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }
}

impl Drop for RotatingWriter {
    fn drop(&mut self) {
        if let Err(e) = self.wait_for_compression() {
            tracing::warn!(error = %e, "failed to compress rotated notification log");
        }
    }
}

fn gz_path(path: &Path) -> PathBuf {
    let mut name = path.to_path_buf().into_os_string();
    name.push(".gz");
    PathBuf::from(name)
}

fn compress_in_place(path: &Path) -> io::Result<()> {
    let data = fs::read(path)?;
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&data)?;
    fs::write(gz_path(path), gz.finish()?)?;
    fs::remove_file(path)
}

/// Shared handle to the notification channel. Cheap to clone.
#[derive(Clone)]
pub struct NotificationSink {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
    log_stdout: bool,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
    log_file_size_bytes: Arc<AtomicU64>,
}

impl NotificationSink {
    pub fn new(writer: Option<RotatingWriter>, log_stdout: bool) -> Self {
        Self {
            writer: writer.map(|w| Arc::new(Mutex::new(w))),
            log_stdout,
            lines_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
            log_file_size_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sink that only reports through `tracing`.
    pub fn disabled() -> Self {
        Self::new(None, true)
    }

    /// Report an oversized submission before it is persisted.
    pub fn notify_anomaly(
        &self,
        action: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
        data: &FieldMap,
    ) {
        if self.log_stdout {
            tracing::warn!(
                target: "honeypot::notify",
                action,
                ip = ip.unwrap_or("-"),
                user_agent = user_agent.unwrap_or("-"),
                fields = %serde_json::to_string(data).unwrap_or_default(),
                "length attack detected"
            );
        }
        self.append(serde_json::json!({
            "schemaVersion": NOTIFICATION_SCHEMA_VERSION,
            "ts": chrono::Utc::now().to_rfc3339(),
            "kind": "length_attack",
            "action": action,
            "ip": ip,
            "userAgent": user_agent,
            "data": data,
        }));
    }

    pub fn notify_persistence_failure(&self, action: &str, ip: Option<&str>, error: &StoreError) {
        tracing::error!(
            target: "honeypot::notify",
            action,
            ip = ip.unwrap_or("-"),
            error = %error,
            "failed to persist activity event"
        );
        self.append(serde_json::json!({
            "schemaVersion": NOTIFICATION_SCHEMA_VERSION,
            "ts": chrono::Utc::now().to_rfc3339(),
            "kind": "persistence_failure",
            "action": action,
            "ip": ip,
            "error": error.to_string(),
        }));
    }

    pub fn notify_recorded(&self, action: &str, id: EventId) {
        tracing::debug!(target: "honeypot::notify", action, id, "activity event recorded");
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    pub fn log_file_size_bytes(&self) -> u64 {
        self.log_file_size_bytes.load(Ordering::Relaxed)
    }

    fn append(&self, payload: serde_json::Value) {
        let Some(writer) = self.writer.as_ref() else {
            return;
        };
        let line = payload.to_string();
        let Ok(mut guard) = writer.lock() else {
            self.write_errors_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("notification writer poisoned; line dropped");
            return;
        };
        match guard.write_line(&line) {
            Ok(()) => {
                self.lines_total.fetch_add(1, Ordering::Relaxed);
                if let Some(size) = guard.current_size() {
                    self.log_file_size_bytes.store(size, Ordering::Relaxed);
                }
            }
            Err(e) => {
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "failed to write notification line");
            }
        }
    }
}
