//! Plain-text metric files.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use super::console::format_metrics;
use super::MetricLogger;
use crate::Result;

/// Appends `Step N | key:value ...` lines to `<log_dir>/log_<unix_ts>.txt`.
pub struct DiskLogger {
    log_dir: PathBuf,
    path: PathBuf,
    file: Mutex<File>,
}

impl DiskLogger {
    pub fn new(log_dir: impl AsRef<Path>) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        fs::create_dir_all(&log_dir)?;
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let path = log_dir.join(format!("log_{}.txt", ts));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::debug!(path = %path.display(), "Writing metrics to disk");

        Ok(Self {
            log_dir,
            path,
            file: Mutex::new(file),
        })
    }

    /// File receiving the metric lines.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, line: &str) {
        if let Ok(mut file) = self.file.lock() {
            if let Err(e) = writeln!(file, "{}", line) {
                tracing::warn!("Failed to write metrics: {}", e);
            }
        }
    }
}

impl MetricLogger for DiskLogger {
    fn log(&self, name: &str, value: f64, step: u64) {
        self.write_line(&format!("Step {} | {}:{}", step, name, value));
    }

    fn log_dict(&self, metrics: &BTreeMap<String, f64>, step: u64) {
        self.write_line(&format_metrics(metrics, step));
    }

    fn log_config(&self, config: &Value) {
        let path = self.log_dir.join("config.json");
        let written = serde_json::to_string_pretty(config)
            .map_err(std::io::Error::from)
            .and_then(|text| fs::write(&path, text));
        if let Err(e) = written {
            tracing::warn!(path = %path.display(), "Failed to write config: {}", e);
        }
    }

    fn close(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}
