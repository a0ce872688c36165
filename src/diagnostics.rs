use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::AppResult;

const BUFFER_FILE: &str = "diagnostics.jsonl";

#[derive(Clone)]
pub struct DiagnosticSink {
    enabled: bool,
    queue: Arc<Mutex<Vec<DiagnosticEvent>>>,
    buffer_path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
}

impl DiagnosticSink {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let buffer_path = data_dir.join(BUFFER_FILE);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&buffer_path)?;

        Ok(Self {
            enabled: config.diagnostics_enabled,
            queue: Arc::new(Mutex::new(Vec::new())),
            buffer_path,
            batch_size: config.diagnostics_batch_size.max(1),
            max_file_bytes: config.diagnostics_max_bytes,
            max_file_count: config.diagnostics_max_files.max(1),
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            queue: Arc::new(Mutex::new(Vec::new())),
            buffer_path: PathBuf::from(BUFFER_FILE),
            batch_size: 1,
            max_file_bytes: 0,
            max_file_count: 1,
        }
    }

    pub fn record(&self, name: impl Into<String>, payload: serde_json::Value) -> AppResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let mut queue = self.queue.lock();
        queue.push(DiagnosticEvent::new(name.into(), payload));
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    pub fn emit(&self, name: &str, payload: serde_json::Value) {
        if let Err(err) = self.record(name, payload) {
            warn!(?err, event = name, "failed to record diagnostic event");
        }
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer_path
    }

    fn persist_locked(&self, queue: &mut Vec<DiagnosticEvent>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut lines = Vec::with_capacity(queue.len());
        let mut incoming = 0_u64;
        for event in queue.iter() {
            let line = serde_json::to_vec(event)?;
            incoming += (line.len() + 1) as u64;
            lines.push(line);
        }

        self.rotate_if_needed(incoming)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.buffer_path)?;
        for line in &lines {
            file.write_all(line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        queue.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming_bytes: u64) -> AppResult<()> {
        let current_size = fs::metadata(&self.buffer_path)
            .map(|m| m.len())
            .unwrap_or(0);
        if current_size == 0 || current_size + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }

        if self.max_file_count > 1 {
            let rotated_path = self.directory().join(format!(
                "{}-{}.jsonl",
                self.buffer_stem(),
                Utc::now().format("%Y%m%d%H%M%S%f")
            ));
            fs::rename(&self.buffer_path, &rotated_path)?;
            self.prune_rotations()?;
        }

        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.buffer_path)?;
        Ok(())
    }

    fn prune_rotations(&self) -> AppResult<()> {
        let prefix = format!("{}-", self.buffer_stem());
        let mut rotations = fs::read_dir(self.directory())?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name().to_string_lossy().to_string();
                (name.starts_with(&prefix) && name.ends_with(".jsonl")).then(|| entry.path())
            })
            .collect::<Vec<_>>();

        // Rotation names embed a sortable timestamp.
        rotations.sort();
        let allowed = self.max_file_count.saturating_sub(1);
        if rotations.len() > allowed {
            let excess = rotations.len() - allowed;
            for path in rotations.into_iter().take(excess) {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }

    fn directory(&self) -> &Path {
        self.buffer_path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn buffer_stem(&self) -> String {
        self.buffer_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "diagnostics".into())
    }
}

#[derive(Debug, Serialize)]
pub struct DiagnosticEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl DiagnosticEvent {
    fn new(name: String, payload: serde_json::Value) -> Self {
        Self {
            name,
            timestamp: Utc::now(),
            payload,
        }
    }
}
