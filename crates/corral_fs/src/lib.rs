//! # Corral FileSystem Backend
//!
//! A local filesystem state backend for corral.
//!
//! This crate implements the [`StateBackend`] trait, storing jobs, installs and
//! stacks as one JSON document each and job logs as JSON lines.
//!
//! ## Layout
//!
//! ```text
//! <root>/jobs/<job id>.json
//! <root>/logs/<job id>.jsonl
//! <root>/installs/<install id>.json
//! <root>/stacks/<stack id>.json
//! ```
//!
//! ## Features
//!
//! * **Atomic Writes**: Records are written to a temporary file and renamed into place, so a crash never leaves a half-written record behind.
//! * **Tolerant Loading**: Unreadable records and torn log lines are skipped with a warning instead of failing startup.
//!
//! ## Usage
//!
//! ```no_run
//! use corral_fs::FileSystemBackend;
//!
//! let backend = FileSystemBackend::new("./corral_data");
//! ```

use corral_core::prelude::*;

use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};

const JOBS_DIR: &str = "jobs";
const LOGS_DIR: &str = "logs";
const INSTALLS_DIR: &str = "installs";
const STACKS_DIR: &str = "stacks";

async fn atomic_write(path: &Path, data: Vec<u8>) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp_path = path.with_extension("tmp");

    fs::write(&tmp_path, data).await?;
    fs::rename(&tmp_path, path).await?;

    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// Files of `dir` with the given extension, as (stem, path). A missing directory is empty.
async fn entries(dir: &Path, extension: &str) -> Result<Vec<(String, PathBuf)>, StorageError> {
    let mut read = match fs::read_dir(dir).await {
        Ok(read) => read,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::Io(e)),
    };
    let mut found = Vec::new();
    while let Some(entry) = read.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            found.push((stem.to_string(), path.clone()));
        }
    }
    Ok(found)
}

async fn read_records<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StorageError> {
    let mut records = Vec::new();
    for (_, path) in entries(dir, "json").await? {
        let data = fs::read(&path).await?;
        match serde_json::from_slice(&data) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!("Skipping unreadable record {}: {e}", path.display()),
        }
    }
    Ok(records)
}

#[derive(Clone, Debug)]
pub struct FileSystemBackend {
    root: PathBuf,
}

impl FileSystemBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { root: path.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn get_path(&self, dir: &str, id: &str, extension: &str) -> Result<PathBuf, StorageError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::System(format!("invalid record id {id:?}")));
        }
        Ok(self.root.join(dir).join(format!("{id}.{extension}")))
    }

    async fn write_record<T: Serialize>(
        &self,
        dir: &str,
        id: &str,
        record: &T,
    ) -> Result<(), StorageError> {
        let path = self.get_path(dir, id, "json")?;
        let data = serde_json::to_vec_pretty(record)?;
        atomic_write(&path, data).await
    }

    async fn read_logs(&self) -> Result<HashMap<String, Vec<LogEntry>>, StorageError> {
        let mut logs = HashMap::new();
        for (job_id, path) in entries(&self.root.join(LOGS_DIR), "jsonl").await? {
            let data = fs::read_to_string(&path).await?;
            let mut parsed = Vec::new();
            for line in data.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<LogEntry>(line) {
                    Ok(entry) => parsed.push(entry),
                    Err(e) => {
                        tracing::warn!("Skipping torn log line of job {job_id}: {e}");
                    }
                }
            }
            logs.insert(job_id, parsed);
        }
        Ok(logs)
    }
}

impl StateBackend for FileSystemBackend {
    async fn load(&self) -> Result<StateSnapshot, StorageError> {
        Ok(StateSnapshot {
            jobs: read_records(&self.root.join(JOBS_DIR)).await?,
            logs: self.read_logs().await?,
            installs: read_records(&self.root.join(INSTALLS_DIR)).await?,
            stacks: read_records(&self.root.join(STACKS_DIR)).await?,
        })
    }

    async fn write_job(&self, job: &Job) -> Result<(), StorageError> {
        self.write_record(JOBS_DIR, &job.id, job).await
    }

    async fn delete_job(&self, id: &str) -> Result<(), StorageError> {
        remove_if_exists(&self.get_path(JOBS_DIR, id, "json")?).await?;
        remove_if_exists(&self.get_path(LOGS_DIR, id, "jsonl")?).await
    }

    async fn append_log(&self, job_id: &str, entry: &LogEntry) -> Result<(), StorageError> {
        let path = self.get_path(LOGS_DIR, job_id, "jsonl")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn write_install(&self, install: &Install) -> Result<(), StorageError> {
        self.write_record(INSTALLS_DIR, &install.id, install).await
    }

    async fn delete_install(&self, id: &str) -> Result<(), StorageError> {
        remove_if_exists(&self.get_path(INSTALLS_DIR, id, "json")?).await
    }

    async fn write_stack(&self, stack: &Stack) -> Result<(), StorageError> {
        self.write_record(STACKS_DIR, &stack.id, stack).await
    }

    async fn delete_stack(&self, id: &str) -> Result<(), StorageError> {
        remove_if_exists(&self.get_path(STACKS_DIR, id, "json")?).await
    }
}
