use corral_core::prelude::*;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

#[derive(Default)]
struct Records {
    jobs: HashMap<String, Job>,
    logs: HashMap<String, Vec<LogEntry>>,
    installs: HashMap<String, Install>,
    stacks: HashMap<String, Stack>,
}

/// Keeps state in process memory only. Clones share the same records,
/// so a second engine built from a clone sees what the first one wrote.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    records: Arc<Mutex<Records>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a job as-is, bypassing the engine. Used to stage state for recovery.
    pub fn seed_job(&self, job: Job) {
        self.records().jobs.insert(job.id.clone(), job);
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.records().jobs.get(id).cloned()
    }

    pub fn install_count(&self) -> usize {
        self.records().installs.len()
    }
}

impl StateBackend for MemoryBackend {
    async fn load(&self) -> Result<StateSnapshot, StorageError> {
        let records = self.records();
        Ok(StateSnapshot {
            jobs: records.jobs.values().cloned().collect(),
            logs: records.logs.clone(),
            installs: records.installs.values().cloned().collect(),
            stacks: records.stacks.values().cloned().collect(),
        })
    }

    async fn write_job(&self, job: &Job) -> Result<(), StorageError> {
        self.records().jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<(), StorageError> {
        let mut records = self.records();
        records.jobs.remove(id);
        records.logs.remove(id);
        Ok(())
    }

    async fn append_log(&self, job_id: &str, entry: &LogEntry) -> Result<(), StorageError> {
        self.records()
            .logs
            .entry(job_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn write_install(&self, install: &Install) -> Result<(), StorageError> {
        self.records()
            .installs
            .insert(install.id.clone(), install.clone());
        Ok(())
    }

    async fn delete_install(&self, id: &str) -> Result<(), StorageError> {
        self.records().installs.remove(id);
        Ok(())
    }

    async fn write_stack(&self, stack: &Stack) -> Result<(), StorageError> {
        self.records().stacks.insert(stack.id.clone(), stack.clone());
        Ok(())
    }

    async fn delete_stack(&self, id: &str) -> Result<(), StorageError> {
        self.records().stacks.remove(id);
        Ok(())
    }
}
