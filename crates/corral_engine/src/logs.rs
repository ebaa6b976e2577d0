use corral_core::prelude::*;

use chrono::Utc;
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};
use tokio::sync::Mutex;

#[derive(Default)]
struct JobLog {
    entries: Vec<LogEntry>,
}

/// Append-only per-job logs with gap-free sequence numbers.
///
/// Each job has its own lock, so appends to different jobs never contend.
pub struct LogStore<B> {
    logs: RwLock<HashMap<String, Arc<Mutex<JobLog>>>>,
    backend: B,
}

impl<B: StateBackend> LogStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            backend,
        }
    }

    /// Restores logs loaded from the backend. Entries are expected in id order.
    pub fn restore(&self, logs: HashMap<String, Vec<LogEntry>>) {
        let mut map = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        for (job_id, mut entries) in logs {
            entries.sort_by_key(|e| e.id);
            map.insert(job_id, Arc::new(Mutex::new(JobLog { entries })));
        }
    }

    fn get(&self, job_id: &str) -> Option<Arc<Mutex<JobLog>>> {
        self.logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }

    fn get_or_create(&self, job_id: &str) -> Arc<Mutex<JobLog>> {
        if let Some(log) = self.get(job_id) {
            return log;
        }
        self.logs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job_id.to_string())
            .or_default()
            .clone()
    }

    /// Appends one entry and returns it with its assigned id.
    pub async fn append(&self, job_id: &str, level: LogLevel, message: impl Into<String>) -> LogEntry {
        let log = self.get_or_create(job_id);
        let mut log = log.lock().await;
        let entry = LogEntry {
            id: log.entries.last().map_or(1, |e| e.id + 1),
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };
        log.entries.push(entry.clone());

        // Persisted under the job lock so the stored order matches the ids.
        if let Err(e) = self.backend.append_log(job_id, &entry).await {
            tracing::warn!("Failed to persist log entry {} of job {job_id}: {e}", entry.id);
        }
        entry
    }

    /// Entries with `id > after_id`, plus the highest id seen.
    ///
    /// Unknown jobs yield no entries and `0`.
    pub async fn since(&self, job_id: &str, after_id: u64) -> (Vec<LogEntry>, u64) {
        let Some(log) = self.get(job_id) else {
            return (Vec::new(), 0);
        };
        let log = log.lock().await;
        let start = log.entries.partition_point(|e| e.id <= after_id);
        let entries = log.entries[start..].to_vec();
        let last_id = entries.last().map_or(after_id, |e| e.id);
        (entries, last_id)
    }

    pub async fn all(&self, job_id: &str) -> Vec<LogEntry> {
        self.since(job_id, 0).await.0
    }

    pub fn remove(&self, job_id: &str) {
        self.logs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    #[tokio::test]
    async fn test_ids_start_at_one_and_are_contiguous() {
        let store = LogStore::new(MemoryBackend::new());
        for i in 0..5 {
            let entry = store.append("job", LogLevel::Info, format!("line {i}")).await;
            assert_eq!(entry.id, i + 1);
        }
        let (entries, last) = store.since("job", 0).await;
        assert_eq!(entries.len(), 5);
        assert_eq!(last, 5);
    }

    #[tokio::test]
    async fn test_since_is_idempotent_and_cursor_based() {
        let store = LogStore::new(MemoryBackend::new());
        store.append("job", LogLevel::Info, "a").await;
        store.append("job", LogLevel::Info, "b").await;

        let (first, last) = store.since("job", 1).await;
        let (again, last_again) = store.since("job", 1).await;
        assert_eq!(first, again);
        assert_eq!(last, last_again);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message, "b");

        store.append("job", LogLevel::Warn, "c").await;
        let (next, next_last) = store.since("job", last).await;
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, last + 1);
        assert_eq!(next_last, 3);
    }

    #[tokio::test]
    async fn test_cursor_past_end_returns_cursor() {
        let store = LogStore::new(MemoryBackend::new());
        store.append("job", LogLevel::Info, "a").await;
        let (entries, last) = store.since("job", 7).await;
        assert!(entries.is_empty());
        assert_eq!(last, 7);
    }

    #[tokio::test]
    async fn test_unknown_job_is_empty() {
        let store = LogStore::new(MemoryBackend::new());
        let (entries, last) = store.since("missing", 3).await;
        assert!(entries.is_empty());
        assert_eq!(last, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_are_gap_free() {
        let store = Arc::new(LogStore::new(MemoryBackend::new()));
        let mut handles = Vec::new();
        for t in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    store.append("job", LogLevel::Info, format!("{t}-{i}")).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let entries = store.all("job").await;
        assert_eq!(entries.len(), 200);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.id, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn test_restore_continues_sequence() {
        let backend = MemoryBackend::new();
        let store = LogStore::new(backend.clone());
        store.append("job", LogLevel::Info, "before restart").await;

        let snapshot = backend.load().await.unwrap();
        let restored = LogStore::new(backend);
        restored.restore(snapshot.logs);
        let entry = restored.append("job", LogLevel::Warn, "after restart").await;
        assert_eq!(entry.id, 2);
    }
}
