use corral_core::prelude::*;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

/// The logical target an operation claims.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GuardKey {
    App(String),
    Stack(String),
    /// A stack that does not have an id yet.
    StackName(String),
}

impl fmt::Display for GuardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardKey::App(id) => write!(f, "app {id}"),
            GuardKey::Stack(id) => write!(f, "stack {id}"),
            GuardKey::StackName(name) => write!(f, "stack {name:?}"),
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveJob {
    job_id: String,
    kind: JobKind,
}

/// Registry of in-flight operations, one per target.
///
/// Admission checks and registration happen under one short-lived lock that is
/// never held across an await.
#[derive(Default)]
pub struct DuplicateGuard {
    active: Mutex<HashMap<GuardKey, ActiveJob>>,
}

/// Proof of admission. Dropping it releases the target.
#[must_use]
pub struct GuardPermit {
    guard: Arc<DuplicateGuard>,
    key: GuardKey,
    job_id: String,
}

impl GuardPermit {
    pub fn key(&self) -> &GuardKey {
        &self.key
    }
}

impl Drop for GuardPermit {
    fn drop(&mut self) {
        self.guard.release(&self.key, &self.job_id);
    }
}

impl DuplicateGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The id of the job currently holding `key`.
    pub fn active_job(&self, key: &GuardKey) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|a| a.job_id.clone())
    }

    /// Claims `key` for `job_id`.
    ///
    /// Fails if another job holds the key, or if `check` reports a conflict.
    /// `check` runs inside the critical section, so nothing can register in between.
    pub fn admit<F>(
        self: &Arc<Self>,
        key: GuardKey,
        job_id: &str,
        kind: JobKind,
        check: F,
    ) -> Result<GuardPermit, Duplicate>
    where
        F: FnOnce() -> Option<Duplicate>,
    {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = active.get(&key) {
            return Err(Duplicate {
                message: format!(
                    "{key} already has an active {} job ({})",
                    existing.kind, existing.job_id
                ),
                job_id: Some(existing.job_id.clone()),
                ..Default::default()
            });
        }
        if let Some(conflict) = check() {
            return Err(conflict);
        }
        active.insert(
            key.clone(),
            ActiveJob {
                job_id: job_id.to_string(),
                kind,
            },
        );
        Ok(GuardPermit {
            guard: self.clone(),
            key,
            job_id: job_id.to_string(),
        })
    }

    fn release(&self, key: &GuardKey, job_id: &str) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.get(key).is_some_and(|a| a.job_id == job_id) {
            active.remove(key);
        }
    }
}
