use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of lifecycle operations a [`Job`] can perform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Install,
    Uninstall,
    Reinstall,
    Update,
    Edit,
    Reconfigure,
    StackInstall,
    StackUninstall,
    StackEdit,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Install => "install",
            JobKind::Uninstall => "uninstall",
            JobKind::Reinstall => "reinstall",
            JobKind::Update => "update",
            JobKind::Edit => "edit",
            JobKind::Reconfigure => "reconfigure",
            JobKind::StackInstall => "stack-install",
            JobKind::StackUninstall => "stack-uninstall",
            JobKind::StackEdit => "stack-edit",
        }
    }

    /// Whether the job allocates a new container that nothing else owns until it completes.
    pub fn creates_container(&self) -> bool {
        matches!(
            self,
            JobKind::Install
                | JobKind::Reinstall
                | JobKind::Update
                | JobKind::Edit
                | JobKind::StackInstall
                | JobKind::StackEdit
        )
    }

    pub fn is_stack(&self) -> bool {
        matches!(
            self,
            JobKind::StackInstall | JobKind::StackUninstall | JobKind::StackEdit
        )
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Transitions only move forward: queued -> running -> terminal, or straight to terminal.
    pub fn can_advance_to(&self, next: JobState) -> bool {
        match self {
            JobState::Queued => next != JobState::Queued,
            JobState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// An asynchronous lifecycle operation tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    /// The app id or stack id the job operates on.
    pub target: String,
    /// Display name of the app or stack.
    pub name: String,
    pub state: JobState,
    /// The pipeline step currently executing, e.g. `create_container`.
    pub step: Option<String>,
    /// Container allocated or targeted by the job.
    pub ctid: Option<u32>,
    pub install_id: Option<String>,
    pub stack_id: Option<String>,
    /// Present iff the job failed.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(kind: JobKind, target: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            target: target.into(),
            name: name.into(),
            state: JobState::Queued,
            step: None,
            ctid: None,
            install_id: None,
            stack_id: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn with_install(mut self, install_id: impl Into<String>) -> Self {
        self.install_id = Some(install_id.into());
        self
    }

    pub fn with_stack(mut self, stack_id: impl Into<String>) -> Self {
        self.stack_id = Some(stack_id.into());
        self
    }

    pub fn with_ctid(mut self, ctid: Option<u32>) -> Self {
        self.ctid = ctid;
        self
    }

    /// Applies a state transition. Returns `false` and leaves the job untouched if the
    /// transition would move backwards or out of a terminal state.
    pub fn advance(&mut self, next: JobState, error: Option<String>) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        let now = Utc::now();
        self.state = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.finished_at = Some(now);
            self.error = if next == JobState::Failed {
                Some(error.unwrap_or_else(|| "unknown error".to_string()))
            } else {
                None
            };
        }
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
}

/// One line of a job's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    /// Sequence number within the job, starting at 1 and gap-free.
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_is_queued() {
        let job = Job::new(JobKind::Install, "nginx", "Nginx");
        assert_eq!(job.state, JobState::Queued);
        assert!(job.error.is_none());
        assert!(job.finished_at.is_none());
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let mut job = Job::new(JobKind::Install, "nginx", "Nginx");
        assert!(job.advance(JobState::Running, None));
        assert!(!job.advance(JobState::Queued, None));
        assert!(job.advance(JobState::Completed, None));
        assert!(!job.advance(JobState::Failed, Some("late".into())));
        assert_eq!(job.state, JobState::Completed);
        assert!(job.error.is_none());
    }

    #[test]
    fn test_failed_job_carries_error() {
        let mut job = Job::new(JobKind::Uninstall, "nginx", "Nginx");
        job.advance(JobState::Running, None);
        job.advance(JobState::Failed, Some("destroy: timeout".into()));
        assert_eq!(job.error.as_deref(), Some("destroy: timeout"));
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_cancel_before_start() {
        let mut job = Job::new(JobKind::StackInstall, "s1", "Media");
        assert!(job.advance(JobState::Cancelled, None));
        assert!(job.is_terminal());
        assert!(job.error.is_none());
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&JobKind::StackUninstall).unwrap();
        assert_eq!(json, "\"stack-uninstall\"");
    }
}
