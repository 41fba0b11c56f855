use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Lifecycle state of a tracked task tree. `Completed` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskTreeState {
    Active,
    Completed,
}

impl Display for TaskTreeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskTreeState::Active => write!(f, "active"),
            TaskTreeState::Completed => write!(f, "completed"),
        }
    }
}

/// One admitted task tree. Created before the tree runs, closed once when it finishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct TaskTreeTracking {
    pub task_tree_id: String,
    pub user_id: String,
    pub is_llm_consuming: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskTreeTracking {
    pub fn state(&self) -> TaskTreeState {
        if self.completed_at.is_some() {
            TaskTreeState::Completed
        } else {
            TaskTreeState::Active
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == TaskTreeState::Active
    }
}

/// Result of `CounterStore::complete_task_tree` for a known tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskTreeCompletion {
    pub record: TaskTreeTracking,
    /// True only for the single call that moved the tree from active to completed.
    pub transitioned: bool,
}

/// What `LifecycleTracker::complete` did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompletionOutcome {
    /// The tree was active; it is now completed and its concurrency slots were released.
    Completed { record: TaskTreeTracking },
    /// The tree had already been completed; nothing changed.
    AlreadyCompleted { record: TaskTreeTracking },
    /// No tracking row exists for the id; nothing changed.
    Unknown,
    /// Admission control is disabled; nothing was recorded.
    Disabled,
    /// The counter store failed; the failure was logged and swallowed.
    StorageError,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracking(completed_at: Option<DateTime<Utc>>) -> TaskTreeTracking {
        TaskTreeTracking {
            task_tree_id: "t1".to_string(),
            user_id: "u1".to_string(),
            is_llm_consuming: false,
            started_at: Utc::now(),
            completed_at,
        }
    }

    #[test]
    fn test_state_follows_completed_at() {
        assert_eq!(tracking(None).state(), TaskTreeState::Active);
        assert!(tracking(None).is_active());
        assert_eq!(tracking(Some(Utc::now())).state(), TaskTreeState::Completed);
    }

    #[test]
    fn test_completion_outcome_serializes_with_tag() {
        let json = serde_json::to_value(CompletionOutcome::Unknown).unwrap();
        assert_eq!(json["outcome"], "unknown");
    }
}
