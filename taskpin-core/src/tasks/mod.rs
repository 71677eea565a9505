//! Task-list service boundary.
//!
//! [`TaskListService`] is the typed façade over the external system of record.
//! Implementations are pure request/response: nothing here caches tasks
//! across calls.

pub mod classify;
pub mod google;
pub mod memory;
pub mod render;

use crate::error::TaskListError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use classify::{Category, Classified, categorize, classify};
pub use google::GoogleTasksClient;
pub use memory::{InMemoryTaskList, TaskCall, TaskOp};
pub use render::{Locale, Snapshot, render};

/// Completion state as reported by the task-list service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TaskStatus {
    #[default]
    #[serde(rename = "needsAction")]
    NeedsAction,
    #[serde(rename = "completed")]
    Completed,
}

/// One assignment. Identity is `id`; titles may repeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Task {
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// A task list's identity as returned by `listTaskLists`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskListRef {
    pub id: String,
    pub title: String,
}

/// Fields for a task about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewTask {
    pub title: String,
    pub due: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// The external task-list service.
///
/// Every call may fail `Transient` (retry later) or `Permanent` (do not
/// retry); see [`TaskListError::class`].
#[async_trait]
pub trait TaskListService: Send + Sync {
    /// All task lists visible to the credential.
    async fn list_task_lists(&self) -> Result<Vec<TaskListRef>, TaskListError>;

    /// Tasks in a list, including completed ones, in upstream order.
    async fn list_tasks(&self, list_id: &str) -> Result<Vec<Task>, TaskListError>;

    async fn insert_task(&self, list_id: &str, task: NewTask) -> Result<Task, TaskListError>;

    /// Mark a task completed. Completing a completed task succeeds unchanged.
    async fn complete_task(&self, list_id: &str, task_id: &str) -> Result<Task, TaskListError>;
}

/// Case-insensitive exact title match over `list_task_lists`.
pub async fn find_list_by_title(
    service: &dyn TaskListService,
    title: &str,
) -> Result<TaskListRef, TaskListError> {
    let wanted = title.trim().to_lowercase();
    service
        .list_task_lists()
        .await?
        .into_iter()
        .find(|list| list.title.trim().to_lowercase() == wanted)
        .ok_or_else(|| TaskListError::ListNotFound {
            title: title.to_string(),
        })
}
