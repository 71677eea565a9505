//! In-process task-list service for tests and dry runs.

use super::{NewTask, Task, TaskListRef, TaskListService, TaskStatus};
use crate::error::TaskListError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Which service operation a call or injected failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskOp {
    ListTaskLists,
    ListTasks,
    InsertTask,
    CompleteTask,
}

/// A recorded call against [`InMemoryTaskList`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCall {
    ListTaskLists,
    ListTasks { list_id: String },
    InsertTask { list_id: String, task: NewTask },
    CompleteTask { list_id: String, task_id: String },
}

impl TaskCall {
    pub fn op(&self) -> TaskOp {
        match self {
            TaskCall::ListTaskLists => TaskOp::ListTaskLists,
            TaskCall::ListTasks { .. } => TaskOp::ListTasks,
            TaskCall::InsertTask { .. } => TaskOp::InsertTask,
            TaskCall::CompleteTask { .. } => TaskOp::CompleteTask,
        }
    }
}

#[derive(Default)]
struct State {
    lists: Vec<(TaskListRef, Vec<Task>)>,
    calls: Vec<TaskCall>,
    failures: VecDeque<(TaskOp, TaskListError)>,
    next_id: u64,
}

/// Task lists held in memory. Records every call and can be told to fail.
#[derive(Default)]
pub struct InMemoryTaskList {
    state: Mutex<State>,
}

impl InMemoryTaskList {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_list(&self, id: &str, title: &str) {
        self.lock().lists.push((
            TaskListRef {
                id: id.into(),
                title: title.into(),
            },
            Vec::new(),
        ));
    }

    /// Append a task to an existing list. Unknown lists are ignored.
    pub fn push_task(&self, list_id: &str, task: Task) {
        let mut state = self.lock();
        if let Some((_, tasks)) = state.lists.iter_mut().find(|(l, _)| l.id == list_id) {
            tasks.push(task);
        }
    }

    /// Make the next call of `op` fail with `err`. Failures queue in order.
    pub fn fail_next(&self, op: TaskOp, err: TaskListError) {
        self.lock().failures.push_back((op, err));
    }

    pub fn tasks(&self, list_id: &str) -> Vec<Task> {
        self.lock()
            .lists
            .iter()
            .find(|(l, _)| l.id == list_id)
            .map(|(_, t)| t.clone())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<TaskCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn count(&self, op: TaskOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op() == op).count()
    }

    fn enter(&self, call: TaskCall) -> Result<std::sync::MutexGuard<'_, State>, TaskListError> {
        let mut state = self.lock();
        let op = call.op();
        state.calls.push(call);
        if let Some(pos) = state.failures.iter().position(|(o, _)| *o == op)
            && let Some((_, err)) = state.failures.remove(pos)
        {
            return Err(err);
        }
        Ok(state)
    }
}

fn list_mut<'a>(state: &'a mut State, list_id: &str) -> Result<&'a mut Vec<Task>, TaskListError> {
    state
        .lists
        .iter_mut()
        .find(|(l, _)| l.id == list_id)
        .map(|(_, t)| t)
        .ok_or_else(|| TaskListError::NotFound {
            id: list_id.to_string(),
        })
}

#[async_trait]
impl TaskListService for InMemoryTaskList {
    async fn list_task_lists(&self) -> Result<Vec<TaskListRef>, TaskListError> {
        let state = self.enter(TaskCall::ListTaskLists)?;
        Ok(state.lists.iter().map(|(l, _)| l.clone()).collect())
    }

    async fn list_tasks(&self, list_id: &str) -> Result<Vec<Task>, TaskListError> {
        let mut state = self.enter(TaskCall::ListTasks {
            list_id: list_id.into(),
        })?;
        Ok(list_mut(&mut state, list_id)?.clone())
    }

    async fn insert_task(&self, list_id: &str, task: NewTask) -> Result<Task, TaskListError> {
        let mut state = self.enter(TaskCall::InsertTask {
            list_id: list_id.into(),
            task: task.clone(),
        })?;
        if task.title.trim().is_empty() {
            return Err(TaskListError::InvalidInput {
                message: "title is empty".into(),
            });
        }
        state.next_id += 1;
        let created = Task {
            id: format!("task-{}", state.next_id),
            title: task.title,
            due: task.due,
            status: TaskStatus::NeedsAction,
            notes: task.notes,
        };
        list_mut(&mut state, list_id)?.push(created.clone());
        Ok(created)
    }

    async fn complete_task(&self, list_id: &str, task_id: &str) -> Result<Task, TaskListError> {
        let mut state = self.enter(TaskCall::CompleteTask {
            list_id: list_id.into(),
            task_id: task_id.into(),
        })?;
        let task = list_mut(&mut state, list_id)?
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| TaskListError::NotFound {
                id: task_id.to_string(),
            })?;
        task.status = TaskStatus::Completed;
        Ok(task.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_complete_idempotent() {
        let svc = InMemoryTaskList::new();
        svc.add_list("l1", "Schule");
        let task = svc
            .insert_task(
                "l1",
                NewTask {
                    title: "Essay".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let done = svc.complete_task("l1", &task.id).await.unwrap();
        assert!(done.is_completed());
        let again = svc.complete_task("l1", &task.id).await.unwrap();
        assert_eq!(again, done);
        assert_eq!(svc.count(TaskOp::CompleteTask), 2);
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let svc = InMemoryTaskList::new();
        svc.add_list("l1", "Schule");
        let err = svc.complete_task("l1", "nope").await.unwrap_err();
        assert!(matches!(err, TaskListError::NotFound { id } if id == "nope"));
    }

    #[tokio::test]
    async fn test_failure_applies_to_matching_op_only() {
        let svc = InMemoryTaskList::new();
        svc.add_list("l1", "Schule");
        svc.fail_next(TaskOp::ListTasks, TaskListError::RateLimited);

        assert!(svc.list_task_lists().await.is_ok());
        assert!(svc.list_tasks("l1").await.is_err());
        assert!(svc.list_tasks("l1").await.is_ok());
        assert_eq!(svc.call_count(), 3);
    }
}
