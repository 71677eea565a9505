//! Pending / passed / completed partitioning.

use super::Task;
use chrono::{DateTime, Utc};

/// Derived display category of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Pending,
    Passed,
    Completed,
}

/// The two displayed buckets. Completed tasks are in neither.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classified {
    pub pending: Vec<Task>,
    pub passed: Vec<Task>,
}

impl Classified {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.passed.is_empty()
    }

    /// Pending then passed, each in upstream order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.pending.iter().chain(self.passed.iter())
    }
}

/// Category of one task at `now`. A due date equal to `now` counts as passed.
pub fn categorize(task: &Task, now: DateTime<Utc>) -> Category {
    if task.is_completed() {
        return Category::Completed;
    }
    match task.due {
        Some(due) if due <= now => Category::Passed,
        _ => Category::Pending,
    }
}

/// Split tasks into pending and passed, keeping the input order in each bucket.
pub fn classify(tasks: &[Task], now: DateTime<Utc>) -> Classified {
    let mut out = Classified::default();
    for task in tasks {
        match categorize(task, now) {
            Category::Pending => out.pending.push(task.clone()),
            Category::Passed => out.passed.push(task.clone()),
            Category::Completed => {}
        }
    }
    out
}
