//! The task tools: create, complete, list, and current date.

use async_trait::async_trait;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde_json::json;
use std::fmt::Write;
use std::sync::Arc;
use taskpin_core::clock::Clock;
use taskpin_core::context::AppContext;
use taskpin_core::error::{TaskListError, TaskpinError, ToolError};
use taskpin_core::tasks::{NewTask, Task, TaskListService, classify, find_list_by_title};
use taskpin_core::types::ToolOutput;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::dates::{due_instant, parse_due};
use crate::registry::{Tool, ToolRegistry};
use crate::schema::{ArgumentSchema, Arguments, FieldSpec, Rule, Validator};

/// What every task tool shares: the service, the list it works on, and
/// the injected clock and time zone.
pub struct TaskToolContext {
    service: Arc<dyn TaskListService>,
    clock: Arc<dyn Clock>,
    tz: Tz,
    list_title: String,
    list_id: Mutex<Option<String>>,
}

impl TaskToolContext {
    pub fn new(
        service: Arc<dyn TaskListService>,
        clock: Arc<dyn Clock>,
        tz: Tz,
        list_title: impl Into<String>,
    ) -> Self {
        Self {
            service,
            clock,
            tz,
            list_title: list_title.into(),
            list_id: Mutex::new(None),
        }
    }

    pub fn from_app(ctx: &AppContext) -> Result<Self, TaskpinError> {
        Ok(Self::new(
            ctx.tasks.clone(),
            ctx.clock.clone(),
            ctx.config.sync.tz()?,
            ctx.config.tasks.list_title.clone(),
        ))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn list_id(&self) -> Result<String, TaskListError> {
        let mut cached = self.list_id.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }
        let list = find_list_by_title(self.service.as_ref(), &self.list_title).await?;
        debug!(list_id = %list.id, title = %list.title, "Resolved task list");
        *cached = Some(list.id.clone());
        Ok(list.id)
    }

    async fn forget_list(&self) {
        *self.list_id.lock().await = None;
    }

    /// Every task in upstream listing order.
    async fn listing(&self) -> Result<Vec<Task>, TaskListError> {
        let list_id = self.list_id().await?;
        match self.service.list_tasks(&list_id).await {
            Ok(tasks) => Ok(tasks),
            Err(e) => {
                if matches!(e, TaskListError::NotFound { .. }) {
                    self.forget_list().await;
                }
                Err(e)
            }
        }
    }

    /// Non-completed tasks split into pending and passed, each in listing order.
    async fn open_tasks(&self) -> Result<(Vec<Task>, Vec<Task>), TaskListError> {
        let tasks = self.listing().await?;
        let classified = classify(&tasks, self.now());
        Ok((classified.pending, classified.passed))
    }
}

/// Register the four task tools against `ctx`.
pub fn register_task_tools(
    registry: &mut ToolRegistry,
    ctx: Arc<TaskToolContext>,
) -> Result<(), ToolError> {
    registry.register(Arc::new(CreateTaskTool { ctx: ctx.clone() }))?;
    registry.register(Arc::new(CompleteTaskTool { ctx: ctx.clone() }))?;
    registry.register(Arc::new(GetPendingAndPassedTasksTool { ctx: ctx.clone() }))?;
    registry.register(Arc::new(GetCurrentDateTool { ctx }))?;
    Ok(())
}

/// A registry holding the task tools for this application.
pub fn task_registry(app: &AppContext) -> Result<ToolRegistry, TaskpinError> {
    let mut registry = ToolRegistry::new();
    register_task_tools(&mut registry, Arc::new(TaskToolContext::from_app(app)?))?;
    Ok(registry)
}

fn due_label(task: &Task) -> String {
    task.due
        .map(|d| d.date_naive().format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "none".to_string())
}

pub struct CreateTaskTool {
    ctx: Arc<TaskToolContext>,
}

impl CreateTaskTool {
    const NAME: &'static str = "create_task";

    fn notes(args: &Arguments) -> Option<String> {
        let lines: Vec<String> = [
            args.str("priority")
                .filter(|p| !p.is_empty())
                .map(|p| format!("Priority: {}", p)),
            args.str("description")
                .filter(|d| !d.is_empty())
                .map(|d| format!("Description: {}", d)),
        ]
        .into_iter()
        .flatten()
        .collect();
        (!lines.is_empty()).then(|| lines.join("\n"))
    }
}

#[async_trait]
impl Tool for CreateTaskTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Create a homework task. Pass the due date as the user said it \
         (e.g. 'Friday', 'tomorrow', '2024-03-08'); it is resolved against today's date."
    }

    fn schema(&self) -> ArgumentSchema {
        ArgumentSchema::new()
            .field(
                FieldSpec::required("title", "Title of the task")
                    .with(Validator::NonBlank),
            )
            .field(FieldSpec::optional(
                "due",
                "Due date, either ISO (YYYY-MM-DD) or natural language",
            ))
            .field(FieldSpec::optional(
                "priority",
                "Priority of the task, stored in its notes",
            ))
            .field(FieldSpec::optional(
                "description",
                "Longer description of the task",
            ))
    }

    async fn execute(&self, args: Arguments) -> Result<ToolOutput, ToolError> {
        let title = args.str("title").unwrap_or_default().to_string();
        let due = match args.str("due").filter(|d| !d.is_empty()) {
            Some(raw) => {
                let date = parse_due(raw, self.ctx.now(), self.ctx.tz)
                    .map_err(|e| ToolError::invalid(Self::NAME, "due", e.to_string()))?;
                Some(due_instant(date))
            }
            None => None,
        };

        let list_id = self
            .ctx
            .list_id()
            .await
            .map_err(|e| ToolError::upstream(Self::NAME, &e))?;
        let created = self
            .ctx
            .service
            .insert_task(
                &list_id,
                NewTask {
                    title: title.clone(),
                    due,
                    notes: Self::notes(&args),
                },
            )
            .await
            .map_err(|e| ToolError::upstream(Self::NAME, &e))?;

        info!(task_id = %created.id, title = %created.title, "Created task");
        Ok(ToolOutput::text(format!(
            "Created task '{}' with ID: {}",
            created.title, created.id
        ))
        .with_metadata("task_id", json!(created.id))
        .with_metadata("due", json!(due_label(&created))))
    }
}

pub struct CompleteTaskTool {
    ctx: Arc<TaskToolContext>,
}

impl CompleteTaskTool {
    const NAME: &'static str = "complete_task";
}

#[async_trait]
impl Tool for CompleteTaskTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Mark a task as completed, by its ID or by its exact title. Give exactly one of the two."
    }

    fn schema(&self) -> ArgumentSchema {
        ArgumentSchema::new()
            .field(
                FieldSpec::optional("id", "ID of the task")
                    .with(Validator::NonBlank),
            )
            .field(
                FieldSpec::optional("title", "Exact title of the task")
                    .with(Validator::NonBlank),
            )
            .rule(Rule::ExactlyOneOf(&["id", "title"]))
    }

    async fn execute(&self, args: Arguments) -> Result<ToolOutput, ToolError> {
        let task_id = match (args.str("id"), args.str("title")) {
            (Some(id), _) => id.to_string(),
            (None, Some(title)) => {
                let tasks = self
                    .ctx
                    .listing()
                    .await
                    .map_err(|e| ToolError::upstream(Self::NAME, &e))?;
                let wanted = title.to_lowercase();
                // Duplicate titles resolve to the first open one in listing order.
                match tasks
                    .iter()
                    .find(|t| !t.is_completed() && t.title.to_lowercase() == wanted)
                {
                    Some(task) => task.id.clone(),
                    None => {
                        return Ok(ToolOutput::text(format!(
                            "No open task titled '{}' was found.",
                            title
                        )));
                    }
                }
            }
            (None, None) => {
                return Err(ToolError::invalid(
                    Self::NAME,
                    "id|title",
                    "one of these is required",
                ));
            }
        };

        let list_id = self
            .ctx
            .list_id()
            .await
            .map_err(|e| ToolError::upstream(Self::NAME, &e))?;
        match self.ctx.service.complete_task(&list_id, &task_id).await {
            Ok(task) => {
                info!(task_id = %task.id, title = %task.title, "Completed task");
                Ok(
                    ToolOutput::text(format!("Completed task '{}' (ID: {})", task.title, task.id))
                        .with_metadata("task_id", json!(task.id)),
                )
            }
            Err(TaskListError::NotFound { .. }) => Ok(ToolOutput::text(format!(
                "No task with ID '{}' was found.",
                task_id
            ))),
            Err(e) => Err(ToolError::upstream(Self::NAME, &e)),
        }
    }
}

pub struct GetPendingAndPassedTasksTool {
    ctx: Arc<TaskToolContext>,
}

#[async_trait]
impl Tool for GetPendingAndPassedTasksTool {
    fn name(&self) -> &str {
        "get_pending_and_passed_tasks"
    }

    fn description(&self) -> &str {
        "List every open task with its ID and due date: pending ones first, then the ones whose due date has passed."
    }

    fn schema(&self) -> ArgumentSchema {
        ArgumentSchema::new()
    }

    async fn execute(&self, _args: Arguments) -> Result<ToolOutput, ToolError> {
        let (pending, passed) = self
            .ctx
            .open_tasks()
            .await
            .map_err(|e| ToolError::upstream(self.name(), &e))?;

        let mut out = String::new();
        for (heading, tasks) in [("Pending tasks", &pending), ("Passed tasks", &passed)] {
            let _ = writeln!(out, "{}:", heading);
            if tasks.is_empty() {
                out.push_str("- none\n");
            }
            for task in tasks {
                let _ = writeln!(
                    out,
                    "- {} (ID: {}, due: {})",
                    task.title,
                    task.id,
                    due_label(task)
                );
            }
        }
        Ok(ToolOutput::text(out.trim_end())
            .with_metadata("pending", json!(pending.len()))
            .with_metadata("passed", json!(passed.len())))
    }
}

pub struct GetCurrentDateTool {
    ctx: Arc<TaskToolContext>,
}

impl GetCurrentDateTool {
    const NAME: &'static str = "get_current_date";
}

#[async_trait]
impl Tool for GetCurrentDateTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Get the current date and time. Defaults to RFC 3339; pass a strftime pattern (e.g. '%A %d.%m.%Y') for other formats."
    }

    fn schema(&self) -> ArgumentSchema {
        ArgumentSchema::new().field(FieldSpec::optional(
            "format",
            "'rfc3339' (default), 'rfc2822', 'date', or a strftime pattern",
        ))
    }

    async fn execute(&self, args: Arguments) -> Result<ToolOutput, ToolError> {
        let now = self.ctx.now().with_timezone(&self.ctx.tz);
        let text = match args.str("format").filter(|f| !f.is_empty()) {
            None | Some("rfc3339") | Some("iso") => now.to_rfc3339_opts(SecondsFormat::Secs, true),
            Some("rfc2822") => now.to_rfc2822(),
            Some("date") => now.format("%Y-%m-%d").to_string(),
            Some(pattern) => {
                let items: Vec<Item<'_>> = StrftimeItems::new(pattern).collect();
                let bad = || {
                    ToolError::invalid(
                        Self::NAME,
                        "format",
                        format!("'{}' is not a valid strftime pattern", pattern),
                    )
                };
                if items.iter().any(|i| matches!(i, Item::Error)) {
                    return Err(bad());
                }
                let mut out = String::new();
                write!(out, "{}", now.format_with_items(items.iter())).map_err(|_| bad())?;
                out
            }
        };
        Ok(ToolOutput::text(text).with_metadata("timezone", json!(self.ctx.tz.name())))
    }
}
