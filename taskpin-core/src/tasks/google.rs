//! Google Tasks REST client.

use super::{NewTask, Task, TaskListRef, TaskListService, TaskStatus};
use crate::credentials::CredentialProvider;
use crate::error::TaskListError;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const TASKS_API: &str = "https://tasks.googleapis.com/tasks/v1";

#[derive(Debug, Deserialize)]
struct ListsPage {
    #[serde(default)]
    items: Vec<RemoteTaskList>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteTaskList {
    id: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct TasksPage {
    #[serde(default)]
    items: Vec<RemoteTask>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteTask {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    due: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Serialize)]
struct InsertBody<'a> {
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    due: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a str>,
}

impl RemoteTask {
    fn into_task(self) -> Result<Task, TaskListError> {
        let due = match self.due.as_deref() {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| TaskListError::Decode {
                        message: format!("task {} has unreadable due '{}': {}", self.id, raw, e),
                    })?
                    .with_timezone(&Utc),
            ),
            None => None,
        };
        let status = match self.status.as_deref() {
            Some("completed") => TaskStatus::Completed,
            _ => TaskStatus::NeedsAction,
        };
        Ok(Task {
            id: self.id,
            title: self.title.unwrap_or_default(),
            due,
            status,
            notes: self.notes,
        })
    }
}

/// Talks to the Google Tasks v1 API with bearer tokens from a
/// [`CredentialProvider`].
pub struct GoogleTasksClient {
    client: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl GoogleTasksClient {
    pub fn new(base_url: impl Into<String>, credentials: Arc<dyn CredentialProvider>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<serde_json::Value>,
        subject: &str,
    ) -> Result<T, TaskListError> {
        let token = self.credentials.access_token().await?;
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, url = %url, "Task service request");

        let mut req = self
            .client
            .request(method, &url)
            .bearer_auth(token)
            .query(query);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await.map_err(|e| TaskListError::Network {
            message: e.to_string(),
        })?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| TaskListError::Network {
            message: e.to_string(),
        })?;

        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED {
                warn!("Task service rejected the access token; dropping cached credential");
                self.credentials.invalidate().await;
            }
            return Err(map_http_error(status, &text, subject));
        }

        serde_json::from_str(&text).map_err(|e| TaskListError::Decode {
            message: e.to_string(),
        })
    }
}

/// Map a failed response to the task-list error taxonomy.
fn map_http_error(status: StatusCode, body: &str, subject: &str) -> TaskListError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status.as_u16() {
        401 => TaskListError::AuthExpired,
        429 => TaskListError::RateLimited,
        // Google signals quota exhaustion with 403 + a rate-limit reason.
        403 if body.contains("ateLimitExceeded") => TaskListError::RateLimited,
        404 => TaskListError::NotFound {
            id: subject.to_string(),
        },
        s if s >= 500 => TaskListError::Server { status: s, message },
        _ => TaskListError::InvalidInput {
            message: format!("HTTP {}: {}", status, message),
        },
    }
}

#[async_trait]
impl TaskListService for GoogleTasksClient {
    async fn list_task_lists(&self) -> Result<Vec<TaskListRef>, TaskListError> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("maxResults", "100")];
            if let Some(t) = page_token.as_deref() {
                query.push(("pageToken", t));
            }
            let page: ListsPage = self
                .request(Method::GET, "/users/@me/lists", &query, None, "task lists")
                .await?;
            out.extend(page.items.into_iter().map(|l| TaskListRef {
                id: l.id,
                title: l.title,
            }));
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        Ok(out)
    }

    async fn list_tasks(&self, list_id: &str) -> Result<Vec<Task>, TaskListError> {
        let path = format!("/lists/{}/tasks", urlencoding::encode(list_id));
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("showCompleted", "true"),
                ("showHidden", "true"),
                ("maxResults", "100"),
            ];
            if let Some(t) = page_token.as_deref() {
                query.push(("pageToken", t));
            }
            let page: TasksPage = self
                .request(Method::GET, &path, &query, None, list_id)
                .await?;
            for item in page.items {
                out.push(item.into_task()?);
            }
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        Ok(out)
    }

    async fn insert_task(&self, list_id: &str, task: NewTask) -> Result<Task, TaskListError> {
        let path = format!("/lists/{}/tasks", urlencoding::encode(list_id));
        let body = InsertBody {
            title: &task.title,
            due: task
                .due
                .map(|d| d.to_rfc3339_opts(SecondsFormat::Millis, true)),
            notes: task.notes.as_deref(),
        };
        let body = serde_json::to_value(&body).map_err(|e| TaskListError::InvalidInput {
            message: e.to_string(),
        })?;
        let created: RemoteTask = self
            .request(Method::POST, &path, &[], Some(body), list_id)
            .await?;
        created.into_task()
    }

    async fn complete_task(&self, list_id: &str, task_id: &str) -> Result<Task, TaskListError> {
        let path = format!(
            "/lists/{}/tasks/{}",
            urlencoding::encode(list_id),
            urlencoding::encode(task_id)
        );
        let updated: RemoteTask = self
            .request(
                Method::PATCH,
                &path,
                &[],
                Some(serde_json::json!({ "status": "completed" })),
                task_id,
            )
            .await?;
        updated.into_task()
    }
}
