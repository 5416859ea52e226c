use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::env;
use std::fmt;
use url::Url;

pub(crate) const ENV_API_TOKEN: &str = "REOPEN_API_TOKEN";
pub(crate) const ENV_API_BASE_URL: &str = "REOPEN_API_BASE_URL";
pub(crate) const DEFAULT_API_BASE_URL: &str = "https://api.todoist.com";

const COMPLETED_TASKS_PATH: &str = "/api/v1/tasks/completed/by_completion_date";

/// A completed task as returned by the upstream service. Read-only: the id
/// feeds the reopen call, the content only ever appears in logs.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub(crate) struct CompletedTask {
    pub id: String,
    #[serde(default)]
    pub content: String,
}

/// One page of completed tasks. A `None` cursor signals the final page.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub(crate) struct CompletedPage {
    pub items: Vec<CompletedTask>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TodoistError {
    TokenMissing,
    InvalidBaseUrl,
    Timeout,
    Unauthorized,
    RateLimited,
    NotFound,
    BadResponse,
    Json,
    Transport,
}

impl TodoistError {
    pub(crate) fn code(&self) -> &'static str {
        match self {
            TodoistError::TokenMissing => "token-missing",
            TodoistError::InvalidBaseUrl => "invalid-base-url",
            TodoistError::Timeout => "timeout",
            TodoistError::Unauthorized => "unauthorized",
            TodoistError::RateLimited => "rate-limited",
            TodoistError::NotFound => "not-found",
            TodoistError::BadResponse => "bad-response",
            TodoistError::Json => "json-error",
            TodoistError::Transport => "transport",
        }
    }
}

impl fmt::Display for TodoistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

pub(crate) struct TodoistClient {
    http: Client,
    base_url: String,
    api_token: String,
}

impl TodoistClient {
    pub(crate) fn new(base_url: &str, api_token: &str) -> Result<Self, TodoistError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        Url::parse(trimmed).map_err(|_| TodoistError::InvalidBaseUrl)?;
        if api_token.trim().is_empty() {
            return Err(TodoistError::TokenMissing);
        }

        // No request timeout: a hung upstream call is left to the host
        // environment's own execution limit. Idle connections are not pooled
        // because each job run is short-lived.
        let http = Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|_| TodoistError::Transport)?;

        Ok(Self {
            http,
            base_url: trimmed.to_string(),
            api_token: api_token.trim().to_string(),
        })
    }

    pub(crate) fn from_env() -> Result<Self, TodoistError> {
        let token = env::var(ENV_API_TOKEN).map_err(|_| TodoistError::TokenMissing)?;
        let base = env::var(ENV_API_BASE_URL)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        Self::new(&base, &token)
    }

    /// Fetch one page of completed tasks within `[since, until)` matching the
    /// filter query. `cursor` continues a previous page sequence.
    pub(crate) async fn completed_tasks_page(
        &self,
        filter_query: &str,
        since: &str,
        until: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<CompletedPage, TodoistError> {
        let url = format!("{}{}", self.base_url, COMPLETED_TASKS_PATH);
        let limit = limit.to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("filter_query", filter_query),
            ("since", since),
            ("until", until),
            ("limit", &limit),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }

        let response = self
            .http
            .get(&url)
            .query(&query)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            return Err(map_status_to_error(response.status()));
        }

        let mut page = response
            .json::<CompletedPage>()
            .await
            .map_err(|_| TodoistError::Json)?;
        // An empty cursor string means the same as an absent one: last page.
        page.next_cursor = page.next_cursor.filter(|c| !c.is_empty());
        Ok(page)
    }

    /// Transition a completed task back to active.
    pub(crate) async fn reopen_task(&self, task_id: &str) -> Result<(), TodoistError> {
        let url = format!("{}/api/v1/tasks/{}/reopen", self.base_url, task_id);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            return Err(map_status_to_error(response.status()));
        }

        Ok(())
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TodoistError {
    if err.is_timeout() {
        return TodoistError::Timeout;
    }
    TodoistError::Transport
}

fn map_status_to_error(status: StatusCode) -> TodoistError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TodoistError::Unauthorized,
        StatusCode::NOT_FOUND => TodoistError::NotFound,
        StatusCode::TOO_MANY_REQUESTS => TodoistError::RateLimited,
        _ => TodoistError::BadResponse,
    }
}
