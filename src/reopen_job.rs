use crate::log_message;
use crate::todoist::{CompletedTask, TodoistClient};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

pub(crate) const COMPLETION_WINDOW_DAYS: i64 = 90;
pub(crate) const PAGE_LIMIT: u32 = 50;
pub(crate) const REOPEN_FILTER_QUERY: &str = "@tracked | @routine";

/// Where in the run an error was recorded, plus the upstream error code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct JobError {
    pub stage: &'static str,
    pub code: String,
    pub task_id: Option<String>,
}

impl JobError {
    fn new(stage: &'static str, code: impl Into<String>) -> Self {
        Self {
            stage,
            code: code.into(),
            task_id: None,
        }
    }

    fn for_task(stage: &'static str, code: impl Into<String>, task_id: &str) -> Self {
        Self {
            stage,
            code: code.into(),
            task_id: Some(task_id.to_string()),
        }
    }
}

/// Outcome of one reopen cycle. The runner never raises; callers inspect and
/// log the report instead.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct JobReport {
    pub pages: u64,
    pub found: usize,
    pub reopened: usize,
    pub error: Option<JobError>,
}

impl JobReport {
    pub(crate) fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub(crate) fn summary(&self) -> String {
        let mut out = format!(
            "pages={} found={} reopened={} status={}",
            self.pages,
            self.found,
            self.reopened,
            if self.succeeded() { "ok" } else { "error" }
        );
        if let Some(err) = &self.error {
            out.push_str(&format!(" stage={} err={}", err.stage, err.code));
            if let Some(task_id) = &err.task_id {
                out.push_str(&format!(" task={task_id}"));
            }
        }
        out
    }
}

/// The completion-date window, recomputed fresh at every run.
#[derive(Clone, Debug)]
pub(crate) struct TimeWindow {
    pub since: String,
    pub until: String,
}

pub(crate) fn completion_window() -> Result<TimeWindow, time::error::Format> {
    let until = OffsetDateTime::now_utc();
    let since = until - Duration::days(COMPLETION_WINDOW_DAYS);
    Ok(TimeWindow {
        since: since.format(&Rfc3339)?,
        until: until.format(&Rfc3339)?,
    })
}

/// One full reopen cycle using credentials from the environment.
pub(crate) async fn run_reopen_job() -> JobReport {
    let client = match TodoistClient::from_env() {
        Ok(client) => client,
        Err(err) => {
            log_message(&format!("reopen-job init failed err={}", err.code()));
            return JobReport {
                error: Some(JobError::new("init", err.code())),
                ..JobReport::default()
            };
        }
    };
    run_with_client(&client).await
}

/// Drain all completed-task pages, then reopen each accumulated task in
/// order. Any failure aborts the remainder of the run and is recorded on the
/// report; nothing propagates to the caller as an error.
///
/// The page loop terminates only on a null cursor from the upstream. An
/// upstream that keeps returning cursors keeps this loop running; that is the
/// documented trust placed in the pagination contract.
pub(crate) async fn run_with_client(client: &TodoistClient) -> JobReport {
    let mut report = JobReport::default();

    let window = match completion_window() {
        Ok(window) => window,
        Err(err) => {
            log_message(&format!("reopen-job window-format-failed err={err}"));
            report.error = Some(JobError::new("window", "time-format"));
            return report;
        }
    };

    let mut tasks: Vec<CompletedTask> = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        match cursor.as_deref() {
            Some(c) => log_message(&format!("reopen-job fetching next page cursor={c}")),
            None => log_message("reopen-job fetching first page of completed tasks"),
        }

        let page = match client
            .completed_tasks_page(
                REOPEN_FILTER_QUERY,
                &window.since,
                &window.until,
                PAGE_LIMIT,
                cursor.as_deref(),
            )
            .await
        {
            Ok(page) => page,
            Err(err) => {
                log_message(&format!("reopen-job page-fetch-failed err={}", err.code()));
                report.error = Some(JobError::new("fetch-page", err.code()));
                return report;
            }
        };

        report.pages += 1;
        tasks.extend(page.items);
        cursor = page.next_cursor;
        if cursor.is_none() {
            break;
        }
    }

    report.found = tasks.len();
    log_message(&format!(
        "reopen-job found {} completed tasks matching {}",
        tasks.len(),
        REOPEN_FILTER_QUERY
    ));

    for task in &tasks {
        log_message(&format!(
            "reopen-job reopening id={} content={}",
            task.id, task.content
        ));
        if let Err(err) = client.reopen_task(&task.id).await {
            log_message(&format!(
                "reopen-job reopen-failed id={} err={}",
                task.id,
                err.code()
            ));
            report.error = Some(JobError::for_task("reopen", err.code(), &task.id));
            return report;
        }
        report.reopened += 1;
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::todoist::tests::{MockApi, Step, page_body};

    const COMPLETED_PATH: &str = "/api/v1/tasks/completed/by_completion_date";

    #[tokio::test(flavor = "current_thread")]
    async fn drains_pages_and_reopens_in_accumulated_order() {
        // Mock steps double as an order assertion: each connection must match
        // the next step or the mock thread panics.
        let api = MockApi::start(
            "t1",
            vec![
                Step::get(COMPLETED_PATH).body(page_body(
                    &[("1", "alpha"), ("2", "beta")],
                    Some("c1"),
                )),
                Step::get(COMPLETED_PATH)
                    .expect_query("cursor=c1")
                    .body(page_body(&[("3", "gamma")], Some("c2"))),
                Step::get(COMPLETED_PATH)
                    .expect_query("cursor=c2")
                    .body(page_body(&[("4", "delta")], None)),
                Step::post("/api/v1/tasks/1/reopen"),
                Step::post("/api/v1/tasks/2/reopen"),
                Step::post("/api/v1/tasks/3/reopen"),
                Step::post("/api/v1/tasks/4/reopen"),
            ],
        );

        let report = run_with_client(&api.client()).await;
        assert!(report.succeeded(), "unexpected error: {:?}", report.error);
        assert_eq!(report.pages, 3);
        assert_eq!(report.found, 4);
        assert_eq!(report.reopened, 4);
        assert_eq!(api.hits(), 7);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_string_cursor_ends_pagination() {
        let api = MockApi::start(
            "t1",
            vec![
                Step::get(COMPLETED_PATH).body(
                    serde_json::json!({
                        "items": [{ "id": "1", "content": "a" }],
                        "next_cursor": "",
                    })
                    .to_string(),
                ),
                Step::post("/api/v1/tasks/1/reopen"),
            ],
        );

        let report = run_with_client(&api.client()).await;
        assert!(report.succeeded(), "unexpected error: {:?}", report.error);
        assert_eq!(report.pages, 1);
        assert_eq!(report.reopened, 1);
        assert_eq!(api.hits(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_single_page_reopens_nothing() {
        let api = MockApi::start(
            "t1",
            vec![Step::get(COMPLETED_PATH).body(page_body(&[], None))],
        );

        let report = run_with_client(&api.client()).await;
        assert!(report.succeeded());
        assert_eq!(report.pages, 1);
        assert_eq!(report.found, 0);
        assert_eq!(report.reopened, 0);
        assert_eq!(api.hits(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reopen_failure_aborts_remaining_tasks() {
        let api = MockApi::start(
            "t1",
            vec![
                Step::get(COMPLETED_PATH).body(page_body(
                    &[("1", "a"), ("2", "b"), ("3", "c")],
                    None,
                )),
                Step::post("/api/v1/tasks/1/reopen"),
                Step::post("/api/v1/tasks/2/reopen").status(500),
            ],
        );

        let report = run_with_client(&api.client()).await;
        assert!(!report.succeeded());
        assert_eq!(report.found, 3);
        assert_eq!(report.reopened, 1);
        let err = report.error.unwrap();
        assert_eq!(err.stage, "reopen");
        assert_eq!(err.code, "bad-response");
        assert_eq!(err.task_id.as_deref(), Some("2"));
        // First task reopened, second failed, third never attempted.
        assert_eq!(api.hits(), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn first_page_fetch_failure_is_contained() {
        let api = MockApi::start("t1", vec![Step::get(COMPLETED_PATH).status(500)]);

        let report = run_with_client(&api.client()).await;
        assert!(!report.succeeded());
        assert_eq!(report.pages, 0);
        assert_eq!(report.found, 0);
        assert_eq!(report.reopened, 0);
        let err = report.error.unwrap();
        assert_eq!(err.stage, "fetch-page");
        assert_eq!(err.code, "bad-response");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn mid_pagination_failure_reopens_nothing() {
        let api = MockApi::start(
            "t1",
            vec![
                Step::get(COMPLETED_PATH).body(page_body(&[("1", "a"), ("2", "b")], Some("c1"))),
                Step::get(COMPLETED_PATH).expect_query("cursor=c1").status(502),
            ],
        );

        let report = run_with_client(&api.client()).await;
        assert!(!report.succeeded());
        assert_eq!(report.pages, 1);
        // Accumulated tasks from the first page are discarded, not reopened.
        assert_eq!(report.reopened, 0);
        assert_eq!(api.hits(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn consecutive_runs_reopen_the_same_tasks_again() {
        let run_steps = || {
            vec![
                Step::get(COMPLETED_PATH).body(page_body(&[("1", "a"), ("2", "b")], None)),
                Step::post("/api/v1/tasks/1/reopen"),
                Step::post("/api/v1/tasks/2/reopen"),
            ]
        };
        let mut steps = run_steps();
        steps.extend(run_steps());
        let api = MockApi::start("t1", steps);
        let client = api.client();

        let first = run_with_client(&client).await;
        let second = run_with_client(&client).await;
        assert_eq!(first.reopened, 2);
        assert_eq!(second.reopened, 2);
        assert_eq!(api.hits(), 6);
    }

    #[test]
    fn completion_window_spans_ninety_days_ending_now() {
        use time::format_description::well_known::Rfc3339;

        let window = completion_window().unwrap();
        let since = OffsetDateTime::parse(&window.since, &Rfc3339).unwrap();
        let until = OffsetDateTime::parse(&window.until, &Rfc3339).unwrap();
        assert_eq!(until - since, Duration::days(COMPLETION_WINDOW_DAYS));
        assert!((OffsetDateTime::now_utc() - until) < Duration::seconds(60));
    }
}
