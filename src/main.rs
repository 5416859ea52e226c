use regex::Regex;
use serde_json::json;
use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::{self, BufRead, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use tokio::runtime::Runtime;
use url::Url;

mod reopen_job;
mod todoist;

const LOG_TAG: &str = "task-reopen-trigger";
const CRON_ROUTE_PREFIX: &str = "/--run-cron";
const NOT_CRON_BODY: &str =
    "This service is triggered by a cron schedule, not by HTTP requests.";
const CRON_TRIGGERED_BODY: &str = "Scheduled job executed manually.";
const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:25180";
const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 86_400;
const DEFAULT_SCHEDULER_MIN_INTERVAL_SECS: u64 = 60;

// Environment variable names (external interface). All variables use the
// REOPEN_ prefix; the upstream client's variables live in todoist.rs.
const ENV_MANUAL_TOKEN: &str = "REOPEN_MANUAL_TOKEN";
const ENV_HTTP_ADDR: &str = "REOPEN_HTTP_ADDR";
const ENV_SCHEDULER_INTERVAL_SECS: &str = "REOPEN_SCHEDULER_INTERVAL_SECS";
const ENV_SCHEDULER_MIN_INTERVAL_SECS: &str = "REOPEN_SCHEDULER_MIN_INTERVAL_SECS";
const ENV_SCHEDULER_MAX_TICKS: &str = "REOPEN_SCHEDULER_MAX_TICKS";

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);
static JOB_RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Failure mode of one served request. `Read` means nothing has been written
/// to the client yet; `Write` means a response (possibly partial) is already
/// on the wire and no further bytes may be appended.
enum HandleError {
    Read(String),
    Write(String),
}

struct RequestContext {
    path: String,
    headers: HashMap<String, String>,
    raw_request: String,
    request_id: String,
    started_at: Instant,
}

fn main() {
    let mut args = env::args();
    let exe = args.next().unwrap_or_else(|| "task-reopen-trigger".into());
    let Some(raw_cmd) = args.next() else {
        print_usage(&exe);
        std::process::exit(1);
    };

    let command = normalize_command(&raw_cmd);
    let remaining: Vec<String> = args.collect();

    match command.as_str() {
        "server" => run_server(),
        "http-server" => run_http_server_cli(&remaining),
        "scheduler" => run_scheduler_cli(&remaining),
        "run-job" => run_job_cli(),
        "version" => {
            println!("{}", release_tag());
            std::process::exit(0);
        }
        "help" => {
            print_usage(&exe);
            std::process::exit(0);
        }
        _ => {
            eprintln!("unknown command: {raw_cmd}");
            print_usage(&exe);
            std::process::exit(2);
        }
    }
}

fn normalize_command(raw: &str) -> String {
    raw.trim_start_matches('-').to_lowercase()
}

fn release_tag() -> String {
    if let Some(tag) = option_env!("REOPEN_BUILD_TAG") {
        let trimmed = tag.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let version = option_env!("REOPEN_BUILD_VERSION")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(env!("CARGO_PKG_VERSION"));
    format!("v{version}")
}

fn print_usage(exe: &str) {
    eprintln!("Usage: {exe} <command> [options]\n");
    eprintln!("Commands:");
    eprintln!("  server                       Run a single HTTP request on stdin/stdout (internal)");
    eprintln!("  http-server                  Run the persistent HTTP server bound to {ENV_HTTP_ADDR}");
    eprintln!("  scheduler [options]          Run the periodic reopen job");
    eprintln!("  run-job                      Execute one reopen cycle and exit");
    eprintln!("  version                      Print the release tag");
    eprintln!("  help                         Show this message");
}

fn run_server() -> ! {
    match handle_connection() {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if emits_fallback_response(&err) {
                let _ = write_response(500, "InternalServerError", "internal error");
            }
            let (kind, detail) = match &err {
                HandleError::Read(detail) => ("500 internal-error", detail),
                HandleError::Write(detail) => ("response-write-failed", detail),
            };
            log_message(&format!("{kind} {detail}"));
            std::process::exit(1);
        }
    }
}

/// The fallback 500 may only be written while the wire is still clean.
fn emits_fallback_response(err: &HandleError) -> bool {
    matches!(err, HandleError::Read(_))
}

fn run_http_server_cli(_args: &[String]) -> ! {
    let addr = env::var(ENV_HTTP_ADDR).unwrap_or_else(|_| DEFAULT_HTTP_ADDR.to_string());
    let listener = TcpListener::bind(&addr).unwrap_or_else(|err| {
        eprintln!("failed to bind HTTP address {addr}: {err}");
        std::process::exit(1);
    });

    eprintln!("listening on http://{addr} (http-server)");

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                // Serve each connection from a short-lived child process running
                // `task-reopen-trigger server` with the stream on stdin/stdout,
                // so per-request state stays isolated in its own process.
                if let Err(err) = spawn_server_for_stream(stream) {
                    eprintln!("failed to spawn server for {peer:?}: {err}");
                }
            }
            Err(err) => {
                eprintln!("accept failed: {err}");
                // avoid busy loop on fatal errors
                thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

fn spawn_server_for_stream(stream: TcpStream) -> Result<(), String> {
    stream
        .set_nodelay(true)
        .map_err(|e| format!("set_nodelay failed: {e}"))?;

    let stdin_stream = stream
        .try_clone()
        .map_err(|e| format!("failed to clone stream for stdin: {e}"))?;
    let stdout_stream = stream;

    let stdin_fd = stdin_stream.into_raw_fd();
    let stdout_fd = stdout_stream.into_raw_fd();

    let exe = env::current_exe().map_err(|e| e.to_string())?;

    let mut cmd = Command::new(exe);
    cmd.arg("server");
    // Safety: ownership of the raw FDs transfers into File and then into the
    // child's Stdio; the parent does not touch them again.
    unsafe {
        cmd.stdin(Stdio::from(File::from_raw_fd(stdin_fd)));
        cmd.stdout(Stdio::from(File::from_raw_fd(stdout_fd)));
    }
    cmd.stderr(Stdio::inherit());

    cmd.spawn()
        .map_err(|e| format!("failed to spawn server child: {e}"))?;
    Ok(())
}

fn run_scheduler_cli(args: &[String]) -> ! {
    let mut interval = env_u64(ENV_SCHEDULER_INTERVAL_SECS, DEFAULT_SCHEDULER_INTERVAL_SECS)
        .unwrap_or(DEFAULT_SCHEDULER_INTERVAL_SECS);
    let mut max_iterations = env::var(ENV_SCHEDULER_MAX_TICKS)
        .ok()
        .and_then(|v| v.parse::<u64>().ok());

    let mut idx = 0;
    while idx < args.len() {
        match args[idx].as_str() {
            "--interval" | "--interval-secs" => {
                idx += 1;
                interval = expect_u64(args.get(idx), "interval");
            }
            "--max-iterations" => {
                idx += 1;
                max_iterations = Some(expect_u64(args.get(idx), "max-iterations"));
            }
            other => {
                eprintln!("unknown scheduler option: {other}");
                std::process::exit(2);
            }
        }
        idx += 1;
    }

    run_scheduler_loop(interval, max_iterations);
    std::process::exit(0);
}

fn run_scheduler_loop(interval_secs: u64, max_iterations: Option<u64>) {
    let min_secs = env_u64(
        ENV_SCHEDULER_MIN_INTERVAL_SECS,
        DEFAULT_SCHEDULER_MIN_INTERVAL_SECS,
    )
    .unwrap_or(DEFAULT_SCHEDULER_MIN_INTERVAL_SECS);
    let sleep = scheduler_sleep_duration(interval_secs, min_secs);
    let mut iterations: u64 = 0;

    loop {
        iterations = iterations.saturating_add(1);
        log_message(&format!("scheduler tick iteration={iterations}"));

        let report = job_runtime().block_on(reopen_job::run_reopen_job());
        log_message(&format!(
            "scheduler reopen-job iteration={iterations} {}",
            report.summary()
        ));

        if let Some(limit) = max_iterations {
            if iterations >= limit {
                break;
            }
        }

        thread::sleep(sleep);
    }
}

fn scheduler_sleep_duration(interval_secs: u64, min_secs: u64) -> Duration {
    Duration::from_secs(interval_secs.max(min_secs))
}

fn run_job_cli() -> ! {
    let report = job_runtime().block_on(reopen_job::run_reopen_job());
    log_message(&format!("run-job {}", report.summary()));

    let payload = json!({
        "pages": report.pages,
        "found": report.found,
        "reopened": report.reopened,
        "error": report.error.as_ref().map(|err| json!({
            "stage": err.stage,
            "code": err.code,
            "task_id": err.task_id,
        })),
    });
    println!("{payload}");

    if report.succeeded() {
        std::process::exit(0);
    }
    std::process::exit(1);
}

fn job_runtime() -> &'static Runtime {
    JOB_RUNTIME.get_or_init(|| Runtime::new().expect("failed to create job runtime"))
}

fn handle_connection() -> Result<(), HandleError> {
    let started_at = Instant::now();
    let request_id = next_request_id();

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .map_err(|e| HandleError::Read(e.to_string()))?;
    let request_line = request_line.trim_end_matches(['\r', '\n']).to_string();

    let (method, raw_target) = parse_request_line(&request_line);
    if method.is_empty() || raw_target.is_empty() {
        log_message(&format!("400 bad-request {}", redact_token(&request_line)));
        send_response(400, "BadRequest", "bad request").map_err(HandleError::Write)?;
        return Ok(());
    }

    let (path, _query) = match parse_target(&raw_target) {
        Ok(parts) => parts,
        Err(e) => {
            log_message(&format!("400 bad-request {}", redact_token(&request_line)));
            send_response(400, "BadRequest", &e).map_err(HandleError::Write)?;
            return Ok(());
        }
    };

    let headers = read_headers(&mut reader).map_err(HandleError::Read)?;

    // Drain any declared body before responding; neither route consumes one.
    if let Some(len) = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        let mut body = vec![0u8; len];
        reader
            .read_exact(&mut body)
            .map_err(|e| HandleError::Read(format!("failed to read body: {e}")))?;
    }

    let ctx = RequestContext {
        path,
        headers,
        raw_request: request_line,
        request_id,
        started_at,
    };

    if ctx.path.starts_with(CRON_ROUTE_PREFIX) {
        handle_cron_trigger(&ctx).map_err(HandleError::Write)
    } else {
        respond_text(&ctx, 404, "NotFound", NOT_CRON_BODY, "not-cron-route")
            .map_err(HandleError::Write)
    }
}

/// The manual-trigger gate. A request that presents the shared secret runs
/// the reopen job exactly as a scheduler tick would, synchronously, and is
/// answered 200 regardless of the run's internal outcome. Everything else is
/// rejected without side effects.
fn handle_cron_trigger(ctx: &RequestContext) -> Result<(), String> {
    let Some(credential) = bearer_credential(&ctx.headers) else {
        return respond_text(ctx, 401, "Unauthorized", "unauthorized", "manual-trigger");
    };

    let expected = env::var(ENV_MANUAL_TOKEN).unwrap_or_default();
    if expected.trim().is_empty() {
        log_message(&format!("manual-trigger rejected: {ENV_MANUAL_TOKEN} unset"));
        return respond_text(ctx, 403, "Forbidden", "forbidden", "manual-trigger");
    }
    if !secret_matches(&credential, &expected) {
        return respond_text(ctx, 403, "Forbidden", "forbidden", "manual-trigger");
    }

    log_message(&format!(
        "manual trigger accepted request_id={}",
        ctx.request_id
    ));
    let report = job_runtime().block_on(reopen_job::run_reopen_job());
    log_message(&format!("manual trigger reopen-job {}", report.summary()));

    respond_text(ctx, 200, "OK", CRON_TRIGGERED_BODY, "manual-trigger")
}

/// The Authorization header value with an optional `Bearer ` prefix removed.
/// Returns None only when the header is absent.
fn bearer_credential(headers: &HashMap<String, String>) -> Option<String> {
    let raw = headers.get("authorization")?;
    let trimmed = raw.trim();
    let credential = trimmed
        .split_once(' ')
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, rest)| rest.trim())
        .unwrap_or(trimmed);
    Some(credential.to_string())
}

fn secret_matches(presented: &str, configured: &str) -> bool {
    if configured.is_empty() {
        return false;
    }
    bool::from(presented.as_bytes().ct_eq(configured.as_bytes()))
}

fn parse_request_line(request_line: &str) -> (String, String) {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();
    (method, target)
}

fn parse_target(raw_target: &str) -> Result<(String, Option<String>), String> {
    if raw_target.is_empty() {
        return Err("empty target".into());
    }

    // Support both absolute-form and origin-form targets.
    let url = if raw_target.starts_with("http://") || raw_target.starts_with("https://") {
        Url::parse(raw_target).map_err(|e| e.to_string())?
    } else {
        Url::parse(&format!("http://dummy{raw_target}")).map_err(|e| e.to_string())?
    };

    let path = url.path().to_string();
    let query = url.query().map(|s| s.to_string());
    Ok((path, query))
}

fn read_headers<R: BufRead>(reader: &mut R) -> Result<HashMap<String, String>, String> {
    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(|e| format!("failed to read header: {e}"))?;
        let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
        if trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok(headers)
}

fn write_response(status: u16, reason: &str, body: &str) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    write!(stdout, "HTTP/1.1 {} {}\r\n", status, reason)?;
    stdout.write_all(b"Content-Type: text/plain; charset=utf-8\r\n")?;
    stdout.write_all(b"Connection: close\r\n")?;
    stdout.write_all(b"\r\n")?;
    if !body.is_empty() {
        writeln!(stdout, "{}", body)?;
    }
    stdout.flush()
}

fn send_response(status: u16, reason: &str, body: &str) -> Result<(), String> {
    match write_response(status, reason, body) {
        Ok(()) => Ok(()),
        Err(err)
            if err.kind() == io::ErrorKind::BrokenPipe
                || err.kind() == io::ErrorKind::ConnectionReset =>
        {
            Ok(())
        }
        Err(err) => Err(err.to_string()),
    }
}

fn respond_text(
    ctx: &RequestContext,
    status: u16,
    reason: &str,
    body: &str,
    action: &str,
) -> Result<(), String> {
    let result = send_response(status, reason, body);
    let elapsed_ms = ctx.started_at.elapsed().as_millis() as u64;
    log_message(&format!(
        "{status} {action} request_id={} {} {}ms",
        ctx.request_id,
        redact_token(&ctx.raw_request),
        elapsed_ms
    ));
    result
}

fn next_request_id() -> String {
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis();
    format!("{ts:x}-{seq:04x}")
}

fn env_u64(name: &str, default: u64) -> Result<u64, String> {
    match env::var(name) {
        Ok(val) => val.trim().parse().map_err(|_| format!("invalid {name}")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(_) => Err(format!("invalid {name}")),
    }
}

fn parse_u64_arg(value: Option<&String>, label: &str) -> Result<u64, String> {
    value
        .ok_or_else(|| format!("missing {label}"))?
        .trim()
        .parse::<u64>()
        .map_err(|_| format!("invalid {label}"))
}

fn expect_u64(value: Option<&String>, label: &str) -> u64 {
    match parse_u64_arg(value, label) {
        Ok(v) => v,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    }
}

fn log_message(message: &str) {
    // Try system logger first; fall back to stderr so container logs capture it.
    let _ = Command::new("logger")
        .arg("-t")
        .arg(LOG_TAG)
        .arg(message)
        .status();
    eprintln!("{message}");
}

fn redact_token(input: &str) -> String {
    static TOKEN_RE: OnceLock<Regex> = OnceLock::new();
    let regex = TOKEN_RE.get_or_init(|| Regex::new(r"(token=)[^&\s]+").unwrap());
    regex.replace_all(input, "$1***REDACTED***").into_owned()
}
