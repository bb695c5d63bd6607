use crate::{
    config::{LOG_FILE, STATE_FILE},
    event::Event,
    failure,
    failure::Failure,
    format,
    process::{run_command, Output, RunOptions},
    state::{epoch_now, StateSnapshot},
    supervisor::{scan_loop, KillOutcome, Supervisor},
};
use axum::{
    extract::{Path as UrlPath, Query, State},
    http::{header::LOCATION, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use std::{
    collections::HashMap,
    convert::Infallible,
    fs,
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};
use tokio_stream::wrappers::UnboundedReceiverStream;

// Run identifiers double as directory and container names, so nothing
// outside `^\d+_[A-Za-z0-9]{40}$` is allowed anywhere near a path.
pub fn verify_identifier(identifier: &str) -> bool {
    match identifier.split_once('_') {
        Some((timestamp, sha)) => {
            !timestamp.is_empty()
                && timestamp.chars().all(|c| c.is_ascii_digit())
                && sha.len() == 40
                && sha.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

// The stage of a log line is its second whitespace-delimited token: the
// task-name column the runner prints.
pub fn stage(line: &str) -> String {
    line.split_whitespace()
        .nth(1)
        .map(html_escape)
        .unwrap_or_default()
}

pub fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            other => escaped.push(other),
        }
    }
    escaped
}

enum StreamItem {
    Line(String),
    State(serde_json::Value),
}

// Feed the SSE channel from two std threads: a `tail -f` of the run log,
// and an mtime poll of the state file. Either producer failing to send means
// the client hung up, which cancels the other through the shared kill event.
fn spawn_stream_producers(
    base_path: PathBuf,
    from_line: u64,
    sender: tokio::sync::mpsc::UnboundedSender<StreamItem>,
    kill_signal: Event,
) {
    {
        let log_path = base_path.join(LOG_FILE);
        let sender = sender.clone();
        let kill_signal = kill_signal.clone();
        thread::spawn(move || {
            // The log file appears when the runner starts; wait for it.
            while !kill_signal.is_set() && !log_path.is_file() {
                kill_signal.wait_timeout(Duration::from_millis(500));
            }
            if kill_signal.is_set() {
                return;
            }
            let (line_sender, line_receiver) = crossbeam::channel::unbounded();
            let forward_kill = kill_signal.clone();
            let forwarder = thread::spawn(move || {
                for line in line_receiver {
                    if sender.send(StreamItem::Line(line)).is_err() {
                        forward_kill.set();
                        break;
                    }
                }
            });
            let tail = vec![
                "tail".to_owned(),
                "-n".to_owned(),
                format!("+{}", from_line),
                "-f".to_owned(),
                log_path.to_string_lossy().into_owned(),
            ];
            let _ = run_command(
                &tail,
                RunOptions::new(kill_signal, Output::Queue(line_sender)),
            );
            let _ = forwarder.join();
        });
    }
    {
        let state_path = base_path.join(STATE_FILE);
        thread::spawn(move || {
            let mut last_modified = None;
            while !kill_signal.is_set() {
                if let Ok(metadata) = fs::metadata(&state_path) {
                    let modified = metadata.modified().ok();
                    if modified != last_modified {
                        if let Ok(value) = fs::read_to_string(&state_path)
                            .map_err(|_| ())
                            .and_then(|text| {
                                serde_json::from_str::<serde_json::Value>(&text).map_err(|_| ())
                            })
                        {
                            if sender.send(StreamItem::State(value)).is_err() {
                                kill_signal.set();
                                return;
                            }
                            last_modified = modified;
                        }
                    }
                }
                kill_signal.wait_timeout(Duration::from_secs(1));
            }
        });
    }
}

async fn stream(
    State(supervisor): State<Arc<Supervisor>>,
    UrlPath(identifier): UrlPath<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !verify_identifier(&identifier) {
        return (StatusCode::BAD_REQUEST, "Invalid identifier").into_response();
    }
    let base_path = supervisor.config.logs_path().join(&identifier);

    // `Last-Event-ID` carries the last line the client saw; resume just
    // after it. The `id` query parameter names the first line wanted.
    let from_line = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(|last| last + 1)
        .or_else(|| params.get("id").and_then(|value| value.parse().ok()))
        .unwrap_or(1);

    // The current state goes out before any line events, so a reconnecting
    // client renders the present before replaying the past.
    let initial_state = fs::read_to_string(base_path.join(STATE_FILE))
        .ok()
        .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok());

    let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
    let kill_signal = Event::new();
    spawn_stream_producers(base_path, from_line, sender.clone(), kill_signal.clone());
    tokio::spawn(async move {
        sender.closed().await;
        kill_signal.set();
    });

    let events = UnboundedReceiverStream::new(receiver).scan(from_line, |line_number, item| {
        let event = match item {
            StreamItem::Line(line) => {
                let data = serde_json::json!([stage(&line), html_escape(&line)]);
                let event = SseEvent::default()
                    .id(line_number.to_string())
                    .event("line")
                    .data(data.to_string());
                *line_number += 1;
                event
            }
            StreamItem::State(value) => SseEvent::default().event("state").data(value.to_string()),
        };
        futures::future::ready(Some(Ok::<_, Infallible>(event)))
    });

    let mut prelude: Vec<Result<SseEvent, Infallible>> =
        vec![Ok(SseEvent::default().comment("connected"))];
    if let Some(value) = initial_state {
        prelude.push(Ok(SseEvent::default().event("state").data(value.to_string())));
    }
    let stream = futures::stream::iter(prelude).chain(events);

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(10))
                .text("ping"),
        )
        .into_response()
}

// Recent runs, newest first, with the metadata the index needs.
async fn index(
    State(supervisor): State<Arc<Supervisor>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let show_all = params.get("show").map(String::as_str) == Some("all");
    let limit = if show_all { None } else { Some(40) };

    let result = tokio::task::spawn_blocking(move || {
        let snapshots = supervisor.state_snapshots(limit, false);
        let tags = supervisor.tags().unwrap_or_default();
        let is_limited_view = limit == Some(snapshots.len());

        let builds = snapshots
            .iter()
            .map(|(_, snapshot)| {
                let started = snapshot.started as i64;
                let timestamp = chrono::DateTime::from_timestamp(started, 0)
                    .map(|t| format!("{}Z", t.naive_utc().format("%Y-%m-%dT%H:%M:%S")))
                    .unwrap_or_default();
                let finished = snapshot.finished.unwrap_or_else(epoch_now) as i64;
                serde_json::json!({
                    "branch": snapshot.branch,
                    "link": format!("logs/{}", snapshot.identifier),
                    "timestamp": timestamp,
                    "duration": format::duration(finished.saturating_sub(started) as u64),
                    "status": snapshot.status,
                    "sha": snapshot.commit.chars().take(8).collect::<String>(),
                    "tags": tags.get(&snapshot.commit).cloned().unwrap_or_default(),
                })
            })
            .collect::<Vec<_>>();

        serde_json::json!({
            "title": supervisor.config.repo_name,
            "builds": builds,
            "is_inhibited": supervisor.is_inhibited(),
            "is_limited_view": is_limited_view,
        })
    })
    .await;

    match result {
        Ok(body) => Json(body).into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response(),
    }
}

// One run's full state. 404 until the state file exists; a freshly-launched
// run simply reports `not_started` until its tasks populate.
async fn logs(
    State(supervisor): State<Arc<Supervisor>>,
    UrlPath(identifier): UrlPath<String>,
) -> Response {
    if !verify_identifier(&identifier) {
        return (StatusCode::BAD_REQUEST, "Invalid identifier").into_response();
    }
    let statefile = supervisor
        .config
        .logs_path()
        .join(&identifier)
        .join(STATE_FILE);
    if !statefile.is_file() {
        return (StatusCode::NOT_FOUND, "Page not found").into_response();
    }
    match StateSnapshot::load(&statefile) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => {
            error!("{}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Unreadable state").into_response()
        }
    }
}

async fn trigger_get(State(supervisor): State<Arc<Supervisor>>) -> Response {
    if supervisor.is_inhibited() {
        return (StatusCode::BAD_REQUEST, "Inhibited").into_response();
    }
    supervisor.scan_trigger.set();
    (StatusCode::OK, "Looking for changes in remote repo").into_response()
}

async fn trigger_post(State(supervisor): State<Arc<Supervisor>>) -> Response {
    if supervisor.is_inhibited() {
        return (StatusCode::BAD_REQUEST, "Inhibited").into_response();
    }
    supervisor.scan_trigger.set();
    (
        StatusCode::SEE_OTHER,
        [(LOCATION, "/".to_owned())],
        "Looking for changes in remote repo",
    )
        .into_response()
}

async fn kill(
    State(supervisor): State<Arc<Supervisor>>,
    UrlPath(identifier): UrlPath<String>,
) -> Response {
    if !verify_identifier(&identifier) {
        return (StatusCode::BAD_REQUEST, "Invalid identifier").into_response();
    }
    let target = identifier.clone();
    let result = tokio::task::spawn_blocking(move || supervisor.kill_run(&target)).await;
    match result {
        Ok(Ok(Some(KillOutcome::Signalled))) => (
            StatusCode::SEE_OTHER,
            [(LOCATION, format!("/logs/{}", identifier))],
            "Sent SIGTERM to container",
        )
            .into_response(),
        Ok(Ok(Some(KillOutcome::MarkedFailed))) => (
            StatusCode::OK,
            "Container not running. Overall status manually set to FAILED.",
        )
            .into_response(),
        Ok(Ok(Some(KillOutcome::NotRunning))) => {
            (StatusCode::BAD_REQUEST, "Container not running").into_response()
        }
        Ok(Ok(None)) => (StatusCode::NOT_FOUND, "Identifier not found").into_response(),
        Ok(Err(e)) => {
            error!("{}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Kill failed").into_response()
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response(),
    }
}

async fn rerun(
    State(supervisor): State<Arc<Supervisor>>,
    UrlPath(identifier): UrlPath<String>,
) -> Response {
    if !verify_identifier(&identifier) {
        return (StatusCode::BAD_REQUEST, "Invalid identifier").into_response();
    }
    if supervisor.is_inhibited() {
        return (StatusCode::BAD_REQUEST, "Inhibited").into_response();
    }
    let result = tokio::task::spawn_blocking(move || supervisor.rerun(&identifier)).await;
    match result {
        Ok(Ok(Some(new_identifier))) => (
            StatusCode::SEE_OTHER,
            [(LOCATION, format!("/logs/{}", new_identifier))],
            "Rerunning",
        )
            .into_response(),
        Ok(Ok(None)) => (StatusCode::NOT_FOUND, "Identifier not found").into_response(),
        Ok(Err(e)) => {
            error!("{}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Rerun failed").into_response()
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response(),
    }
}

async fn inhibit(State(supervisor): State<Arc<Supervisor>>) -> Response {
    supervisor.set_inhibited(true);
    (
        StatusCode::SEE_OTHER,
        [(LOCATION, "/".to_owned())],
        "Inhibited",
    )
        .into_response()
}

async fn remove_inhibition(State(supervisor): State<Arc<Supervisor>>) -> Response {
    supervisor.set_inhibited(false);
    (
        StatusCode::SEE_OTHER,
        [(LOCATION, "/".to_owned())],
        "Removed inhibition",
    )
        .into_response()
}

// Serve the web surface and run the background scanner until the kill
// signal fires.
pub fn serve(supervisor: Arc<Supervisor>) -> Result<(), Failure> {
    {
        let supervisor = supervisor.clone();
        thread::spawn(move || scan_loop(&supervisor));
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(failure::system("Unable to start the async runtime."))?;
    runtime.block_on(async {
        let app = Router::new()
            .route("/", get(index))
            .route("/logs/:identifier", get(logs))
            .route("/stream/:identifier", get(stream))
            .route("/trigger", get(trigger_get).post(trigger_post))
            .route("/kill/:identifier", post(kill))
            .route("/rerun/:identifier", post(rerun))
            .route("/inhibit", post(inhibit))
            .route("/remove_inhibition", post(remove_inhibition))
            .with_state(supervisor.clone());

        let listener = tokio::net::TcpListener::bind(&supervisor.config.listen_addr)
            .await
            .map_err(failure::system(format!(
                "Unable to listen on {}.",
                supervisor.config.listen_addr,
            )))?;
        info!("Listening on {}", supervisor.config.listen_addr);

        let kill_signal = supervisor.kill_signal.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = tokio::task::spawn_blocking(move || kill_signal.wait()).await;
            })
            .await
            .map_err(failure::system("Server error."))
    })
}
