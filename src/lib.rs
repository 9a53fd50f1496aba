//! Core library for the honeypot.  This module wires together the intake
//! pipeline, shared state and HTTP handlers.  Every login or registration
//! submission is answered with `503 Service Unavailable`; the submission
//! itself is classified and recorded in the background.

pub mod classifier;
mod config;
pub mod intake;
pub mod recorder;
pub mod store;
pub mod telemetry;

pub use config::{AppConfig, RotationConfig};

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Form, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::intake::{Action, IntakeHandler, IntakeOutcome, IntakeRequest};
use crate::recorder::ActivityRecorder;
use crate::store::{ActivityStore, SqliteStore};
use crate::telemetry::{NotificationSink, RotatingWriter};

pub use crate::classifier::{classify, Classification, FieldMap, FieldValue};
pub use crate::store::{ActivityEvent, EventId, MemoryStore, NewActivityEvent, StoreError};

const HOME_PAGE: &str = include_str!("../templates/home.html");

/// State shared across handlers.  Constructed once at startup; every
/// collaborator is an explicit handle rather than a global.
#[derive(Clone)]
pub struct AppState {
    pub intake: IntakeHandler,
    pub notifier: NotificationSink,
    /// Maximum accepted raw request body size in bytes (None => axum default)
    pub max_request_bytes: Option<usize>,
    pub metrics_enabled: bool,
    // Process start time (epoch secs) and instant for uptime computation
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

impl AppState {
    /// Assemble state around an already opened store.
    pub fn new(config: &AppConfig, store: Arc<dyn ActivityStore>) -> Self {
        let writer = match config.log_file.as_deref() {
            Some(path) => match RotatingWriter::open(path, config.rotation.clone()) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(
                        path = %path,
                        error = %e,
                        "failed to open LOG_FILE; notifications go to the log stream only"
                    );
                    None
                }
            },
            None => None,
        };
        let notifier = NotificationSink::new(writer, config.log_stdout);
        let recorder = ActivityRecorder::new(store, notifier.clone());
        let intake = IntakeHandler::new(recorder, config.max_value_length);

        let start_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();

        Self {
            intake,
            notifier,
            max_request_bytes: config.max_request_bytes,
            metrics_enabled: config.metrics_enabled,
            process_start_epoch: start_time.as_secs_f64(),
            process_start_instant: Instant::now(),
        }
    }

    /// Report each finished background submission on `tx`.
    pub fn with_completions(mut self, tx: mpsc::UnboundedSender<IntakeOutcome>) -> Self {
        self.intake = self.intake.with_completions(tx);
        self
    }
}

/// Build state from environment variables, opening the SQLite store named
/// by `HP_DATABASE_PATH`.  See [`AppConfig::from_env`] for the full list.
pub async fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;
    build_state(&config).await
}

pub async fn build_state(config: &AppConfig) -> Result<AppState, Box<dyn std::error::Error>> {
    let path = config.database_path.clone();
    let pool_size = config.database_pool_size;
    let open = move || SqliteStore::open(path, pool_size);
    let store = tokio::task::spawn_blocking(open).await??;
    tracing::info!(
        database = %config.database_path.display(),
        max_value_length = config.max_value_length,
        "activity store opened"
    );
    Ok(AppState::new(config, Arc::new(store)))
}

/// Build the Axum router and attach handlers.  Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()` so the socket
/// address is available as a fallback client identifier.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let mut router = Router::new()
        .route("/", get(home_handler))
        .route("/login", post(login_handler))
        .route("/register", post(register_handler));
    if state.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.with_state(state)
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct RegisterForm {
    name: String,
    phone: String,
    city: String,
}

/// The decoy response.  Identical for every submission, whatever happens
/// in the background.
pub fn decoy_response() -> Response {
    StatusCode::SERVICE_UNAVAILABLE.into_response()
}

async fn home_handler() -> Html<&'static str> {
    Html(HOME_PAGE)
}

async fn login_handler(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    let fields = vec![
        ("email".to_string(), form.email),
        ("password".to_string(), form.password),
    ];
    submit(&state, Action::Login, connect, headers, fields)
}

async fn register_handler(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Form(form): Form<RegisterForm>,
) -> Response {
    let fields = vec![
        ("name".to_string(), form.name),
        ("phone".to_string(), form.phone),
        ("city".to_string(), form.city),
    ];
    submit(&state, Action::Register, connect, headers, fields)
}

fn submit(
    state: &AppState,
    action: Action,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    fields: Vec<(String, String)>,
) -> Response {
    let request = IntakeRequest {
        headers,
        remote: connect.map(|ConnectInfo(addr)| addr),
        fields,
    };
    state.intake.schedule(action, request);
    decoy_response()
}

/// Prometheus-style metrics exposition.  Only routed when
/// `HP_METRICS_ENABLED` is set.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    use std::fmt::Write as _;
    let mut buf = String::new();
    let m = state.intake.metrics();
    let counters: [(&str, &str, u64); 6] = [
        (
            "honeypot_intake_total",
            "Submissions scheduled for intake",
            m.intake_total.load(Ordering::Relaxed),
        ),
        (
            "honeypot_length_attacks_total",
            "Submissions with at least one oversized field",
            m.anomalous_total.load(Ordering::Relaxed),
        ),
        (
            "honeypot_events_persisted_total",
            "Activity events durably recorded",
            m.persisted_total.load(Ordering::Relaxed),
        ),
        (
            "honeypot_persistence_failures_total",
            "Activity events the store failed to record",
            m.failed_total.load(Ordering::Relaxed),
        ),
        (
            "honeypot_notification_lines_total",
            "Notification JSON lines written",
            state.notifier.lines_total(),
        ),
        (
            "honeypot_notification_write_errors_total",
            "Notification JSON line write failures",
            state.notifier.write_errors_total(),
        ),
    ];
    for (name, help, value) in counters {
        writeln!(&mut buf, "# HELP {} {}", name, help).ok();
        writeln!(&mut buf, "# TYPE {} counter", name).ok();
        writeln!(&mut buf, "{} {}", name, value).ok();
    }
    writeln!(
        &mut buf,
        "# HELP honeypot_log_file_size_bytes Current size in bytes of the notification log (0 if disabled)\n# TYPE honeypot_log_file_size_bytes gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "honeypot_log_file_size_bytes {}",
        state.notifier.log_file_size_bytes()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP honeypot_build_info Build information\n# TYPE honeypot_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "honeypot_build_info{{version=\"{}\",maxValueLength=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION"),
        state.intake.max_value_length()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP honeypot_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE honeypot_process_start_time_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "honeypot_process_start_time_seconds {}",
        state.process_start_epoch
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP honeypot_process_uptime_seconds Process uptime seconds\n# TYPE honeypot_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "honeypot_process_uptime_seconds {}",
        state.process_start_instant.elapsed().as_secs_f64()
    )
    .ok();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buf,
    )
        .into_response()
}
