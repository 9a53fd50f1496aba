//! Per-submission orchestration, run off the response path.
//!
//! A handler hands the raw request parts to [`IntakeHandler::schedule`],
//! which spawns one task per submission and returns at once. The task
//! extracts client metadata, classifies the fields and records one event.
//! Its errors end on the notification channel and never reach the caller.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::http::header::USER_AGENT;
use axum::http::HeaderMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::classifier::classify;
use crate::recorder::ActivityRecorder;
use crate::store::EventId;

pub const REAL_IP_HEADER: &str = "x-real-ip";

const LENGTH_ATTACK_SUFFIX: &str = "_length_attack";

/// Kind of decoy submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Login,
    Register,
    Other(String),
}

impl Action {
    pub fn label(&self) -> &str {
        match self {
            Action::Login => "login",
            Action::Register => "register",
            Action::Other(label) => label,
        }
    }

    pub fn length_attack_label(&self) -> String {
        format!("{}{}", self.label(), LENGTH_ATTACK_SUFFIX)
    }

    /// Label an event is stored under.
    pub fn event_label(&self, anomalous: bool) -> String {
        if anomalous {
            self.length_attack_label()
        } else {
            self.label().to_owned()
        }
    }
}

/// Best-effort identity of the submitting client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientMeta {
    /// `X-Real-IP` wins over the socket address when present and non-empty.
    pub fn from_parts(headers: &HeaderMap, remote: Option<SocketAddr>) -> Self {
        let ip = header_text(headers, REAL_IP_HEADER)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| remote.map(|addr| addr.ip().to_string()));
        let user_agent = header_text(headers, USER_AGENT.as_str());
        Self { ip, user_agent }
    }
}

/// Header value as sent. Bytes that are not valid UTF-8 are read as
/// Latin-1, one char per byte.
fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(name)?.as_bytes();
    match std::str::from_utf8(raw) {
        Ok(text) => Some(text.to_owned()),
        Err(_) => Some(raw.iter().map(|&b| char::from(b)).collect()),
    }
}

/// Everything a background worker needs from the HTTP request.
#[derive(Debug, Clone)]
pub struct IntakeRequest {
    pub headers: HeaderMap,
    pub remote: Option<SocketAddr>,
    /// Submitted form fields in declaration order, untrimmed.
    pub fields: Vec<(String, String)>,
}

/// What happened to one scheduled submission. Only observable through the
/// optional completion channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    Recorded {
        id: EventId,
        action: String,
        anomalous: bool,
    },
    Failed {
        action: String,
        error: String,
    },
}

#[derive(Debug, Default)]
pub struct IntakeMetrics {
    pub intake_total: AtomicU64,
    pub anomalous_total: AtomicU64,
    pub persisted_total: AtomicU64,
    pub failed_total: AtomicU64,
}

#[derive(Clone)]
pub struct IntakeHandler {
    recorder: ActivityRecorder,
    max_value_length: u64,
    metrics: Arc<IntakeMetrics>,
    completions: Option<mpsc::UnboundedSender<IntakeOutcome>>,
}

impl IntakeHandler {
    pub fn new(recorder: ActivityRecorder, max_value_length: u64) -> Self {
        Self {
            recorder,
            max_value_length,
            metrics: Arc::new(IntakeMetrics::default()),
            completions: None,
        }
    }

    /// Report every finished submission on `tx`.
    pub fn with_completions(mut self, tx: mpsc::UnboundedSender<IntakeOutcome>) -> Self {
        self.completions = Some(tx);
        self
    }

    pub fn metrics(&self) -> &Arc<IntakeMetrics> {
        &self.metrics
    }

    pub fn max_value_length(&self) -> u64 {
        self.max_value_length
    }

    /// Fire and forget. The returned handle is for tests; dropping it does
    /// not cancel the work.
    pub fn schedule(&self, action: Action, request: IntakeRequest) -> JoinHandle<()> {
        self.metrics.intake_total.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.process(action, request).await;
            if let Some(tx) = &this.completions {
                let _ = tx.send(outcome);
            }
        })
    }

    /// Run the whole intake sequence for one submission.
    pub async fn process(&self, action: Action, request: IntakeRequest) -> IntakeOutcome {
        let meta = ClientMeta::from_parts(&request.headers, request.remote);
        let classification = classify(&request.fields, self.max_value_length);
        let metrics = &self.metrics;
        if classification.is_anomalous() {
            metrics.anomalous_total.fetch_add(1, Ordering::Relaxed);
        }

        let attempt = self.recorder.record(&action, classification, &meta).await;
        let notifier = self.recorder.notifier();
        match attempt.result {
            Ok(id) => {
                metrics.persisted_total.fetch_add(1, Ordering::Relaxed);
                notifier.notify_recorded(&attempt.label, id);
                IntakeOutcome::Recorded {
                    id,
                    action: attempt.label,
                    anomalous: attempt.anomalous,
                }
            }
            Err(err) => {
                metrics.failed_total.fetch_add(1, Ordering::Relaxed);
                notifier.notify_persistence_failure(&attempt.label, meta.ip.as_deref(), &err);
                IntakeOutcome::Failed {
                    action: attempt.label,
                    error: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::telemetry::NotificationSink;
    use axum::http::HeaderValue;

    fn handler(store: &Arc<MemoryStore>) -> IntakeHandler {
        IntakeHandler::new(
            ActivityRecorder::new(store.clone(), NotificationSink::disabled()),
            100,
        )
    }

    fn login_fields(password: &str) -> Vec<(String, String)> {
        vec![
            ("email".to_string(), "a@b.com".to_string()),
            ("password".to_string(), password.to_string()),
        ]
    }

    #[test]
    fn real_ip_header_wins_over_socket() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.7"));
        let remote: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let meta = ClientMeta::from_parts(&headers, Some(remote));
        assert_eq!(meta.ip.as_deref(), Some("198.51.100.7"));
        assert_eq!(meta.user_agent, None);
    }

    #[test]
    fn falls_back_to_socket_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static(""));
        headers.insert("user-agent", HeaderValue::from_static("Mozilla/5.0"));
        let remote: SocketAddr = "[::1]:9000".parse().unwrap();
        let meta = ClientMeta::from_parts(&headers, Some(remote));
        assert_eq!(meta.ip.as_deref(), Some("::1"));
        assert_eq!(meta.user_agent.as_deref(), Some("Mozilla/5.0"));
    }

    #[test]
    fn non_ascii_headers_are_kept() {
        let agent = "Mozilla/5.0 (Ünïcode)";
        let agent_value = HeaderValue::from_bytes(agent.as_bytes()).unwrap();
        let ip_value = HeaderValue::from_bytes(b"10.0.0.\xff").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", agent_value);
        headers.insert("x-real-ip", ip_value);
        let remote: SocketAddr = "127.0.0.1:5555".parse().unwrap();

        let meta = ClientMeta::from_parts(&headers, Some(remote));
        assert_eq!(meta.user_agent.as_deref(), Some(agent));
        assert_eq!(meta.ip.as_deref(), Some("10.0.0.\u{ff}"));
    }

    #[test]
    fn no_address_at_all_is_not_an_error() {
        let meta = ClientMeta::from_parts(&HeaderMap::new(), None);
        assert_eq!(meta, ClientMeta::default());
    }

    #[test]
    fn action_labels() {
        let reset = Action::Other("reset".into());
        assert_eq!(Action::Login.label(), "login");
        assert_eq!(Action::Login.event_label(false), "login");
        assert_eq!(reset.length_attack_label(), "reset_length_attack");

        let label = Action::Register.event_label(true);
        assert_eq!(label, "register_length_attack");
    }

    #[tokio::test]
    async fn scheduled_submission_reports_completion() {
        let store = Arc::new(MemoryStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let intake = handler(&store).with_completions(tx);

        let request = IntakeRequest {
            headers: HeaderMap::new(),
            remote: Some("10.1.1.1:40000".parse().unwrap()),
            fields: login_fields(&"p".repeat(101)),
        };
        intake.schedule(Action::Login, request);

        let outcome = rx.recv().await.unwrap();
        assert_eq!(
            outcome,
            IntakeOutcome::Recorded {
                id: 1,
                action: "login_length_attack".into(),
                anomalous: true,
            }
        );
        let event = store.events().remove(0);
        assert_eq!(event.ip_address.as_deref(), Some("10.1.1.1"));
        assert!(event.data.contains_key("password_length"));

        let metrics = intake.metrics();
        assert_eq!(metrics.intake_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.anomalous_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.persisted_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn persistence_failure_is_contained() {
        let store = Arc::new(MemoryStore::new());
        store.set_refuse_writes(true);
        let intake = handler(&store);

        let request = IntakeRequest {
            headers: HeaderMap::new(),
            remote: None,
            fields: login_fields("short"),
        };
        let outcome = intake.process(Action::Login, request).await;
        match outcome {
            IntakeOutcome::Failed { action, error } => {
                assert_eq!(action, "login");
                assert!(error.contains("refusing writes"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        let failed = &intake.metrics().failed_total;
        assert_eq!(failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn outcome_label_matches_stored_action() {
        let store = Arc::new(MemoryStore::new());
        let intake = handler(&store);
        let request = IntakeRequest {
            headers: HeaderMap::new(),
            remote: None,
            fields: login_fields(&"p".repeat(300)),
        };
        let action = Action::Other("reset".into());
        let outcome = intake.process(action, request).await;
        let event = store.events().remove(0);
        match outcome {
            IntakeOutcome::Recorded { action, .. } => assert_eq!(action, event.action),
            other => panic!("expected record, got {other:?}"),
        }
        assert_eq!(event.action, "reset_length_attack");
    }

    #[tokio::test]
    async fn fields_are_kept_verbatim() {
        let store = Arc::new(MemoryStore::new());
        let intake = handler(&store);
        let request = IntakeRequest {
            headers: HeaderMap::new(),
            remote: None,
            fields: login_fields("  spaced  "),
        };
        intake.process(Action::Login, request).await;
        let event = store.events().remove(0);
        assert_eq!(
            serde_json::to_string(&event.data).unwrap(),
            r#"{"email":"a@b.com","password":"  spaced  "}"#
        );
    }
}
