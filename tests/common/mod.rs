#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use honeypot::intake::IntakeOutcome;
use honeypot::{AppConfig, AppState, MemoryStore};
use tokio::sync::mpsc;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Config with stdout mirroring off so test output stays readable.
pub fn quiet_config() -> AppConfig {
    AppConfig {
        log_stdout: false,
        ..AppConfig::default()
    }
}

/// State over an in-memory store, plus the completion receiver.
pub fn memory_state(
    config: &AppConfig,
) -> (AppState, Arc<MemoryStore>, mpsc::UnboundedReceiver<IntakeOutcome>) {
    let store = Arc::new(MemoryStore::new());
    let (tx, rx) = mpsc::unbounded_channel();
    let state = AppState::new(config, store.clone()).with_completions(tx);
    (state, store, rx)
}

/// Encode a body the way browsers do for `application/x-www-form-urlencoded`.
pub fn form_body(fields: &[(&str, &str)]) -> String {
    serde_urlencoded::to_string(fields).unwrap()
}

pub fn form_request(uri: &str, fields: &[(&str, &str)]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(form_body(fields)))
        .unwrap()
}
