#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::{form_request, memory_state, quiet_config};
use honeypot::{app, AppConfig};
use tower::ServiceExt;

fn read_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).expect("line parses as JSON"))
        .collect()
}

#[tokio::test]
async fn length_attack_lands_in_notification_log() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("notify.jsonl");
    let config = AppConfig {
        log_file: Some(log_path.to_string_lossy().to_string()),
        ..quiet_config()
    };
    let (state, _store, mut rx) = memory_state(&config);
    let router = app(state);

    let req = form_request("/login", &[("email", "a@b.com"), ("password", "short")]);
    router.clone().oneshot(req).await.unwrap();
    rx.recv().await.unwrap();
    assert!(
        read_lines(&log_path).is_empty(),
        "normal submissions are not notified"
    );

    let payload = "\"quoted\"\nline".repeat(20);
    let fields = [("email", payload.as_str()), ("password", "x")];
    let mut req = form_request("/login", &fields);
    req.headers_mut().insert("x-real-ip", "198.51.100.1".parse().unwrap());
    router.oneshot(req).await.unwrap();
    rx.recv().await.unwrap();

    let lines = read_lines(&log_path);
    assert_eq!(lines.len(), 1);
    let line = &lines[0];
    for key in [
        "schemaVersion",
        "ts",
        "kind",
        "action",
        "ip",
        "userAgent",
        "data",
    ] {
        assert!(line.get(key).is_some(), "missing notification field {key}");
    }
    assert_eq!(line["kind"], "length_attack");
    assert_eq!(line["action"], "login_length_attack");
    assert_eq!(line["ip"], "198.51.100.1");
    assert_eq!(line["data"]["email_length"], 260);
    assert_eq!(line["data"]["password"], "x");
}

#[tokio::test]
async fn persistence_failure_lands_in_notification_log() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("notify.jsonl");
    let config = AppConfig {
        log_file: Some(log_path.to_string_lossy().to_string()),
        ..quiet_config()
    };
    let (state, store, mut rx) = memory_state(&config);
    store.set_refuse_writes(true);

    let req = form_request(
        "/register",
        &[("name", "Ann"), ("phone", "555"), ("city", "Oslo")],
    );
    let resp = app(state).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), 503);
    rx.recv().await.unwrap();

    let lines = read_lines(&log_path);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["kind"], "persistence_failure");
    assert_eq!(lines[0]["action"], "register");
    let error = lines[0]["error"].as_str().unwrap();
    assert!(error.contains("refusing writes"));
}

#[tokio::test]
async fn unwritable_log_path_does_not_block_intake() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("missing/dir/notify.jsonl");
    let config = AppConfig {
        log_file: Some(log_path.to_string_lossy().to_string()),
        ..quiet_config()
    };
    let (state, store, mut rx) = memory_state(&config);
    let long = "L".repeat(300);
    let req = form_request("/login", &[("email", long.as_str()), ("password", "x")]);
    let resp = app(state).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), 503);
    rx.recv().await.unwrap();
    assert_eq!(store.events().len(), 1);
    assert_eq!(store.events()[0].action, "login_length_attack");
}
