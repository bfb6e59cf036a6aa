//! End-to-end scenarios driven straight through `Engine::on_request`/
//! `on_response`, no live network. Mirrors spec.md §8's scenarios S1-S6
//! and its universal properties (counter monotonicity, cycle wrap,
//! reload atomicity, regex ordering).

use bytes::Bytes;
use http::HeaderMap;
use mockbeat::{Engine, Flow, OrderedMultiMap, Request};
use std::io::Write;
use tempfile::NamedTempFile;

fn request(path: &str) -> Request {
    Request {
        scheme: "http".into(),
        host: "h".into(),
        method: "GET".into(),
        path: path.into(),
        query: OrderedMultiMap::new(),
        headers: HeaderMap::new(),
        body: Bytes::new(),
    }
}

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

#[tokio::test]
async fn s1_simple_mock() {
    let file = config_file(r#"{"request": {"/ping": {"respond": "pong"}}}"#);
    let engine = Engine::new(file.path().to_path_buf());
    engine.on_load().await.unwrap();

    let mut flow = Flow::new(request("/ping"));
    engine.on_request(&mut flow).await.unwrap();

    let response = flow.response.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "pong");
    assert_eq!(
        response.headers.get("content-type").unwrap(),
        "application/json; charset=utf-8"
    );
}

#[tokio::test]
async fn s2_once_then_pass() {
    let file = config_file(r#"{"request": {"/a": {"once": {"respond": {"status": 503}}}}}"#);
    let engine = Engine::new(file.path().to_path_buf());
    engine.on_load().await.unwrap();

    let mut first = Flow::new(request("/a"));
    engine.on_request(&mut first).await.unwrap();
    assert_eq!(first.response.unwrap().status, 503);

    let mut second = Flow::new(request("/a"));
    engine.on_request(&mut second).await.unwrap();
    assert!(second.response.is_none(), "second hit should pass through to upstream");
}

#[tokio::test]
async fn s3_cycle() {
    let file = config_file(
        r#"{"request": {"/r": {"cycle": [{"respond": {"status": 200}}, {"respond": {"status": 500}}]}}}"#,
    );
    let engine = Engine::new(file.path().to_path_buf());
    engine.on_load().await.unwrap();

    let mut statuses = Vec::new();
    for _ in 0..4 {
        let mut flow = Flow::new(request("/r"));
        engine.on_request(&mut flow).await.unwrap();
        statuses.push(flow.response.unwrap().status);
    }
    assert_eq!(statuses, vec![200, 500, 200, 500]);
}

#[tokio::test]
async fn s4_merge_on_response() {
    let file = config_file(r#"{"response": {"/data": {"modify": {"merge": {"b": [3]}}}}}"#);
    let engine = Engine::new(file.path().to_path_buf());
    engine.on_load().await.unwrap();

    let mut flow = Flow::new(request("/data"));
    flow.response = Some(mockbeat::Response {
        status: 200,
        headers: HeaderMap::new(),
        body: Bytes::from_static(br#"{"a":1,"b":[1,2]}"#),
    });
    engine.on_response(&mut flow).await.unwrap();

    let body: serde_json::Value = serde_json::from_str(&flow.response.unwrap().text()).unwrap();
    assert_eq!(body, serde_json::json!({"a": 1, "b": [1, 2, 3]}));
}

#[tokio::test]
async fn s5_regex_path_and_count() {
    let file = config_file(
        r#"{"request": {"~^/u/([0-9]+)$": {"count": {"1": {"respond": "first"}, "~": {"respond": "other"}}}}}"#,
    );
    let engine = Engine::new(file.path().to_path_buf());
    engine.on_load().await.unwrap();

    let mut results = Vec::new();
    for _ in 0..3 {
        let mut flow = Flow::new(request("/u/42"));
        engine.on_request(&mut flow).await.unwrap();
        results.push(flow.response.unwrap().text());
    }
    assert_eq!(results, vec!["first", "other", "other"]);
}

#[tokio::test]
async fn s6_state_set_and_require() {
    let file = config_file(
        r#"{"request": {
            "/set": {"set": {"mode": "x"}},
            "/need-x": {"require": {"mode": "x"}, "respond": "ok"},
            "/need-y": {"require": {"mode": "y"}, "respond": "ok"}
        }}"#,
    );
    let engine = Engine::new(file.path().to_path_buf());
    engine.on_load().await.unwrap();

    let mut set_flow = Flow::new(request("/set"));
    engine.on_request(&mut set_flow).await.unwrap();

    let mut matches_flow = Flow::new(request("/need-x"));
    engine.on_request(&mut matches_flow).await.unwrap();
    assert!(matches_flow.response.is_some());

    let mut mismatches_flow = Flow::new(request("/need-y"));
    engine.on_request(&mut mismatches_flow).await.unwrap();
    assert!(mismatches_flow.response.is_none());
}

#[tokio::test]
async fn counter_monotonicity_across_many_hits() {
    let file = config_file(r#"{"request": {"/counted": {"count": {"~": {"respond": "x"}}}}}"#);
    let engine = Engine::new(file.path().to_path_buf());
    engine.on_load().await.unwrap();

    for _ in 0..10 {
        let mut flow = Flow::new(request("/counted"));
        engine.on_request(&mut flow).await.unwrap();
        assert!(flow.response.is_some());
    }
}

#[tokio::test]
async fn reload_is_atomic_between_events() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{"request": {{"/v": {{"respond": "v1"}}}}}}"#).unwrap();
    let engine = Engine::new(file.path().to_path_buf());
    engine.on_load().await.unwrap();

    let mut before = Flow::new(request("/v"));
    engine.on_request(&mut before).await.unwrap();
    assert_eq!(before.response.unwrap().text(), "v1");

    // Bump mtime forward so the next event picks up the reload.
    std::thread::sleep(std::time::Duration::from_millis(10));
    file.as_file()
        .set_len(0)
        .and_then(|_| {
            use std::io::Seek;
            file.as_file_mut().seek(std::io::SeekFrom::Start(0))
        })
        .unwrap();
    write!(file, r#"{{"request": {{"/v": {{"respond": "v2"}}}}}}"#).unwrap();
    file.flush().unwrap();

    let mut after = Flow::new(request("/v"));
    engine.on_request(&mut after).await.unwrap();
    assert_eq!(after.response.unwrap().text(), "v2");
}

#[tokio::test]
async fn terminate_flag_surfaces_on_flow() {
    let file = config_file(r#"{"request": {"/shutdown": {"respond": "bye", "terminate": true}}}"#);
    let engine = Engine::new(file.path().to_path_buf());
    engine.on_load().await.unwrap();

    let mut flow = Flow::new(request("/shutdown"));
    let terminate = engine.on_request(&mut flow).await.unwrap();
    assert!(terminate);
    assert!(flow.should_terminate);
}

#[tokio::test]
async fn global_response_modify_applies_even_to_a_request_mocked_response() {
    let file = config_file(
        r#"{
            "request": {"/ping": {"respond": "pong"}},
            "response": {"*": {"modify": {"merge": {"injected": true}}}, "/ping": {}}
        }"#,
    );
    let engine = Engine::new(file.path().to_path_buf());
    engine.on_load().await.unwrap();

    let mut flow = Flow::new(request("/ping"));
    engine.on_request(&mut flow).await.unwrap();
    assert_eq!(flow.response.as_ref().unwrap().text(), "pong");

    // The response hook must still run over a flow mocked entirely by the
    // request hook, the same way it runs over an upstream-fetched one.
    engine.on_response(&mut flow).await.unwrap();
    let body: serde_json::Value = serde_json::from_str(&flow.response.unwrap().text()).unwrap();
    assert_eq!(body, serde_json::json!({"injected": true}));
}
