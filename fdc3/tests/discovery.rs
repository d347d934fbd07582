//! Connection establishment: handshake over the window tree, the published
//! handle short-circuit, attempt caching, and failover behavior.

mod common;

use std::time::Duration;

use common::*;
use fdc3::{get_agent, wire, Error, FailoverResult, GetAgentParams, Message, Window};
use futures_util::FutureExt;
use serde_json::json;

fn quick() -> GetAgentParams {
    GetAgentParams::default().timeout(Duration::from_millis(100))
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn child_frames_connect_through_the_handshake() {
    let root = start_root().await;
    let frame = root.window().child("https://charts.example.com/");
    let agent = get_agent(&frame, GetAgentParams::default()).await.unwrap();
    assert_eq!(agent.app_identifier().app_id, "https://charts.example.com/");
    assert!(!agent.app_identifier().instance_id.is_empty());

    // A deeply nested frame reaches the root through the ancestor walk.
    let nested = frame
        .child("https://inner.example.com/")
        .child("https://innermost.example.com/");
    let agent = get_agent(&nested, GetAgentParams::default()).await.unwrap();
    assert_eq!(
        agent.app_identifier().app_id,
        "https://innermost.example.com/"
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn published_handle_short_circuits_discovery() {
    let root = start_root().await;
    // The root's own window carries the handle; no handshake happens.
    let agent = get_agent(root.window(), quick()).await.unwrap();
    assert_eq!(
        agent.app_identifier(),
        root.agent().app_identifier()
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn repeat_calls_share_one_attempt_and_one_connection() {
    let root = start_root().await;
    let frame = root.window().child("https://charts.example.com/");

    let first = get_agent(&frame, GetAgentParams::default()).await.unwrap();
    let second = get_agent(&frame, quick()).await.unwrap();
    assert_eq!(first.app_identifier(), second.app_identifier());

    // After a reset a fresh attempt produces a fresh connection.
    frame.reset_agent_promise();
    let third = get_agent(&frame, GetAgentParams::default()).await.unwrap();
    assert_ne!(
        first.app_identifier().instance_id,
        third.app_identifier().instance_id
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn stray_acceptances_are_ignored_during_discovery() {
    let root = start_root().await;
    let frame = root.window().child("https://charts.example.com/");

    // A forged acceptance with the wrong attempt uuid and no port sits in
    // the inbox ahead of the real one.
    let mut forged = Message::event(
        wire::kinds::WCP1_ACCEPTED,
        json!({"fdc3Version": "2.1", "appIdentifier": {"appId": "evil", "instanceId": "evil"}}),
    )
    .unwrap();
    forged.meta.event_uuid = None;
    forged.meta.connection_attempt_uuid = Some("not-this-attempt".into());
    frame.post_message(forged, None, None);

    let agent = get_agent(&frame, GetAgentParams::default()).await.unwrap();
    assert_eq!(agent.app_identifier().app_id, "https://charts.example.com/");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn timeout_without_failover_reports_agent_not_found() {
    let lonely = Window::new("https://lonely.example.com/");
    assert_eq!(
        get_agent(&lonely, quick()).await.unwrap_err(),
        Error::AgentNotFound
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn failover_agent_is_adopted() {
    let root = start_root().await;
    let fallback = root.agent();

    let lonely = Window::new("https://lonely.example.com/");
    let params = quick().failover(Box::new(move || {
        let agent = fallback.clone();
        async move { Some(FailoverResult::Agent(agent)) }.boxed()
    }));
    let agent = get_agent(&lonely, params).await.unwrap();
    assert_eq!(agent.app_identifier(), root.agent().app_identifier());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn failover_window_is_rejected_with_the_documented_literal() {
    let lonely = Window::new("https://lonely.example.com/");
    let params = quick().failover(Box::new(|| {
        async move {
            Some(FailoverResult::Window(Window::new(
                "https://elsewhere.example.com/",
            )))
        }
        .boxed()
    }));
    let error = get_agent(&lonely, params).await.unwrap_err();
    assert_eq!(
        error.to_string(),
        "Failover Window result not currently supported"
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn declining_failover_reports_agent_not_found() {
    let lonely = Window::new("https://lonely.example.com/");
    let params = quick().failover(Box::new(|| async move { None }.boxed()));
    assert_eq!(
        get_agent(&lonely, params).await.unwrap_err(),
        Error::AgentNotFound
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn hello_identifies_the_connecting_origin() {
    let root = start_root().await;
    let mut raw = RawApp::connect(root.window(), "https://origin.example.com/").await;
    assert_eq!(raw.identity.app_id, "https://origin.example.com/");

    // The connection is fully usable at the protocol level.
    let response = raw
        .request(
            wire::kinds::GET_USER_CHANNELS_REQUEST,
            wire::kinds::GET_USER_CHANNELS_RESPONSE,
            json!({}),
        )
        .await;
    assert_eq!(
        response.payload["userChannels"]
            .as_array()
            .map(|channels| channels.len()),
        Some(8)
    );
    let _ = root;
}
