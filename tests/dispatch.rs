mod common;

use common::{anthropic_request, openai_reply, openai_request, recorded, route, state_with, Reply, ScriptedTransport};
use modelrouter_lib::commands;
use modelrouter_lib::commands::config::RedirectInput;
use modelrouter_lib::error::{AppError, ErrorKind};
use modelrouter_lib::modality::chat::ChatFormat;
use modelrouter_lib::server::dispatch::{DispatchReply, InboundRequest};
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

fn inbound(format: ChatFormat, body: bytes::Bytes) -> InboundRequest {
    InboundRequest {
        format,
        body,
        authorization: None,
    }
}

fn json_body(reply: DispatchReply) -> serde_json::Value {
    match reply {
        DispatchReply::Json(body) => serde_json::from_slice(&body).unwrap(),
        DispatchReply::Stream(_) => panic!("expected a buffered reply"),
    }
}

async fn collect_stream(reply: DispatchReply) -> String {
    let mut stream = match reply {
        DispatchReply::Stream(stream) => stream,
        DispatchReply::Json(_) => panic!("expected a stream"),
    };
    let mut out = String::new();
    while let Some(chunk) = stream.next().await {
        out.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
    }
    out
}

#[tokio::test]
async fn fails_over_to_the_first_healthy_group_member() {
    let transport = ScriptedTransport::new();
    transport.on("http://a.test", Reply::Json(500, "boom".into()));
    transport.on("http://b.test", Reply::Json(429, "slow down".into()));
    transport.on("http://c.test", Reply::Json(200, openai_reply("hi", 5, 7)));
    let state = state_with(transport.clone()).await;

    commands::routes::add_route(&state, route("a", "gpt-4", "http://a.test", "pool", "openai")).await.unwrap();
    commands::routes::add_route(&state, route("b", "gpt-4", "http://b.test", "pool", "openai")).await.unwrap();
    let third = commands::routes::add_route(&state, route("c", "gpt-4", "http://c.test", "pool", "openai"))
        .await
        .unwrap();

    let reply = state
        .dispatcher
        .dispatch(inbound(ChatFormat::OpenaiChat, openai_request("gpt-4", false)), CancellationToken::new())
        .await
        .unwrap();
    let body = json_body(reply);
    assert_eq!(body["choices"][0]["message"]["content"], "hi");
    assert_eq!(transport.calls().len(), 3);

    let rows = recorded(&state).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0], ("gpt-4".to_string(), Some(third.id), true, None, 5, 7));
}

#[tokio::test]
async fn exhausted_group_records_a_single_failure() {
    let transport = ScriptedTransport::new();
    for host in ["http://a.test", "http://b.test", "http://c.test"] {
        transport.on(host, Reply::Json(503, "unavailable".into()));
    }
    let state = state_with(transport.clone()).await;
    for name in ["a", "b", "c"] {
        let url = format!("http://{}.test", name);
        commands::routes::add_route(&state, route(name, "gpt-4", &url, "pool", "openai")).await.unwrap();
    }

    let err = state
        .dispatcher
        .dispatch(inbound(ChatFormat::OpenaiChat, openai_request("gpt-4", false)), CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AppError::GroupExhausted { attempts: 3, .. }));

    let rows = recorded(&state).await;
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].2);
    assert_eq!(rows[0].3.as_deref(), Some("group_exhausted"));
}

#[tokio::test]
async fn single_route_surfaces_its_own_upstream_error() {
    let transport = ScriptedTransport::new();
    transport.on("http://a.test", Reply::Json(429, "rate limited".into()));
    let state = state_with(transport).await;
    commands::routes::add_route(&state, route("a", "gpt-4", "http://a.test", "", "openai")).await.unwrap();

    let err = state
        .dispatcher
        .dispatch(inbound(ChatFormat::OpenaiChat, openai_request("gpt-4", false)), CancellationToken::new())
        .await
        .err()
        .unwrap();
    match err {
        AppError::Upstream { status, body } => {
            assert_eq!(status, 429);
            assert_eq!(body, "rate limited");
        }
        other => panic!("unexpected error: {}", other),
    }
    let rows = recorded(&state).await;
    assert_eq!(rows[0].3.as_deref(), Some("upstream"));
}

#[tokio::test]
async fn unknown_model_is_recorded_as_no_route() {
    let transport = ScriptedTransport::new();
    let state = state_with(transport.clone()).await;

    let err = state
        .dispatcher
        .dispatch(inbound(ChatFormat::OpenaiChat, openai_request("nobody-serves-this", false)), CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::NoRouteFound);
    assert!(transport.calls().is_empty());

    let rows = recorded(&state).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, "nobody-serves-this");
    assert_eq!(rows[0].1, None);
    assert_eq!(rows[0].3.as_deref(), Some("no_route_found"));
}

#[tokio::test]
async fn redirect_keyword_resolves_to_the_target_model() {
    let transport = ScriptedTransport::new();
    transport.on("http://a.test", Reply::Json(200, openai_reply("redirected", 1, 1)));
    let state = state_with(transport.clone()).await;
    commands::routes::add_route(&state, route("a", "gpt-4", "http://a.test", "", "openai")).await.unwrap();
    commands::config::update_config(
        &state,
        RedirectInput {
            redirect_enabled: true,
            redirect_keyword: "auto".into(),
            redirect_target_model: "gpt-4".into(),
            redirect_target_name: None,
        },
    )
    .await
    .unwrap();

    let reply = state
        .dispatcher
        .dispatch(inbound(ChatFormat::OpenaiChat, openai_request("auto", false)), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(json_body(reply)["choices"][0]["message"]["content"], "redirected");

    let sent: serde_json::Value = serde_json::from_slice(&transport.calls()[0].body).unwrap();
    assert_eq!(sent["model"], "gpt-4");

    let rows = recorded(&state).await;
    assert_eq!(rows[0].0, "gpt-4");
}

#[tokio::test]
async fn anthropic_client_is_served_by_an_openai_route() {
    let transport = ScriptedTransport::new();
    transport.on("http://a.test", Reply::Json(200, openai_reply("converted", 4, 2)));
    let state = state_with(transport.clone()).await;
    commands::routes::add_route(&state, route("a", "claude-like", "http://a.test", "", "openai")).await.unwrap();

    let reply = state
        .dispatcher
        .dispatch(inbound(ChatFormat::Anthropic, anthropic_request("claude-like", false)), CancellationToken::new())
        .await
        .unwrap();
    let body = json_body(reply);
    assert_eq!(body["type"], "message");
    assert_eq!(body["content"][0]["text"], "converted");
    assert_eq!(body["usage"]["input_tokens"], 4);

    let call = &transport.calls()[0];
    assert_eq!(call.url, "http://a.test/v1/chat/completions");
    assert!(call
        .headers
        .contains(&("Authorization".to_string(), "Bearer sk-a".to_string())));
    let sent: serde_json::Value = serde_json::from_slice(&call.body).unwrap();
    assert_eq!(sent["messages"][0]["role"], "user");
}

#[tokio::test]
async fn openai_stream_is_reencoded_as_anthropic_events() {
    let frames = vec![
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n".to_string(),
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n".to_string(),
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4\",\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n".to_string(),
        "data: [DONE]\n\n".to_string(),
    ];
    let transport = ScriptedTransport::new();
    transport.on("http://a.test", Reply::Sse(frames));
    let state = state_with(transport).await;
    let added = commands::routes::add_route(&state, route("a", "gpt-4", "http://a.test", "", "openai"))
        .await
        .unwrap();

    let reply = state
        .dispatcher
        .dispatch(inbound(ChatFormat::Anthropic, anthropic_request("gpt-4", true)), CancellationToken::new())
        .await
        .unwrap();
    let out = collect_stream(reply).await;

    assert!(out.starts_with("event: message_start"));
    assert!(out.contains("\"text\":\"Hel\""));
    assert!(out.contains("\"text\":\"lo\""));
    assert!(out.contains("\"stop_reason\":\"end_turn\""));
    assert!(out.trim_end().ends_with("{\"type\":\"message_stop\"}"));

    let rows = recorded(&state).await;
    assert_eq!(rows, vec![("gpt-4".to_string(), Some(added.id), true, None, 3, 2)]);
}

#[tokio::test]
async fn cancelled_token_records_client_cancelled() {
    let transport = ScriptedTransport::new();
    transport.on("http://a.test", Reply::Hang);
    let state = state_with(transport).await;
    commands::routes::add_route(&state, route("a", "gpt-4", "http://a.test", "", "openai")).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = state
        .dispatcher
        .dispatch(inbound(ChatFormat::OpenaiChat, openai_request("gpt-4", false)), cancel)
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::ClientCancelled);

    let rows = recorded(&state).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].3.as_deref(), Some("client_cancelled"));
}

#[tokio::test]
async fn aborted_request_task_still_records_one_event() {
    let transport = ScriptedTransport::new();
    transport.on("http://a.test", Reply::Hang);
    let state = state_with(transport.clone()).await;
    commands::routes::add_route(&state, route("a", "gpt-4", "http://a.test", "", "openai")).await.unwrap();

    let task_state = state.clone();
    let task = tokio::spawn(async move {
        task_state
            .dispatcher
            .dispatch(inbound(ChatFormat::OpenaiChat, openai_request("gpt-4", false)), CancellationToken::new())
            .await
            .map(|_| ())
    });

    while transport.calls().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let rows = recorded(&state).await;
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].2);
    assert_eq!(rows[0].3.as_deref(), Some("client_cancelled"));
}

#[tokio::test]
async fn hanging_upstream_times_out() {
    let transport = ScriptedTransport::new();
    transport.on("http://a.test", Reply::Hang);
    let state = state_with(transport).await;
    commands::routes::add_route(&state, route("a", "gpt-4", "http://a.test", "", "openai")).await.unwrap();
    state.config.update(|c| c.upstream_timeout_secs = 1).await.unwrap();

    let err = state
        .dispatcher
        .dispatch(inbound(ChatFormat::OpenaiChat, openai_request("gpt-4", false)), CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AppError::UpstreamTimeout(1)));

    let rows = recorded(&state).await;
    assert_eq!(rows[0].3.as_deref(), Some("upstream_timeout"));
}

#[tokio::test]
async fn failing_routes_trip_the_circuit_and_are_tried_last() {
    let transport = ScriptedTransport::new();
    transport.on("http://a.test", Reply::Json(500, "down".into()));
    transport.on("http://b.test", Reply::Json(200, openai_reply("ok", 1, 1)));
    let state = state_with(transport.clone()).await;
    let first = commands::routes::add_route(&state, route("a", "gpt-4", "http://a.test", "pool", "openai"))
        .await
        .unwrap();
    commands::routes::add_route(&state, route("b", "gpt-4", "http://b.test", "pool", "openai")).await.unwrap();

    for _ in 0..5 {
        state
            .dispatcher
            .dispatch(inbound(ChatFormat::OpenaiChat, openai_request("gpt-4", false)), CancellationToken::new())
            .await
            .unwrap();
    }
    assert!(!state.dispatcher.circuit().is_available(first.id));
    let before = transport.calls().len();

    state
        .dispatcher
        .dispatch(inbound(ChatFormat::OpenaiChat, openai_request("gpt-4", false)), CancellationToken::new())
        .await
        .unwrap();
    let calls = transport.calls();
    assert_eq!(calls.len(), before + 1);
    assert!(calls[before].url.starts_with("http://b.test"));
}

fn anthropic_request_with_top_k(model: &str) -> bytes::Bytes {
    bytes::Bytes::from(
        serde_json::json!({
            "model": model,
            "max_tokens": 64,
            "top_k": 5,
            "messages": [{ "role": "user", "content": "hello" }]
        })
        .to_string(),
    )
}

#[tokio::test]
async fn field_without_openai_equivalent_fails_conversion() {
    let transport = ScriptedTransport::new();
    transport.on("http://a.test", Reply::Json(200, openai_reply("dropped", 1, 1)));
    let state = state_with(transport.clone()).await;
    let added = commands::routes::add_route(&state, route("a", "m", "http://a.test", "", "openai"))
        .await
        .unwrap();

    let err = state
        .dispatcher
        .dispatch(inbound(ChatFormat::Anthropic, anthropic_request_with_top_k("m")), CancellationToken::new())
        .await
        .err()
        .unwrap();
    match &err {
        AppError::FormatConversion { field, .. } => assert_eq!(field, "top_k"),
        other => panic!("unexpected error: {}", other),
    }
    assert!(transport.calls().is_empty());
    // conversion failures say nothing about the upstream's health
    assert!(state.dispatcher.circuit().is_available(added.id));

    let rows = recorded(&state).await;
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].2);
    assert_eq!(rows[0].3.as_deref(), Some("format_conversion"));
}

#[tokio::test]
async fn unconvertible_request_fails_over_to_a_native_group_member() {
    let transport = ScriptedTransport::new();
    transport.on("http://a.test", Reply::Json(200, openai_reply("dropped", 1, 1)));
    transport.on(
        "http://b.test",
        Reply::Json(
            200,
            serde_json::json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "content": [{ "type": "text", "text": "native" }],
                "model": "m",
                "stop_reason": "end_turn",
                "usage": { "input_tokens": 2, "output_tokens": 3 }
            })
            .to_string(),
        ),
    );
    let state = state_with(transport.clone()).await;
    commands::routes::add_route(&state, route("a", "m", "http://a.test", "pool", "openai")).await.unwrap();
    let native = commands::routes::add_route(&state, route("b", "m", "http://b.test", "pool", "anthropic"))
        .await
        .unwrap();

    let reply = state
        .dispatcher
        .dispatch(inbound(ChatFormat::Anthropic, anthropic_request_with_top_k("m")), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(json_body(reply)["content"][0]["text"], "native");

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, "http://b.test/v1/messages");
    let sent: serde_json::Value = serde_json::from_slice(&calls[0].body).unwrap();
    assert_eq!(sent["top_k"], 5);

    let rows = recorded(&state).await;
    assert_eq!(rows, vec![("m".to_string(), Some(native.id), true, None, 2, 3)]);
}
