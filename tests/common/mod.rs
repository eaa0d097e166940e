#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use modelrouter_lib::db::{self, models::{RequestLog, RouteFields}};
use modelrouter_lib::error::AppError;
use modelrouter_lib::server::dispatch::{UpstreamRequest, UpstreamResponse, UpstreamTransport};
use modelrouter_lib::{commands, AppState};
use parking_lot::Mutex;
use std::sync::Arc;

/// What the scripted upstream answers for a URL prefix.
#[derive(Clone)]
pub enum Reply {
    Json(u16, String),
    Sse(Vec<String>),
    Hang,
}

#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<Vec<(String, Reply)>>,
    calls: Mutex<Vec<UpstreamRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, url_prefix: &str, reply: Reply) {
        self.replies.lock().push((url_prefix.to_string(), reply));
    }

    pub fn calls(&self) -> Vec<UpstreamRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl UpstreamTransport for ScriptedTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, AppError> {
        self.calls.lock().push(request.clone());
        let reply = self
            .replies
            .lock()
            .iter()
            .find(|(prefix, _)| request.url.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone());

        match reply {
            None => Err(AppError::Upstream {
                status: 502,
                body: format!("unscripted url {}", request.url),
            }),
            Some(Reply::Json(status, body)) => Ok(UpstreamResponse {
                status,
                body: Box::pin(tokio_stream::once(Ok(Bytes::from(body)))),
            }),
            Some(Reply::Sse(frames)) => Ok(UpstreamResponse {
                status: 200,
                body: Box::pin(tokio_stream::iter(
                    frames.into_iter().map(|f| Ok(Bytes::from(f))),
                )),
            }),
            Some(Reply::Hang) => std::future::pending().await,
        }
    }
}

pub async fn state_with(transport: Arc<ScriptedTransport>) -> Arc<AppState> {
    let pool = db::init_memory_pool().await.unwrap();
    let state = AppState::with_transport(pool, reqwest::Client::new(), transport)
        .await
        .unwrap();
    commands::config::set_selection_strategy(&state, "priority")
        .await
        .unwrap();
    state
}

pub fn route(name: &str, model: &str, url: &str, group: &str, format: &str) -> RouteFields {
    RouteFields {
        name: name.into(),
        model: model.into(),
        api_url: url.into(),
        api_key: format!("sk-{}", name),
        group: group.into(),
        format: format.into(),
    }
}

pub fn openai_reply(text: &str, prompt: u32, completion: u32) -> String {
    serde_json::json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 1,
        "model": "gpt-4",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion
        }
    })
    .to_string()
}

pub fn openai_request(model: &str, stream: bool) -> Bytes {
    Bytes::from(
        serde_json::json!({
            "model": model,
            "stream": stream,
            "messages": [{ "role": "user", "content": "hello" }]
        })
        .to_string(),
    )
}

pub fn anthropic_request(model: &str, stream: bool) -> Bytes {
    Bytes::from(
        serde_json::json!({
            "model": model,
            "max_tokens": 64,
            "stream": stream,
            "messages": [{ "role": "user", "content": "hello" }]
        })
        .to_string(),
    )
}

/// `(model, route_id, success, failure_kind, request_tokens, response_tokens)` per recorded event.
pub async fn recorded(
    state: &AppState,
) -> Vec<(String, Option<i64>, bool, Option<String>, i64, i64)> {
    state.stats.flush().await.unwrap();
    let rows: Vec<RequestLog> = sqlx::query_as("SELECT * FROM request_logs ORDER BY id")
        .fetch_all(&state.db)
        .await
        .unwrap();
    rows.into_iter()
        .map(|r| {
            (
                r.model,
                r.route_id,
                r.success,
                r.failure_kind,
                r.request_tokens,
                r.response_tokens,
            )
        })
        .collect()
}
