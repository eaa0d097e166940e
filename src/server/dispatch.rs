use super::sse::SseParser;
use crate::config::ConfigStore;
use crate::db::models::Route;
use crate::error::{AppError, ErrorKind};
use crate::modality::chat::ir::{IrChatRequest, IrUsage};
use crate::modality::chat::{self, ChatFormat, SseEvent};
use crate::routing::{redirect, Balancer, CircuitBreaker, RouteTable};
use crate::stats::{CompletionEvent, StatsHandle};
use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use futures_util::TryStreamExt;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, AppError>> + Send>>;

/// Client-facing SSE body.
pub type SseBody = Pin<Box<dyn Stream<Item = Result<Bytes, Infallible>> + Send>>;

/// One outbound call, fully prepared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub struct UpstreamResponse {
    pub status: u16,
    pub body: ByteStream,
}

/// Network seam for forwarding. `HttpTransport` is the production implementation.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, AppError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, AppError> {
        let mut builder = self
            .client
            .post(&request.url)
            .header("Content-Type", "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let resp = builder.body(request.body).send().await?;
        let status = resp.status().as_u16();
        let body = resp.bytes_stream().map_err(AppError::HttpClient);
        Ok(UpstreamResponse {
            status,
            body: Box::pin(body),
        })
    }
}

/// Join a route base URL and an API path without doubling a version segment
/// the base already ends with (`https://host/v1` + `/v1/messages`).
fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let version = path.trim_start_matches('/').split('/').next().unwrap_or("");
    if !version.is_empty() && base.ends_with(&format!("/{}", version)) {
        format!("{}{}", base, &path[version.len() + 1..])
    } else {
        format!("{}{}", base, path)
    }
}

pub fn build_upstream_url(base_url: &str, format: ChatFormat, model: &str, stream: bool) -> String {
    match format {
        ChatFormat::OpenaiChat => join_url(base_url, "/v1/chat/completions"),
        ChatFormat::Anthropic => join_url(base_url, "/v1/messages"),
        ChatFormat::Gemini => {
            if stream {
                join_url(
                    base_url,
                    &format!("/v1beta/models/{}:streamGenerateContent?alt=sse", model),
                )
            } else {
                join_url(base_url, &format!("/v1beta/models/{}:generateContent", model))
            }
        }
    }
}

/// Auth headers for `route`. A route without its own key forwards the caller's
/// Authorization header unchanged.
pub fn auth_headers(
    format: ChatFormat,
    api_key: &str,
    inbound_authorization: Option<&str>,
) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    if format == ChatFormat::Anthropic {
        headers.push(("anthropic-version".to_string(), "2023-06-01".to_string()));
    }
    if api_key.is_empty() {
        if let Some(auth) = inbound_authorization {
            headers.push(("Authorization".to_string(), auth.to_string()));
        }
        return headers;
    }
    match format {
        ChatFormat::OpenaiChat => {
            headers.push(("Authorization".to_string(), format!("Bearer {}", api_key)))
        }
        ChatFormat::Anthropic => headers.push(("x-api-key".to_string(), api_key.to_string())),
        ChatFormat::Gemini => headers.push(("x-goog-api-key".to_string(), api_key.to_string())),
    }
    headers
}

/// A client request as received by the HTTP surface.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub format: ChatFormat,
    pub body: Bytes,
    pub authorization: Option<String>,
}

pub enum DispatchReply {
    /// Complete JSON body in the inbound format.
    Json(Vec<u8>),
    /// SSE frames in the inbound format, converted as upstream chunks arrive.
    Stream(SseBody),
}

/// Emits exactly one completion event. If the owner is dropped before
/// reporting an outcome, the request counts as client-cancelled.
struct CompletionGuard {
    stats: StatsHandle,
    model: String,
    started: Instant,
    emitted: bool,
}

impl CompletionGuard {
    fn new(stats: StatsHandle) -> Self {
        Self {
            stats,
            model: String::new(),
            started: Instant::now(),
            emitted: false,
        }
    }

    fn elapsed_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    fn emit(&mut self, event: CompletionEvent) {
        if !self.emitted {
            self.emitted = true;
            self.stats.record(event);
        }
    }

    fn succeed(&mut self, route_id: i64, usage: Option<&IrUsage>) {
        let event = CompletionEvent::success(&self.model, route_id, usage, self.elapsed_ms());
        self.emit(event);
    }

    fn fail(&mut self, route_id: Option<i64>, kind: ErrorKind) {
        let event = CompletionEvent::failure(&self.model, route_id, kind, self.elapsed_ms());
        self.emit(event);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.emitted {
            log::info!("Request for {} cancelled by the client", self.model);
            self.fail(None, ErrorKind::ClientCancelled);
        }
    }
}

enum Attempt {
    Complete { body: Vec<u8>, usage: Option<IrUsage> },
    Stream { body: ByteStream, format: ChatFormat },
}

async fn with_timeout<T, F>(secs: u64, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    tokio::time::timeout(Duration::from_secs(secs), fut)
        .await
        .map_err(|_| AppError::UpstreamTimeout(secs))?
}

/// Drain a body, applying the timeout to every gap between chunks.
async fn read_body(body: &mut ByteStream, secs: u64) -> Result<Vec<u8>, AppError> {
    let mut buf = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(secs), body.next()).await {
            Err(_) => return Err(AppError::UpstreamTimeout(secs)),
            Ok(None) => return Ok(buf),
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk?),
        }
    }
}

pub struct Dispatcher {
    routes: Arc<RouteTable>,
    config: Arc<ConfigStore>,
    stats: StatsHandle,
    transport: Arc<dyn UpstreamTransport>,
    balancer: Balancer,
    circuit: CircuitBreaker,
}

impl Dispatcher {
    pub fn new(
        routes: Arc<RouteTable>,
        config: Arc<ConfigStore>,
        stats: StatsHandle,
        transport: Arc<dyn UpstreamTransport>,
    ) -> Self {
        Self {
            routes,
            config,
            stats,
            transport,
            balancer: Balancer::new(),
            circuit: CircuitBreaker::new(5, 60),
        }
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Serve one inbound request: redirect, resolve, convert, forward with
    /// failover, convert back. Exactly one completion event is recorded,
    /// whatever the outcome.
    pub async fn dispatch(
        &self,
        inbound: InboundRequest,
        cancel: CancellationToken,
    ) -> Result<DispatchReply, AppError> {
        let mut guard = CompletionGuard::new(self.stats.clone());

        let ir = match chat::get_decoder(inbound.format).decode_request(&inbound.body) {
            Ok(ir) => ir,
            Err(e) => {
                guard.model = "unknown".to_string();
                guard.fail(None, e.kind());
                return Err(e);
            }
        };
        guard.model = ir.model.clone();

        // config is cloned out; no lock is held past this point
        let config = self.config.snapshot().await;
        let resolution = match redirect::resolve(&ir.model, &config) {
            Ok(r) => r,
            Err(e) => {
                guard.fail(None, e.kind());
                return Err(e);
            }
        };
        let model = resolution.model.clone();
        guard.model = model.clone();

        let snapshot = self.routes.snapshot();
        let mut candidates = resolution
            .target_name
            .as_deref()
            .map(|name| snapshot.lookup(&format!("{}/{}", name, model)))
            .unwrap_or_default();
        if candidates.is_empty() {
            candidates = snapshot.lookup(&model);
        }
        drop(snapshot);

        if candidates.is_empty() {
            let err = AppError::NoRouteFound(model);
            guard.fail(None, err.kind());
            return Err(err);
        }

        let ordered = self
            .balancer
            .order(config.selection_strategy, &model, candidates, &self.circuit);
        let attempts = ordered.len();
        let timeout = config.upstream_timeout_secs;
        let mut last: Option<(i64, AppError)> = None;

        for route in &ordered {
            if cancel.is_cancelled() {
                guard.fail(Some(route.id), ErrorKind::ClientCancelled);
                return Err(AppError::ClientCancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(AppError::ClientCancelled),
                r = self.attempt(route, &ir, &inbound, timeout) => r,
            };

            match result {
                Ok(Attempt::Complete { body, usage }) => {
                    self.circuit.record_success(route.id);
                    log::info!("{} served by route {} ({})", model, route.id, route.name);
                    guard.succeed(route.id, usage.as_ref());
                    return Ok(DispatchReply::Json(body));
                }
                Ok(Attempt::Stream { body: upstream, format }) => {
                    self.circuit.record_success(route.id);
                    log::info!("{} streaming from route {} ({})", model, route.id, route.name);
                    let body = convert_stream(
                        upstream,
                        format,
                        inbound.format,
                        guard,
                        route.id,
                        timeout,
                        cancel,
                    );
                    return Ok(DispatchReply::Stream(body));
                }
                Err(e) if e.is_retryable() => {
                    if e.kind() != ErrorKind::FormatConversion {
                        self.circuit.record_failure(route.id);
                    }
                    log::warn!("Route {} ({}) failed for {}: {}", route.id, route.name, model, e);
                    last = Some((route.id, e));
                }
                Err(e) => {
                    guard.fail(Some(route.id), e.kind());
                    return Err(e);
                }
            }
        }

        let (route_id, last) = match last {
            Some(last) => last,
            None => {
                let err = AppError::Internal("no dispatch attempt was made".into());
                guard.fail(None, err.kind());
                return Err(err);
            }
        };
        let err = if attempts == 1 {
            last
        } else {
            AppError::GroupExhausted {
                model,
                attempts,
                last: Box::new(last),
            }
        };
        guard.fail(Some(route_id), err.kind());
        Err(err)
    }

    async fn attempt(
        &self,
        route: &Route,
        ir: &IrChatRequest,
        inbound: &InboundRequest,
        timeout: u64,
    ) -> Result<Attempt, AppError> {
        let target = chat::resolve_format(&route.format)?;
        let body = chat::get_encoder(target).encode_request(ir, &route.model)?;
        let request = UpstreamRequest {
            url: build_upstream_url(&route.api_url, target, &route.model, ir.stream),
            headers: auth_headers(target, &route.api_key, inbound.authorization.as_deref()),
            body,
        };

        let mut resp = with_timeout(timeout, self.transport.send(request)).await?;
        if !(200..300).contains(&resp.status) {
            let body = read_body(&mut resp.body, timeout).await.unwrap_or_default();
            return Err(AppError::Upstream {
                status: resp.status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        if ir.stream {
            return Ok(Attempt::Stream {
                body: resp.body,
                format: target,
            });
        }

        let raw = read_body(&mut resp.body, timeout).await?;
        let reply = chat::get_decoder(target).decode_response(&raw)?;
        chat::check_response(inbound.format, &reply)?;
        let body = chat::get_encoder(inbound.format).encode_response(&reply)?;
        Ok(Attempt::Complete {
            body,
            usage: reply.usage,
        })
    }
}

fn error_frame(format: ChatFormat, err: &AppError) -> SseEvent {
    let payload = serde_json::json!({
        "type": "error",
        "error": { "type": err.kind(), "message": err.to_string() },
    })
    .to_string();
    match format {
        ChatFormat::Anthropic => SseEvent::named("error", payload),
        _ => SseEvent::data(payload),
    }
}

/// Re-encode an upstream SSE body chunk by chunk. The guard travels with the
/// stream: it records success at a clean end, failure on a mid-stream error,
/// and cancellation if the client drops the body early.
fn convert_stream(
    mut upstream: ByteStream,
    from: ChatFormat,
    to: ChatFormat,
    mut guard: CompletionGuard,
    route_id: i64,
    timeout: u64,
    cancel: CancellationToken,
) -> SseBody {
    let stream = async_stream::stream! {
        let mut decoder = chat::get_decoder(from);
        let mut encoder = chat::get_encoder(to);
        let mut parser = SseParser::default();
        let mut usage: Option<IrUsage> = None;
        let mut failure: Option<AppError> = None;
        let mut pending: Vec<String> = Vec::new();
        let mut upstream_done = false;

        'read: loop {
            for data in pending.drain(..) {
                if decoder.is_stream_done(&data) {
                    upstream_done = true;
                    break 'read;
                }
                let chunk = match decoder.decode_stream_chunk(&data) {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => continue,
                    Err(e) => {
                        failure = Some(e);
                        break 'read;
                    }
                };
                if let Some(u) = &chunk.usage {
                    usage.get_or_insert_with(IrUsage::default).merge(u);
                }
                match encoder.encode_stream_chunk(&chunk) {
                    Ok(events) => {
                        for event in events {
                            yield Ok(Bytes::from(event.to_frame()));
                        }
                    }
                    Err(e) => {
                        failure = Some(e);
                        break 'read;
                    }
                }
            }
            if upstream_done {
                break;
            }

            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    failure = Some(AppError::ClientCancelled);
                    break;
                }
                next = tokio::time::timeout(Duration::from_secs(timeout), upstream.next()) => next,
            };
            match next {
                Err(_) => {
                    failure = Some(AppError::UpstreamTimeout(timeout));
                    break;
                }
                Ok(Some(Ok(bytes))) => pending = parser.push(&bytes),
                Ok(Some(Err(e))) => {
                    failure = Some(e);
                    break;
                }
                Ok(None) => {
                    pending = parser.finish().into_iter().collect();
                    upstream_done = true;
                }
            }
        }

        match failure {
            None => {
                for event in encoder.stream_done_signal() {
                    yield Ok(Bytes::from(event.to_frame()));
                }
                guard.succeed(route_id, usage.as_ref());
            }
            Some(err) => {
                log::warn!("Stream from route {} ended with an error: {}", route_id, err);
                guard.fail(Some(route_id), err.kind());
                if err.kind() != ErrorKind::ClientCancelled {
                    yield Ok(Bytes::from(error_frame(to, &err).to_frame()));
                }
            }
        }
    };
    Box::pin(stream)
}
