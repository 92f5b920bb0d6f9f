use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Multipart, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{RouterError, RouterResult};
use crate::proxy::{generate_request_id, request_content_key};
use crate::queue::QueuedRequest;
use crate::routing::RequestContext;
use crate::state::{now_secs, AppState};
use crate::types::EndpointRole;

const ADMISSION_WAIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Header name/value pairs with sensitive values redacted, for debug
/// logging only -- never use this for anything forwarded upstream.
fn redacted_headers_for_log(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let value_str = value.to_str().unwrap_or("<binary>");
            (name.as_str().to_string(), crate::logging::redact_header(name.as_str(), value_str))
        })
        .collect()
}

fn forwardable_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if matches!(lower.as_str(), "host" | "content-length" | "connection") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(name, value);
        }
    }
    out
}

async fn proxy_openai_request(
    state: &Arc<AppState>,
    path: &'static str,
    headers: HeaderMap,
    body: Bytes,
    required_role: Option<EndpointRole>,
) -> RouterResult<Response> {
    let request_id = generate_request_id(request_id_from_headers(&headers).as_deref());
    debug!(%request_id, headers = ?redacted_headers_for_log(&headers), "dispatching proxied request");

    let parsed: Value = serde_json::from_slice(&body)
        .map_err(|e| RouterError::InvalidBody(e.to_string()))?;

    let (body, model) = state.proxy.prepare_body(parsed)?;

    let session_value = state
        .session_header
        .as_ref()
        .and_then(|key| headers.get(key.as_str()))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let max_tokens = body.get("max_tokens").and_then(Value::as_u64);

    let ctx = RequestContext {
        request_id: request_id.clone(),
        model,
        session_value,
        content_key: request_content_key(&body),
        max_tokens,
        required_role,
    };

    let engine_stats = state.engine_stats.get_engine_stats();
    let now = now_secs();

    let dispatched = match &state.queue {
        Some(queue) => {
            let endpoints = state.discovery.snapshot();
            let stats_snapshot = state.request_stats.get_stats(now);
            let target = state
                .router
                .route(&endpoints, &stats_snapshot, &engine_stats, &ctx)
                .ok_or_else(|| RouterError::NoHealthyEndpoint(ctx.model.clone()))?;

            let (tx, rx) = tokio::sync::oneshot::channel();
            state.admission_waiters.lock().insert(ctx.request_id.clone(), tx);
            queue.enqueue(
                &target,
                QueuedRequest {
                    request_id: ctx.request_id.clone(),
                    model: ctx.model.clone(),
                    priority: 0,
                    enqueued_at: now,
                    session_value: ctx.session_value.clone(),
                },
            );

            let assigned = tokio::time::timeout(ADMISSION_WAIT_TIMEOUT, rx).await.map_err(|_| {
                state.admission_waiters.lock().remove(&ctx.request_id);
                RouterError::FailoverExhausted("admission queue wait timed out".to_string())
            })?;
            let assigned = assigned
                .map_err(|_| RouterError::FailoverExhausted("admission queue closed".to_string()))?;

            state
                .proxy
                .dispatch_direct(&ctx, &assigned, body, path, forwardable_headers(&headers), now)
                .await?
        }
        None => {
            state
                .proxy
                .dispatch(&ctx, body, path, forwardable_headers(&headers), &engine_stats, now)
                .await?
        }
    };

    let status = StatusCode::from_u16(dispatched.response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);

    let request_stats = state.request_stats.clone();
    let endpoint_url = dispatched.endpoint_url.clone();
    let metrics = state.metrics.clone();
    let model_label = dispatched
        .body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let leading_chunk = dispatched.leading_chunk.clone();
    if leading_chunk.is_some() {
        request_stats.on_request_response(&endpoint_url, &request_id, now_secs());
    }

    let byte_stream = dispatched.response.bytes_stream();
    let tail = futures_util::stream::unfold(
        (byte_stream, leading_chunk.is_none(), request_id.clone(), endpoint_url.clone()),
        move |(mut inner, mut first, request_id, endpoint_url)| {
            let request_stats = request_stats.clone();
            async move {
                match inner.next().await {
                    Some(Ok(chunk)) => {
                        if first {
                            request_stats.on_request_response(&endpoint_url, &request_id, now_secs());
                            first = false;
                        }
                        Some((Ok(chunk), (inner, first, request_id, endpoint_url)))
                    }
                    Some(Err(e)) => Some((
                        Err(std::io::Error::other(e.to_string())),
                        (inner, first, request_id, endpoint_url),
                    )),
                    None => {
                        request_stats.on_request_complete(&endpoint_url, &request_id, now_secs());
                        None
                    }
                }
            }
        },
    );
    let stream: std::pin::Pin<Box<dyn futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Send>> =
        match leading_chunk {
            Some(chunk) => {
                Box::pin(futures_util::stream::once(async move { Ok::<Bytes, std::io::Error>(chunk) }).chain(tail))
            }
            None => Box::pin(tail),
        };

    if status.is_client_error() || status.is_server_error() {
        metrics
            .request_errors_total
            .get_or_create(&crate::metrics::ErrorLabel {
                server: endpoint_url.clone(),
                model: model_label,
                error_type: "upstream_status".to_string(),
            })
            .inc();
    }

    let body = Body::from_stream(stream);
    let mut response = Response::builder().status(status).body(body).unwrap();
    response
        .headers_mut()
        .insert("x-request-id", request_id.parse().unwrap());
    Ok(response)
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_openai_request(&state, "/v1/chat/completions", headers, body, None)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

pub async fn completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_openai_request(&state, "/v1/completions", headers, body, None)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_openai_request(&state, "/v1/embeddings", headers, body, None)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

/// Transcriptions are multipart, not JSON; the request is buffered field by
/// field (rather than forwarded as an opaque byte stream, like the JSON
/// routes) so the `model` field can be read for routing, then rebuilt into a
/// `reqwest` multipart form for the chosen backend.
pub async fn transcriptions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let request_id = generate_request_id(request_id_from_headers(&headers).as_deref());
    debug!(%request_id, headers = ?redacted_headers_for_log(&headers), "dispatching transcription request");

    let mut model: Option<String> = None;
    let mut form = reqwest::multipart::Form::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return RouterError::InvalidBody(e.to_string()).into_response(),
        };
        let name = field.name().unwrap_or("").to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = match field.bytes().await {
            Ok(data) => data,
            Err(e) => return RouterError::InvalidBody(e.to_string()).into_response(),
        };

        if name == "model" {
            model = Some(String::from_utf8_lossy(&data).trim().to_string());
        }

        let mut part = reqwest::multipart::Part::bytes(data.to_vec());
        if let Some(file_name) = file_name {
            part = part.file_name(file_name);
        }
        if let Some(content_type) = content_type {
            if let Ok(part_with_type) = part.mime_str(&content_type) {
                part = part_with_type;
            }
        }
        form = form.part(name, part);
    }

    let Some(model) = model else {
        return RouterError::MissingField("model").into_response();
    };

    let ctx = RequestContext {
        request_id: request_id.clone(),
        model,
        required_role: Some(EndpointRole::Transcription),
        ..Default::default()
    };
    let endpoints = state.discovery.snapshot();
    let stats = state.request_stats.get_stats(now_secs());
    let engine_stats = state.engine_stats.get_engine_stats();
    let Some(chosen) = state.router.route(&endpoints, &stats, &engine_stats, &ctx) else {
        return RouterError::NoHealthyEndpoint(ctx.model).into_response();
    };

    let mut forward_headers = forwardable_headers(&headers);
    forward_headers.remove(reqwest::header::CONTENT_TYPE);

    let client = reqwest::Client::new();
    let url = format!("{chosen}/v1/audio/transcriptions");
    let result = client
        .post(&url)
        .headers(forward_headers)
        .multipart(form)
        .send()
        .await;

    match result {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let bytes = resp.bytes().await.unwrap_or_default();
            let mut response = (status, bytes).into_response();
            response.headers_mut().insert("x-request-id", request_id.parse().unwrap());
            response
        }
        Err(e) => RouterError::Upstream(e).into_response(),
    }
}

pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let endpoints = state.discovery.snapshot();
    let mut models = std::collections::BTreeSet::new();
    for ep in endpoints.iter().filter(|ep| !ep.sleeping) {
        models.extend(ep.models.iter().cloned());
    }
    let data: Vec<Value> = models
        .into_iter()
        .map(|id| serde_json::json!({"id": id, "object": "model"}))
        .collect();
    Json(serde_json::json!({"object": "list", "data": data}))
}

pub async fn version() -> Json<Value> {
    Json(serde_json::json!({"version": env!("CARGO_PKG_VERSION")}))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    if state.healthy() {
        StatusCode::OK.into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(text) => (
            StatusCode::OK,
            [("content-type", "application/openmetrics-text; version=1.0.0; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(e) => RouterError::Internal(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct EndpointIdQuery {
    pub id: String,
}

async fn control_call(state: &AppState, id: &str, path: &str, sleeping: bool) -> Response {
    let endpoints = state.discovery.snapshot();
    let Some(endpoint) = endpoints.iter().find(|ep| ep.url == id || ep.pod_name.as_deref() == Some(id)) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let client = reqwest::Client::new();
    let result = client.post(format!("{}{}", endpoint.url, path)).send().await;
    match result {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            if status.is_success() {
                state.discovery.set_sleep(id, sleeping);
            }
            status.into_response()
        }
        Err(e) => RouterError::Upstream(e).into_response(),
    }
}

pub async fn sleep(State(state): State<Arc<AppState>>, Query(q): Query<EndpointIdQuery>) -> Response {
    control_call(&state, &q.id, "/sleep", true).await
}

pub async fn wake_up(State(state): State<Arc<AppState>>, Query(q): Query<EndpointIdQuery>) -> Response {
    control_call(&state, &q.id, "/wake_up", false).await
}

pub async fn is_sleeping(State(state): State<Arc<AppState>>, Query(q): Query<EndpointIdQuery>) -> Response {
    let endpoints = state.discovery.snapshot();
    match endpoints.iter().find(|ep| ep.url == q.id) {
        Some(endpoint) => Json(serde_json::json!({"is_sleeping": endpoint.sleeping})).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwardable_headers_drops_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "example.com".parse().unwrap());
        headers.insert("authorization", "Bearer x".parse().unwrap());
        let forwarded = forwardable_headers(&headers);
        assert!(!forwarded.contains_key("host"));
        assert!(forwarded.contains_key("authorization"));
    }
}
