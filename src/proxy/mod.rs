pub mod kv_sidecar;
pub mod pd;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::discovery::ServiceDiscovery;
use crate::error::RouterError;
use crate::proxy::kv_sidecar::KvReadySidecar;
use crate::proxy::pd::{KvTransferParams, PdPipeline};
use crate::routing::{RequestContext, Router};
use crate::telemetry::{EngineStats, RequestStatsMonitor};
use crate::types::EndpointRole;

/// Pluggable hook that may rewrite a request body before it is routed and
/// forwarded, e.g. to inject default sampling parameters or strip
/// organization-internal fields. Mirrors the original's
/// `get_request_rewriter()` / `is_request_rewriter_initialized()` pair.
pub trait RequestRewriter: Send + Sync {
    fn rewrite(&self, body: Value) -> Value;
}

#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub aliases: HashMap<String, String>,
    pub max_failover_attempts: u32,
}

/// Reads the `model` field of a parsed request body.
pub fn extract_model(body: &Value) -> Result<String, RouterError> {
    body.get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(RouterError::MissingField("model"))
}

/// If `model` names a registered alias, rewrites the body's `model` field to
/// the canonical name in place and returns the canonical name; otherwise
/// returns `model` unchanged. Grounded on `utils.py`'s
/// `replace_model_in_request_body`.
pub fn apply_alias(body: &mut Value, model: &str, aliases: &HashMap<String, String>) -> String {
    match aliases.get(model) {
        Some(canonical) => {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("model".to_string(), Value::String(canonical.clone()));
            }
            canonical.clone()
        }
        None => model.to_string(),
    }
}

pub fn request_content_key(body: &Value) -> String {
    body.get("messages")
        .or_else(|| body.get("prompt"))
        .or_else(|| body.get("input"))
        .map(|v| v.to_string())
        .unwrap_or_default()
}

pub fn generate_request_id(caller_provided: Option<&str>) -> String {
    caller_provided
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Best-effort prompt text pulled from a chat or completion body, used as the
/// TOKENIZE-stage input for the disaggregated pipeline.
fn extract_prompt_text(body: &Value) -> String {
    if let Some(prompt) = body.get("prompt").and_then(Value::as_str) {
        return prompt.to_string();
    }
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        return messages
            .iter()
            .filter_map(|m| m.get("content").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
    }
    String::new()
}

/// Wiring needed to run requests through [`PdPipeline`] instead of a single
/// proxied call. Present only when `--routing-logic=disaggregated`.
#[derive(Clone)]
pub struct DisaggregatedConfig {
    pub kv_sidecar: Arc<KvReadySidecar>,
    pub kv_wait_timeout: Duration,
    pub kv_receiver_host: String,
    pub kv_receiver_init_port: u16,
    pub kv_receiver_alloc_port: u16,
}

/// Owns the HTTP client used to talk to backends and composes aliasing,
/// the rewriter hook, routing, and bounded failover into one call.
pub struct Proxy {
    client: reqwest::Client,
    discovery: Arc<dyn ServiceDiscovery>,
    router: Arc<Router>,
    request_stats: Arc<RequestStatsMonitor>,
    rewriter: Option<Arc<dyn RequestRewriter>>,
    config: ProxyConfig,
    disaggregated: Option<DisaggregatedConfig>,
}

/// Outcome of a successful dispatch: which endpoint answered and its raw
/// (not yet streamed) response, plus the final request body actually sent
/// (after aliasing/rewriting) for callers that need it (e.g. disaggregated
/// staging).
pub struct Dispatched {
    pub endpoint_url: String,
    pub response: reqwest::Response,
    pub body: Value,
    /// A synthesized leading SSE chunk to emit before `response`'s own
    /// stream, carrying the token the disaggregated prefill stage already
    /// produced. `None` outside the disaggregated path.
    pub leading_chunk: Option<bytes::Bytes>,
}

impl Proxy {
    pub fn new(
        discovery: Arc<dyn ServiceDiscovery>,
        router: Arc<Router>,
        request_stats: Arc<RequestStatsMonitor>,
        rewriter: Option<Arc<dyn RequestRewriter>>,
        config: ProxyConfig,
        disaggregated: Option<DisaggregatedConfig>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            discovery,
            router,
            request_stats,
            rewriter,
            config,
            disaggregated,
        }
    }

    /// Applies aliasing and the optional rewriter hook, producing the final
    /// body to route and forward.
    pub fn prepare_body(&self, mut body: Value) -> Result<(Value, String), RouterError> {
        let model = extract_model(&body)?;
        let canonical = apply_alias(&mut body, &model, &self.config.aliases);
        let body = match &self.rewriter {
            Some(rewriter) => rewriter.rewrite(body),
            None => body,
        };
        Ok((body, canonical))
    }

    /// Routes and forwards `body` to `path` on the chosen backend, retrying
    /// on connect errors or a 5xx response received before any bytes of a
    /// streamed body, up to `max_failover_attempts` additional attempts.
    /// HTTP 4xx responses are never retried.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        mut body: Value,
        path: &str,
        forward_headers: reqwest::header::HeaderMap,
        engine_stats: &HashMap<String, EngineStats>,
        now: f64,
    ) -> Result<Dispatched, RouterError> {
        if let Some(cfg) = self.disaggregated.clone() {
            return self.dispatch_disaggregated(ctx, body, engine_stats, now, &cfg).await;
        }

        let mut tried: HashSet<String> = HashSet::new();
        let mut attempts_left = self.config.max_failover_attempts + 1;
        let mut last_err: Option<String> = None;

        while attempts_left > 0 {
            attempts_left -= 1;

            let all_endpoints = self.discovery.snapshot();
            let candidates: Vec<_> = all_endpoints
                .iter()
                .filter(|ep| !tried.contains(&ep.url))
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }

            let stats_snapshot = self.request_stats.get_stats(now);
            let Some(chosen) = self.router.route(&candidates, &stats_snapshot, engine_stats, ctx) else {
                break;
            };

            self.request_stats.on_new_request(&chosen, &ctx.request_id, now);

            let url = format!("{chosen}{path}");
            let result = self
                .client
                .post(&url)
                .headers(forward_headers.clone())
                .json(&body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_server_error() => {
                    warn!(url = %chosen, status = %resp.status(), "upstream 5xx before streaming, failing over");
                    tried.insert(chosen);
                    last_err = Some(format!("upstream returned {}", resp.status()));
                    continue;
                }
                Ok(response) => {
                    return Ok(Dispatched {
                        endpoint_url: chosen,
                        response,
                        body: std::mem::take(&mut body),
                        leading_chunk: None,
                    });
                }
                Err(e) => {
                    warn!(url = %chosen, error = %e, "upstream connect error, failing over");
                    tried.insert(chosen);
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(RouterError::FailoverExhausted(
            last_err.unwrap_or_else(|| "no endpoints available".to_string()),
        ))
    }

    /// Runs one request through the disaggregated TOKENIZE -> PREFILL ->
    /// WAIT_KV -> DECODE pipeline instead of a single proxied call. A prefill
    /// endpoint and a decode endpoint are each chosen with the normal router
    /// (role-filtered via `ctx.required_role`), then `PdPipeline` drives the
    /// staged calls; the returned `Dispatched` carries the decode engine's
    /// streaming response.
    async fn dispatch_disaggregated(
        &self,
        ctx: &RequestContext,
        body: Value,
        engine_stats: &HashMap<String, EngineStats>,
        now: f64,
        cfg: &DisaggregatedConfig,
    ) -> Result<Dispatched, RouterError> {
        let all_endpoints = self.discovery.snapshot();
        let stats_snapshot = self.request_stats.get_stats(now);

        let mut prefill_ctx = ctx.clone();
        prefill_ctx.required_role = Some(EndpointRole::Prefill);
        let prefill_url = self
            .router
            .route(&all_endpoints, &stats_snapshot, engine_stats, &prefill_ctx)
            .ok_or_else(|| RouterError::NoHealthyEndpoint(ctx.model.clone()))?;

        let mut decode_ctx = ctx.clone();
        decode_ctx.required_role = Some(EndpointRole::Decode);
        let decode_url = self
            .router
            .route(&all_endpoints, &stats_snapshot, engine_stats, &decode_ctx)
            .ok_or_else(|| RouterError::NoHealthyEndpoint(ctx.model.clone()))?;

        self.request_stats.on_new_request(&prefill_url, &ctx.request_id, now);

        let prompt = extract_prompt_text(&body);
        let pipeline = PdPipeline {
            client: &self.client,
            prefill_url: &prefill_url,
            decode_url: &decode_url,
            kv_sidecar: &cfg.kv_sidecar,
            kv_wait_timeout: cfg.kv_wait_timeout,
        };

        let token_ids = pipeline.tokenize(&prompt).await?;
        let kv_params = KvTransferParams {
            req_id: ctx.request_id.clone(),
            receiver_host: cfg.kv_receiver_host.clone(),
            receiver_init_port: cfg.kv_receiver_init_port,
            receiver_alloc_port: cfg.kv_receiver_alloc_port,
        };
        let prefill = pipeline.prefill(token_ids, &ctx.model, &kv_params).await?;
        pipeline.wait_kv_ready(&ctx.request_id).await;

        let max_tokens = ctx.max_tokens.unwrap_or(16);
        let response = pipeline.decode(&prefill, &ctx.model, max_tokens).await?;

        let leading = serde_json::json!({
            "id": format!("cmpl-{}", ctx.request_id),
            "object": "text_completion",
            "model": ctx.model,
            "choices": [prefill.first_choice],
        });
        let leading_chunk = bytes::Bytes::from(format!("data: {leading}\n\n"));

        Ok(Dispatched { endpoint_url: decode_url, response, body, leading_chunk: Some(leading_chunk) })
    }

    /// Sends `body` straight to `endpoint_url` without re-running routing,
    /// for callers (the admission queue) that already picked the endpoint.
    pub async fn dispatch_direct(
        &self,
        ctx: &RequestContext,
        endpoint_url: &str,
        mut body: Value,
        path: &str,
        forward_headers: reqwest::header::HeaderMap,
        now: f64,
    ) -> Result<Dispatched, RouterError> {
        self.request_stats.on_new_request(endpoint_url, &ctx.request_id, now);
        let url = format!("{endpoint_url}{path}");
        let response = self.client.post(&url).headers(forward_headers).json(&body).send().await?;
        Ok(Dispatched {
            endpoint_url: endpoint_url.to_string(),
            response,
            body: std::mem::take(&mut body),
            leading_chunk: None,
        })
    }

    pub fn request_stats(&self) -> &Arc<RequestStatsMonitor> {
        &self.request_stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_alias_rewrites_known_alias() {
        let mut body = serde_json::json!({"model": "gpt-4", "messages": []});
        let mut aliases = HashMap::new();
        aliases.insert("gpt-4".to_string(), "llama-3-70b".to_string());
        let canonical = apply_alias(&mut body, "gpt-4", &aliases);
        assert_eq!(canonical, "llama-3-70b");
        assert_eq!(body["model"], "llama-3-70b");
    }

    #[test]
    fn apply_alias_leaves_unknown_model_untouched() {
        let mut body = serde_json::json!({"model": "llama-3-8b"});
        let canonical = apply_alias(&mut body, "llama-3-8b", &HashMap::new());
        assert_eq!(canonical, "llama-3-8b");
        assert_eq!(body["model"], "llama-3-8b");
    }

    #[test]
    fn extract_model_requires_field() {
        let body = serde_json::json!({"messages": []});
        assert!(extract_model(&body).is_err());
    }

    #[test]
    fn generate_request_id_prefers_caller_value() {
        assert_eq!(generate_request_id(Some("abc-123")), "abc-123");
        assert_ne!(generate_request_id(None), "");
    }
}
