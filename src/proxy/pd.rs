use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::error::RouterError;
use crate::proxy::kv_sidecar::KvReadySidecar;

/// States of the disaggregated prefill/decode pipeline for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdState {
    Tokenize,
    Prefill,
    WaitKv,
    Decode,
    Done,
    Error,
}

#[derive(Debug, Clone)]
pub struct KvTransferParams {
    pub req_id: String,
    pub receiver_host: String,
    pub receiver_init_port: u16,
    pub receiver_alloc_port: u16,
}

impl KvTransferParams {
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "req_id": self.req_id,
            "receiver_host": self.receiver_host,
            "receiver_init_port": self.receiver_init_port,
            "receiver_alloc_port": self.receiver_alloc_port,
            "ret_first_tok": true,
        })
    }
}

/// Runs one request through TOKENIZE -> PREFILL -> WAIT_KV -> DECODE,
/// returning the first token produced by the prefill stage plus the tail
/// request body ready to send to the decode endpoint. Grounded on
/// `services/request_service/request.py`'s disaggregated branch.
pub struct PdPipeline<'a> {
    pub client: &'a reqwest::Client,
    pub prefill_url: &'a str,
    pub decode_url: &'a str,
    pub kv_sidecar: &'a KvReadySidecar,
    pub kv_wait_timeout: Duration,
}

pub struct PrefillOutcome {
    /// The token id prefill produced, to be appended to `token_ids` before
    /// the decode call continues generation from it.
    pub first_token_id: i64,
    /// The prefill response's choice for that token, reshaped into a
    /// streaming chunk and sent to the client ahead of the decode stream so
    /// the client sees one uniform stream.
    pub first_choice: Value,
    pub token_ids: Vec<i64>,
}

impl<'a> PdPipeline<'a> {
    /// TOKENIZE: ask the prefill engine to tokenize the prompt.
    pub async fn tokenize(&self, prompt: &str) -> Result<Vec<i64>, RouterError> {
        let resp = self
            .client
            .post(format!("{}/tokenize", self.prefill_url))
            .json(&serde_json::json!({"prompt": prompt}))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(RouterError::Upstream(resp.error_for_status().unwrap_err()));
        }
        let body: Value = resp.json().await?;
        let tokens = body
            .get("tokens")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();
        Ok(tokens)
    }

    /// PREFILL: run the one-token prefill call carrying `kv_transfer_params`,
    /// returning the first token synthesized for the client-visible stream.
    pub async fn prefill(
        &self,
        token_ids: Vec<i64>,
        model: &str,
        kv_params: &KvTransferParams,
    ) -> Result<PrefillOutcome, RouterError> {
        let body = serde_json::json!({
            "model": model,
            "prompt": token_ids.clone(),
            "max_tokens": 1,
            "stream": false,
            "kv_transfer_params": kv_params.to_json(),
        });
        let resp = self
            .client
            .post(format!("{}/v1/completions", self.prefill_url))
            .json(&body)
            .send()
            .await?;
        if resp.status().is_server_error() {
            return Err(RouterError::Upstream(resp.error_for_status().unwrap_err()));
        }
        let body: Value = resp.json().await?;
        let first_token_id = body.get("first_tok").and_then(Value::as_i64).unwrap_or(0);
        let first_choice = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .cloned()
            .unwrap_or(Value::Null);
        Ok(PrefillOutcome { first_token_id, first_choice, token_ids })
    }

    /// WAIT_KV: wait, with a bounded deadline, for the out-of-band KV-ready
    /// signal. A timeout is not fatal -- the decode engine is expected to
    /// detect missing KV state and recompute.
    pub async fn wait_kv_ready(&self, req_id: &str) {
        let deadline = tokio::time::Instant::now() + self.kv_wait_timeout;
        loop {
            if self.kv_sidecar.is_ready(req_id) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(%req_id, "kv-ready wait timed out, proceeding to decode anyway");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// DECODE: stream the remaining tokens from the decode endpoint, resuming
    /// from the token prefill already produced.
    pub async fn decode(
        &self,
        prefill: &PrefillOutcome,
        model: &str,
        max_tokens: u64,
    ) -> Result<reqwest::Response, RouterError> {
        let remaining = max_tokens.saturating_sub(1);
        let mut prompt = prefill.token_ids.clone();
        prompt.push(prefill.first_token_id);
        let body = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "max_tokens": remaining,
            "stream": true,
        });
        let resp = self
            .client
            .post(format!("{}/v1/completions", self.decode_url))
            .json(&body)
            .send()
            .await?;
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_transfer_params_serialize_expected_shape() {
        let params = KvTransferParams {
            req_id: "r1".to_string(),
            receiver_host: "10.0.0.2".to_string(),
            receiver_init_port: 1234,
            receiver_alloc_port: 1235,
        };
        let json = params.to_json();
        assert_eq!(json["req_id"], "r1");
        assert_eq!(json["ret_first_tok"], true);
    }

    #[tokio::test]
    async fn wait_kv_ready_returns_immediately_once_signalled() {
        let sidecar = KvReadySidecar::new();
        sidecar.finished_for_test("r1");
        let client = reqwest::Client::new();
        let pipeline = PdPipeline {
            client: &client,
            prefill_url: "http://prefill",
            decode_url: "http://decode",
            kv_sidecar: &sidecar,
            kv_wait_timeout: Duration::from_secs(5),
        };
        let start = std::time::Instant::now();
        pipeline.wait_kv_ready("r1").await;
        assert!(start.elapsed() < Duration::from_millis(200));
    }
}
