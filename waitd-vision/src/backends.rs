// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;

use crate::{EvaluateOptions, Health, Result, VisionBackend};

/// Vision calls can legitimately take a while (large models, cold starts);
/// the scheduler relies on this bound rather than imposing its own.
const EVALUATE_TIMEOUT: Duration = Duration::from_secs(150);

fn http_client() -> reqwest::Client {
  reqwest::Client::builder()
    .timeout(EVALUATE_TIMEOUT)
    .build()
    .expect("reqwest client with a fixed timeout always builds")
}

/// Always reports `watching`, with no actual model call. Used by default
/// and in tests — screenshots are still captured and journaled, only the
/// judgement is skipped.
pub struct PassthroughBackend;

#[async_trait]
impl VisionBackend for PassthroughBackend {
  async fn evaluate_condition(&self, _prompt: &str, _images: &[Vec<u8>], _opts: &EvaluateOptions) -> Result<String> {
    Ok(
      "FINAL_JSON: {\"decision\":\"watching\",\"confidence\":0.0,\"evidence\":[],\"summary\":\"passthrough backend — no vision evaluation\"}"
        .to_owned(),
    )
  }

  async fn check_health(&self) -> Health {
    Health { ok: true, backend: "passthrough", detail: "no vision model — screenshots only".to_owned() }
  }
}

fn encode_images(images: &[Vec<u8>]) -> Vec<String> {
  images.iter().map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes)).collect()
}

/// A local Ollama server exposing a vision-capable chat model.
pub struct OllamaBackend {
  client: reqwest::Client,
  base_url: String,
  default_model: String,
}

impl OllamaBackend {
  pub fn new(base_url: impl Into<String>, default_model: impl Into<String>) -> Self {
    OllamaBackend { client: http_client(), base_url: base_url.into(), default_model: default_model.into() }
  }
}

#[async_trait]
impl VisionBackend for OllamaBackend {
  async fn evaluate_condition(&self, prompt: &str, images: &[Vec<u8>], opts: &EvaluateOptions) -> Result<String> {
    let model = opts.model.clone().unwrap_or_else(|| self.default_model.clone());
    let body = json!({
      "model": model,
      "prompt": prompt,
      "images": encode_images(images),
      "stream": false,
    });
    let response = self
      .client
      .post(format!("{}/api/generate", self.base_url))
      .json(&body)
      .send()
      .await?
      .error_for_status()?;
    let parsed: serde_json::Value = response.json().await?;
    Ok(parsed.get("response").and_then(|v| v.as_str()).unwrap_or_default().to_owned())
  }

  async fn check_health(&self) -> Health {
    match self.client.get(format!("{}/api/tags", self.base_url)).send().await {
      Ok(resp) if resp.status().is_success() => {
        Health { ok: true, backend: "ollama", detail: format!("reachable at {}", self.base_url) }
      }
      Ok(resp) => Health { ok: false, backend: "ollama", detail: format!("status {}", resp.status()) },
      Err(e) => Health { ok: false, backend: "ollama", detail: e.to_string() },
    }
  }
}

/// An OpenAI-compatible vLLM server.
pub struct VllmBackend {
  client: reqwest::Client,
  base_url: String,
  default_model: String,
}

impl VllmBackend {
  pub fn new(base_url: impl Into<String>, default_model: impl Into<String>) -> Self {
    VllmBackend { client: http_client(), base_url: base_url.into(), default_model: default_model.into() }
  }
}

#[async_trait]
impl VisionBackend for VllmBackend {
  async fn evaluate_condition(&self, prompt: &str, images: &[Vec<u8>], opts: &EvaluateOptions) -> Result<String> {
    let model = opts.model.clone().unwrap_or_else(|| self.default_model.clone());
    let content: Vec<serde_json::Value> = std::iter::once(json!({"type": "text", "text": prompt}))
      .chain(encode_images(images).into_iter().map(|b64| {
        json!({"type": "image_url", "image_url": {"url": format!("data:image/jpeg;base64,{b64}")}})
      }))
      .collect();
    let body = json!({
      "model": model,
      "messages": [{"role": "user", "content": content}],
    });
    let response = self
      .client
      .post(format!("{}/v1/chat/completions", self.base_url))
      .json(&body)
      .send()
      .await?
      .error_for_status()?;
    let parsed: serde_json::Value = response.json().await?;
    Ok(parsed["choices"][0]["message"]["content"].as_str().unwrap_or_default().to_owned())
  }

  async fn check_health(&self) -> Health {
    match self.client.get(format!("{}/v1/models", self.base_url)).send().await {
      Ok(resp) if resp.status().is_success() => {
        Health { ok: true, backend: "vllm", detail: format!("reachable at {}", self.base_url) }
      }
      Ok(resp) => Health { ok: false, backend: "vllm", detail: format!("status {}", resp.status()) },
      Err(e) => Health { ok: false, backend: "vllm", detail: e.to_string() },
    }
  }
}

/// Anthropic's Claude API.
pub struct ClaudeBackend {
  client: reqwest::Client,
  api_key: String,
  default_model: String,
}

impl ClaudeBackend {
  pub fn new(api_key: impl Into<String>, default_model: impl Into<String>) -> Self {
    ClaudeBackend { client: http_client(), api_key: api_key.into(), default_model: default_model.into() }
  }
}

#[async_trait]
impl VisionBackend for ClaudeBackend {
  async fn evaluate_condition(&self, prompt: &str, images: &[Vec<u8>], opts: &EvaluateOptions) -> Result<String> {
    let model = opts.model.clone().unwrap_or_else(|| self.default_model.clone());
    let mut content: Vec<serde_json::Value> = encode_images(images)
      .into_iter()
      .map(|b64| json!({"type": "image", "source": {"type": "base64", "media_type": "image/jpeg", "data": b64}}))
      .collect();
    content.push(json!({"type": "text", "text": prompt}));
    let body = json!({
      "model": model,
      "max_tokens": 512,
      "messages": [{"role": "user", "content": content}],
    });
    let response = self
      .client
      .post("https://api.anthropic.com/v1/messages")
      .header("x-api-key", &self.api_key)
      .header("anthropic-version", "2023-06-01")
      .json(&body)
      .send()
      .await?
      .error_for_status()?;
    let parsed: serde_json::Value = response.json().await?;
    Ok(parsed["content"][0]["text"].as_str().unwrap_or_default().to_owned())
  }

  async fn check_health(&self) -> Health {
    Health { ok: !self.api_key.is_empty(), backend: "claude", detail: "api key configured locally".to_owned() }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn passthrough_always_reports_watching() {
    let backend = PassthroughBackend;
    let reply = backend.evaluate_condition("x", &[], &EvaluateOptions::default()).await.unwrap();
    assert!(reply.contains("\"decision\":\"watching\""));
    assert!(backend.check_health().await.ok);
  }
}
