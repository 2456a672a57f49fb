//! Remote generation over an OpenAI-compatible chat-completions API.
//!
//! Default endpoint is OpenRouter. Responses are consumed as server-sent
//! events; each `data:` line carries a delta whose content is forwarded as
//! one stream fragment.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::RemoteConfig;

use super::{BackendInfo, GenerationBackend, GenerationParams, TokenStream};

pub struct RemoteBackend {
    endpoint: String,
    api_key: String,
    model: String,
    client: Client,
}

impl RemoteBackend {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(300))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;

        tracing::info!(
            endpoint = %config.endpoint,
            model = %config.model,
            "Remote generation backend ready"
        );

        Ok(Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            client,
        })
    }
}

#[async_trait]
impl GenerationBackend for RemoteBackend {
    async fn stream(&self, prompt: &str, params: &GenerationParams) -> Result<TokenStream> {
        let request = json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": prompt}
            ],
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "stream": true
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow!("Streaming request timed out; check network connectivity")
                } else if e.is_connect() {
                    anyhow!("Failed to connect to remote generation endpoint: {}", e)
                } else {
                    anyhow!("Streaming request failed: {}", e)
                }
            })?;

        let status = response.status();
        // CDNs sometimes answer with an HTML error page instead of SSE
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !status.is_success() || content_type.contains("text/html") {
            let error = response.text().await.unwrap_or_default();
            let preview: String = error.chars().take(300).collect();
            return Err(anyhow!(
                "Remote API streaming error (HTTP {}, content-type: {}): {}",
                status,
                content_type,
                preview
            ));
        }

        let (tx, rx) = mpsc::channel::<Result<String>>(256);
        let mut byte_stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(err) => {
                        let _ = tx
                            .send(Err(anyhow!("Remote stream interrupted: {}", err)))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // Process complete SSE lines
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if line.is_empty() || !line.starts_with("data: ") {
                        continue;
                    }
                    let data = &line[6..];
                    if data == "[DONE]" {
                        return;
                    }

                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) {
                        if let Some(content) = parsed["choices"][0]["delta"]["content"].as_str() {
                            if !content.is_empty()
                                && tx.send(Ok(content.to_string())).await.is_err()
                            {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(TokenStream::new(rx))
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            name: "remote-api".to_string(),
            model: self.model.clone(),
            is_local: false,
        }
    }
}
