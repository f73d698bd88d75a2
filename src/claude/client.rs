// HTTP client for Claude API

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;

use super::streaming::{parse_sse_line, SseLine};
use crate::agent::{Message, ModelClient, TurnRequest};
use crate::config::ModelConfig;
use crate::errors::{api_key_missing_error, provider_http_error};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [Message],
    stream: bool,
}

pub struct ClaudeClient {
    client: Client,
    api_key: String,
    api_url: String,
    model: String,
}

impl ClaudeClient {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!(api_key_missing_error("Anthropic", "ANTHROPIC_API_KEY")))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key,
            api_url: config.api_url.clone(),
            model: config.name.clone(),
        })
    }
}

#[async_trait]
impl ModelClient for ClaudeClient {
    fn name(&self) -> &str {
        &self.model
    }

    /// Returns a channel that receives text chunks as they arrive
    async fn stream_turn(&self, request: &TurnRequest) -> Result<mpsc::Receiver<Result<String>>> {
        let (tx, rx) = mpsc::channel(100);

        let body = MessageRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            system: &request.system,
            messages: &request.messages,
            stream: true,
        };

        tracing::debug!(
            model = %self.model,
            messages = request.messages.len(),
            "Sending streaming request to Claude API"
        );

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .context("Failed to send streaming request to Claude API")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!(provider_http_error("Claude", status.as_u16(), &error_body));
        }

        // Spawn task to parse SSE stream
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = Vec::new();

            'chunks: while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        buffer.extend_from_slice(&bytes);

                        while let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                            let line_bytes: Vec<u8> = buffer.drain(..=newline_pos).collect();
                            let line = String::from_utf8_lossy(&line_bytes);

                            match parse_sse_line(line.trim_end()) {
                                SseLine::Text(text) => {
                                    if tx.send(Ok(text)).await.is_err() {
                                        // Receiver dropped, stop streaming
                                        break 'chunks;
                                    }
                                }
                                SseLine::Done => {
                                    tracing::debug!("Stream completed");
                                    break 'chunks;
                                }
                                SseLine::Error(message) => {
                                    let _ = tx
                                        .send(Err(anyhow::anyhow!("Claude stream error: {}", message)))
                                        .await;
                                    break 'chunks;
                                }
                                SseLine::Ignored => {}
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn config(api_url: String) -> ModelConfig {
        ModelConfig {
            api_key: Some("sk-ant-test".to_string()),
            api_url,
            ..ModelConfig::default()
        }
    }

    fn request() -> TurnRequest {
        TurnRequest {
            system: "system".to_string(),
            messages: vec![Message::user("hi")],
            max_tokens: 64,
        }
    }

    #[test]
    fn test_missing_api_key() {
        let err = ClaudeClient::new(&ModelConfig::default()).err().unwrap();
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }

    #[tokio::test]
    async fn test_stream_text_deltas() {
        let mut server = Server::new_async().await;
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"<python>print(1+1\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\")</python>\"}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "sk-ant-test")
            .match_header("anthropic-version", ANTHROPIC_VERSION)
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let client = ClaudeClient::new(&config(format!("{}/v1/messages", server.url()))).unwrap();
        let mut rx = client.stream_turn(&request()).await.unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk.unwrap());
        }
        assert_eq!(chunks, vec!["<python>print(1+1", ")</python>"]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_error_is_reported() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/messages")
            .with_status(401)
            .with_body(r#"{"error":"invalid x-api-key"}"#)
            .create_async()
            .await;

        let client = ClaudeClient::new(&config(format!("{}/v1/messages", server.url()))).unwrap();
        let err = client.stream_turn(&request()).await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
