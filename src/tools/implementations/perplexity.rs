// Perplexity tool - web search through the Perplexity chat completions API

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::PerplexityToolConfig;
use crate::tags::ToolKind;
use crate::tools::executor::{InvocationContext, ToolError, ToolExecutor};

const SYSTEM_PROMPT: &str = "You are a helpful AI assistant that provides accurate, \
    detailed, and well-researched answers to questions.";

const MISSING_KEY: &str = "Perplexity API key not configured. \
    Please set the PERPLEXITY_API_KEY environment variable.";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

pub struct PerplexityTool {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    temperature: f32,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, (Instant, String)>>,
}

impl PerplexityTool {
    pub fn new(config: &PerplexityToolConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("glad/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn cached(&self, query: &str) -> Option<String> {
        let mut cache = self.cache.lock().ok()?;
        match cache.get(query) {
            Some((at, answer)) if at.elapsed() < self.cache_ttl => Some(answer.clone()),
            Some(_) => {
                cache.remove(query);
                None
            }
            None => None,
        }
    }

    fn store(&self, query: &str, answer: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            let ttl = self.cache_ttl;
            cache.retain(|_, (at, _)| at.elapsed() < ttl);
            cache.insert(query.to_string(), (Instant::now(), answer.to_string()));
        }
    }

    async fn search(&self, api_key: &str, query: &str) -> Result<String, ToolError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: query,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ToolError::execution(format!("Search request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(200).collect();
            return Err(ToolError::execution(format!(
                "Perplexity API error {}: {}",
                status, body
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ToolError::execution(format!("Invalid search response: {}", e)))?;

        let answer = parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message)
            .map(|message| message.content.trim().to_string())
            .ok_or_else(|| ToolError::execution("No response content received"))?;

        if answer.is_empty() {
            return Ok("No answer found for the query.".to_string());
        }
        Ok(answer)
    }
}

#[async_trait]
impl ToolExecutor for PerplexityTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Perplexity
    }

    fn description(&self) -> &str {
        "Search the web for current information and return a sourced summary"
    }

    fn supports_cancellation(&self) -> bool {
        true
    }

    async fn invoke(&self, input: &str, ctx: &InvocationContext) -> Result<String, ToolError> {
        let query = input.trim();
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(ToolError::rejected(MISSING_KEY));
        };

        if let Some(answer) = self.cached(query) {
            tracing::debug!(task_id = %ctx.task_id, "Returning cached search result");
            return Ok(format!("{}\n(cached result)", answer));
        }

        tracing::info!(task_id = %ctx.task_id, query, "Running web search");
        let answer = self.search(api_key, query).await?;
        self.store(query, &answer);
        Ok(answer)
    }
}
