// Server-Sent Events parsing for Claude API streaming

use serde::{Deserialize, Serialize};

/// Server-Sent Event from Claude API
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub index: Option<usize>,
    pub delta: Option<StreamDelta>,
    pub error: Option<StreamError>,
}

/// Delta within a streaming event
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamDelta {
    #[serde(rename = "type")]
    pub delta_type: Option<String>,
    pub text: Option<String>,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl StreamEvent {
    /// Check if this event contains a text delta
    pub fn is_text_delta(&self) -> bool {
        self.event_type == "content_block_delta"
            && self
                .delta
                .as_ref()
                .and_then(|d| d.delta_type.as_deref())
                .map(|t| t == "text_delta")
                .unwrap_or(false)
    }

    /// Extract text from the event if available
    pub fn text(&self) -> Option<&str> {
        self.delta.as_ref()?.text.as_deref()
    }

    pub fn is_stop(&self) -> bool {
        self.event_type == "message_stop"
    }
}

/// What one SSE line carried
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Text(String),
    Done,
    Error(String),
    Ignored,
}

/// Interpret one line of the event stream
pub fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Ignored;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<StreamEvent>(data) {
        Ok(event) if event.is_text_delta() => match event.text() {
            Some(text) if !text.is_empty() => SseLine::Text(text.to_string()),
            _ => SseLine::Ignored,
        },
        Ok(event) if event.is_stop() => SseLine::Done,
        Ok(event) if event.event_type == "error" => SseLine::Error(
            event
                .error
                .map(|e| format!("{}: {}", e.error_type, e.message))
                .unwrap_or_else(|| "unknown stream error".to_string()),
        ),
        Ok(_) => SseLine::Ignored,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unparseable stream event");
            SseLine::Ignored
        }
    }
}
