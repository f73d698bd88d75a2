// Claude API client module
// Streams assistant turns from the Anthropic messages API

mod client;
pub(crate) mod streaming;

pub use client::ClaudeClient;
pub use streaming::{parse_sse_line, SseLine, StreamDelta, StreamError, StreamEvent};
