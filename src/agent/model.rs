// Model client seam

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::conversation::Message;

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
}

/// A language model that streams one assistant turn as text fragments
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn name(&self) -> &str;

    /// Start a turn; fragments arrive on the receiver until it closes.
    /// Dropping the receiver abandons the turn.
    async fn stream_turn(&self, request: &TurnRequest) -> Result<mpsc::Receiver<Result<String>>>;
}
