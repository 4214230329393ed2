//! Chat session: a transcript plus one request/response exchange per
//! message.

use tracing::{debug, info};

use crate::api::{AuthGate, ChatApi};
use crate::error::ClientError;
use crate::model::{ChatMessage, ChatRole, now_millis};

/// Conversation with the assistant about uploaded files.
pub struct ChatSession<'a, A: ChatApi> {
    api: &'a A,
    transcript: Vec<ChatMessage>,
}

impl<'a, A: ChatApi> ChatSession<'a, A> {
    pub fn new(api: &'a A) -> Self {
        Self {
            api,
            transcript: Vec::new(),
        }
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    /// Send `message` and return the assistant's reply.
    ///
    /// Both sides are appended to the transcript only when the exchange
    /// succeeds, so a failed message can simply be sent again.
    pub async fn send(
        &mut self,
        auth: &dyn AuthGate,
        session_id: &str,
        message: &str,
    ) -> Result<String, ClientError> {
        auth.require("chat")?;
        let message = message.trim();
        if message.is_empty() {
            return Err(ClientError::EmptyMessage);
        }

        let sent_at = now_millis();
        debug!(chars = message.len(), "sending chat message");
        let reply = self.api.send_message(message, session_id).await?;
        info!(reply_chars = reply.len(), "chat reply received");

        self.transcript.push(ChatMessage {
            role: ChatRole::User,
            content: message.to_string(),
            timestamp: sent_at,
        });
        self.transcript.push(ChatMessage {
            role: ChatRole::Assistant,
            content: reply.clone(),
            timestamp: now_millis(),
        });
        Ok(reply)
    }

    pub fn clear(&mut self) {
        self.transcript.clear();
    }
}
