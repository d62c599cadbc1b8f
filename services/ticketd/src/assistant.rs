//! Conversational assistant seam
//!
//! The real assistant is an external service; the trait is all the front
//! depends on. The bundled implementation answers from a small script so
//! the endpoint works end to end without network access.

use async_trait::async_trait;

#[async_trait]
pub trait Assistant: Send + Sync + 'static {
    async fn chat(&self, user: &str, prompt: &str) -> String;
}

/// Canned-answer assistant for demos and tests
#[derive(Debug, Default)]
pub struct ScriptedAssistant;

#[async_trait]
impl Assistant for ScriptedAssistant {
    async fn chat(&self, user: &str, prompt: &str) -> String {
        let lower = prompt.to_lowercase();
        if lower.contains("refund") || lower.contains("cancel") {
            format!(
                "{user}, you can cancel a booking from your booking list; \
                 paid bookings are refunded to the original payment method."
            )
        } else if lower.contains("hold") || lower.contains("expire") {
            format!(
                "{user}, held seats are released automatically if payment \
                 does not arrive before the hold expires."
            )
        } else {
            format!("{user}, ask me about bookings, holds or refunds.")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_answers_mention_the_user() {
        let assistant = ScriptedAssistant;
        let reply = assistant.chat("alice", "how do refunds work?").await;
        assert!(reply.contains("alice"));
        assert!(reply.contains("refund"));
    }
}
