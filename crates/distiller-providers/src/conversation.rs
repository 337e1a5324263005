use std::sync::Arc;

use distiller_types::RemoteFileHandle;
use tokio_util::sync::CancellationToken;

use crate::{ChunkStream, ConversationMessage, MessageRole, RemoteModelClient, TurnRequest};

/// Multi-turn conversation owned by exactly one job.
///
/// History is kept on this side of the wire and only grows through
/// [`Conversation::commit`], so an attempt that fails or is discarded leaves
/// no trace in the context sent with the next call. Deliberately not `Clone`.
pub struct Conversation {
    client: Arc<dyn RemoteModelClient>,
    model: String,
    temperature: f32,
    history: Vec<ConversationMessage>,
}

impl Conversation {
    pub fn new(client: Arc<dyn RemoteModelClient>, model: impl Into<String>, temperature: f32) -> Self {
        Self {
            client,
            model: model.into(),
            temperature,
            history: Vec::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider_id(&self) -> String {
        self.client.info().id
    }

    /// Number of model replies accepted so far.
    pub fn committed_turns(&self) -> usize {
        self.history
            .iter()
            .filter(|m| m.role == MessageRole::Model)
            .count()
    }

    /// True until the first turn is committed; the artifact handle is only
    /// attached while this holds.
    pub fn is_fresh(&self) -> bool {
        self.history.is_empty()
    }

    pub fn history(&self) -> &[ConversationMessage] {
        &self.history
    }

    pub fn request_for(&self, prompt: &str, attachment: Option<&RemoteFileHandle>) -> TurnRequest {
        let mut messages = self.history.clone();
        messages.push(ConversationMessage {
            role: MessageRole::User,
            text: prompt.to_string(),
            attachment: attachment.cloned(),
        });
        TurnRequest {
            model: self.model.clone(),
            temperature: self.temperature,
            messages,
        }
    }

    pub async fn stream(
        &self,
        prompt: &str,
        attachment: Option<&RemoteFileHandle>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let request = self.request_for(prompt, attachment);
        self.client.stream(request, cancel).await
    }

    /// Records an accepted exchange so later turns carry it as context.
    pub fn commit(&mut self, prompt: &str, attachment: Option<RemoteFileHandle>, reply: &str) {
        self.history.push(ConversationMessage {
            role: MessageRole::User,
            text: prompt.to_string(),
            attachment,
        });
        self.history.push(ConversationMessage {
            role: MessageRole::Model,
            text: reply.to_string(),
            attachment: None,
        });
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("messages", &self.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalEchoClient;

    fn handle() -> RemoteFileHandle {
        RemoteFileHandle {
            name: "files/abc".to_string(),
            uri: "https://files/abc".to_string(),
            mime_type: "application/pdf".to_string(),
        }
    }

    #[test]
    fn request_appends_prompt_after_committed_history() {
        let mut conversation = Conversation::new(Arc::new(LocalEchoClient::new(3)), "m", 0.7);
        assert!(conversation.is_fresh());
        let first = conversation.request_for("Seed", Some(&handle()));
        assert_eq!(first.messages.len(), 1);
        assert!(first.messages[0].attachment.is_some());

        conversation.commit("Seed", Some(handle()), "Part one");
        let second = conversation.request_for("Next", None);
        assert_eq!(second.messages.len(), 3);
        assert_eq!(second.messages[1].role, MessageRole::Model);
        assert_eq!(second.messages[2].text, "Next");
        assert!(second.messages[2].attachment.is_none());
        assert_eq!(
            second
                .messages
                .iter()
                .filter(|m| m.attachment.is_some())
                .count(),
            1
        );
        assert_eq!(conversation.committed_turns(), 1);
    }

    #[test]
    fn building_requests_never_mutates_history() {
        let conversation = Conversation::new(Arc::new(LocalEchoClient::new(3)), "m", 0.7);
        let _ = conversation.request_for("Seed", None);
        let _ = conversation.request_for("Seed", None);
        assert!(conversation.history().is_empty());
    }
}
