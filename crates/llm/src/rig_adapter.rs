use rig::completion::{CompletionModel, Message as RigMessage};
use rig::message::AssistantContent;
use rig::prelude::CompletionClient as _;
use rig::providers::gemini;
use snafu::{OptionExt, ResultExt};

use super::provider::{
    BoxFuture, ClientConfig, CompletionClient, CompletionResult, EmptyReplySnafu,
    RigCompletionSnafu, RigHttpClientSnafu,
};
use super::wire::{CompletionRequest, ProjectedTurn, WireRole};

pub const RIG_GEMINI_BACKEND_ID: &str = "gemini";

/// Calls Gemini directly through rig: replayed turns become chat messages and the question
/// is sent as the final user prompt.
pub struct GeminiCompletionClient {
    base_url: Option<String>,
}

impl GeminiCompletionClient {
    pub fn new(config: &ClientConfig) -> Self {
        let base_url = if config.endpoint.is_empty() {
            None
        } else {
            Some(config.endpoint.clone())
        };

        Self { base_url }
    }

    fn build_client(&self, api_key: &str) -> CompletionResult<gemini::Client> {
        let mut builder = gemini::Client::builder().api_key(api_key.trim());
        if let Some(base_url) = &self.base_url {
            builder = builder.base_url(base_url.as_str());
        }
        builder.build().context(RigHttpClientSnafu {
            stage: "build-gemini-client",
        })
    }

    fn to_rig_message(turn: &ProjectedTurn) -> RigMessage {
        match turn.role {
            WireRole::User => RigMessage::user(turn.text()),
            WireRole::Model => RigMessage::assistant(turn.text()),
        }
    }

    async fn generate(&self, request: CompletionRequest) -> CompletionResult<String> {
        let client = self.build_client(&request.api_key)?;
        let model = client.completion_model(request.model.clone());

        let history = request
            .chat_history
            .iter()
            .map(Self::to_rig_message)
            .collect::<Vec<_>>();

        tracing::debug!(
            model = %request.model,
            history_len = history.len(),
            "sending completion request to gemini"
        );

        let response = model
            .completion_request(RigMessage::user(request.question.clone()))
            .messages(history)
            .send()
            .await
            .context(RigCompletionSnafu {
                stage: "gemini-generate-content",
            })?;

        // First non-empty text part, as the proxy route extracts `candidates[0].content.parts[0].text`.
        response
            .choice
            .iter()
            .find_map(|content| match content {
                AssistantContent::Text(text) if !text.text.trim().is_empty() => {
                    Some(text.text.clone())
                }
                _ => None,
            })
            .context(EmptyReplySnafu {
                stage: "gemini-extract-text",
            })
    }
}

impl CompletionClient for GeminiCompletionClient {
    fn name(&self) -> &str {
        RIG_GEMINI_BACKEND_ID
    }

    fn complete<'a>(&'a self, request: CompletionRequest) -> BoxFuture<'a, CompletionResult<String>> {
        Box::pin(self.generate(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Backend;

    #[test]
    fn wire_roles_map_to_rig_roles() {
        let user = GeminiCompletionClient::to_rig_message(&ProjectedTurn::user("hi"));
        let model = GeminiCompletionClient::to_rig_message(&ProjectedTurn::model("hello"));

        assert!(matches!(user, RigMessage::User { .. }));
        assert!(matches!(model, RigMessage::Assistant { .. }));
    }

    #[test]
    fn empty_endpoint_uses_the_default_gemini_base_url() {
        let client = GeminiCompletionClient::new(&ClientConfig::new(Backend::Gemini, ""));
        assert!(client.base_url.is_none());

        let overridden =
            GeminiCompletionClient::new(&ClientConfig::new(Backend::Gemini, "http://127.0.0.1:9"));
        assert_eq!(overridden.base_url.as_deref(), Some("http://127.0.0.1:9"));
    }
}
