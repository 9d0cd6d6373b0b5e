use std::sync::Arc;

mod model;
mod provider;
mod proxy;
mod rig_adapter;
mod wire;

pub use model::{DEFAULT_GEMINI_MODEL, Model, default_gemini_models, find_model};
pub use provider::{
    Backend, BoxFuture, ClientConfig, CompletionClient, CompletionError, CompletionResult,
    DEFAULT_PROXY_ENDPOINT, DEFAULT_REQUEST_TIMEOUT, FailureKind,
};
pub use proxy::ProxyCompletionClient;
pub use rig_adapter::{GeminiCompletionClient, RIG_GEMINI_BACKEND_ID};
pub use wire::{CompletionRequest, ProjectedTurn, TextPart, WireRole};

pub fn create_client(config: ClientConfig) -> CompletionResult<Arc<dyn CompletionClient>> {
    match config.backend {
        Backend::Proxy => Ok(Arc::new(ProxyCompletionClient::new(&config)?)),
        Backend::Gemini => Ok(Arc::new(GeminiCompletionClient::new(&config))),
    }
}
