use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use super::wire::CompletionRequest;

pub const DEFAULT_PROXY_ENDPOINT: &str = "http://localhost:3000/api";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type CompletionResult<T> = Result<T, CompletionError>;

/// Sends one question plus replayed history and resolves to the model's reply text.
///
/// Implementations fail on transport errors, on any non-success status, and on replies
/// that carry no text. Callers only distinguish the coarse [`FailureKind`].
pub trait CompletionClient: Send + Sync {
    fn name(&self) -> &str;

    fn complete<'a>(&'a self, request: CompletionRequest) -> BoxFuture<'a, CompletionResult<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// POST to a completion proxy that holds the upstream integration.
    #[default]
    Proxy,
    /// Call the Gemini API directly.
    Gemini,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Gemini => "gemini",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "proxy" => Some(Self::Proxy),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub backend: Backend,
    /// Proxy URL for [`Backend::Proxy`]; optional base URL override for [`Backend::Gemini`].
    pub endpoint: String,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(backend: Backend, endpoint: impl Into<String>) -> Self {
        Self {
            backend,
            endpoint: endpoint.into().trim().to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

/// Coarse classification surfaced to the conversation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Network,
    Remote,
    Malformed,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CompletionError {
    #[snafu(display("no endpoint configured for the {backend} backend"))]
    MissingEndpoint {
        stage: &'static str,
        backend: &'static str,
    },
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request to {endpoint} failed: {source}"))]
    Transport {
        stage: &'static str,
        endpoint: String,
        source: reqwest::Error,
    },
    #[snafu(display("request to {endpoint} timed out"))]
    Timeout {
        stage: &'static str,
        endpoint: String,
        source: reqwest::Error,
    },
    #[snafu(display("failed to read completion response: {source}"))]
    ReadBody {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("completion endpoint answered {status}: {detail}"))]
    RemoteStatus {
        stage: &'static str,
        status: u16,
        detail: String,
    },
    #[snafu(display("completion response contained no text"))]
    EmptyReply { stage: &'static str },
    #[snafu(display("rig http client failed on `{stage}`, {source}"))]
    RigHttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("gemini completion failed on `{stage}`: {source}"))]
    RigCompletion {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

impl CompletionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::MissingEndpoint { .. }
            | Self::BuildHttpClient { .. }
            | Self::Transport { .. }
            | Self::Timeout { .. }
            | Self::ReadBody { .. }
            | Self::RigHttpClient { .. } => FailureKind::Network,
            Self::RemoteStatus { .. } => FailureKind::Remote,
            Self::EmptyReply { .. } => FailureKind::Malformed,
            Self::RigCompletion { source, .. } => match source {
                rig::completion::CompletionError::HttpError(_) => FailureKind::Network,
                rig::completion::CompletionError::JsonError(_)
                | rig::completion::CompletionError::ResponseError(_) => FailureKind::Malformed,
                _ => FailureKind::Remote,
            },
        }
    }

    /// Upstream HTTP status, when the failure carried one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RemoteStatus { status, .. } => Some(*status),
            Self::Transport { source, .. } | Self::ReadBody { source, .. } => {
                source.status().map(|status| status.as_u16())
            }
            _ => None,
        }
    }
}
