use gemchat_llm::{CompletionError, FailureKind};
use gemchat_storage::StorageError;
use snafu::Snafu;

/// Why an exchange, or a history operation, did not go through. None of these is fatal.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExchangeError {
    #[snafu(display("an api key and model must be configured before chatting"))]
    ConfigurationRequired { stage: &'static str },
    #[snafu(display("could not reach the completion service on `{stage}`: {source}"))]
    NetworkFailure {
        stage: &'static str,
        source: CompletionError,
    },
    #[snafu(display("completion service rejected the request{}: {detail}", format_status(*status)))]
    RemoteError {
        stage: &'static str,
        status: Option<u16>,
        detail: String,
    },
    #[snafu(display("completion response was unusable on `{stage}`: {detail}"))]
    MalformedResponse { stage: &'static str, detail: String },
    #[snafu(display("chat history is unavailable on `{stage}`: {source}"))]
    StorageUnavailable {
        stage: &'static str,
        source: StorageError,
    },
}

impl ExchangeError {
    pub(crate) fn from_completion(stage: &'static str, error: CompletionError) -> Self {
        match error.kind() {
            FailureKind::Network => Self::NetworkFailure {
                stage,
                source: error,
            },
            FailureKind::Remote => Self::RemoteError {
                stage,
                status: error.status(),
                detail: match error {
                    CompletionError::RemoteStatus { detail, .. } => detail,
                    other => other.to_string(),
                },
            },
            FailureKind::Malformed => Self::MalformedResponse {
                stage,
                detail: error.to_string(),
            },
        }
    }
}

fn format_status(status: Option<u16>) -> String {
    status.map(|code| format!(" ({code})")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_failures_map_onto_the_exchange_taxonomy() {
        let remote = ExchangeError::from_completion(
            "test",
            CompletionError::RemoteStatus {
                stage: "proxy-status",
                status: 429,
                detail: "quota exceeded".to_string(),
            },
        );
        assert!(matches!(
            &remote,
            ExchangeError::RemoteError { status: Some(429), detail, .. } if detail == "quota exceeded"
        ));
        assert_eq!(
            remote.to_string(),
            "completion service rejected the request (429): quota exceeded"
        );

        let malformed = ExchangeError::from_completion(
            "test",
            CompletionError::EmptyReply {
                stage: "proxy-empty-reply",
            },
        );
        assert!(matches!(malformed, ExchangeError::MalformedResponse { .. }));

        let network = ExchangeError::from_completion(
            "test",
            CompletionError::MissingEndpoint {
                stage: "proxy-client-new",
                backend: "proxy",
            },
        );
        assert!(matches!(network, ExchangeError::NetworkFailure { .. }));
    }
}
