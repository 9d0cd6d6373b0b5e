use reqwest::header::ACCEPT;
use snafu::{ResultExt, ensure};

use super::provider::{
    BoxFuture, BuildHttpClientSnafu, ClientConfig, CompletionClient, CompletionError,
    CompletionResult, EmptyReplySnafu, MissingEndpointSnafu, ReadBodySnafu, RemoteStatusSnafu,
};
use super::wire::CompletionRequest;

/// Client for a completion proxy: `POST {question, chatHistory, apiKey, model}` as JSON.
///
/// The HTTP status decides success. A 2xx body is the reply, either plain text or a
/// JSON-encoded string; anything else becomes [`CompletionError::RemoteStatus`] carrying the
/// body as detail.
pub struct ProxyCompletionClient {
    client: reqwest::Client,
    endpoint: String,
}

impl ProxyCompletionClient {
    pub fn new(config: &ClientConfig) -> CompletionResult<Self> {
        ensure!(
            !config.endpoint.is_empty(),
            MissingEndpointSnafu {
                stage: "proxy-client-new",
                backend: "proxy",
            }
        );

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context(BuildHttpClientSnafu {
                stage: "proxy-client-build",
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }

    async fn send(&self, request: CompletionRequest) -> CompletionResult<String> {
        tracing::debug!(
            endpoint = %self.endpoint,
            model = %request.model,
            history_len = request.chat_history.len(),
            "sending completion request to proxy"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|source| self.transport_error("proxy-send", source))?;

        let status = response.status();
        let body = response.text().await.context(ReadBodySnafu {
            stage: "proxy-read-body",
        })?;

        if !status.is_success() {
            let detail = if body.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                body.trim().to_string()
            };
            tracing::warn!(status = status.as_u16(), detail = %detail, "proxy rejected completion");
            return RemoteStatusSnafu {
                stage: "proxy-status",
                status: status.as_u16(),
                detail,
            }
            .fail();
        }

        let reply = unwrap_reply_body(body);
        ensure!(
            !reply.trim().is_empty(),
            EmptyReplySnafu {
                stage: "proxy-empty-reply",
            }
        );

        Ok(reply)
    }

    fn transport_error(&self, stage: &'static str, source: reqwest::Error) -> CompletionError {
        let endpoint = self.endpoint.clone();
        if source.is_timeout() {
            CompletionError::Timeout {
                stage,
                endpoint,
                source,
            }
        } else {
            CompletionError::Transport {
                stage,
                endpoint,
                source,
            }
        }
    }
}

impl CompletionClient for ProxyCompletionClient {
    fn name(&self) -> &str {
        "proxy"
    }

    fn complete<'a>(&'a self, request: CompletionRequest) -> BoxFuture<'a, CompletionResult<String>> {
        Box::pin(self.send(request))
    }
}

/// Some proxies answer with `JSON.stringify(text)`; unwrap that form, pass plain text through.
fn unwrap_reply_body(body: String) -> String {
    let trimmed = body.trim();
    if trimmed.starts_with('"')
        && let Ok(decoded) = serde_json::from_str::<String>(trimmed)
    {
        return decoded;
    }

    body
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;

    use super::*;
    use crate::provider::{Backend, FailureKind};
    use crate::wire::ProjectedTurn;

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn client_for(addr: SocketAddr) -> ProxyCompletionClient {
        let config = ClientConfig::new(Backend::Proxy, format!("http://{addr}/api"))
            .with_request_timeout(Duration::from_millis(500));
        ProxyCompletionClient::new(&config).unwrap()
    }

    fn sample_request() -> CompletionRequest {
        CompletionRequest::new(
            "what next?",
            vec![ProjectedTurn::user("hi"), ProjectedTurn::model("hello")],
            "key",
            "gemini-2.5-flash",
        )
    }

    #[tokio::test]
    async fn forwards_the_payload_and_returns_plain_text() {
        let router = Router::new().route(
            "/api",
            post(|axum::Json(payload): axum::Json<CompletionRequest>| async move {
                format!(
                    "{} after {} turns with {}",
                    payload.question,
                    payload.chat_history.len(),
                    payload.api_key
                )
            }),
        );
        let client = client_for(serve(router).await);

        let reply = client.complete(sample_request()).await.unwrap();
        assert_eq!(reply, "what next? after 2 turns with key");
    }

    #[tokio::test]
    async fn unwraps_json_encoded_string_replies() {
        let router = Router::new().route("/api", post(|| async { "\"line one\\nline two\"" }));
        let client = client_for(serve(router).await);

        let reply = client.complete(sample_request()).await.unwrap();
        assert_eq!(reply, "line one\nline two");
    }

    #[tokio::test]
    async fn non_success_status_is_a_remote_error_with_detail() {
        let router = Router::new().route(
            "/api",
            post(|| async {
                (
                    StatusCode::FORBIDDEN,
                    "API key does not have access or has exceeded quota",
                )
            }),
        );
        let client = client_for(serve(router).await);

        let error = client.complete(sample_request()).await.unwrap_err();
        assert_eq!(error.kind(), FailureKind::Remote);
        assert_eq!(error.status(), Some(403));
        assert!(error.to_string().contains("exceeded quota"));
    }

    #[tokio::test]
    async fn blank_success_body_is_malformed() {
        let router = Router::new().route("/api", post(|| async { "   " }));
        let client = client_for(serve(router).await);

        let error = client.complete(sample_request()).await.unwrap_err();
        assert_eq!(error.kind(), FailureKind::Malformed);
    }

    #[tokio::test]
    async fn slow_proxy_times_out_as_network_failure() {
        let router = Router::new().route(
            "/api",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "too late"
            }),
        );
        let client = client_for(serve(router).await);

        let error = client.complete(sample_request()).await.unwrap_err();
        assert_eq!(error.kind(), FailureKind::Network);
    }

    #[tokio::test]
    async fn unreachable_proxy_is_a_network_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let error = client_for(addr).complete(sample_request()).await.unwrap_err();
        assert_eq!(error.kind(), FailureKind::Network);
    }

    #[test]
    fn empty_endpoint_is_rejected() {
        let config = ClientConfig::new(Backend::Proxy, "  ");
        assert!(matches!(
            ProxyCompletionClient::new(&config),
            Err(CompletionError::MissingEndpoint { .. })
        ));
    }
}
