//! HTTP credential source.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use questline_core::{AccessToken, CredentialError, CredentialSource};

const MAX_ERROR_BODY: usize = 512;

#[derive(Deserialize)]
struct NegotiateResponse {
    #[serde(default)]
    url: Option<String>,
}

/// Fetches client access URLs with `GET <endpoint>`.
///
/// The endpoint must answer 2xx with `{"url": "..."}`. Anything else is a
/// hard failure for that attempt.
#[derive(Clone, Debug)]
pub struct HttpCredentialSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCredentialSource {
    /// Create a source for `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    /// Create a source sharing an existing HTTP client.
    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// The endpoint this source calls.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self) -> Result<AccessToken, CredentialError> {
        debug!(endpoint = %self.endpoint, "fetching access token");
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| CredentialError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(CredentialError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: NegotiateResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::Decode(e.to_string()))?;

        match parsed.url {
            Some(url) if !url.trim().is_empty() => Ok(AccessToken::new(url)),
            _ => Err(CredentialError::MissingUrl),
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn source_for(server: &MockServer) -> HttpCredentialSource {
        HttpCredentialSource::new(format!("{}/api/negotiate", server.uri()))
    }

    #[tokio::test]
    async fn returns_url_from_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/negotiate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": "wss://example.webpubsub.azure.com/client/hubs/questline?access_token=abc"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token = source_for(&server).await.fetch().await.unwrap();
        assert!(token.url().ends_with("access_token=abc"));
    }

    #[tokio::test]
    async fn non_success_status_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/negotiate"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let err = source_for(&server).await.fetch().await.unwrap_err();
        assert!(
            matches!(&err, CredentialError::Status { status: 503, body } if body == "busy"),
            "got: {err:?}"
        );
    }

    #[tokio::test]
    async fn missing_or_empty_url_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/negotiate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "x"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/negotiate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"url": ""})))
            .mount(&server)
            .await;

        let source = source_for(&server).await;
        assert!(matches!(source.fetch().await, Err(CredentialError::MissingUrl)));
        assert!(matches!(source.fetch().await, Err(CredentialError::MissingUrl)));
    }

    #[tokio::test]
    async fn invalid_json_is_a_decode_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = source_for(&server).await.fetch().await.unwrap_err();
        assert!(matches!(err, CredentialError::Decode(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_request_failure() {
        let source = HttpCredentialSource::new("http://127.0.0.1:1/api/negotiate");
        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, CredentialError::Request(_)), "got: {err:?}");
    }
}
