use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::OracleError;
use crate::scheduler::Oracle;
use crate::util::env_u64;

const BODY_PREVIEW_BYTES: usize = 512;

fn connect_timeout() -> Duration {
    Duration::from_secs(env_u64("BATCHWISE_HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(3).max(1))
}

fn pool_idle() -> Duration {
    Duration::from_secs(env_u64("BATCHWISE_HTTP_POOL_IDLE_SECS").unwrap_or(90).max(1))
}

fn user_agent() -> String {
    format!("batchwise/{}", env!("CARGO_PKG_VERSION"))
}

/// Base client builder with the defaults every oracle client shares. Request
/// timeouts are applied by the scheduler around each call.
pub fn client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(user_agent())
        .connect_timeout(connect_timeout())
        .tcp_keepalive(Duration::from_secs(60))
        .pool_idle_timeout(pool_idle())
}

/// POSTs each payload as JSON and returns the decoded JSON response.
#[derive(Debug, Clone)]
pub struct HttpOracle {
    client: reqwest::Client,
    endpoint: String,
    bearer: Option<String>,
}

impl HttpOracle {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, OracleError> {
        let client = client_builder()
            .build()
            .map_err(|err| OracleError::Transport(err.to_string()))?;
        Ok(Self::with_client(client, endpoint))
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            bearer: None,
        }
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.bearer = (!token.trim().is_empty()).then_some(token);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn invoke(&self, payload: &Value) -> Result<Value, OracleError> {
        let mut request = self.client.post(&self.endpoint).json(payload);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| OracleError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > BODY_PREVIEW_BYTES {
                let mut cut = BODY_PREVIEW_BYTES;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            tracing::debug!(endpoint = %self.endpoint, status = status.as_u16(), "oracle rejected request");
            return Err(OracleError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| OracleError::Decode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn posts_payload_and_decodes_response() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/analyze")
                    .header("authorization", "Bearer secret")
                    .json_body(json!({"id": "a"}));
                then.status(200).json_body(json!({"score": 3}));
            })
            .await;

        let oracle = HttpOracle::new(server.url("/analyze"))
            .unwrap()
            .with_bearer("secret");
        let out = oracle.invoke(&json!({"id": "a"})).await.unwrap();
        assert_eq!(out, json!({"score": 3}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/analyze");
                then.status(429).body("slow down");
            })
            .await;

        let oracle = HttpOracle::new(server.url("/analyze")).unwrap();
        let err = oracle.invoke(&json!({})).await.unwrap_err();
        assert_eq!(
            err,
            OracleError::Rejected {
                status: 429,
                body: "slow down".into()
            }
        );
    }

    #[tokio::test]
    async fn invalid_json_is_a_decode_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(200).body("<html>");
            })
            .await;

        let oracle = HttpOracle::new(server.url("/")).unwrap();
        assert!(matches!(
            oracle.invoke(&json!({})).await,
            Err(OracleError::Decode(_))
        ));
    }
}
