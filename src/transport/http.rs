//! Production wire: one reqwest GET per attempt.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, ClientBuilder, Proxy, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::{RemoteReply, Transport, WireFailure};
use crate::user_agent;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default whole-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// The HTTP client could not be constructed.
#[derive(Debug, Error)]
#[error("HTTP client construction failed: {message}")]
pub struct ClientBuildError {
    message: String,
}

/// [`Transport`] over HTTPS using reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Builds a transport with the given timeouts and the crate User-Agent.
    ///
    /// # Errors
    ///
    /// Returns [`ClientBuildError`] if the TLS backend or proxy settings
    /// cannot be initialised.
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self, ClientBuildError> {
        let user_agent = user_agent::default_user_agent();
        let client = match try_build_client(&user_agent, connect_timeout, request_timeout, false) {
            Ok(client) => client,
            Err(BuildClientFailure::Panic) => {
                // Some sandboxes panic when reading system proxy settings.
                warn!("system proxy lookup panicked; using environment proxies only");
                try_build_client(&user_agent, connect_timeout, request_timeout, true)
                    .map_err(BuildClientFailure::into_error)?
            }
            Err(failure) => return Err(failure.into_error()),
        };
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self), level = "debug")]
    async fn execute(&self, url: &str) -> Result<RemoteReply, WireFailure> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|error| wire_failure(&error))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("remote reports absence");
            return Ok(RemoteReply::Absent);
        }
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            return Err(WireFailure::Status {
                status: status.as_u16(),
                retry_after,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.is_empty() && !content_type.contains("json") {
            return Err(WireFailure::decode(format!(
                "expected JSON, got content type {content_type}"
            )));
        }

        response
            .json::<Value>()
            .await
            .map(RemoteReply::Payload)
            .map_err(|error| {
                if error.is_timeout() {
                    WireFailure::Timeout
                } else if error.is_decode() {
                    WireFailure::decode(error.to_string())
                } else {
                    wire_failure(&error)
                }
            })
    }
}

fn wire_failure(error: &reqwest::Error) -> WireFailure {
    if error.is_timeout() {
        WireFailure::Timeout
    } else {
        WireFailure::network(error.to_string())
    }
}

enum BuildClientFailure {
    Panic,
    Build(reqwest::Error),
}

impl BuildClientFailure {
    fn into_error(self) -> ClientBuildError {
        let message = match self {
            Self::Panic => "client construction panicked".to_string(),
            Self::Build(error) => error.to_string(),
        };
        ClientBuildError { message }
    }
}

fn try_build_client(
    user_agent: &str,
    connect_timeout: Duration,
    request_timeout: Duration,
    disable_system_proxy_lookup: bool,
) -> Result<Client, BuildClientFailure> {
    let user_agent = user_agent.to_string();
    catch_unwind(AssertUnwindSafe(move || {
        let mut builder = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .user_agent(user_agent)
            .gzip(true);
        if disable_system_proxy_lookup {
            builder = apply_env_proxy(builder.no_proxy());
        }
        builder.build().map_err(BuildClientFailure::Build)
    }))
    .map_err(|_| BuildClientFailure::Panic)?
}

fn apply_env_proxy(mut builder: ClientBuilder) -> ClientBuilder {
    let https = ["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"];
    if let Some(proxy) = first_env(&https)
        && let Ok(resolved) = Proxy::https(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    builder
}

fn first_env(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport() -> HttpTransport {
        HttpTransport::new(Duration::from_secs(2), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_success_returns_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"a": 1})),
            )
            .mount(&server)
            .await;

        let reply = transport()
            .execute(&format!("{}/ok", server.uri()))
            .await
            .unwrap();
        assert_eq!(reply, RemoteReply::Payload(serde_json::json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_not_found_is_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let reply = transport()
            .execute(&format!("{}/missing", server.uri()))
            .await
            .unwrap();
        assert_eq!(reply, RemoteReply::Absent);
    }

    #[tokio::test]
    async fn test_error_status_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "2"))
            .mount(&server)
            .await;

        let failure = transport()
            .execute(&format!("{}/busy", server.uri()))
            .await
            .unwrap_err();
        assert_eq!(
            failure,
            WireFailure::Status {
                status: 503,
                retry_after: Some("2".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_non_json_body_is_decode_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html></html>")
                    .insert_header("Content-Type", "text/html"),
            )
            .mount(&server)
            .await;

        let failure = transport()
            .execute(&format!("{}/html", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(failure, WireFailure::Decode { .. }));
    }

    #[tokio::test]
    async fn test_refused_connection_is_network_failure() {
        let failure = transport()
            .execute("http://127.0.0.1:9/unreachable")
            .await
            .unwrap_err();
        assert!(matches!(
            failure,
            WireFailure::Network { .. } | WireFailure::Timeout
        ));
    }
}
