use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;

use crate::error::{Result, TransportError, UpdaterError};

/// Abstraction over fetching remote content.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch `url` as UTF-8 text, waiting at most `timeout`.
    async fn fetch_text(&self, url: &str, timeout: Duration) -> std::result::Result<String, TransportError>;

    /// Fetch `url` as raw bytes, waiting at most `timeout`.
    async fn fetch_binary(&self, url: &str, timeout: Duration) -> std::result::Result<Bytes, TransportError>;
}

/// Builder for [`HttpTransport`].
#[derive(Default)]
pub struct HttpTransportBuilder {
    client: Option<Client>,
    user_agent: Option<String>,
}

impl HttpTransportBuilder {
    /// Provide a custom reqwest client instance.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// User agent sent with every request. Ignored when a custom client is supplied.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Build the transport.
    pub fn build(self) -> Result<HttpTransport> {
        let client = match self.client {
            Some(client) => client,
            None => {
                let user_agent = self.user_agent.unwrap_or_else(|| {
                    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
                });
                Client::builder()
                    .user_agent(user_agent)
                    .build()
                    .map_err(|err| UpdaterError::validation(format!("http client: {err}")))?
            }
        };
        Ok(HttpTransport { client })
    }
}

/// reqwest-backed [`Transport`].
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a new builder.
    pub fn builder() -> HttpTransportBuilder {
        HttpTransportBuilder::default()
    }

    async fn get(&self, url: &str, timeout: Duration) -> std::result::Result<reqwest::Response, TransportError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%url, status = status.as_u16(), "unexpected response status");
            return Err(TransportError::HttpStatus(status.as_u16()));
        }
        Ok(response)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if let Some(status) = err.status() {
        TransportError::HttpStatus(status.as_u16())
    } else {
        TransportError::NetworkUnavailable(err.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_text(&self, url: &str, timeout: Duration) -> std::result::Result<String, TransportError> {
        tracing::debug!(%url, "fetching text");
        let response = self.get(url, timeout).await?;
        response.text().await.map_err(map_reqwest_error)
    }

    async fn fetch_binary(&self, url: &str, timeout: Duration) -> std::result::Result<Bytes, TransportError> {
        tracing::debug!(%url, "fetching binary");
        let response = self.get(url, timeout).await?;
        response.bytes().await.map_err(map_reqwest_error)
    }
}
