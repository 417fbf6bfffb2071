//! # Byte Transport
//!
//! This module defines the transport seam between the engine and the
//! network: a single "fetch bytes from URL" primitive. The engine adds no
//! retry, redirect or header logic of its own on top of it, and tests swap
//! in doubles through the same trait.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tracing::debug;

use crate::config::FetcherConfig;
use crate::error::FetchError;

/// A primitive capable of fetching the raw payload behind a resource key.
#[async_trait]
pub trait ByteTransport: Send + Sync + 'static {
    /// Fetch the payload for `key`. The key has already been validated.
    async fn fetch_bytes(&self, key: &str) -> Result<Bytes, FetchError>;
}

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &FetcherConfig) -> Result<Client, FetchError> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5) // Allow multiple connections to same host
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    client_builder.build().map_err(FetchError::from)
}

/// HTTP transport backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build an HTTP transport from the engine configuration.
    pub fn new(config: &FetcherConfig) -> Result<Self, FetchError> {
        Ok(Self {
            client: create_client(config)?,
        })
    }

    /// Wrap an existing reqwest client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ByteTransport for HttpTransport {
    async fn fetch_bytes(&self, key: &str) -> Result<Bytes, FetchError> {
        debug!(key, "issuing HTTP GET");

        let response = self.client.get(key).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        let payload = response.bytes().await?;
        debug!(key, size = payload.len(), "HTTP fetch completed");
        Ok(payload)
    }
}
