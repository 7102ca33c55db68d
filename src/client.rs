//! Outbound calls to providers.
//!
//! [`ProviderClient`] is the only way the dispatcher talks to the network, so
//! tests can swap in a fake. [`HttpProviderClient`] is the real one: one
//! pooled `reqwest::Client` built at startup and shared read-only.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

use crate::config::{Credentials, GatewayConfig};
use crate::error::{GatewayError, Result};
use crate::providers::Provider;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, GatewayError>>;

/// Where one upstream call goes.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub provider: Provider,
    /// Upstream model name; part of the URL for generate-content.
    pub model: String,
    pub credentials: Credentials,
}

impl UpstreamTarget {
    pub fn url(&self, stream: bool) -> String {
        let base = self.credentials.base_url.trim_end_matches('/');
        match self.provider {
            Provider::OpenAi => format!("{base}/chat/completions"),
            Provider::Anthropic => format!("{base}/v1/messages"),
            Provider::Gemini if stream => {
                format!("{base}/models/{}:streamGenerateContent?alt=sse", self.model)
            }
            Provider::Gemini => format!("{base}/models/{}:generateContent", self.model),
        }
    }
}

/// A whole upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl UpstreamReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Result of opening an upstream stream. Error statuses come back whole so
/// they can be relayed verbatim.
pub enum UpstreamStream {
    Open(ByteStream),
    Failed(UpstreamReply),
}

pub trait ProviderClient: Send + Sync + 'static {
    fn send(
        &self,
        target: &UpstreamTarget,
        body: Bytes,
    ) -> impl Future<Output = Result<UpstreamReply>> + Send;

    fn stream(
        &self,
        target: &UpstreamTarget,
        body: Bytes,
    ) -> impl Future<Output = Result<UpstreamStream>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpProviderClient {
    http: reqwest::Client,
    request_timeout: Duration,
    stream_open_timeout: Duration,
}

impl HttpProviderClient {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self {
            http,
            request_timeout: config.request_timeout(),
            stream_open_timeout: config.stream_idle_timeout(),
        })
    }

    fn request(&self, target: &UpstreamTarget, body: Bytes, stream: bool) -> reqwest::RequestBuilder {
        let url = target.url(stream);
        debug!(%url, provider = %target.provider, bytes = body.len(), "upstream request");

        let key = &target.credentials.api_key;
        let builder = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);

        match target.provider {
            Provider::OpenAi => builder.bearer_auth(key),
            Provider::Anthropic => builder
                .header("x-api-key", key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            Provider::Gemini => builder.header("x-goog-api-key", key),
        }
    }
}

async fn read_reply(response: reqwest::Response) -> Result<UpstreamReply> {
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.bytes().await.map_err(GatewayError::from_reqwest)?;
    Ok(UpstreamReply {
        status,
        content_type,
        body,
    })
}

impl ProviderClient for HttpProviderClient {
    async fn send(&self, target: &UpstreamTarget, body: Bytes) -> Result<UpstreamReply> {
        let response = self
            .request(target, body, false)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(GatewayError::from_reqwest)?;
        read_reply(response).await
    }

    async fn stream(&self, target: &UpstreamTarget, body: Bytes) -> Result<UpstreamStream> {
        let pending = self.request(target, body, true).send();
        let response = tokio::time::timeout(self.stream_open_timeout, pending)
            .await
            .map_err(|_| {
                GatewayError::timeout(format!(
                    "{} did not start streaming within {}s",
                    target.provider,
                    self.stream_open_timeout.as_secs()
                ))
            })?
            .map_err(GatewayError::from_reqwest)?;

        if !response.status().is_success() {
            return Ok(UpstreamStream::Failed(read_reply(response).await?));
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(GatewayError::from_reqwest))
            .boxed();
        Ok(UpstreamStream::Open(bytes))
    }
}
