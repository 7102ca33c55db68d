//! Request orchestration: route, authorize, convert, forward, convert back.
//!
//! When the caller's protocol is the provider's own, bodies pass through
//! untouched apart from the model alias. Otherwise the matching
//! [`Converter`] runs in both directions. Upstream error statuses are relayed
//! verbatim in either case.

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tracing::{info, warn};

use crate::client::{ProviderClient, UpstreamReply, UpstreamStream, UpstreamTarget};
use crate::config::{AccessKey, GatewayConfig};
use crate::error::{GatewayError, Result};
use crate::providers::Provider;
use crate::routing::provider_for;
use crate::translate::common::TokenUsage;
use crate::translate::streaming::{observe_usage, reassemble, relay, StreamState};
use crate::translate::{
    AnthropicToGemini, AnthropicToOpenAi, Converter, GeminiToAnthropic, GeminiToOpenAi,
    OpenAiToAnthropic, OpenAiToGemini, UpstreamBody,
};
use crate::usage::{UsageRecord, UsageRecorder, UsageTicket, ANONYMOUS};

pub type FrameStream = BoxStream<'static, std::result::Result<Bytes, std::io::Error>>;

/// Who is calling, as established by the access key.
#[derive(Debug, Clone)]
pub struct Caller {
    pub name: String,
    /// Provider the key is restricted to, if any.
    pub provider: Option<Provider>,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self {
            name: ANONYMOUS.to_string(),
            provider: None,
        }
    }
}

impl From<&AccessKey> for Caller {
    fn from(key: &AccessKey) -> Self {
        Self {
            name: key.name.clone(),
            provider: key.provider,
        }
    }
}

/// One request as received on an entry point.
#[derive(Debug, Clone)]
pub struct InboundCall {
    pub protocol: Provider,
    pub body: Bytes,
    /// Model named in the URL; generate-content carries it there.
    pub path_model: Option<String>,
    /// Streaming chosen by the URL action rather than a body field.
    pub path_stream: Option<bool>,
    pub caller: Caller,
}

impl InboundCall {
    pub fn new(protocol: Provider, body: impl Into<Bytes>) -> Self {
        Self {
            protocol,
            body: body.into(),
            path_model: None,
            path_stream: None,
            caller: Caller::anonymous(),
        }
    }

    pub fn with_path(mut self, model: impl Into<String>, stream: bool) -> Self {
        self.path_model = Some(model.into());
        self.path_stream = Some(stream);
        self
    }

    pub fn with_caller(mut self, caller: Caller) -> Self {
        self.caller = caller;
        self
    }
}

pub enum DispatchOutcome {
    /// A whole body: a converted response or an upstream reply relayed as is.
    Json {
        status: u16,
        content_type: String,
        body: Bytes,
    },
    /// `text/event-stream` frames in the caller's protocol.
    Stream { body: FrameStream },
}

impl std::fmt::Debug for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json {
                status,
                content_type,
                body,
            } => f
                .debug_struct("Json")
                .field("status", status)
                .field("content_type", content_type)
                .field("bytes", &body.len())
                .finish(),
            Self::Stream { .. } => f.write_str("Stream"),
        }
    }
}

impl DispatchOutcome {
    fn relayed(reply: UpstreamReply) -> Self {
        Self::Json {
            status: reply.status,
            content_type: reply
                .content_type
                .unwrap_or_else(|| "application/json".to_string()),
            body: reply.body,
        }
    }

    fn json(body: Vec<u8>) -> Self {
        Self::Json {
            status: 200,
            content_type: "application/json".to_string(),
            body: Bytes::from(body),
        }
    }
}

/// Everything resolved about a call before it is forwarded.
struct Route {
    inbound: Provider,
    requested_model: String,
    stream: bool,
    target: UpstreamTarget,
    caller: Caller,
}

pub struct Dispatcher<P, U> {
    client: Arc<P>,
    config: Arc<GatewayConfig>,
    usage: U,
}

impl<P, U: Clone> Clone for Dispatcher<P, U> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            config: Arc::clone(&self.config),
            usage: self.usage.clone(),
        }
    }
}

impl<P, U> Dispatcher<P, U>
where
    P: ProviderClient,
    U: UsageRecorder + Clone,
{
    pub fn new(client: Arc<P>, config: Arc<GatewayConfig>, usage: U) -> Self {
        Self {
            client,
            config,
            usage,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn dispatch(&self, call: InboundCall) -> Result<DispatchOutcome> {
        let body: Value = serde_json::from_slice(&call.body)
            .map_err(|e| GatewayError::invalid_request(format!("Invalid request body: {e}")))?;
        let route = self.route(&call, &body)?;

        info!(
            inbound = %route.inbound,
            provider = %route.target.provider,
            model = %route.requested_model,
            upstream_model = %route.target.model,
            stream = route.stream,
            caller = %route.caller.name,
            "dispatching"
        );

        use Provider::{Anthropic, Gemini, OpenAi};
        match (route.inbound, route.target.provider) {
            (OpenAi, OpenAi) | (Anthropic, Anthropic) | (Gemini, Gemini) => {
                self.passthrough(route, body).await
            }
            (OpenAi, Anthropic) => self.convert::<OpenAiToAnthropic>(route, body).await,
            (OpenAi, Gemini) => self.convert::<OpenAiToGemini>(route, body).await,
            (Anthropic, OpenAi) => self.convert::<AnthropicToOpenAi>(route, body).await,
            (Anthropic, Gemini) => self.convert::<AnthropicToGemini>(route, body).await,
            (Gemini, OpenAi) => self.convert::<GeminiToOpenAi>(route, body).await,
            (Gemini, Anthropic) => self.convert::<GeminiToAnthropic>(route, body).await,
        }
    }

    fn route(&self, call: &InboundCall, body: &Value) -> Result<Route> {
        let requested_model = match &call.path_model {
            Some(model) => model.clone(),
            None => body
                .get("model")
                .and_then(Value::as_str)
                .ok_or_else(|| GatewayError::invalid_request("Request body has no model"))?
                .to_string(),
        };
        let stream = call
            .path_stream
            .unwrap_or_else(|| body.get("stream").and_then(Value::as_bool).unwrap_or(false));

        let upstream_model = self.config.resolve_model(&requested_model).to_string();
        let provider = provider_for(&upstream_model, call.protocol);

        if let Some(bound) = call.caller.provider {
            if bound != provider {
                return Err(GatewayError::protocol_mismatch(format!(
                    "Model '{requested_model}' is served by {provider}, \
                     but access key '{}' is bound to {bound}",
                    call.caller.name
                )));
            }
        }

        let credentials = self.config.credentials(provider)?;

        Ok(Route {
            inbound: call.protocol,
            requested_model,
            stream,
            target: UpstreamTarget {
                provider,
                model: upstream_model,
                credentials,
            },
            caller: call.caller.clone(),
        })
    }

    fn ticket(&self, route: &Route, status: u16) -> UsageTicket<U> {
        let mut record = UsageRecord::new(
            route.caller.name.clone(),
            route.inbound,
            route.target.provider,
            route.target.model.clone(),
            route.stream,
        );
        record.status = status;
        UsageTicket::new(self.usage.clone(), record)
    }

    async fn passthrough(&self, route: Route, mut body: Value) -> Result<DispatchOutcome> {
        let provider = route.target.provider;
        if provider != Provider::Gemini && route.target.model != route.requested_model {
            body["model"] = Value::String(route.target.model.clone());
        }
        let bytes = Bytes::from(serde_json::to_vec(&body)?);

        if route.stream {
            return match self.client.stream(&route.target, bytes).await? {
                UpstreamStream::Open(upstream) => {
                    let mut ticket = self.ticket(&route, 200);
                    let frames = relay(upstream, provider, self.config.stream_idle_timeout(), move |u| {
                        ticket.observe(u)
                    });
                    Ok(DispatchOutcome::Stream {
                        body: frames.boxed(),
                    })
                }
                UpstreamStream::Failed(reply) => Ok(self.relay_error(&route, reply)),
            };
        }

        let reply = self.client.send(&route.target, bytes).await?;
        if !reply.is_success() {
            return Ok(self.relay_error(&route, reply));
        }

        let mut ticket = self.ticket(&route, reply.status);
        if let Ok(value) = serde_json::from_slice::<Value>(&reply.body) {
            let mut usage = TokenUsage::default();
            observe_usage(provider, &value, &mut usage);
            ticket.observe(usage);
        }
        Ok(DispatchOutcome::relayed(reply))
    }

    async fn convert<C: Converter>(&self, route: Route, body: Value) -> Result<DispatchOutcome> {
        let request: C::Request = serde_json::from_value(body)
            .map_err(|e| GatewayError::invalid_request(format!("Invalid request body: {e}")))?;
        let (mut upstream, model) = C::convert_request(&request, &route.target.model);
        let mut target = route.target.clone();
        target.model = model;

        if route.stream {
            upstream.enable_streaming();
            let bytes = Bytes::from(serde_json::to_vec(&upstream)?);
            return match self.client.stream(&target, bytes).await? {
                UpstreamStream::Open(upstream) => {
                    let mut ticket = self.ticket(&route, 200);
                    let state = StreamState::new(C::INBOUND, route.requested_model.clone());
                    let frames = reassemble::<C, _, _, _>(
                        upstream,
                        state,
                        self.config.stream_idle_timeout(),
                        move |u| ticket.observe(u),
                    );
                    Ok(DispatchOutcome::Stream {
                        body: frames.boxed(),
                    })
                }
                UpstreamStream::Failed(reply) => Ok(self.relay_error(&route, reply)),
            };
        }

        let bytes = Bytes::from(serde_json::to_vec(&upstream)?);
        let reply = self.client.send(&target, bytes).await?;
        if !reply.is_success() {
            return Ok(self.relay_error(&route, reply));
        }

        let parsed: C::UpstreamResponse = serde_json::from_slice(&reply.body).map_err(|e| {
            GatewayError::upstream_body(format!("{} returned an unreadable body: {e}", C::UPSTREAM))
        })?;
        let converted = serde_json::to_value(C::convert_response(&parsed, &route.requested_model))?;

        let mut usage = TokenUsage::default();
        observe_usage(C::INBOUND, &converted, &mut usage);
        let mut ticket = self.ticket(&route, reply.status);
        ticket.observe(usage);

        Ok(DispatchOutcome::json(serde_json::to_vec(&converted)?))
    }

    fn relay_error(&self, route: &Route, reply: UpstreamReply) -> DispatchOutcome {
        warn!(
            provider = %route.target.provider,
            status = reply.status,
            body = %String::from_utf8_lossy(&reply.body[..reply.body.len().min(300)]),
            "upstream returned an error"
        );
        drop(self.ticket(route, reply.status));
        DispatchOutcome::relayed(reply)
    }
}
