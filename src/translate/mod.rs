//! Protocol translation between the chat-completions, messages and
//! generate-content wire formats.
//!
//! Every ordered pair of distinct protocols has one [`Converter`], named
//! `<inbound>_to_<upstream>`: it turns the caller's request into the
//! provider's shape, and the provider's response (whole or streamed) back into
//! the caller's shape. All conversion here is pure; the only state is the
//! per-stream [`streaming::StreamState`].

pub mod anthropic_to_gemini;
pub mod anthropic_to_openai;
pub mod anthropic_types;
pub mod common;
pub mod gemini_to_anthropic;
pub mod gemini_to_openai;
pub mod gemini_types;
pub mod openai_to_anthropic;
pub mod openai_to_gemini;
pub mod openai_types;
pub mod streaming;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::providers::Provider;
use streaming::StreamState;

pub use anthropic_to_gemini::AnthropicToGemini;
pub use anthropic_to_openai::AnthropicToOpenAi;
pub use gemini_to_anthropic::GeminiToAnthropic;
pub use gemini_to_openai::GeminiToOpenAi;
pub use openai_to_anthropic::OpenAiToAnthropic;
pub use openai_to_gemini::OpenAiToGemini;

/// One direction of translation: callers speak `INBOUND`, the provider
/// speaks `UPSTREAM`.
pub trait Converter: 'static {
    const INBOUND: Provider;
    const UPSTREAM: Provider;

    /// Caller request body.
    type Request: DeserializeOwned;
    /// Request body sent to the provider.
    type UpstreamRequest: Serialize + UpstreamBody;
    /// Whole (non-streamed) provider response.
    type UpstreamResponse: DeserializeOwned;
    /// Whole response returned to the caller.
    type Response: Serialize;
    /// One decoded unit of the provider's stream.
    type UpstreamEvent: DeserializeOwned;

    /// Returns the provider request and the model it targets.
    fn convert_request(req: &Self::Request, upstream_model: &str) -> (Self::UpstreamRequest, String);

    /// `caller_model` is echoed back instead of whatever the provider reports.
    fn convert_response(resp: &Self::UpstreamResponse, caller_model: &str) -> Self::Response;

    /// Zero or more complete frames in the caller's protocol, concatenated.
    fn convert_stream_event(event: &Self::UpstreamEvent, state: &mut StreamState) -> Option<String>;

    /// Whether this event ends the provider's stream on its own.
    fn is_terminal(_event: &Self::UpstreamEvent) -> bool {
        false
    }
}

/// Request bodies that carry a streaming switch.
pub trait UpstreamBody {
    fn enable_streaming(&mut self);
}

impl UpstreamBody for openai_types::ChatCompletionRequest {
    fn enable_streaming(&mut self) {
        self.stream = Some(true);
        self.stream_options = Some(openai_types::StreamOptions {
            include_usage: true,
        });
    }
}

impl UpstreamBody for anthropic_types::MessagesRequest {
    fn enable_streaming(&mut self) {
        self.stream = Some(true);
    }
}

/// Streaming is selected by the URL action for this protocol.
impl UpstreamBody for gemini_types::GenerateContentRequest {
    fn enable_streaming(&mut self) {}
}
