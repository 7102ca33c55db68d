//! Generate-content callers served by a messages provider.
//!
//! The messages protocol requires an id on every `tool_use` block and a
//! matching `tool_use_id` on its result, so both are synthesized here as
//! `toolu_<name>_<n>`.

use serde_json::Value;

use super::anthropic_types::{
    ContentBlock, Delta, ImageSource, Message, MessageContent, MessagesRequest, MessagesResponse,
    ResponseContentBlock, Role, StreamEvent, SystemContent, Tool, ToolResultContent,
};
use super::common::{
    data_frame, response_text, FinishKind, ToolCallIds, DEFAULT_MAX_TOKENS,
};
use super::gemini_types::{
    Candidate, Content, ContentRole, GeminiErrorResponse, GenerateContentRequest,
    GenerateContentResponse, Part, UsageMetadata,
};
use super::streaming::StreamState;
use super::Converter;
use crate::providers::Provider;

pub struct GeminiToAnthropic;

impl Converter for GeminiToAnthropic {
    const INBOUND: Provider = Provider::Gemini;
    const UPSTREAM: Provider = Provider::Anthropic;

    type Request = GenerateContentRequest;
    type UpstreamRequest = MessagesRequest;
    type UpstreamResponse = MessagesResponse;
    type Response = GenerateContentResponse;
    type UpstreamEvent = StreamEvent;

    fn convert_request(req: &GenerateContentRequest, upstream_model: &str) -> (MessagesRequest, String) {
        let mut ids = ToolCallIds::new("toolu");
        let mut messages = Vec::new();

        for content in &req.contents {
            let (role, blocks) = match content.role {
                Some(ContentRole::Model) => (Role::Assistant, model_blocks(content, &mut ids)),
                Some(ContentRole::User) | None => (Role::User, user_blocks(content, &mut ids)),
            };
            if blocks.is_empty() {
                continue;
            }
            let content = MessageContent::from_blocks(blocks);
            messages.push(match role {
                Role::Assistant => Message::assistant(content),
                Role::User => Message::user(content),
            });
        }

        let config = req.generation_config.clone().unwrap_or_default();

        let tools: Vec<Tool> = req
            .tools
            .iter()
            .flatten()
            .flat_map(|tool| tool.function_declarations.iter())
            .map(|decl| Tool {
                name: decl.name.clone(),
                description: decl.description.clone(),
                input_schema: decl.parameters.clone().unwrap_or_default(),
            })
            .collect();

        let upstream = MessagesRequest {
            model: upstream_model.to_string(),
            max_tokens: config.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: req
                .system_instruction
                .as_ref()
                .map(Content::joined_text)
                .filter(|s| !s.is_empty())
                .map(SystemContent::Text),
            stream: None,
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            tool_choice: None,
            tools: (!tools.is_empty()).then_some(tools),
            metadata: None,
            stop_sequences: config.stop_sequences,
            thinking: None,
        };

        (upstream, upstream_model.to_string())
    }

    fn convert_response(resp: &MessagesResponse, caller_model: &str) -> GenerateContentResponse {
        let mut parts = Vec::new();

        for block in &resp.content {
            match block {
                ResponseContentBlock::Text { text } if !text.is_empty() => {
                    parts.push(Part::text(text.clone()))
                }
                ResponseContentBlock::Thinking { thinking, .. } if !thinking.is_empty() => {
                    parts.push(Part::Text {
                        text: thinking.clone(),
                        thought: true,
                    })
                }
                ResponseContentBlock::ToolUse { name, input, .. } => {
                    let args = match input {
                        Value::Object(map) => map.clone(),
                        _ => Default::default(),
                    };
                    parts.push(Part::function_call(name.clone(), args));
                }
                _ => {}
            }
        }

        let has_call = parts.iter().any(|p| matches!(p, Part::FunctionCall { .. }));
        let finish = FinishKind::resolve(
            resp.stop_reason.as_deref().map(FinishKind::from_anthropic),
            has_call,
        );

        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content::model(parts)),
                finish_reason: Some(finish.gemini().to_string()),
                index: 0,
            }],
            usage_metadata: Some(UsageMetadata::new(
                resp.usage.input_tokens,
                resp.usage.output_tokens,
            )),
            model_version: Some(caller_model.to_string()),
            response_id: (!resp.id.is_empty()).then(|| resp.id.clone()),
        }
    }

    fn convert_stream_event(event: &StreamEvent, state: &mut StreamState) -> Option<String> {
        match event {
            StreamEvent::MessageStart { message } => {
                state.set_input_tokens(message.usage.input_tokens);
                None
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ResponseContentBlock::ToolUse { name, .. } => {
                    state.gemini_call_fragment(*index, Some(name.as_str()), "");
                    None
                }
                ResponseContentBlock::Text { text } => state.gemini_text(text, false),
                ResponseContentBlock::Thinking { thinking, .. } => state.gemini_text(thinking, true),
                _ => None,
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::TextDelta { text } => state.gemini_text(text, false),
                Delta::ThinkingDelta { thinking } => state.gemini_text(thinking, true),
                Delta::InputJsonDelta { partial_json } => {
                    state.gemini_call_fragment(*index, None, partial_json);
                    None
                }
                Delta::SignatureDelta { .. } | Delta::Unsupported => None,
            },
            StreamEvent::ContentBlockStop { index } => state.gemini_flush_call(*index),
            StreamEvent::MessageDelta { delta, usage } => {
                state.set_output_tokens(usage.output_tokens);
                if let Some(input) = usage.input_tokens {
                    state.set_input_tokens(input);
                }
                state.gemini_finish(delta.stop_reason.as_deref().map(FinishKind::from_anthropic))
            }
            StreamEvent::Error { error } => {
                data_frame(&GeminiErrorResponse::new(500, "INTERNAL", error.message.clone()))
            }
            StreamEvent::MessageStop | StreamEvent::Ping => None,
        }
    }

    fn is_terminal(event: &StreamEvent) -> bool {
        matches!(event, StreamEvent::MessageStop)
    }
}

fn user_blocks(content: &Content, ids: &mut ToolCallIds) -> Vec<ContentBlock> {
    content
        .parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text, .. } if !text.is_empty() => {
                Some(ContentBlock::Text { text: text.clone() })
            }
            Part::InlineData { inline_data } => Some(ContentBlock::Image {
                source: ImageSource::Base64 {
                    media_type: inline_data.mime_type.clone(),
                    data: inline_data.data.clone(),
                },
            }),
            Part::FunctionResponse { function_response } => {
                let response = &function_response.response;
                let is_error = response.len() == 1 && response.contains_key("error");
                let text = match response.get("error") {
                    Some(Value::String(message)) if is_error => message.clone(),
                    _ => response_text(response),
                };
                Some(ContentBlock::ToolResult {
                    tool_use_id: ids.result(&function_response.name),
                    content: Some(ToolResultContent::Text(text)),
                    is_error: is_error.then_some(true),
                })
            }
            _ => None,
        })
        .collect()
}

fn model_blocks(content: &Content, ids: &mut ToolCallIds) -> Vec<ContentBlock> {
    content
        .parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text, thought: false } if !text.is_empty() => {
                Some(ContentBlock::Text { text: text.clone() })
            }
            Part::FunctionCall { function_call } => Some(ContentBlock::ToolUse {
                id: ids.call(&function_call.name),
                name: function_call.name.clone(),
                input: Value::Object(function_call.args.clone()),
            }),
            _ => None,
        })
        .collect()
}
