//! Chat-completions callers served by a messages-protocol provider.
//!
//! System messages are hoisted into the top-level `system` field, tool
//! results become `tool_result` blocks inside user turns, and the stream of
//! typed events is flattened back into `chat.completion.chunk` deltas.

use serde_json::Value;
use tracing::warn;

use super::anthropic_types::{
    ContentBlock, Delta, ImageSource, Message, MessageContent, MessagesRequest, MessagesResponse,
    Metadata, ResponseContentBlock, Role, StreamEvent, SystemContent, Tool, ToolChoice,
    ToolResultContent,
};
use super::common::{parse_arguments, parse_data_uri, FinishKind, DEFAULT_MAX_TOKENS};
use super::openai_types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatContent, ChatErrorResponse, ChatMessage,
    ChatRole, ChatToolCall, ChatToolChoice, ChatUsage, Choice, ChoiceMessage, ContentPart,
};
use super::streaming::StreamState;
use super::Converter;
use crate::providers::Provider;

pub struct OpenAiToAnthropic;

impl Converter for OpenAiToAnthropic {
    const INBOUND: Provider = Provider::OpenAi;
    const UPSTREAM: Provider = Provider::Anthropic;

    type Request = ChatCompletionRequest;
    type UpstreamRequest = MessagesRequest;
    type UpstreamResponse = MessagesResponse;
    type Response = ChatCompletionResponse;
    type UpstreamEvent = StreamEvent;

    fn convert_request(req: &ChatCompletionRequest, upstream_model: &str) -> (MessagesRequest, String) {
        let system: Vec<String> = req
            .messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .map(ChatMessage::text)
            .filter(|t| !t.is_empty())
            .collect();

        let mut messages: Vec<Message> = Vec::new();
        for msg in &req.messages {
            match msg.role {
                ChatRole::System => {}
                ChatRole::User | ChatRole::Unsupported => {
                    let content = msg
                        .content
                        .as_ref()
                        .map(user_content)
                        .unwrap_or_else(|| MessageContent::Text(String::new()));
                    messages.push(Message::user(content));
                }
                ChatRole::Assistant => {
                    if let Some(message) = assistant_message(msg) {
                        messages.push(message);
                    }
                }
                ChatRole::Tool => push_tool_result(&mut messages, msg),
            }
        }

        let tools = req.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| Tool {
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    input_schema: t.function.parameters.clone().unwrap_or_default(),
                })
                .collect()
        });

        let upstream = MessagesRequest {
            model: upstream_model.to_string(),
            max_tokens: req
                .max_tokens
                .or(req.max_completion_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: (!system.is_empty()).then(|| SystemContent::Text(system.join("\n"))),
            stream: req.stream,
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: None,
            tools,
            tool_choice: req.tool_choice.as_ref().and_then(translate_tool_choice),
            metadata: req.user.as_ref().map(|user| Metadata {
                user_id: Some(user.clone()),
            }),
            stop_sequences: req.stop.as_ref().map(|s| s.to_vec()),
            thinking: None,
        };

        (upstream, upstream_model.to_string())
    }

    fn convert_response(resp: &MessagesResponse, caller_model: &str) -> ChatCompletionResponse {
        let mut text = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();

        for block in &resp.content {
            match block {
                ResponseContentBlock::Text { text: t } => text.push_str(t),
                ResponseContentBlock::Thinking { thinking, .. } => reasoning.push_str(thinking),
                ResponseContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ChatToolCall::new(
                        id.clone(),
                        name.clone(),
                        serde_json::to_string(input).unwrap_or_default(),
                    ));
                }
                ResponseContentBlock::RedactedThinking { .. } | ResponseContentBlock::Unsupported => {}
            }
        }

        let finish = FinishKind::resolve(
            resp.stop_reason.as_deref().map(FinishKind::from_anthropic),
            !tool_calls.is_empty(),
        );

        ChatCompletionResponse {
            id: format!("chatcmpl-{}", resp.id.trim_start_matches("msg_")),
            object: "chat.completion".to_string(),
            created: u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default(),
            model: caller_model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: ChoiceMessage {
                    role: "assistant".to_string(),
                    content: (!text.is_empty()).then_some(text),
                    reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                },
                finish_reason: Some(finish.openai().to_string()),
            }],
            usage: Some(ChatUsage::new(
                resp.usage.input_tokens,
                resp.usage.output_tokens,
            )),
        }
    }

    fn convert_stream_event(event: &StreamEvent, state: &mut StreamState) -> Option<String> {
        match event {
            StreamEvent::MessageStart { message } => {
                state.set_input_tokens(message.usage.input_tokens);
                state.set_output_tokens(message.usage.output_tokens);
                state.openai_delta(Default::default())
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block: ResponseContentBlock::ToolUse { id, name, .. },
            } => state.openai_tool_start(*index, id, name, String::new()),
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::TextDelta { text } => state.openai_text(text),
                Delta::ThinkingDelta { thinking } => state.openai_reasoning(thinking),
                Delta::InputJsonDelta { partial_json } => {
                    state.openai_tool_arguments(*index, partial_json)
                }
                Delta::SignatureDelta { .. } | Delta::Unsupported => None,
            },
            StreamEvent::MessageDelta { delta, usage } => {
                state.set_output_tokens(usage.output_tokens);
                if let Some(input) = usage.input_tokens {
                    state.set_input_tokens(input);
                }
                let reason = delta.stop_reason.as_deref()?;
                state.openai_finish(Some(FinishKind::from_anthropic(reason)))
            }
            StreamEvent::Error { error } => {
                let body = ChatErrorResponse::new(&error.error_type, error.message.clone());
                super::common::data_frame(&body)
            }
            StreamEvent::ContentBlockStart { .. }
            | StreamEvent::ContentBlockStop { .. }
            | StreamEvent::MessageStop
            | StreamEvent::Ping => None,
        }
    }

    fn is_terminal(event: &StreamEvent) -> bool {
        matches!(event, StreamEvent::MessageStop)
    }
}

fn user_content(content: &ChatContent) -> MessageContent {
    match content {
        ChatContent::Text(text) => MessageContent::Text(text.clone()),
        ChatContent::Parts(parts) => {
            let blocks = parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(ContentBlock::Text { text: text.clone() }),
                    ContentPart::ImageUrl { image_url } => Some(ContentBlock::Image {
                        source: match parse_data_uri(&image_url.url) {
                            Some((mime, data)) => ImageSource::Base64 {
                                media_type: mime.to_string(),
                                data: data.to_string(),
                            },
                            None => ImageSource::Url {
                                url: image_url.url.clone(),
                            },
                        },
                    }),
                    ContentPart::Unsupported => {
                        warn!("dropping unsupported content part");
                        None
                    }
                })
                .collect();
            MessageContent::from_blocks(blocks)
        }
    }
}

/// `None` for an assistant turn with neither text nor tool calls; the
/// messages protocol rejects empty turns.
fn assistant_message(msg: &ChatMessage) -> Option<Message> {
    let text = msg.text();
    let calls = msg.tool_calls.as_deref().unwrap_or_default();

    if calls.is_empty() {
        return (!text.is_empty()).then(|| Message::assistant(MessageContent::Text(text)));
    }

    let mut blocks = Vec::with_capacity(calls.len() + 1);
    if !text.is_empty() {
        blocks.push(ContentBlock::Text { text });
    }
    for call in calls {
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.function.name.clone(),
            input: Value::Object(parse_arguments(&call.function.arguments)),
        });
    }
    Some(Message::assistant(MessageContent::Blocks(blocks)))
}

/// Consecutive tool messages answer one batch of parallel calls, so they
/// share a single user turn.
fn push_tool_result(messages: &mut Vec<Message>, msg: &ChatMessage) {
    let block = ContentBlock::ToolResult {
        tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
        content: Some(ToolResultContent::Text(msg.text())),
        is_error: None,
    };

    if let Some(Message {
        role: Role::User,
        content: MessageContent::Blocks(blocks),
    }) = messages.last_mut()
    {
        if blocks
            .iter()
            .all(|b| matches!(b, ContentBlock::ToolResult { .. }))
        {
            blocks.push(block);
            return;
        }
    }
    messages.push(Message::user(MessageContent::Blocks(vec![block])));
}

fn translate_tool_choice(choice: &ChatToolChoice) -> Option<ToolChoice> {
    match choice {
        ChatToolChoice::String(mode) => match mode.as_str() {
            "auto" => Some(ToolChoice::Auto),
            "required" => Some(ToolChoice::Any),
            "none" => Some(ToolChoice::None),
            _ => None,
        },
        ChatToolChoice::Specific(specific) => Some(ToolChoice::Tool {
            name: specific.function.name.clone(),
        }),
    }
}
