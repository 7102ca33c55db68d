//! Messages-protocol callers served by a chat-completions provider.
//!
//! A single Anthropic message can expand into several chat messages: tool
//! results in a user turn become separate `tool`-role messages. On the way
//! back, the flat chunk stream is rebuilt into typed content-block events.

use serde_json::Value;

use super::anthropic_types::{
    ContentBlock, ImageSource, Message, MessagesRequest, MessagesResponse, ResponseContentBlock,
    Role, ToolChoice, ToolResultContent, Usage,
};
use super::common::{data_uri, FinishKind, TokenUsage};
use super::openai_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatContent, ChatFunction,
    ChatMessage, ChatTool, ChatToolCall, ChatToolChoice, ContentPart, ImageUrlDetail,
    StopSequences, StreamOptions,
};
use super::streaming::StreamState;
use super::Converter;
use crate::providers::Provider;

pub struct AnthropicToOpenAi;

impl Converter for AnthropicToOpenAi {
    const INBOUND: Provider = Provider::Anthropic;
    const UPSTREAM: Provider = Provider::OpenAi;

    type Request = MessagesRequest;
    type UpstreamRequest = ChatCompletionRequest;
    type UpstreamResponse = ChatCompletionResponse;
    type Response = MessagesResponse;
    type UpstreamEvent = ChatCompletionChunk;

    fn convert_request(req: &MessagesRequest, upstream_model: &str) -> (ChatCompletionRequest, String) {
        let mut messages = Vec::new();

        if let Some(system) = &req.system {
            let text = system.as_text();
            if !text.is_empty() {
                messages.push(ChatMessage::system(text));
            }
        }

        for msg in &req.messages {
            match msg.role {
                Role::User => translate_user_message(msg, &mut messages),
                Role::Assistant => messages.push(translate_assistant_message(msg)),
            }
        }

        let tools = req.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| ChatTool {
                    tool_type: "function".to_string(),
                    function: ChatFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: Some(t.input_schema.clone()),
                    },
                })
                .collect()
        });

        let stream_options = req.stream.filter(|s| *s).map(|_| StreamOptions {
            include_usage: true,
        });

        let upstream = ChatCompletionRequest {
            model: upstream_model.to_string(),
            messages,
            max_tokens: Some(req.max_tokens),
            max_completion_tokens: None,
            temperature: req.temperature,
            top_p: req.top_p,
            stream: req.stream,
            stream_options,
            tools,
            tool_choice: req.tool_choice.as_ref().map(translate_tool_choice),
            stop: req.stop_sequences.clone().map(StopSequences::Many),
            user: req.metadata.as_ref().and_then(|m| m.user_id.clone()),
        };

        (upstream, upstream_model.to_string())
    }

    fn convert_response(resp: &ChatCompletionResponse, caller_model: &str) -> MessagesResponse {
        let choice = resp.choices.first();
        let mut content: Vec<ResponseContentBlock> = Vec::new();

        if let Some(c) = choice {
            if let Some(reasoning) = c.message.reasoning_content.as_ref().filter(|r| !r.is_empty()) {
                content.push(ResponseContentBlock::Thinking {
                    thinking: reasoning.clone(),
                    signature: None,
                });
            }

            if let Some(text) = c.message.content.as_ref().filter(|t| !t.is_empty()) {
                content.push(ResponseContentBlock::Text { text: text.clone() });
            }

            for tc in c.message.tool_calls.iter().flatten() {
                let input = serde_json::from_str::<Value>(&tc.function.arguments)
                    .ok()
                    .filter(Value::is_object)
                    .unwrap_or_else(|| Value::Object(Default::default()));
                content.push(ResponseContentBlock::ToolUse {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    input,
                });
            }
        }

        let has_tool_use = content
            .iter()
            .any(|b| matches!(b, ResponseContentBlock::ToolUse { .. }));

        // Callers expect at least one block.
        if content.is_empty() {
            content.push(ResponseContentBlock::Text {
                text: String::new(),
            });
        }

        let finish = FinishKind::resolve(
            choice
                .and_then(|c| c.finish_reason.as_deref())
                .map(FinishKind::from_openai),
            has_tool_use,
        );

        let usage = resp.usage.as_ref().map_or_else(Usage::default, |u| {
            Usage::new(u.prompt_tokens, u.completion_tokens)
        });

        MessagesResponse::new(
            format!("msg_{}", resp.id.trim_start_matches("chatcmpl-")),
            caller_model,
            content,
            Some(finish.anthropic().to_string()),
            usage,
        )
    }

    fn convert_stream_event(chunk: &ChatCompletionChunk, state: &mut StreamState) -> Option<String> {
        if let Some(usage) = &chunk.usage {
            state.set_usage(TokenUsage {
                input: usage.prompt_tokens,
                output: usage.completion_tokens,
                reported_total: usage.total_tokens,
            });
        }

        // The finish chunk usually precedes the usage-only chunk; hold the
        // finish until counts are known.
        if let Some(kind) = state.pending_finish() {
            return chunk
                .usage
                .as_ref()
                .and_then(|_| state.anthropic_finish(Some(kind)));
        }

        let choice = chunk.choices.first()?;
        let mut out = String::new();

        if let Some(reasoning) = choice.delta.reasoning_content.as_deref() {
            out.extend(state.anthropic_thinking(reasoning));
        }
        if let Some(text) = choice.delta.content.as_deref() {
            out.extend(state.anthropic_text(text));
        }

        for tc in choice.delta.tool_calls.iter().flatten() {
            let key = tc.index as usize;
            let function = tc.function.as_ref();

            if tc.id.is_some() || !state.knows_tool(key) {
                let name = function.and_then(|f| f.name.as_deref()).unwrap_or_default();
                let id = match &tc.id {
                    Some(id) => id.clone(),
                    None => state.synth_call_id(name),
                };
                out.push_str(&state.anthropic_tool_start(key, &id, name));
            }
            if let Some(arguments) = function.and_then(|f| f.arguments.as_deref()) {
                out.extend(state.anthropic_tool_input(key, arguments));
            }
        }

        if let Some(reason) = choice.finish_reason.as_deref() {
            let kind = FinishKind::from_openai(reason);
            if chunk.usage.is_some() {
                out.extend(state.anthropic_finish(Some(kind)));
            } else {
                state.defer_finish(kind);
            }
        }

        (!out.is_empty()).then_some(out)
    }
}

fn translate_user_message(msg: &Message, messages: &mut Vec<ChatMessage>) {
    let mut parts: Vec<ContentPart> = Vec::new();
    let mut produced = false;

    for block in msg.content.blocks() {
        match block {
            ContentBlock::Text { text } => parts.push(ContentPart::Text { text }),
            ContentBlock::Image { source } => {
                let url = match source {
                    ImageSource::Base64 { media_type, data } => data_uri(&media_type, &data),
                    ImageSource::Url { url } => url,
                    ImageSource::Unsupported => continue,
                };
                parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrlDetail { url, detail: None },
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                // Flush accumulated parts first so ordering is preserved.
                if !parts.is_empty() {
                    messages.push(ChatMessage::user(ChatContent::from_parts(std::mem::take(
                        &mut parts,
                    ))));
                }
                messages.push(ChatMessage::tool(
                    tool_use_id,
                    tool_result_text(content.as_ref(), is_error),
                ));
                produced = true;
            }
            ContentBlock::ToolUse { .. }
            | ContentBlock::Thinking { .. }
            | ContentBlock::RedactedThinking { .. }
            | ContentBlock::Unsupported => {}
        }
    }

    if !parts.is_empty() {
        messages.push(ChatMessage::user(ChatContent::from_parts(parts)));
    } else if !produced {
        messages.push(ChatMessage::user(ChatContent::Text(String::new())));
    }
}

fn translate_assistant_message(msg: &Message) -> ChatMessage {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in msg.content.blocks() {
        match block {
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ChatToolCall::new(
                    id,
                    name,
                    serde_json::to_string(&input).unwrap_or_default(),
                ));
            }
            _ => {}
        }
    }

    ChatMessage::assistant((!text.is_empty()).then_some(text), tool_calls)
}

fn tool_result_text(content: Option<&ToolResultContent>, is_error: Option<bool>) -> String {
    let prefix = if is_error == Some(true) { "ERROR: " } else { "" };
    match content {
        Some(content) => format!("{prefix}{}", content.text()),
        None => format!("{prefix}(no content)"),
    }
}

fn translate_tool_choice(choice: &ToolChoice) -> ChatToolChoice {
    match choice {
        ToolChoice::Auto => ChatToolChoice::String("auto".to_string()),
        ToolChoice::Any => ChatToolChoice::String("required".to_string()),
        ToolChoice::None => ChatToolChoice::String("none".to_string()),
        ToolChoice::Tool { name } => ChatToolChoice::function(name.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::openai_types::{ChatRole, ChatUsage, Choice, ChoiceMessage};
    use serde_json::json;

    fn request(value: Value) -> MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_simple_text_request() {
        let req = request(json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 1024,
            "system": "You are helpful",
            "messages": [{"role": "user", "content": "Hello"}]
        }));

        let (out, model) = AnthropicToOpenAi::convert_request(&req, "gpt-4o");
        assert_eq!(model, "gpt-4o");
        assert_eq!(out.model, "gpt-4o");
        assert_eq!(out.max_tokens, Some(1024));
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[0].role, ChatRole::System);
        assert_eq!(out.messages[1].role, ChatRole::User);
    }

    #[test]
    fn test_tool_result_splits_into_tool_messages() {
        let req = request(json!({
            "model": "claude-sonnet-4",
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "result 1"},
                {"type": "tool_result", "tool_use_id": "toolu_2", "content": [{"type": "text", "text": "bad"}], "is_error": true},
                {"type": "text", "text": "Now continue"}
            ]}]
        }));

        let (out, _) = AnthropicToOpenAi::convert_request(&req, "gpt-4o");
        assert_eq!(out.messages.len(), 3);
        assert_eq!(out.messages[0].role, ChatRole::Tool);
        assert_eq!(out.messages[0].tool_call_id.as_deref(), Some("toolu_1"));
        assert_eq!(out.messages[1].text(), "ERROR: bad");
        assert_eq!(out.messages[2].role, ChatRole::User);
    }

    #[test]
    fn test_assistant_tool_use_and_choice() {
        let req = request(json!({
            "model": "claude-sonnet-4",
            "max_tokens": 10,
            "stream": true,
            "stop_sequences": ["###"],
            "tool_choice": {"type": "tool", "name": "lookup"},
            "tools": [{"name": "lookup", "input_schema": {"type": "object", "properties": {"q": {"type": "string"}}}}],
            "messages": [
                {"role": "user", "content": "find it"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "hmm", "signature": "sig"},
                    {"type": "tool_use", "id": "toolu_1", "name": "lookup", "input": {"q": "x"}}
                ]}
            ]
        }));

        let (out, _) = AnthropicToOpenAi::convert_request(&req, "gpt-4o");
        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["tool_choice"], json!({"type": "function", "function": {"name": "lookup"}}));
        assert_eq!(value["stop"], json!(["###"]));
        assert_eq!(value["stream_options"]["include_usage"], true);
        assert_eq!(value["tools"][0]["function"]["parameters"]["properties"]["q"]["type"], "string");
        assert!(value["messages"][1].get("content").is_none());
        assert_eq!(value["messages"][1]["tool_calls"][0]["function"]["arguments"], r#"{"q":"x"}"#);
    }

    fn make_response(content: Option<&str>, finish_reason: Option<&str>) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: "chatcmpl-abc123".to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: "gpt-4o".to_string(),
            choices: vec![Choice {
                index: 0,
                message: ChoiceMessage {
                    role: "assistant".to_string(),
                    content: content.map(str::to_string),
                    reasoning_content: None,
                    tool_calls: None,
                },
                finish_reason: finish_reason.map(str::to_string),
            }],
            usage: Some(ChatUsage {
                prompt_tokens: 10,
                completion_tokens: 20,
                total_tokens: Some(30),
            }),
        }
    }

    #[test]
    fn test_simple_text_response() {
        let out = AnthropicToOpenAi::convert_response(
            &make_response(Some("Hello!"), Some("stop")),
            "claude-sonnet-4-20250514",
        );

        assert_eq!(out.id, "msg_abc123");
        assert_eq!(out.model, "claude-sonnet-4-20250514");
        assert_eq!(out.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(out.usage.input_tokens, 10);
        assert_eq!(out.usage.output_tokens, 20);
        assert!(matches!(&out.content[0], ResponseContentBlock::Text { text } if text == "Hello!"));
    }

    #[test]
    fn test_length_and_empty_content() {
        let out = AnthropicToOpenAi::convert_response(&make_response(None, Some("length")), "m");
        assert_eq!(out.stop_reason.as_deref(), Some("max_tokens"));
        assert_eq!(out.content.len(), 1);
    }

    #[test]
    fn test_tool_calls_force_tool_use() {
        let mut resp = make_response(None, Some("stop"));
        resp.choices[0].message.tool_calls = Some(vec![ChatToolCall::new(
            "call_1",
            "get_weather",
            r#"{"city":"Oslo"}"#,
        )]);

        let out = AnthropicToOpenAi::convert_response(&resp, "m");
        assert_eq!(out.stop_reason.as_deref(), Some("tool_use"));
        match &out.content[0] {
            ResponseContentBlock::ToolUse { id, input, .. } => {
                assert_eq!(id, "call_1");
                assert_eq!(input["city"], "Oslo");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    fn chunk(value: Value) -> ChatCompletionChunk {
        serde_json::from_value(value).unwrap()
    }

    fn event_names(frames: &str) -> Vec<&str> {
        frames
            .lines()
            .filter_map(|l| l.strip_prefix("event: "))
            .collect()
    }

    #[test]
    fn test_role_text_finish_stream_shape() {
        let mut state = StreamState::with_id(Provider::Anthropic, "msg_t", "claude-sonnet-4", 1);
        let mut out = String::new();
        for c in [
            json!({"choices": [{"index": 0, "delta": {"role": "assistant"}}]}),
            json!({"choices": [{"index": 0, "delta": {"content": "Hi"}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
        ] {
            out.extend(AnthropicToOpenAi::convert_stream_event(&chunk(c), &mut state));
        }
        out.extend(crate::translate::streaming::closing_frames(Provider::Anthropic, &mut state));

        assert_eq!(
            event_names(&out),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "message_delta",
                "message_stop"
            ]
        );
        assert!(out.contains("\"text\":\"Hi\""));
        assert!(out.contains("\"stop_reason\":\"end_turn\""));
    }

    #[test]
    fn test_usage_chunk_completes_deferred_finish() {
        let mut state = StreamState::with_id(Provider::Anthropic, "msg_t", "m", 1);
        let mut out = String::new();
        for c in [
            json!({"choices": [{"index": 0, "delta": {"content": "Hi"}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "length"}]}),
            json!({"choices": [{"index": 0, "delta": {"content": "late"}}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6}}),
        ] {
            out.extend(AnthropicToOpenAi::convert_stream_event(&chunk(c), &mut state));
        }

        assert!(state.finish_sent());
        assert!(!out.contains("late"));
        assert!(out.contains("\"stop_reason\":\"max_tokens\""));
        assert!(out.contains("\"output_tokens\":2"));
        assert!(crate::translate::streaming::closing_frames(Provider::Anthropic, &mut state).is_empty());
    }

    #[test]
    fn test_streamed_tool_call_closes_text_block() {
        let mut state = StreamState::with_id(Provider::Anthropic, "msg_t", "m", 1);
        let mut out = String::new();
        for c in [
            json!({"choices": [{"index": 0, "delta": {"content": "Let me check."}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "id": "call_1", "type": "function", "function": {"name": "lookup", "arguments": ""}}]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "function": {"arguments": "{\"q\":1}"}}]}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}], "usage": {"prompt_tokens": 1, "completion_tokens": 1}}),
        ] {
            out.extend(AnthropicToOpenAi::convert_stream_event(&chunk(c), &mut state));
        }

        assert_eq!(
            event_names(&out),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert!(out.contains("\"stop_reason\":\"tool_use\""));
        assert!(out.contains("\"index\":1"));
    }
}
