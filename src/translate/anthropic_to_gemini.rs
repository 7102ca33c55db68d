//! Messages-protocol callers served by a generate-content provider.
//!
//! The generate-content protocol keys function responses by function name
//! rather than by call id, so tool results look up the name of the
//! `tool_use` block they answer. Responses synthesize `toolu_<name>_<n>` ids.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use super::anthropic_types::{
    ContentBlock, ImageSource, MessagesRequest, MessagesResponse, ResponseContentBlock, Role,
    Usage,
};
use super::common::{response_object, FinishKind, TokenUsage, ToolCallIds};
use super::gemini_types::{
    Blob, Content, FunctionDeclaration, GeminiTool, GenerateContentRequest,
    GenerateContentResponse, GenerationConfig, Part,
};
use super::streaming::StreamState;
use super::Converter;
use crate::providers::Provider;

pub struct AnthropicToGemini;

impl Converter for AnthropicToGemini {
    const INBOUND: Provider = Provider::Anthropic;
    const UPSTREAM: Provider = Provider::Gemini;

    type Request = MessagesRequest;
    type UpstreamRequest = GenerateContentRequest;
    type UpstreamResponse = GenerateContentResponse;
    type Response = MessagesResponse;
    type UpstreamEvent = GenerateContentResponse;

    fn convert_request(req: &MessagesRequest, upstream_model: &str) -> (GenerateContentRequest, String) {
        let mut tool_names: HashMap<String, String> = HashMap::new();
        let mut contents = Vec::new();

        for msg in &req.messages {
            let mut parts = Vec::new();
            for block in msg.content.blocks() {
                match block {
                    ContentBlock::Text { text } => parts.push(Part::text(text)),
                    ContentBlock::Image { source } => match source {
                        ImageSource::Base64 { media_type, data } => parts.push(Part::InlineData {
                            inline_data: Blob {
                                mime_type: media_type,
                                data,
                            },
                        }),
                        ImageSource::Url { url } => {
                            debug!(%url, "dropping remote image, only inline data is forwarded");
                        }
                        ImageSource::Unsupported => {}
                    },
                    ContentBlock::ToolUse { id, name, input } if msg.role == Role::Assistant => {
                        let args = match input {
                            Value::Object(map) => map,
                            _ => Default::default(),
                        };
                        parts.push(Part::function_call(name.clone(), args));
                        tool_names.insert(id, name);
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        let name = tool_names.get(&tool_use_id).cloned().unwrap_or_default();
                        let text = content.map(|c| c.text()).unwrap_or_default();
                        parts.push(Part::function_response(
                            name,
                            response_object(&text, is_error == Some(true)),
                        ));
                    }
                    ContentBlock::ToolUse { .. }
                    | ContentBlock::Thinking { .. }
                    | ContentBlock::RedactedThinking { .. }
                    | ContentBlock::Unsupported => {}
                }
            }

            if !parts.is_empty() {
                contents.push(match msg.role {
                    Role::User => Content::user(parts),
                    Role::Assistant => Content::model(parts),
                });
            }
        }

        let tools = req.tools.as_ref().map(|tools| {
            vec![GeminiTool {
                function_declarations: tools
                    .iter()
                    .map(|t| FunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.input_schema.for_gemini(),
                    })
                    .collect(),
            }]
        });

        let upstream = GenerateContentRequest {
            contents,
            system_instruction: req
                .system
                .as_ref()
                .map(|s| s.as_text())
                .filter(|s| !s.is_empty())
                .map(Content::text),
            generation_config: Some(GenerationConfig {
                temperature: req.temperature,
                top_p: req.top_p,
                top_k: req.top_k,
                max_output_tokens: Some(req.max_tokens),
                stop_sequences: req.stop_sequences.clone(),
                candidate_count: None,
            }),
            tools,
            safety_settings: None,
        };

        (upstream, upstream_model.to_string())
    }

    fn convert_response(resp: &GenerateContentResponse, caller_model: &str) -> MessagesResponse {
        let mut content = Vec::new();
        let mut ids = ToolCallIds::new("toolu");

        let candidate = resp.first_candidate();
        for part in candidate.map(|c| c.parts()).unwrap_or_default() {
            match part {
                Part::Text { text, thought: true } => content.push(ResponseContentBlock::Thinking {
                    thinking: text.clone(),
                    signature: None,
                }),
                Part::Text { text, .. } => {
                    content.push(ResponseContentBlock::Text { text: text.clone() })
                }
                Part::FunctionCall { function_call } => content.push(ResponseContentBlock::ToolUse {
                    id: ids.call(&function_call.name),
                    name: function_call.name.clone(),
                    input: Value::Object(function_call.args.clone()),
                }),
                _ => {}
            }
        }

        let has_tool_use = content
            .iter()
            .any(|b| matches!(b, ResponseContentBlock::ToolUse { .. }));
        if content.is_empty() {
            content.push(ResponseContentBlock::Text {
                text: String::new(),
            });
        }

        let finish = FinishKind::resolve(
            candidate
                .and_then(|c| c.finish_reason.as_deref())
                .map(FinishKind::from_gemini),
            has_tool_use,
        );

        let usage = resp.usage_metadata.as_ref().map_or_else(Usage::default, |u| {
            Usage::new(u.prompt_token_count, u.candidates_token_count)
        });

        let id = resp
            .response_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        MessagesResponse::new(
            format!("msg_{id}"),
            caller_model,
            content,
            Some(finish.anthropic().to_string()),
            usage,
        )
    }

    fn convert_stream_event(chunk: &GenerateContentResponse, state: &mut StreamState) -> Option<String> {
        if let Some(u) = &chunk.usage_metadata {
            state.set_usage(TokenUsage {
                input: u.prompt_token_count,
                output: u.candidates_token_count,
                reported_total: u.total_token_count,
            });
        }

        let candidate = chunk.first_candidate()?;
        let mut out = String::new();

        for part in candidate.parts() {
            match part {
                Part::Text { text, thought: true } => out.extend(state.anthropic_thinking(text)),
                Part::Text { text, .. } => out.extend(state.anthropic_text(text)),
                Part::FunctionCall { function_call } => {
                    let key = state.tool_call_count();
                    let id = state.synth_call_id(&function_call.name);
                    out.push_str(&state.anthropic_tool_start(key, &id, &function_call.name));
                    let input = serde_json::to_string(&function_call.args).unwrap_or_default();
                    out.extend(state.anthropic_tool_input(key, &input));
                }
                _ => {}
            }
        }

        if let Some(reason) = candidate.finish_reason.as_deref() {
            out.extend(state.anthropic_finish(Some(FinishKind::from_gemini(reason))));
        }

        (!out.is_empty()).then_some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: Value) -> MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_request_recovers_function_names() {
        let req = request(json!({
            "model": "gemini-2.0-flash",
            "max_tokens": 512,
            "top_k": 40,
            "system": [{"type": "text", "text": "Be brief."}],
            "messages": [
                {"role": "user", "content": "Weather in Oslo?"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "call the tool", "signature": "s"},
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Oslo"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "rain"},
                    {"type": "tool_result", "tool_use_id": "toolu_zz", "content": "boom", "is_error": true}
                ]}
            ],
            "tool_choice": {"type": "any"}
        }));

        let (out, _) = AnthropicToGemini::convert_request(&req, "gemini-2.0-flash");
        let value = serde_json::to_value(&out).unwrap();

        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert_eq!(value["generationConfig"]["topK"], 40);
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 512);
        assert_eq!(value["contents"][1]["role"], "model");
        assert_eq!(value["contents"][1]["parts"].as_array().unwrap().len(), 1);
        assert_eq!(value["contents"][1]["parts"][0]["functionCall"]["name"], "get_weather");

        let results = &value["contents"][2]["parts"];
        assert_eq!(results[0]["functionResponse"]["name"], "get_weather");
        assert_eq!(results[0]["functionResponse"]["response"], json!({"result": "rain"}));
        assert_eq!(results[1]["functionResponse"]["name"], "");
        assert_eq!(results[1]["functionResponse"]["response"], json!({"error": "boom"}));
        assert!(value.get("toolConfig").is_none());
    }

    #[test]
    fn test_tool_without_properties_has_no_parameters() {
        let req = request(json!({
            "model": "gemini-2.0-flash",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "ping"}],
            "tools": [{"name": "ping", "input_schema": {"type": "object"}}]
        }));

        let (out, _) = AnthropicToGemini::convert_request(&req, "gemini-2.0-flash");
        let value = serde_json::to_value(&out).unwrap();
        let decl = &value["tools"][0]["functionDeclarations"][0];
        assert_eq!(decl["name"], "ping");
        assert!(decl.get("parameters").is_none());
    }

    #[test]
    fn test_response_synthesizes_tool_ids() {
        let resp: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "get_weather", "args": {"city": "Oslo"}}},
                    {"functionCall": {"name": "get_weather", "args": {"city": "Bergen"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 7}
        }))
        .unwrap();

        let out = AnthropicToGemini::convert_response(&resp, "gemini-2.0-flash");
        assert_eq!(out.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(out.usage.input_tokens, 5);
        let ids: Vec<&str> = out
            .content
            .iter()
            .filter_map(|b| match b {
                ResponseContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["toolu_get_weather_0", "toolu_get_weather_1"]);
    }

    #[test]
    fn test_max_tokens_maps_to_max_tokens() {
        let resp: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": "partial"}]}, "finishReason": "MAX_TOKENS"}]
        }))
        .unwrap();
        let out = AnthropicToGemini::convert_response(&resp, "m");
        assert_eq!(out.stop_reason.as_deref(), Some("max_tokens"));
    }

    #[test]
    fn test_stream_text_then_call() {
        let mut state = StreamState::with_id(Provider::Anthropic, "msg_g", "gemini-2.0-flash", 1);
        let chunks: Vec<GenerateContentResponse> = serde_json::from_value(json!([
            {"candidates": [{"content": {"role": "model", "parts": [{"text": "Let me look."}]}}],
             "usageMetadata": {"promptTokenCount": 6}},
            {"candidates": [{"content": {"role": "model", "parts": [
                {"functionCall": {"name": "lookup", "args": {"q": "x"}}}
            ]}, "finishReason": "STOP"}],
             "usageMetadata": {"promptTokenCount": 6, "candidatesTokenCount": 9}}
        ]))
        .unwrap();

        let out: String = chunks
            .iter()
            .filter_map(|c| AnthropicToGemini::convert_stream_event(c, &mut state))
            .collect();

        let events: Vec<&str> = out.lines().filter_map(|l| l.strip_prefix("event: ")).collect();
        assert_eq!(
            events,
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
        assert!(out.contains("\"input_tokens\":6"));
        assert!(out.contains("\"id\":\"toolu_lookup_0\""));
        assert!(out.contains("\"stop_reason\":\"tool_use\""));
        assert!(out.contains("\"output_tokens\":9"));
    }
}
