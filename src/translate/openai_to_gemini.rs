//! Chat-completions callers served by a generate-content provider.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::common::{
    parse_arguments, parse_data_uri, response_object, FinishKind, TokenUsage, ToolCallIds,
};
use super::gemini_types::{
    Blob, Content, ContentRole, FunctionDeclaration, GeminiTool, GenerateContentRequest,
    GenerateContentResponse, GenerationConfig, Part,
};
use super::openai_types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatContent, ChatMessage, ChatRole,
    ChatToolCall, ChatUsage, Choice, ChoiceMessage, ContentPart,
};
use super::streaming::StreamState;
use super::Converter;
use crate::providers::Provider;

pub struct OpenAiToGemini;

impl Converter for OpenAiToGemini {
    const INBOUND: Provider = Provider::OpenAi;
    const UPSTREAM: Provider = Provider::Gemini;

    type Request = ChatCompletionRequest;
    type UpstreamRequest = GenerateContentRequest;
    type UpstreamResponse = GenerateContentResponse;
    type Response = ChatCompletionResponse;
    type UpstreamEvent = GenerateContentResponse;

    fn convert_request(req: &ChatCompletionRequest, upstream_model: &str) -> (GenerateContentRequest, String) {
        let system: Vec<String> = req
            .messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .map(ChatMessage::text)
            .filter(|t| !t.is_empty())
            .collect();

        // Function responses are keyed by name, chat tool messages by call id.
        let mut call_names: HashMap<&str, &str> = HashMap::new();
        let mut contents: Vec<Content> = Vec::new();

        for msg in &req.messages {
            match msg.role {
                ChatRole::System => {}
                ChatRole::User | ChatRole::Unsupported => {
                    let parts = msg.content.as_ref().map(user_parts).unwrap_or_default();
                    if !parts.is_empty() {
                        contents.push(Content::user(parts));
                    }
                }
                ChatRole::Assistant => {
                    let mut parts = Vec::new();
                    let text = msg.text();
                    if !text.is_empty() {
                        parts.push(Part::text(text));
                    }
                    for call in msg.tool_calls.iter().flatten() {
                        call_names.insert(&call.id, &call.function.name);
                        parts.push(Part::function_call(
                            call.function.name.clone(),
                            parse_arguments(&call.function.arguments),
                        ));
                    }
                    if !parts.is_empty() {
                        contents.push(Content::model(parts));
                    }
                }
                ChatRole::Tool => {
                    let name = msg
                        .tool_call_id
                        .as_deref()
                        .and_then(|id| call_names.get(id).copied())
                        .or(msg.name.as_deref())
                        .unwrap_or_default();
                    let part = Part::function_response(name, response_object(&msg.text(), false));
                    push_function_response(&mut contents, part);
                }
            }
        }

        let tools = req.tools.as_ref().map(|tools| {
            vec![GeminiTool {
                function_declarations: tools
                    .iter()
                    .map(|t| FunctionDeclaration {
                        name: t.function.name.clone(),
                        description: t.function.description.clone(),
                        parameters: t.function.parameters.as_ref().and_then(|p| p.for_gemini()),
                    })
                    .collect(),
            }]
        });

        let upstream = GenerateContentRequest {
            contents,
            system_instruction: (!system.is_empty()).then(|| Content::text(system.join("\n"))),
            generation_config: Some(GenerationConfig {
                temperature: req.temperature,
                top_p: req.top_p,
                top_k: None,
                max_output_tokens: req.max_tokens.or(req.max_completion_tokens),
                stop_sequences: req.stop.as_ref().map(|s| s.to_vec()),
                candidate_count: None,
            }),
            tools,
            safety_settings: None,
        };

        (upstream, upstream_model.to_string())
    }

    fn convert_response(resp: &GenerateContentResponse, caller_model: &str) -> ChatCompletionResponse {
        let mut text = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();
        let mut ids = ToolCallIds::new("call");

        let candidate = resp.first_candidate();
        for part in candidate.map(|c| c.parts()).unwrap_or_default() {
            match part {
                Part::Text { text: t, thought: true } => reasoning.push_str(t),
                Part::Text { text: t, .. } => text.push_str(t),
                Part::FunctionCall { function_call } => {
                    tool_calls.push(ChatToolCall::new(
                        ids.call(&function_call.name),
                        function_call.name.clone(),
                        serde_json::to_string(&function_call.args).unwrap_or_default(),
                    ));
                }
                _ => {}
            }
        }

        let finish = FinishKind::resolve(
            candidate
                .and_then(|c| c.finish_reason.as_deref())
                .map(FinishKind::from_gemini),
            !tool_calls.is_empty(),
        );

        let usage = resp.usage_metadata.as_ref().map(|u| {
            let counts = TokenUsage {
                input: u.prompt_token_count,
                output: u.candidates_token_count,
                reported_total: u.total_token_count,
            };
            ChatUsage {
                prompt_tokens: counts.input,
                completion_tokens: counts.output,
                total_tokens: Some(counts.total()),
            }
        });

        let id = resp
            .response_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        ChatCompletionResponse {
            id: format!("chatcmpl-{id}"),
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
            usage,
        }
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
                Part::Text { text, thought: true } => out.extend(state.openai_reasoning(text)),
                Part::Text { text, .. } => out.extend(state.openai_text(text)),
                Part::FunctionCall { function_call } => {
                    let key = state.tool_call_count();
                    let id = state.synth_call_id(&function_call.name);
                    let arguments = serde_json::to_string(&function_call.args).unwrap_or_default();
                    out.extend(state.openai_tool_start(key, &id, &function_call.name, arguments));
                }
                _ => {}
            }
        }

        if let Some(reason) = candidate.finish_reason.as_deref() {
            out.extend(state.openai_finish(Some(FinishKind::from_gemini(reason))));
        }

        (!out.is_empty()).then_some(out)
    }
}

fn user_parts(content: &ChatContent) -> Vec<Part> {
    match content {
        ChatContent::Text(text) => vec![Part::text(text.clone())],
        ChatContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(Part::text(text.clone())),
                ContentPart::ImageUrl { image_url } => match parse_data_uri(&image_url.url) {
                    Some((mime, data)) => Some(Part::InlineData {
                        inline_data: Blob {
                            mime_type: mime.to_string(),
                            data: data.to_string(),
                        },
                    }),
                    None => {
                        debug!(url = %image_url.url, "dropping remote image, only inline data is forwarded");
                        None
                    }
                },
                ContentPart::Unsupported => {
                    warn!("dropping unsupported content part");
                    None
                }
            })
            .collect(),
    }
}

/// Responses to one batch of parallel calls must share a single user turn.
fn push_function_response(contents: &mut Vec<Content>, part: Part) {
    if let Some(last) = contents.last_mut() {
        if last.role == Some(ContentRole::User)
            && !last.parts.is_empty()
            && last
                .parts
                .iter()
                .all(|p| matches!(p, Part::FunctionResponse { .. }))
        {
            last.parts.push(part);
            return;
        }
    }
    contents.push(Content::user(vec![part]));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn request(value: Value) -> ChatCompletionRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_unsupported_parts_dropped_not_fatal() {
        let req = request(json!({
            "model": "gemini-2.0-flash",
            "messages": [
                {"role": "user", "content": [
                    {"type": "file", "file": {"file_id": "file-1"}},
                    {"type": "text", "text": "Summarize"}
                ]}
            ]
        }));

        let (out, _) = OpenAiToGemini::convert_request(&req, "gemini-2.0-flash");
        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["contents"].as_array().unwrap().len(), 1);
        assert_eq!(value["contents"][0]["parts"], json!([{"text": "Summarize"}]));
    }

    #[test]
    fn test_request_shape() {
        let req = request(json!({
            "model": "gemini-2.0-flash",
            "max_tokens": 256,
            "temperature": 0.2,
            "stop": "END",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": [
                    {"type": "text", "text": "What is this?"},
                    {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,/9j/"}}
                ]}
            ]
        }));

        let (out, model) = OpenAiToGemini::convert_request(&req, "gemini-2.0-flash");
        assert_eq!(model, "gemini-2.0-flash");

        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert_eq!(value["contents"][0]["role"], "user");
        assert_eq!(value["contents"][0]["parts"][1]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(value["generationConfig"]["stopSequences"], json!(["END"]));
    }

    #[test]
    fn test_tool_messages_resolve_names_and_group() {
        let req = request(json!({
            "model": "gemini-2.0-flash",
            "messages": [
                {"role": "user", "content": "weather in Oslo and Bergen"},
                {"role": "assistant", "tool_calls": [
                    {"id": "call_a", "type": "function", "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}},
                    {"id": "call_b", "type": "function", "function": {"name": "get_time", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_a", "content": "{\"temp\":3}"},
                {"role": "tool", "tool_call_id": "call_b", "content": "noon"}
            ],
            "tools": [{"type": "function", "function": {"name": "get_weather", "parameters": {
                "type": "object", "additionalProperties": false,
                "properties": {"city": {"type": "string"}}
            }}}],
            "tool_choice": {"type": "function", "function": {"name": "get_weather"}}
        }));

        let (out, _) = OpenAiToGemini::convert_request(&req, "gemini-2.0-flash");
        let value = serde_json::to_value(&out).unwrap();

        assert_eq!(value["contents"].as_array().unwrap().len(), 3);
        assert_eq!(value["contents"][1]["role"], "model");
        assert_eq!(value["contents"][1]["parts"][0]["functionCall"]["args"], json!({"city": "Oslo"}));

        let responses = &value["contents"][2]["parts"];
        assert_eq!(responses[0]["functionResponse"]["name"], "get_weather");
        assert_eq!(responses[0]["functionResponse"]["response"], json!({"temp": 3}));
        assert_eq!(responses[1]["functionResponse"]["name"], "get_time");
        assert_eq!(responses[1]["functionResponse"]["response"], json!({"result": "noon"}));

        let decl = &value["tools"][0]["functionDeclarations"][0];
        assert!(decl["parameters"].get("additionalProperties").is_none());
        // No generate-content counterpart for a forced tool.
        assert!(value.get("toolConfig").is_none());
    }

    #[test]
    fn test_response_with_function_call() {
        let resp: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "Checking."},
                    {"functionCall": {"name": "get_weather", "args": {"city": "Oslo"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 4}
        }))
        .unwrap();

        let out = OpenAiToGemini::convert_response(&resp, "gemini-2.0-flash");
        let choice = &out.choices[0];
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(choice.message.content.as_deref(), Some("Checking."));
        let call = &choice.message.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.id, "call_get_weather_0");
        assert_eq!(call.function.arguments, r#"{"city":"Oslo"}"#);
        assert_eq!(out.usage.unwrap().total_tokens, Some(12));
    }

    #[test]
    fn test_safety_maps_to_content_filter() {
        let resp: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{"finishReason": "SAFETY"}]
        }))
        .unwrap();
        let out = OpenAiToGemini::convert_response(&resp, "gemini-2.0-flash");
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("content_filter"));
        assert!(out.choices[0].message.content.is_none());
    }

    #[test]
    fn test_stream_chunks() {
        let mut state = StreamState::with_id(Provider::OpenAi, "chatcmpl-g", "gemini-2.0-flash", 1);
        let chunks: Vec<GenerateContentResponse> = serde_json::from_value(json!([
            {"candidates": [{"content": {"role": "model", "parts": [{"text": "Hel"}]}}]},
            {"candidates": [{"content": {"role": "model", "parts": [{"text": "lo"}]}, "finishReason": "STOP"}],
             "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5}}
        ]))
        .unwrap();

        let frames: Vec<String> = chunks
            .iter()
            .filter_map(|c| OpenAiToGemini::convert_stream_event(c, &mut state))
            .collect();

        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("\"role\":\"assistant\""));
        assert!(frames[0].contains("\"content\":\"Hel\""));
        assert!(!frames[1].contains("\"role\""));
        assert!(frames[1].contains("\"finish_reason\":\"stop\""));
        assert!(frames[1].contains("\"total_tokens\":5"));
        assert_eq!(state.usage().total(), 5);
    }
}
