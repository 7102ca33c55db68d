//! Generate-content callers served by a chat-completions provider.
//!
//! Generate-content conversations carry no call ids, so `call_<name>_<n>` ids
//! are synthesized and function responses are paired with the oldest
//! unanswered call of the same name.

use super::common::{
    data_uri, parse_arguments, response_text, FinishKind, TokenUsage, ToolCallIds,
};
use super::gemini_types::{
    Candidate, Content, ContentRole, GenerateContentRequest, GenerateContentResponse, Part,
    UsageMetadata,
};
use super::openai_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatContent, ChatFunction,
    ChatMessage, ChatTool, ChatToolCall, ContentPart, ImageUrlDetail,
    StopSequences,
};
use super::streaming::StreamState;
use super::Converter;
use crate::providers::Provider;

pub struct GeminiToOpenAi;

impl Converter for GeminiToOpenAi {
    const INBOUND: Provider = Provider::Gemini;
    const UPSTREAM: Provider = Provider::OpenAi;

    type Request = GenerateContentRequest;
    type UpstreamRequest = ChatCompletionRequest;
    type UpstreamResponse = ChatCompletionResponse;
    type Response = GenerateContentResponse;
    type UpstreamEvent = ChatCompletionChunk;

    fn convert_request(req: &GenerateContentRequest, upstream_model: &str) -> (ChatCompletionRequest, String) {
        let mut messages = Vec::new();
        let mut ids = ToolCallIds::new("call");

        if let Some(system) = &req.system_instruction {
            let text = system.joined_text();
            if !text.is_empty() {
                messages.push(ChatMessage::system(text));
            }
        }

        for content in &req.contents {
            match content.role {
                Some(ContentRole::Model) => translate_model_turn(content, &mut ids, &mut messages),
                Some(ContentRole::User) | None => {
                    translate_user_turn(content, &mut ids, &mut messages)
                }
            }
        }

        let config = req.generation_config.clone().unwrap_or_default();

        let functions: Vec<ChatTool> = req
            .tools
            .iter()
            .flatten()
            .flat_map(|tool| tool.function_declarations.iter())
            .map(|decl| ChatTool {
                tool_type: "function".to_string(),
                function: ChatFunction {
                    name: decl.name.clone(),
                    description: decl.description.clone(),
                    parameters: decl.parameters.clone(),
                },
            })
            .collect();

        let upstream = ChatCompletionRequest {
            model: upstream_model.to_string(),
            messages,
            max_tokens: config.max_output_tokens,
            max_completion_tokens: None,
            temperature: config.temperature,
            top_p: config.top_p,
            stream: None,
            stream_options: None,
            tool_choice: None,
            tools: (!functions.is_empty()).then_some(functions),
            stop: config.stop_sequences.map(StopSequences::Many),
            user: None,
        };

        (upstream, upstream_model.to_string())
    }

    fn convert_response(resp: &ChatCompletionResponse, caller_model: &str) -> GenerateContentResponse {
        let choice = resp.choices.first();
        let mut parts = Vec::new();

        if let Some(message) = choice.map(|c| &c.message) {
            if let Some(reasoning) = message.reasoning_content.as_deref().filter(|r| !r.is_empty()) {
                parts.push(Part::Text {
                    text: reasoning.to_string(),
                    thought: true,
                });
            }
            if let Some(text) = message.content.as_deref().filter(|t| !t.is_empty()) {
                parts.push(Part::text(text));
            }
            for call in message.tool_calls.iter().flatten() {
                parts.push(Part::function_call(
                    call.function.name.clone(),
                    parse_arguments(&call.function.arguments),
                ));
            }
        }

        let has_call = parts.iter().any(|p| matches!(p, Part::FunctionCall { .. }));
        let finish = FinishKind::resolve(
            choice
                .and_then(|c| c.finish_reason.as_deref())
                .map(FinishKind::from_openai),
            has_call,
        );

        let usage_metadata = resp.usage.as_ref().map(|u| {
            let counts = TokenUsage {
                input: u.prompt_tokens,
                output: u.completion_tokens,
                reported_total: u.total_tokens,
            };
            UsageMetadata {
                prompt_token_count: counts.input,
                candidates_token_count: counts.output,
                total_token_count: Some(counts.total()),
            }
        });

        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content::model(parts)),
                finish_reason: Some(finish.gemini().to_string()),
                index: 0,
            }],
            usage_metadata,
            model_version: Some(caller_model.to_string()),
            response_id: (!resp.id.is_empty()).then(|| resp.id.clone()),
        }
    }

    fn convert_stream_event(chunk: &ChatCompletionChunk, state: &mut StreamState) -> Option<String> {
        if let Some(usage) = &chunk.usage {
            state.set_usage(TokenUsage {
                input: usage.prompt_tokens,
                output: usage.completion_tokens,
                reported_total: usage.total_tokens,
            });
        }

        // Same ordering as for messages callers: the usage-only chunk comes
        // after the finish, and the final chunk here carries both.
        if let Some(kind) = state.pending_finish() {
            return chunk
                .usage
                .as_ref()
                .and_then(|_| state.gemini_finish(Some(kind)));
        }

        let choice = chunk.choices.first()?;
        let mut out = String::new();

        if let Some(reasoning) = choice.delta.reasoning_content.as_deref() {
            out.extend(state.gemini_text(reasoning, true));
        }
        if let Some(text) = choice.delta.content.as_deref() {
            out.extend(state.gemini_text(text, false));
        }
        for tc in choice.delta.tool_calls.iter().flatten() {
            let function = tc.function.as_ref();
            state.gemini_call_fragment(
                tc.index as usize,
                function.and_then(|f| f.name.as_deref()),
                function.and_then(|f| f.arguments.as_deref()).unwrap_or_default(),
            );
        }

        if let Some(reason) = choice.finish_reason.as_deref() {
            let kind = FinishKind::from_openai(reason);
            if chunk.usage.is_some() {
                out.extend(state.gemini_finish(Some(kind)));
            } else {
                state.defer_finish(kind);
            }
        }

        (!out.is_empty()).then_some(out)
    }
}

fn translate_user_turn(content: &Content, ids: &mut ToolCallIds, messages: &mut Vec<ChatMessage>) {
    let mut parts = Vec::new();

    for part in &content.parts {
        match part {
            Part::Text { text, .. } => parts.push(ContentPart::Text { text: text.clone() }),
            Part::InlineData { inline_data } => parts.push(ContentPart::ImageUrl {
                image_url: ImageUrlDetail {
                    url: data_uri(&inline_data.mime_type, &inline_data.data),
                    detail: None,
                },
            }),
            Part::FunctionResponse { function_response } => {
                messages.push(ChatMessage::tool(
                    ids.result(&function_response.name),
                    response_text(&function_response.response),
                ));
            }
            Part::FunctionCall { .. } | Part::Other(_) => {}
        }
    }

    if !parts.is_empty() {
        messages.push(ChatMessage::user(ChatContent::from_parts(parts)));
    }
}

fn translate_model_turn(content: &Content, ids: &mut ToolCallIds, messages: &mut Vec<ChatMessage>) {
    let mut text = String::new();
    let mut calls = Vec::new();

    for part in &content.parts {
        match part {
            Part::Text { text: t, thought: false } => text.push_str(t),
            Part::FunctionCall { function_call } => calls.push(ChatToolCall::new(
                ids.call(&function_call.name),
                function_call.name.clone(),
                serde_json::to_string(&function_call.args).unwrap_or_default(),
            )),
            _ => {}
        }
    }

    if !text.is_empty() || !calls.is_empty() {
        messages.push(ChatMessage::assistant((!text.is_empty()).then_some(text), calls));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::openai_types::ChatRole;
    use serde_json::{json, Value};

    fn request(value: Value) -> GenerateContentRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_request_pairs_results_with_synthesized_ids() {
        let req = request(json!({
            "systemInstruction": {"parts": [{"text": "Be terse."}]},
            "contents": [
                {"role": "user", "parts": [{"text": "Weather in Oslo and Bergen?"}]},
                {"role": "model", "parts": [
                    {"functionCall": {"name": "get_weather", "args": {"city": "Oslo"}}},
                    {"functionCall": {"name": "get_weather", "args": {"city": "Bergen"}}}
                ]},
                {"role": "user", "parts": [
                    {"functionResponse": {"name": "get_weather", "response": {"result": "rain"}}},
                    {"functionResponse": {"name": "get_weather", "response": {"temp": 3}}}
                ]}
            ],
            "generationConfig": {"maxOutputTokens": 256, "topK": 5, "stopSequences": ["END"]},
            "toolConfig": {"functionCallingConfig": {"mode": "ANY", "allowedFunctionNames": ["get_weather"]}}
        }));

        let (out, model) = GeminiToOpenAi::convert_request(&req, "gpt-4o");
        assert_eq!(model, "gpt-4o");
        assert_eq!(out.max_tokens, Some(256));
        assert_eq!(out.messages[0].role, ChatRole::System);
        assert_eq!(out.messages[0].text(), "Be terse.");

        let calls = out.messages[2].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_get_weather_0");
        assert_eq!(calls[1].id, "call_get_weather_1");
        assert_eq!(calls[0].function.arguments, r#"{"city":"Oslo"}"#);

        assert_eq!(out.messages[3].role, ChatRole::Tool);
        assert_eq!(out.messages[3].tool_call_id.as_deref(), Some("call_get_weather_0"));
        assert_eq!(out.messages[3].text(), "rain");
        assert_eq!(out.messages[4].tool_call_id.as_deref(), Some("call_get_weather_1"));
        assert_eq!(out.messages[4].text(), r#"{"temp":3}"#);

        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["stop"], json!(["END"]));
        assert!(value.get("tool_choice").is_none());
    }

    #[test]
    fn test_inline_image_becomes_data_uri() {
        let req = request(json!({
            "contents": [{"parts": [
                {"text": "What is this?"},
                {"inlineData": {"mimeType": "image/png", "data": "iVBOR"}}
            ]}]
        }));

        let (out, _) = GeminiToOpenAi::convert_request(&req, "gpt-4o");
        let value = serde_json::to_value(&out.messages[0]).unwrap();
        assert_eq!(value["role"], "user");
        assert_eq!(value["content"][1]["image_url"]["url"], "data:image/png;base64,iVBOR");
    }

    #[test]
    fn test_response_maps_calls_and_usage() {
        let resp: ChatCompletionResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o-2024",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_x", "type": "function",
                     "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}}
                ]},
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 11, "completion_tokens": 4, "total_tokens": 15}
        }))
        .unwrap();

        let out = GeminiToOpenAi::convert_response(&resp, "gemini-pro");
        let value = serde_json::to_value(&out).unwrap();
        let candidate = &value["candidates"][0];
        assert_eq!(candidate["finishReason"], "STOP");
        assert_eq!(candidate["content"]["role"], "model");
        assert_eq!(candidate["content"]["parts"][0]["functionCall"]["args"]["city"], "Oslo");
        assert_eq!(value["usageMetadata"]["totalTokenCount"], 15);
        assert_eq!(value["modelVersion"], "gemini-pro");
    }

    #[test]
    fn test_length_finish() {
        let resp: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": "cut"}, "finish_reason": "length"}]
        }))
        .unwrap();
        let out = GeminiToOpenAi::convert_response(&resp, "gemini-pro");
        assert_eq!(out.candidates[0].finish_reason.as_deref(), Some("MAX_TOKENS"));
    }

    #[test]
    fn test_stream_accumulates_call_until_finish() {
        let mut state = StreamState::with_id(Provider::Gemini, "r1", "gemini-pro", 1);
        let chunks: Vec<ChatCompletionChunk> = serde_json::from_value(json!([
            {"choices": [{"index": 0, "delta": {"role": "assistant", "content": "Checking"}}]},
            {"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_a", "type": "function",
                 "function": {"name": "get_weather", "arguments": "{\"ci"}}
            ]}}]},
            {"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "ty\":\"Oslo\"}"}}
            ]}}]},
            {"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]},
            {"choices": [], "usage": {"prompt_tokens": 9, "completion_tokens": 6, "total_tokens": 15}}
        ]))
        .unwrap();

        let frames: Vec<String> = chunks
            .iter()
            .filter_map(|c| GeminiToOpenAi::convert_stream_event(c, &mut state))
            .collect();

        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("\"text\":\"Checking\""));

        let last: Value =
            serde_json::from_str(frames[1].trim().strip_prefix("data: ").unwrap()).unwrap();
        let candidate = &last["candidates"][0];
        assert_eq!(candidate["content"]["parts"][0]["functionCall"]["name"], "get_weather");
        assert_eq!(candidate["content"]["parts"][0]["functionCall"]["args"]["city"], "Oslo");
        assert_eq!(candidate["finishReason"], "STOP");
        assert_eq!(last["usageMetadata"]["promptTokenCount"], 9);
        assert!(state.finish_sent());
    }
}
