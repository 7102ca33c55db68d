//! Stream reassembly: provider bytes in, caller-protocol frames out.
//!
//! Network reads split frames at arbitrary byte offsets. [`FrameSplitter`]
//! buffers raw bytes and only hands out complete units, so a multi-byte
//! character or a JSON object cut in half is never decoded early.
//! [`StreamReassembler`] drives a [`Converter`] over those units and owns the
//! lifecycle `Idle -> Streaming -> Closing -> Done`, including the closing
//! frames each caller protocol expects exactly once.

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use super::anthropic_types::{
    Delta, DeltaUsage, MessageDeltaBody, MessagesResponse, ResponseContentBlock, StreamEvent, Usage,
};
use super::common::{parse_arguments, FinishKind, TokenUsage, ToolCallIds};
use super::gemini_types::{Candidate, Content, GenerateContentResponse, Part, UsageMetadata};
use super::openai_types::{ChatCompletionChunk, ChatUsage, ChunkDelta, ChunkToolCall};
use super::Converter;
use crate::providers::Provider;

const DONE_FRAME: &str = "data: [DONE]\n\n";

// ---------------------------------------------------------------------------
// Per-stream state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

#[derive(Debug, Clone, Copy)]
struct OpenBlock {
    index: usize,
    kind: BlockKind,
}

#[derive(Debug)]
struct PendingCall {
    name: String,
    arguments: String,
}

impl PendingCall {
    fn into_part(self) -> Part {
        Part::function_call(self.name, parse_arguments(&self.arguments))
    }
}

/// Everything one translated stream needs to remember between events.
///
/// The message id and creation time are fixed at construction so every frame
/// of one stream agrees on them.
#[derive(Debug)]
pub struct StreamState {
    message_id: String,
    model: String,
    created: u64,
    started: bool,
    open_block: Option<OpenBlock>,
    next_block: usize,
    finish_sent: bool,
    pending_finish: Option<FinishKind>,
    done_sent: bool,
    tool_calls: usize,
    /// Upstream tool key (block or call index) -> index in the caller's stream.
    tool_slots: HashMap<usize, usize>,
    pending_calls: BTreeMap<usize, PendingCall>,
    ids: ToolCallIds,
    usage: TokenUsage,
}

impl StreamState {
    /// `model` is the name the caller asked for; it is echoed in every frame.
    pub fn new(caller: Provider, model: impl Into<String>) -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let message_id = match caller {
            Provider::OpenAi => format!("chatcmpl-{uuid}"),
            Provider::Anthropic => format!("msg_{uuid}"),
            Provider::Gemini => uuid,
        };
        let created = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
        Self::with_id(caller, message_id, model, created)
    }

    pub fn with_id(
        caller: Provider,
        message_id: impl Into<String>,
        model: impl Into<String>,
        created: u64,
    ) -> Self {
        let prefix = match caller {
            Provider::Anthropic => "toolu",
            Provider::OpenAi | Provider::Gemini => "call",
        };
        Self {
            message_id: message_id.into(),
            model: model.into(),
            created,
            started: false,
            open_block: None,
            next_block: 0,
            finish_sent: false,
            pending_finish: None,
            done_sent: false,
            tool_calls: 0,
            tool_slots: HashMap::new(),
            pending_calls: BTreeMap::new(),
            ids: ToolCallIds::new(prefix),
            usage: TokenUsage::default(),
        }
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn finish_sent(&self) -> bool {
        self.finish_sent
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub(crate) fn set_input_tokens(&mut self, tokens: u64) {
        self.usage.input = tokens;
    }

    pub(crate) fn set_output_tokens(&mut self, tokens: u64) {
        self.usage.output = tokens;
    }

    pub(crate) fn set_usage(&mut self, usage: TokenUsage) {
        self.usage = usage;
    }

    pub(crate) fn has_tool_calls(&self) -> bool {
        self.tool_calls > 0
    }

    pub(crate) fn synth_call_id(&mut self, name: &str) -> String {
        self.ids.call(name)
    }

    pub(crate) fn defer_finish(&mut self, kind: FinishKind) {
        self.pending_finish = Some(kind);
    }

    pub(crate) fn pending_finish(&self) -> Option<FinishKind> {
        self.pending_finish
    }

    pub(crate) fn tool_call_count(&self) -> usize {
        self.tool_calls
    }

    pub(crate) fn knows_tool(&self, key: usize) -> bool {
        self.tool_slots.contains_key(&key)
    }

    fn tool_index(&mut self, key: usize) -> usize {
        if let Some(index) = self.tool_slots.get(&key) {
            return *index;
        }
        let index = self.tool_calls;
        self.tool_calls += 1;
        self.tool_slots.insert(key, index);
        index
    }

    // -- chat-completions callers -------------------------------------------

    fn openai_chunk(&self, delta: ChunkDelta, finish: Option<FinishKind>) -> ChatCompletionChunk {
        ChatCompletionChunk::new(
            self.message_id.clone(),
            self.model.clone(),
            self.created,
            delta,
            finish.map(|f| f.openai().to_string()),
        )
    }

    /// The first delta of a stream also carries the assistant role.
    pub(crate) fn openai_delta(&mut self, mut delta: ChunkDelta) -> Option<String> {
        if !self.started {
            delta.role = Some("assistant".to_string());
            self.started = true;
        }
        self.openai_chunk(delta, None).frame()
    }

    pub(crate) fn openai_text(&mut self, text: &str) -> Option<String> {
        if text.is_empty() {
            return None;
        }
        self.openai_delta(ChunkDelta {
            content: Some(text.to_string()),
            ..Default::default()
        })
    }

    pub(crate) fn openai_reasoning(&mut self, text: &str) -> Option<String> {
        if text.is_empty() {
            return None;
        }
        self.openai_delta(ChunkDelta {
            reasoning_content: Some(text.to_string()),
            ..Default::default()
        })
    }

    pub(crate) fn openai_tool_start(
        &mut self,
        key: usize,
        id: &str,
        name: &str,
        arguments: String,
    ) -> Option<String> {
        let index = self.tool_index(key) as u64;
        self.openai_delta(ChunkDelta {
            tool_calls: Some(vec![ChunkToolCall::start(index, id, name, arguments)]),
            ..Default::default()
        })
    }

    pub(crate) fn openai_tool_arguments(&mut self, key: usize, fragment: &str) -> Option<String> {
        let index = *self.tool_slots.get(&key)? as u64;
        if fragment.is_empty() {
            return None;
        }
        self.openai_delta(ChunkDelta {
            tool_calls: Some(vec![ChunkToolCall::arguments(index, fragment)]),
            ..Default::default()
        })
    }

    pub(crate) fn openai_finish(&mut self, reported: Option<FinishKind>) -> Option<String> {
        if self.finish_sent {
            return None;
        }
        self.finish_sent = true;
        let kind = FinishKind::resolve(reported, self.has_tool_calls());
        let mut chunk = self.openai_chunk(ChunkDelta::default(), Some(kind));
        chunk.usage = Some(ChatUsage::new(self.usage.input, self.usage.output));
        chunk.frame()
    }

    fn openai_close(&mut self) -> Vec<String> {
        let mut frames: Vec<String> = self.openai_finish(None).into_iter().collect();
        if !self.done_sent {
            self.done_sent = true;
            frames.push(DONE_FRAME.to_string());
        }
        frames
    }

    // -- messages callers ---------------------------------------------------

    fn anthropic_start(&mut self, out: &mut String) {
        if self.started {
            return;
        }
        self.started = true;
        let message = MessagesResponse::new(
            self.message_id.clone(),
            self.model.clone(),
            Vec::new(),
            None,
            Usage::new(self.usage.input, 0),
        );
        push_event(out, &StreamEvent::MessageStart { message });
    }

    fn anthropic_open(
        &mut self,
        kind: BlockKind,
        content_block: ResponseContentBlock,
        out: &mut String,
    ) -> usize {
        self.anthropic_start(out);
        self.anthropic_close_block(out);
        let index = self.next_block;
        self.next_block += 1;
        self.open_block = Some(OpenBlock { index, kind });
        push_event(
            out,
            &StreamEvent::ContentBlockStart {
                index,
                content_block,
            },
        );
        index
    }

    fn open_index(&self, kind: BlockKind) -> Option<usize> {
        self.open_block
            .filter(|block| block.kind == kind)
            .map(|block| block.index)
    }

    pub(crate) fn anthropic_close_block(&mut self, out: &mut String) {
        if let Some(block) = self.open_block.take() {
            push_event(out, &StreamEvent::ContentBlockStop { index: block.index });
        }
    }

    pub(crate) fn anthropic_text(&mut self, text: &str) -> Option<String> {
        if text.is_empty() {
            return None;
        }
        let mut out = String::new();
        let index = match self.open_index(BlockKind::Text) {
            Some(index) => index,
            None => self.anthropic_open(
                BlockKind::Text,
                ResponseContentBlock::Text {
                    text: String::new(),
                },
                &mut out,
            ),
        };
        push_event(
            &mut out,
            &StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::TextDelta {
                    text: text.to_string(),
                },
            },
        );
        Some(out)
    }

    pub(crate) fn anthropic_thinking(&mut self, text: &str) -> Option<String> {
        if text.is_empty() {
            return None;
        }
        let mut out = String::new();
        let index = match self.open_index(BlockKind::Thinking) {
            Some(index) => index,
            None => self.anthropic_open(
                BlockKind::Thinking,
                ResponseContentBlock::Thinking {
                    thinking: String::new(),
                    signature: None,
                },
                &mut out,
            ),
        };
        push_event(
            &mut out,
            &StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::ThinkingDelta {
                    thinking: text.to_string(),
                },
            },
        );
        Some(out)
    }

    /// Opens a `tool_use` block for upstream call `key`, closing whatever
    /// block was open before it.
    pub(crate) fn anthropic_tool_start(&mut self, key: usize, id: &str, name: &str) -> String {
        let mut out = String::new();
        let index = self.anthropic_open(
            BlockKind::ToolUse,
            ResponseContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: json!({}),
            },
            &mut out,
        );
        self.tool_slots.insert(key, index);
        self.tool_calls += 1;
        out
    }

    pub(crate) fn anthropic_tool_input(&mut self, key: usize, partial_json: &str) -> Option<String> {
        let index = *self.tool_slots.get(&key)?;
        if partial_json.is_empty() {
            return None;
        }
        StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::InputJsonDelta {
                partial_json: partial_json.to_string(),
            },
        }
        .frame()
    }

    /// Finish reported by the provider: `message_delta` + `message_stop`.
    /// An open tool block is stopped first so its input is complete; an open
    /// text block is left as is.
    pub(crate) fn anthropic_finish(&mut self, reported: Option<FinishKind>) -> Option<String> {
        if self.finish_sent {
            return None;
        }
        self.finish_sent = true;
        self.pending_finish = None;

        let mut out = String::new();
        self.anthropic_start(&mut out);
        if self.open_index(BlockKind::ToolUse).is_some() {
            self.anthropic_close_block(&mut out);
        }
        self.anthropic_message_end(FinishKind::resolve(reported, self.has_tool_calls()), &mut out);
        Some(out)
    }

    fn anthropic_message_end(&self, kind: FinishKind, out: &mut String) {
        push_event(
            out,
            &StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some(kind.anthropic().to_string()),
                    stop_sequence: None,
                },
                usage: DeltaUsage {
                    output_tokens: self.usage.output,
                    input_tokens: (self.usage.input > 0).then_some(self.usage.input),
                },
            },
        );
        push_event(out, &StreamEvent::MessageStop);
    }

    fn anthropic_close(&mut self) -> Vec<String> {
        if self.finish_sent {
            return Vec::new();
        }
        if let Some(kind) = self.pending_finish {
            return self.anthropic_finish(Some(kind)).into_iter().collect();
        }

        self.finish_sent = true;
        let mut out = String::new();
        self.anthropic_start(&mut out);
        self.anthropic_close_block(&mut out);
        self.anthropic_message_end(FinishKind::resolve(None, self.has_tool_calls()), &mut out);
        vec![out]
    }

    // -- generate-content callers -------------------------------------------

    fn gemini_chunk(&self, parts: Vec<Part>, finish: Option<FinishKind>) -> Option<String> {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content::model(parts)),
                finish_reason: finish.map(|f| f.gemini().to_string()),
                index: 0,
            }],
            usage_metadata: finish
                .map(|_| UsageMetadata::new(self.usage.input, self.usage.output)),
            model_version: Some(self.model.clone()),
            response_id: Some(self.message_id.clone()),
        }
        .frame()
    }

    pub(crate) fn gemini_text(&mut self, text: &str, thought: bool) -> Option<String> {
        if text.is_empty() {
            return None;
        }
        self.started = true;
        self.gemini_chunk(
            vec![Part::Text {
                text: text.to_string(),
                thought,
            }],
            None,
        )
    }

    /// Function calls go out whole, so argument fragments are held here until
    /// the call is complete.
    pub(crate) fn gemini_call_fragment(&mut self, key: usize, name: Option<&str>, fragment: &str) {
        if !self.pending_calls.contains_key(&key) {
            self.tool_calls += 1;
        }
        let call = self.pending_calls.entry(key).or_insert_with(|| PendingCall {
            name: String::new(),
            arguments: String::new(),
        });
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            call.name = name.to_string();
        }
        call.arguments.push_str(fragment);
    }

    pub(crate) fn gemini_flush_call(&mut self, key: usize) -> Option<String> {
        let call = self.pending_calls.remove(&key)?;
        self.started = true;
        self.gemini_chunk(vec![call.into_part()], None)
    }

    /// Final chunk: any calls still pending, the finish reason and usage.
    pub(crate) fn gemini_finish(&mut self, reported: Option<FinishKind>) -> Option<String> {
        if self.finish_sent {
            return None;
        }
        self.finish_sent = true;
        let parts = std::mem::take(&mut self.pending_calls)
            .into_values()
            .map(PendingCall::into_part)
            .collect();
        let kind = FinishKind::resolve(reported, self.has_tool_calls());
        self.gemini_chunk(parts, Some(kind))
    }
}

fn push_event(out: &mut String, event: &StreamEvent) {
    if let Some(frame) = event.frame() {
        out.push_str(&frame);
    }
}

/// Frames that end a stream for `caller`, emitted at most once: a finish
/// signal if none went out yet, plus the `[DONE]` terminator for
/// chat-completions callers.
pub fn closing_frames(caller: Provider, state: &mut StreamState) -> Vec<String> {
    match caller {
        Provider::OpenAi => state.openai_close(),
        Provider::Anthropic => state.anthropic_close(),
        Provider::Gemini => {
            let pending = state.pending_finish();
            state.gemini_finish(pending).into_iter().collect()
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// How a provider delimits stream units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// SSE events separated by a blank line.
    BlankLine,
    /// One unit per line: `data:` lines or bare JSON objects.
    Line,
}

impl Framing {
    pub fn for_provider(provider: Provider) -> Self {
        match provider {
            Provider::OpenAi | Provider::Anthropic => Framing::BlankLine,
            Provider::Gemini => Framing::Line,
        }
    }

    fn delimiter(self) -> &'static [u8] {
        match self {
            Framing::BlankLine => b"\n\n",
            Framing::Line => b"\n",
        }
    }
}

/// One complete, decoded stream unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    Data(String),
    Done,
}

/// Largest unit the splitter will buffer. Anything longer is dropped whole.
pub const MAX_UNIT_BYTES: usize = 16 * 1024 * 1024;

/// Byte buffer that yields only complete units. Carriage returns are dropped
/// on the way in, so CRLF and LF streams frame identically.
#[derive(Debug)]
pub struct FrameSplitter {
    framing: Framing,
    buffer: Vec<u8>,
    /// Bytes before this offset hold no delimiter start.
    scanned: usize,
    max_unit: usize,
    /// Inside an oversized unit; skip up to the next delimiter.
    discarding: bool,
}

impl FrameSplitter {
    pub fn new(framing: Framing) -> Self {
        Self::with_limit(framing, MAX_UNIT_BYTES)
    }

    pub fn with_limit(framing: Framing, max_unit: usize) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
            scanned: 0,
            max_unit,
            discarding: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Unit> {
        self.buffer
            .extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let delimiter = self.framing.delimiter();
        let mut units = Vec::new();
        let mut consumed = 0;
        while let Some(pos) = find(&self.buffer[self.scanned..], delimiter).map(|p| p + self.scanned) {
            // The tail of a unit that already overflowed was reported then.
            let tail = std::mem::take(&mut self.discarding);
            let unit = &self.buffer[consumed..pos];
            if unit.len() > self.max_unit && !tail {
                warn!(limit = self.max_unit, "dropping oversized stream unit");
            } else if !tail {
                units.extend(self.decode(unit));
            }
            consumed = pos + delimiter.len();
            self.scanned = consumed;
        }
        self.buffer.drain(..consumed);
        // A delimiter may straddle this push and the next.
        self.scanned = self.buffer.len().saturating_sub(delimiter.len() - 1);

        if self.buffer.len() >= self.max_unit + delimiter.len() {
            warn!(limit = self.max_unit, "dropping oversized stream unit");
            let cut = self.buffer.len() - (delimiter.len() - 1);
            self.buffer.drain(..cut);
            self.scanned = 0;
            self.discarding = true;
        }
        units
    }

    /// End of input: whatever is buffered counts as a final unit.
    pub fn flush(&mut self) -> Vec<Unit> {
        let raw = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) || raw.len() > self.max_unit {
            return Vec::new();
        }
        self.decode(&raw).into_iter().collect()
    }

    fn decode(&self, raw: &[u8]) -> Option<Unit> {
        let text = String::from_utf8_lossy(raw);
        let payload = match self.framing {
            Framing::BlankLine => {
                let lines: Vec<&str> = text
                    .lines()
                    .filter_map(|line| line.strip_prefix("data:"))
                    .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
                    .collect();
                if lines.is_empty() {
                    return None;
                }
                lines.join("\n")
            }
            Framing::Line => {
                let line = text.trim();
                if let Some(rest) = line.strip_prefix("data:") {
                    rest.to_string()
                } else if line.starts_with('{') {
                    line.to_string()
                } else {
                    return None;
                }
            }
        };

        let payload = payload.trim();
        match payload {
            "" => None,
            "[DONE]" => Some(Unit::Done),
            _ => Some(Unit::Data(payload.to_string())),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// ---------------------------------------------------------------------------
// Reassembler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Streaming,
    Closing,
    Done,
}

/// Turns the provider's byte stream into frames of the caller's protocol
/// using converter `C`.
///
/// Output depends only on the concatenated input bytes, never on how they
/// were split across [`feed`](Self::feed) calls.
pub struct StreamReassembler<C: Converter> {
    splitter: FrameSplitter,
    state: StreamState,
    phase: StreamPhase,
    _converter: PhantomData<fn() -> C>,
}

impl<C: Converter> StreamReassembler<C> {
    pub fn new(state: StreamState) -> Self {
        Self {
            splitter: FrameSplitter::new(Framing::for_provider(C::UPSTREAM)),
            state,
            phase: StreamPhase::Idle,
            _converter: PhantomData,
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == StreamPhase::Done
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    /// Frames produced by the units this chunk completed, in order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        match self.phase {
            StreamPhase::Closing | StreamPhase::Done => return Vec::new(),
            StreamPhase::Idle => self.phase = StreamPhase::Streaming,
            StreamPhase::Streaming => {}
        }
        let units = self.splitter.push(bytes);
        self.process(units)
    }

    /// Upstream ended cleanly: decode any trailing unit, then close.
    pub fn finish(&mut self) -> Vec<String> {
        if self.is_done() {
            return Vec::new();
        }
        let units = self.splitter.flush();
        let mut frames = self.process(units);
        if !self.is_done() {
            frames.extend(self.close());
        }
        frames
    }

    /// Upstream failed mid-stream. Nothing more is emitted.
    pub fn abort(&mut self) {
        self.phase = StreamPhase::Done;
    }

    fn process(&mut self, units: Vec<Unit>) -> Vec<String> {
        let mut frames = Vec::new();
        for unit in units {
            let payload = match unit {
                Unit::Done => {
                    frames.extend(self.close());
                    break;
                }
                Unit::Data(payload) => payload,
            };

            let event = match serde_json::from_str::<C::UpstreamEvent>(&payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, provider = %C::UPSTREAM, "skipping undecodable stream unit");
                    continue;
                }
            };

            if !self.state.finish_sent {
                if let Some(frame) = C::convert_stream_event(&event, &mut self.state) {
                    frames.push(frame);
                }
            }

            if C::is_terminal(&event) {
                frames.extend(self.close());
                break;
            }
        }
        frames
    }

    fn close(&mut self) -> Vec<String> {
        self.phase = StreamPhase::Closing;
        let frames = closing_frames(C::INBOUND, &mut self.state);
        self.phase = StreamPhase::Done;
        debug!(
            caller = %C::INBOUND,
            input_tokens = self.state.usage.input,
            output_tokens = self.state.usage.output,
            "stream closed"
        );
        frames
    }
}

// ---------------------------------------------------------------------------
// Usage observation for identity relays
// ---------------------------------------------------------------------------

/// Overwrite the fields of `usage` that `value` reports, using `protocol`'s
/// field names. Works on whole responses and on single stream events.
pub fn observe_usage(protocol: Provider, value: &Value, usage: &mut TokenUsage) {
    fn set(target: &mut u64, source: &Value, key: &str) {
        if let Some(n) = source.get(key).and_then(Value::as_u64) {
            *target = n;
        }
    }

    match protocol {
        Provider::OpenAi => {
            if let Some(u) = value.get("usage").filter(|u| u.is_object()) {
                set(&mut usage.input, u, "prompt_tokens");
                set(&mut usage.output, u, "completion_tokens");
                if let Some(total) = u.get("total_tokens").and_then(Value::as_u64) {
                    usage.reported_total = Some(total);
                }
            }
        }
        Provider::Anthropic => {
            let u = value
                .get("usage")
                .or_else(|| value.get("message").and_then(|m| m.get("usage")));
            if let Some(u) = u.filter(|u| u.is_object()) {
                set(&mut usage.input, u, "input_tokens");
                set(&mut usage.output, u, "output_tokens");
            }
        }
        Provider::Gemini => {
            if let Some(u) = value.get("usageMetadata").filter(|u| u.is_object()) {
                set(&mut usage.input, u, "promptTokenCount");
                set(&mut usage.output, u, "candidatesTokenCount");
                if let Some(total) = u.get("totalTokenCount").and_then(Value::as_u64) {
                    usage.reported_total = Some(total);
                }
            }
        }
    }
}

/// Watches a stream that is relayed untouched and picks up token counts.
#[derive(Debug)]
pub struct UsageTap {
    protocol: Provider,
    splitter: FrameSplitter,
    usage: TokenUsage,
}

impl UsageTap {
    pub fn new(protocol: Provider) -> Self {
        Self {
            protocol,
            splitter: FrameSplitter::new(Framing::for_provider(protocol)),
            usage: TokenUsage::default(),
        }
    }

    pub fn observe(&mut self, bytes: &[u8]) {
        let units = self.splitter.push(bytes);
        self.absorb(units);
    }

    pub fn finish(&mut self) {
        let units = self.splitter.flush();
        self.absorb(units);
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    fn absorb(&mut self, units: Vec<Unit>) {
        for unit in units {
            if let Unit::Data(payload) = unit {
                if let Ok(value) = serde_json::from_str::<Value>(&payload) {
                    observe_usage(self.protocol, &value, &mut self.usage);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Async adapters
// ---------------------------------------------------------------------------

/// Translate an upstream byte stream with converter `C`.
///
/// Frames are yielded as soon as they are produced. `on_usage` sees the
/// running token counts after every upstream chunk. An upstream error or a
/// gap longer than `idle_timeout` ends the stream without closing frames.
pub fn reassemble<C, S, E, F>(
    upstream: S,
    state: StreamState,
    idle_timeout: Duration,
    mut on_usage: F,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static
where
    C: Converter,
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: FnMut(TokenUsage) + Send + 'static,
{
    async_stream::stream! {
        let mut reassembler = StreamReassembler::<C>::new(state);
        let upstream = upstream.timeout(idle_timeout);
        tokio::pin!(upstream);

        loop {
            let frames = match upstream.next().await {
                Some(Ok(Ok(chunk))) => reassembler.feed(&chunk),
                Some(Ok(Err(e))) => {
                    warn!(error = %e, provider = %C::UPSTREAM, "upstream stream failed");
                    reassembler.abort();
                    break;
                }
                Some(Err(_)) => {
                    warn!(
                        idle_secs = idle_timeout.as_secs(),
                        provider = %C::UPSTREAM,
                        "upstream stream went idle"
                    );
                    reassembler.abort();
                    break;
                }
                None => reassembler.finish(),
            };

            on_usage(reassembler.state().usage());
            for frame in frames {
                yield Ok(Bytes::from(frame));
            }
            if reassembler.is_done() {
                break;
            }
        }
    }
}

/// Relay an upstream byte stream verbatim while tapping its usage.
pub fn relay<S, E, F>(
    upstream: S,
    protocol: Provider,
    idle_timeout: Duration,
    mut on_usage: F,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: FnMut(TokenUsage) + Send + 'static,
{
    async_stream::stream! {
        let mut tap = UsageTap::new(protocol);
        let upstream = upstream.timeout(idle_timeout);
        tokio::pin!(upstream);

        loop {
            match upstream.next().await {
                Some(Ok(Ok(chunk))) => {
                    tap.observe(&chunk);
                    on_usage(tap.usage());
                    yield Ok(chunk);
                }
                Some(Ok(Err(e))) => {
                    warn!(error = %e, provider = %protocol, "upstream stream failed");
                    break;
                }
                Some(Err(_)) => {
                    warn!(idle_secs = idle_timeout.as_secs(), provider = %protocol, "upstream stream went idle");
                    break;
                }
                None => {
                    tap.finish();
                    on_usage(tap.usage());
                    break;
                }
            }
        }
    }
}
