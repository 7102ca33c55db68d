//! Pieces shared by all three protocols: the tool parameter schema, the
//! finish-reason table, token accounting, and a few content helpers.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Output cap used when the caller's protocol has no required cap but the
/// provider's protocol does.
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

// ---------------------------------------------------------------------------
// Tool parameter schema
// ---------------------------------------------------------------------------

/// JSON-Schema-like parameter spec. Every protocol wraps tools differently but
/// carries this same `{type, properties, required}` triple inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(rename = "type", default = "default_schema_type")]
    pub schema_type: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    /// Any other keywords (`description`, `additionalProperties`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_schema_type() -> String {
    "object".to_string()
}

impl Default for ToolSchema {
    fn default() -> Self {
        Self {
            schema_type: default_schema_type(),
            properties: Map::new(),
            required: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// Keywords the generate-content API rejects inside function parameters.
const GEMINI_UNSUPPORTED_KEYWORDS: &[&str] = &[
    "$schema",
    "$id",
    "$ref",
    "$defs",
    "definitions",
    "additionalProperties",
    "default",
    "examples",
    "const",
    "patternProperties",
    "unevaluatedProperties",
    "propertyNames",
    "exclusiveMinimum",
    "exclusiveMaximum",
];

impl ToolSchema {
    /// Copy of this schema suitable for a function declaration. Returns `None`
    /// for an object schema without properties, which that API refuses.
    pub fn for_gemini(&self) -> Option<ToolSchema> {
        if self.schema_type == "object" && self.properties.is_empty() {
            return None;
        }

        let properties = self
            .properties
            .iter()
            .map(|(name, schema)| (name.clone(), sanitize_schema(schema)))
            .collect();

        let extra = self
            .extra
            .iter()
            .filter(|(key, _)| !GEMINI_UNSUPPORTED_KEYWORDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), sanitize_keyword(key, value)))
            .collect();

        Some(ToolSchema {
            schema_type: self.schema_type.clone(),
            properties,
            required: self.required.clone(),
            extra,
        })
    }
}

fn sanitize_schema(schema: &Value) -> Value {
    let Value::Object(obj) = schema else {
        return schema.clone();
    };

    let mut out = Map::new();
    for (key, value) in obj {
        if GEMINI_UNSUPPORTED_KEYWORDS.contains(&key.as_str()) {
            continue;
        }
        out.insert(key.clone(), sanitize_keyword(key, value));
    }
    Value::Object(out)
}

/// `properties` maps names to schemas, so the names themselves must survive
/// even when they collide with a stripped keyword.
fn sanitize_keyword(key: &str, value: &Value) -> Value {
    match (key, value) {
        ("properties", Value::Object(props)) => Value::Object(
            props
                .iter()
                .map(|(name, schema)| (name.clone(), sanitize_schema(schema)))
                .collect(),
        ),
        (_, Value::Array(items)) => Value::Array(items.iter().map(sanitize_schema).collect()),
        (_, Value::Object(_)) => sanitize_schema(value),
        _ => value.clone(),
    }
}

// ---------------------------------------------------------------------------
// Finish reasons
// ---------------------------------------------------------------------------

/// Protocol-neutral reason generation ended. Each ordered pair of protocols
/// maps through this: parse with the source's `from_*`, render with the
/// target's method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishKind {
    Stop,
    Length,
    ToolUse,
    ContentFilter,
}

impl FinishKind {
    pub fn from_openai(reason: &str) -> Self {
        match reason {
            "length" => Self::Length,
            "tool_calls" | "function_call" => Self::ToolUse,
            "content_filter" => Self::ContentFilter,
            _ => Self::Stop,
        }
    }

    pub fn from_anthropic(reason: &str) -> Self {
        match reason {
            "max_tokens" => Self::Length,
            "tool_use" => Self::ToolUse,
            "refusal" => Self::ContentFilter,
            _ => Self::Stop,
        }
    }

    pub fn from_gemini(reason: &str) -> Self {
        match reason {
            "MAX_TOKENS" => Self::Length,
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII"
            | "IMAGE_SAFETY" => Self::ContentFilter,
            _ => Self::Stop,
        }
    }

    pub fn openai(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolUse => "tool_calls",
            Self::ContentFilter => "content_filter",
        }
    }

    pub fn anthropic(self) -> &'static str {
        match self {
            Self::Stop | Self::ContentFilter => "end_turn",
            Self::Length => "max_tokens",
            Self::ToolUse => "tool_use",
        }
    }

    /// The generate-content protocol has no tool-calling finish reason.
    pub fn gemini(self) -> &'static str {
        match self {
            Self::Stop | Self::ToolUse => "STOP",
            Self::Length => "MAX_TOKENS",
            Self::ContentFilter => "SAFETY",
        }
    }

    /// A tool invocation in the content always wins over the reported reason.
    pub fn resolve(reported: Option<FinishKind>, has_tool_call: bool) -> FinishKind {
        if has_tool_call {
            FinishKind::ToolUse
        } else {
            reported.unwrap_or(FinishKind::Stop)
        }
    }
}

// ---------------------------------------------------------------------------
// Token usage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    /// Only set when the source protocol reported one.
    pub reported_total: Option<u64>,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            reported_total: None,
        }
    }

    pub fn total(&self) -> u64 {
        self.reported_total.unwrap_or(self.input + self.output)
    }
}

// ---------------------------------------------------------------------------
// Content helpers
// ---------------------------------------------------------------------------

/// Split a `data:<mime>;base64,<payload>` URI.
pub fn parse_data_uri(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (mime, data) = rest.split_once(";base64,")?;
    Some((mime, data))
}

pub fn data_uri(mime: &str, data: &str) -> String {
    format!("data:{mime};base64,{data}")
}

/// Parse a JSON-string tool argument list into an object. Anything that is
/// not a JSON object becomes an empty object.
pub fn parse_arguments(arguments: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(arguments) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Tool output text as a function-response object: JSON objects are used as
/// is, anything else is wrapped under `result` (or `error`).
pub fn response_object(text: &str, is_error: bool) -> Map<String, Value> {
    if !is_error {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
            return map;
        }
    }

    let key = if is_error { "error" } else { "result" };
    let mut map = Map::new();
    map.insert(key.to_string(), Value::String(text.to_string()));
    map
}

/// Inverse of [`response_object`]: a lone string `result` unwraps to its
/// text, anything else renders as compact JSON.
pub fn response_text(response: &Map<String, Value>) -> String {
    if response.len() == 1 {
        if let Some(Value::String(text)) = response.get("result") {
            return text.clone();
        }
    }
    serde_json::to_string(response).unwrap_or_default()
}

/// Synthesizes tool-call ids for a protocol that carries none.
///
/// Calls get `<prefix>_<name>_<n>` where `n` counts calls of that name within
/// one conversion. Results are matched to the oldest unanswered call with the
/// same name, so parallel calls to one function pair up in order.
#[derive(Debug)]
pub struct ToolCallIds {
    prefix: &'static str,
    issued: HashMap<String, usize>,
    pending: HashMap<String, VecDeque<String>>,
}

impl ToolCallIds {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            issued: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn call(&mut self, name: &str) -> String {
        let n = self.issued.entry(name.to_string()).or_insert(0);
        let id = format!("{}_{}_{}", self.prefix, id_safe(name), n);
        *n += 1;
        self.pending
            .entry(name.to_string())
            .or_default()
            .push_back(id.clone());
        id
    }

    pub fn result(&mut self, name: &str) -> String {
        self.pending
            .get_mut(name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| format!("{}_{}_0", self.prefix, id_safe(name)))
    }
}

fn id_safe(name: &str) -> String {
    if name.is_empty() {
        return "fn".to_string();
    }
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Serialize `value` as one `data:` frame.
pub fn data_frame<T: Serialize>(value: &T) -> Option<String> {
    serde_json::to_string(value)
        .ok()
        .map(|json| format!("data: {json}\n\n"))
}

/// Serialize `value` as one frame with a named `event:` line.
pub fn event_frame<T: Serialize>(event: &str, value: &T) -> Option<String> {
    serde_json::to_string(value)
        .ok()
        .map(|json| format!("event: {event}\ndata: {json}\n\n"))
}
