//! Which provider serves a model.

use crate::providers::Provider;

const PREFIXES: &[(&str, Provider)] = &[
    ("gpt-", Provider::OpenAi),
    ("o1", Provider::OpenAi),
    ("o3", Provider::OpenAi),
    ("claude", Provider::Anthropic),
    ("gemini", Provider::Gemini),
];

/// Case-insensitive prefix match on the model name. Unknown models go to
/// `fallback`, which is the home provider of the entry point they came in on.
pub fn provider_for(model: &str, fallback: Provider) -> Provider {
    let model = model.to_ascii_lowercase();
    PREFIXES
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map_or(fallback, |(_, provider)| *provider)
}
