use crate::client::ProviderClient;
use crate::config::GatewayConfig;
use crate::dispatch::{Caller, DispatchOutcome, Dispatcher, InboundCall};
use crate::error::GatewayError;
use crate::providers::Provider;
use crate::routing::provider_for;
use crate::translate::anthropic_types::ErrorResponse;
use crate::translate::gemini_types::GeminiErrorResponse;
use crate::translate::openai_types::ChatErrorResponse;
use crate::usage::SharedUsageLog;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

pub struct AppState<P> {
    pub dispatcher: Dispatcher<P, SharedUsageLog>,
    pub usage: SharedUsageLog,
}

impl<P: ProviderClient> AppState<P> {
    pub fn new(config: GatewayConfig, client: P, usage: SharedUsageLog) -> Self {
        Self {
            dispatcher: Dispatcher::new(Arc::new(client), Arc::new(config), usage.clone()),
            usage,
        }
    }

    fn config(&self) -> &GatewayConfig {
        self.dispatcher.config()
    }
}

pub fn build_router<P: ProviderClient>(state: Arc<AppState<P>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions::<P>))
        .route("/v1/messages", post(handle_messages::<P>))
        .route("/v1beta/models/:model_action", post(handle_generate::<P>))
        .route("/v1/models/:model_action", post(handle_generate::<P>))
        .route("/health", get(handle_health))
        .route("/v1/models", get(handle_models::<P>))
        .route("/v1/usage", get(handle_usage::<P>))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type QueryMap = Query<HashMap<String, String>>;

async fn handle_chat_completions<P: ProviderClient>(
    State(state): State<Arc<AppState<P>>>,
    headers: HeaderMap,
    Query(query): QueryMap,
    body: Bytes,
) -> Response {
    let call = InboundCall::new(Provider::OpenAi, body);
    dispatch(&state, &headers, &query, call).await
}

async fn handle_messages<P: ProviderClient>(
    State(state): State<Arc<AppState<P>>>,
    headers: HeaderMap,
    Query(query): QueryMap,
    body: Bytes,
) -> Response {
    let call = InboundCall::new(Provider::Anthropic, body);
    dispatch(&state, &headers, &query, call).await
}

/// `{model}:generateContent` or `{model}:streamGenerateContent`.
async fn handle_generate<P: ProviderClient>(
    State(state): State<Arc<AppState<P>>>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Query(query): QueryMap,
    body: Bytes,
) -> Response {
    let Some((model, action)) = model_action.rsplit_once(':') else {
        let err = GatewayError::invalid_request(format!(
            "Expected '<model>:generateContent' or '<model>:streamGenerateContent', got '{model_action}'"
        ));
        return error_response(Provider::Gemini, &err);
    };

    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            let err = GatewayError::invalid_request(format!("Unsupported action '{other}'"));
            return error_response(Provider::Gemini, &err);
        }
    };

    let call = InboundCall::new(Provider::Gemini, body).with_path(model, stream);
    dispatch(&state, &headers, &query, call).await
}

async fn dispatch<P: ProviderClient>(
    state: &AppState<P>,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    call: InboundCall,
) -> Response {
    let protocol = call.protocol;
    let caller = match authorize(state.config(), headers, query) {
        Ok(caller) => caller,
        Err(e) => return error_response(protocol, &e),
    };

    match state.dispatcher.dispatch(call.with_caller(caller)).await {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => {
            if e.status().is_server_error() {
                error!(error = %e, %protocol, "request failed");
            } else {
                warn!(error = %e, %protocol, "request rejected");
            }
            error_response(protocol, &e)
        }
    }
}

/// Key from `Authorization: Bearer`, `x-api-key`, `x-goog-api-key` or `?key=`.
fn presented_key(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header_value(header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| header_value("x-api-key"))
        .or_else(|| header_value("x-goog-api-key"))
        .map(|v| v.trim().to_string())
        .or_else(|| query.get("key").cloned())
}

fn authorize(
    config: &GatewayConfig,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<Caller, GatewayError> {
    if !config.requires_access_key() {
        return Ok(Caller::anonymous());
    }
    let key = presented_key(headers, query)
        .ok_or_else(|| GatewayError::unauthorized("No access key presented"))?;
    config
        .find_access_key(&key)
        .map(Caller::from)
        .ok_or_else(|| GatewayError::unauthorized("Unknown access key"))
}

fn outcome_response(outcome: DispatchOutcome) -> Response {
    let built = match outcome {
        DispatchOutcome::Json {
            status,
            content_type,
            body,
        } => Response::builder()
            .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body)),
        DispatchOutcome::Stream { body } => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(body)),
    };
    built.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `err` in the error shape of `protocol`.
pub fn error_response(protocol: Provider, err: &GatewayError) -> Response {
    let status = err.status();
    let message = err.to_string();
    let body = match protocol {
        Provider::OpenAi => serde_json::to_value(ChatErrorResponse::new(err.kind(), message)),
        Provider::Anthropic => serde_json::to_value(ErrorResponse::new(err.kind(), message)),
        Provider::Gemini => serde_json::to_value(GeminiErrorResponse::new(
            status.as_u16(),
            gemini_status(status),
            message,
        )),
    };
    match body {
        Ok(body) => (status, Json(body)).into_response(),
        Err(_) => status.into_response(),
    }
}

fn gemini_status(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "INVALID_ARGUMENT",
        StatusCode::UNAUTHORIZED => "UNAUTHENTICATED",
        StatusCode::GATEWAY_TIMEOUT => "DEADLINE_EXCEEDED",
        StatusCode::BAD_GATEWAY => "UNAVAILABLE",
        _ => "INTERNAL",
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_models<P: ProviderClient>(
    State(state): State<Arc<AppState<P>>>,
) -> Json<serde_json::Value> {
    let mut names: Vec<(&String, &String)> = state.config().models.iter().collect();
    names.sort();

    let models: Vec<serde_json::Value> = names
        .into_iter()
        .map(|(alias, target)| {
            serde_json::json!({
                "id": alias,
                "object": "model",
                "owned_by": provider_for(target, Provider::OpenAi).name(),
            })
        })
        .collect();

    Json(serde_json::json!({ "data": models, "object": "list" }))
}

async fn handle_usage<P: ProviderClient>(
    State(state): State<Arc<AppState<P>>>,
    headers: HeaderMap,
    Query(query): QueryMap,
) -> Response {
    let caller = match authorize(state.config(), &headers, &query) {
        Ok(caller) => caller,
        Err(e) => return error_response(Provider::OpenAi, &e),
    };
    let totals = state.usage.totals(&caller.name);
    Json(serde_json::json!({
        "key": caller.name,
        "requests": totals.requests,
        "prompt_tokens": totals.prompt_tokens,
        "completion_tokens": totals.completion_tokens,
        "total_tokens": totals.total_tokens,
    }))
    .into_response()
}
