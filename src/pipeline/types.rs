//! Request/response shapes the pipeline moves between stages.
//!
//! The core is deliberately agnostic to any one wire format — callers
//! (HTTP front-end, provider adapters) populate these from their own
//! types and read them back afterward. Bodies are carried as
//! [`serde_json::Value`] rather than a fixed schema.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpRequestContext {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpResponseContext {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    pub sequence: u64,
    pub data: Value,
    pub is_final: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub provider: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    pub payload: Value,
}

/// The result of the provider call (or a plugin-supplied short circuit):
/// either a response or a terminal error, never both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmStageOutcome {
    pub response: Option<LlmResponse>,
    pub error: Option<String>,
}

impl LlmStageOutcome {
    pub fn ok(response: LlmResponse) -> Self {
        Self { response: Some(response), error: None }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self { response: None, error: Some(message.into()) }
    }
}

/// What an LLM pre-hook decided: keep going with a (possibly transformed)
/// request, or replace the provider call entirely with a synthetic
/// outcome.
#[derive(Debug, Clone)]
pub enum PreLlmDecision {
    Continue(LlmRequest),
    ShortCircuit(LlmStageOutcome),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpRequest {
    pub tool: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpResponse {
    pub result: Value,
}

/// A completed trace handed to observability plugins out-of-band.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trace {
    pub request_id: String,
    pub spans: Vec<Value>,
}

/// Final state of one request's trip through the pipeline, returned by
/// [`super::Pipeline::execute`].
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub response: Option<LlmResponse>,
    pub error: Option<String>,
    pub transport_response: Option<HttpResponseContext>,
    pub short_circuited_by: Option<String>,
}
