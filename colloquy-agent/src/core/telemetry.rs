//! Capture of the last request and response of an agent.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

use crate::clients::openai::build_request;
use crate::clients::{CompletionRequest, CompletionResponse, LLMError, Usage};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestMetadata {
    pub model: String,
    /// Serialized size of the request messages, in bytes.
    pub context_length: usize,
    pub stream: bool,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseMetadata {
    pub model: String,
    pub finish_reason: String,
    pub usage: Usage,
    pub response_time: Duration,
    pub timestamp: SystemTime,
}

/// Receives telemetry as it is captured. Every method defaults to a no-op.
pub trait TelemetryCallback: Send + Sync {
    fn on_request_sent(&self, _metadata: &RequestMetadata, _request_json: &str) {}

    fn on_response_received(&self, _metadata: &ResponseMetadata, _response_json: &str) {}

    /// `index` counts the content chunks of the current stream from 0.
    fn on_stream_chunk(&self, _chunk: &str, _index: usize) {}

    fn on_error(&self, _error: &LLMError, _context: &str) {}
}

pub type SharedTelemetryCallback = Arc<dyn TelemetryCallback>;

#[derive(Default)]
struct Captured {
    request: Option<(RequestMetadata, serde_json::Value)>,
    response: Option<(ResponseMetadata, serde_json::Value)>,
    total_tokens: u64,
}

/// Last request and response of one agent, and the tokens it has used.
#[derive(Default)]
pub struct Telemetry {
    captured: Mutex<Captured>,
    callback: Mutex<Option<SharedTelemetryCallback>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callback(&self, callback: SharedTelemetryCallback) {
        *self.callback.lock() = Some(callback);
    }

    pub fn clear_callback(&self) {
        *self.callback.lock() = None;
    }

    fn callback(&self) -> Option<SharedTelemetryCallback> {
        self.callback.lock().clone()
    }

    /// Records `request` as the last one sent and returns the instant the
    /// response time is measured from.
    pub(crate) fn capture_request(&self, request: &CompletionRequest, stream: bool) -> Instant {
        let body = build_request(request, stream);
        let context_length = request
            .messages
            .iter()
            .filter_map(|m| serde_json::to_vec(m).ok())
            .map(|bytes| bytes.len())
            .sum();
        let metadata = RequestMetadata {
            model: request.params.model.clone(),
            context_length,
            stream,
            temperature: request.params.temperature,
            top_p: request.params.top_p,
            max_tokens: request.params.max_tokens,
            timestamp: SystemTime::now(),
        };

        if let Some(callback) = self.callback() {
            callback.on_request_sent(&metadata, &body.to_string());
        }
        self.captured.lock().request = Some((metadata, body));
        Instant::now()
    }

    pub(crate) fn capture_response(&self, model: &str, response: &CompletionResponse, started: Instant) {
        let usage = response.usage.unwrap_or_default();
        let metadata = ResponseMetadata {
            model: model.to_string(),
            finish_reason: response.finish_reason.as_str().to_string(),
            usage,
            response_time: started.elapsed(),
            timestamp: SystemTime::now(),
        };
        let body = response_json(model, response);
        debug!(
            model,
            finish_reason = %metadata.finish_reason,
            total_tokens = usage.total_tokens,
            elapsed_ms = metadata.response_time.as_millis() as u64,
            "response captured"
        );

        {
            let mut captured = self.captured.lock();
            captured.total_tokens += usage.total_tokens;
            captured.response = Some((metadata.clone(), body.clone()));
        }
        if let Some(callback) = self.callback() {
            callback.on_response_received(&metadata, &body.to_string());
        }
    }

    pub(crate) fn capture_chunk(&self, chunk: &str, index: usize) {
        if let Some(callback) = self.callback() {
            callback.on_stream_chunk(chunk, index);
        }
    }

    pub(crate) fn capture_error(&self, error: &LLMError, context: &str) {
        if let Some(callback) = self.callback() {
            callback.on_error(error, context);
        }
    }

    /// Pretty-printed body of the last request, as it went on the wire.
    pub fn last_request_json(&self) -> Option<String> {
        let captured = self.captured.lock();
        let (_, body) = captured.request.as_ref()?;
        serde_json::to_string_pretty(body).ok()
    }

    pub fn last_request_metadata(&self) -> Option<RequestMetadata> {
        self.captured.lock().request.as_ref().map(|(m, _)| m.clone())
    }

    pub fn last_response_json(&self) -> Option<String> {
        let captured = self.captured.lock();
        let (_, body) = captured.response.as_ref()?;
        serde_json::to_string_pretty(body).ok()
    }

    pub fn last_response_metadata(&self) -> Option<ResponseMetadata> {
        self.captured.lock().response.as_ref().map(|(m, _)| m.clone())
    }

    pub fn total_tokens_used(&self) -> u64 {
        self.captured.lock().total_tokens
    }

    /// Forgets the captured request and response and zeroes the token count.
    /// The callback stays registered.
    pub fn reset(&self) {
        *self.captured.lock() = Captured::default();
    }
}

fn response_json(model: &str, response: &CompletionResponse) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "content": response.content,
        "reasoning": response.reasoning,
        "finish_reason": response.finish_reason.as_str(),
        "tool_calls": response.tool_calls,
        "usage": response.usage,
    })
}
