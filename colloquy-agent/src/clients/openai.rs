use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    ChunkStream, ChunkType, CompletionRequest, CompletionResponse, FinishReason, LLMClient,
    LLMError, Message, StreamChunk, ToolCall, ToolCallDelta, ToolDefinition, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Error fragments engines use when the prompt does not fit the model context.
const CONTEXT_EXCEEDED_MARKERS: &[&str] = &[
    "context_length_exceeded",
    "maximum context length",
    "exceeds the available context size",
    "context size has been exceeded",
];

pub struct OpenAIClient {
    api_key: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
    base_url: String,
}

impl OpenAIClient {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(600),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .post(self.endpoint(path))
            .timeout(self.timeout)
            .header("Content-Type", "application/json");
        match &self.api_key {
            Some(key) if !key.is_empty() => builder.header("Authorization", format!("Bearer {}", key)),
            _ => builder,
        }
    }

    async fn send(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response, LLMError> {
        let response = self
            .post(path)
            .json(body)
            .send()
            .await
            .map_err(|e| LLMError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|e| format!("<unreadable body: {}>", e));
        warn!(status = status.as_u16(), path, "completion engine returned an error");
        Err(classify_error(status.as_u16(), message))
    }
}

pub(crate) fn build_request(request: &CompletionRequest, stream: bool) -> serde_json::Value {
    let messages_json: Vec<serde_json::Value> = request.messages.iter().map(message_to_json).collect();

    let mut body = serde_json::Map::new();
    body.insert("model".to_string(), serde_json::Value::String(request.params.model.clone()));
    body.insert("messages".to_string(), serde_json::Value::Array(messages_json));
    body.insert("stream".to_string(), serde_json::Value::Bool(stream));
    if stream {
        body.insert("stream_options".to_string(), serde_json::json!({ "include_usage": true }));
    }

    if let Some(temperature) = request.params.temperature {
        body.insert("temperature".to_string(), serde_json::json!(temperature));
    }
    if let Some(top_p) = request.params.top_p {
        body.insert("top_p".to_string(), serde_json::json!(top_p));
    }
    if let Some(max_tokens) = request.params.max_tokens {
        body.insert("max_tokens".to_string(), serde_json::json!(max_tokens));
    }

    if !request.tools.is_empty() {
        let tools_json: Vec<serde_json::Value> = request.tools.iter().map(tool_to_json).collect();
        body.insert("tools".to_string(), serde_json::Value::Array(tools_json));
        if let Some(parallel) = request.params.parallel_tool_calls {
            body.insert("parallel_tool_calls".to_string(), serde_json::Value::Bool(parallel));
        }
    }

    serde_json::Value::Object(body)
}

fn message_to_json(msg: &Message) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(
        "role".to_string(),
        serde_json::Value::String(msg.role.as_str().to_string()),
    );

    let has_tool_calls = msg.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty());
    if has_tool_calls && msg.content.is_empty() {
        map.insert("content".to_string(), serde_json::Value::Null);
    } else {
        map.insert("content".to_string(), serde_json::Value::String(msg.content.clone()));
    }

    if let Some(tool_calls) = msg.tool_calls.as_ref().filter(|tc| !tc.is_empty()) {
        let tool_calls_json: Vec<serde_json::Value> = tool_calls
            .iter()
            .map(|tc| {
                serde_json::json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.function.name,
                        "arguments": tc.function.arguments
                    }
                })
            })
            .collect();
        map.insert("tool_calls".to_string(), serde_json::Value::Array(tool_calls_json));
    }

    if let Some(call_id) = &msg.tool_call_id {
        map.insert("tool_call_id".to_string(), serde_json::Value::String(call_id.clone()));
    }

    serde_json::Value::Object(map)
}

fn tool_to_json(tool: &ToolDefinition) -> serde_json::Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters
        }
    })
}

pub(crate) fn classify_error(status: u16, message: String) -> LLMError {
    let lowered = message.to_lowercase();
    if CONTEXT_EXCEEDED_MARKERS.iter().any(|m| lowered.contains(m)) {
        return LLMError::ContextExceeded(message);
    }
    LLMError::ApiError { status, message }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<WireError>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
}

fn parse_completion(body: &str) -> Result<CompletionResponse, LLMError> {
    let completion: ChatCompletion =
        serde_json::from_str(body).map_err(|e| LLMError::ParseError(e.to_string()))?;

    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LLMError::ParseError("no choices found".to_string()))?;

    let tool_calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, tc)| {
            let id = if tc.id.is_empty() { format!("call_{}", i) } else { tc.id };
            ToolCall::new(id, tc.function.name, tc.function.arguments)
        })
        .collect();

    let finish_reason = match choice.finish_reason.as_deref() {
        Some(reason) => FinishReason::parse(reason),
        None if !tool_calls.is_empty() => FinishReason::ToolCalls,
        None => FinishReason::Stop,
    };

    Ok(CompletionResponse {
        content: choice.message.content.unwrap_or_default(),
        reasoning: choice.message.reasoning_content.filter(|r| !r.is_empty()),
        finish_reason,
        tool_calls,
        usage: completion.usage,
    })
}

/// Chunks decoded from one SSE event, plus the token usage some engines
/// attach to it.
#[derive(Debug, Default)]
pub(crate) struct ParsedEvent {
    pub(crate) chunks: Vec<StreamChunk>,
    pub(crate) usage: Option<Usage>,
}

/// Decodes the JSON payload of one SSE `data:` line.
pub(crate) fn parse_stream_event(data: &str) -> Result<ParsedEvent, LLMError> {
    let event: StreamEvent =
        serde_json::from_str(data).map_err(|e| LLMError::ParseError(format!("{}: {}", e, data)))?;

    if let Some(error) = event.error {
        return Err(classify_error(500, error.message));
    }

    let mut chunks = Vec::new();
    for choice in event.choices {
        if let Some(delta) = choice.delta {
            if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
                chunks.push(StreamChunk::reasoning(reasoning));
            }
            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                chunks.push(StreamChunk::content(content));
            }
            for tc in delta.tool_calls.unwrap_or_default() {
                let (name, arguments) = match tc.function {
                    Some(f) => (f.name.filter(|n| !n.is_empty()), f.arguments.unwrap_or_default()),
                    None => (None, String::new()),
                };
                chunks.push(StreamChunk::tool_call(ToolCallDelta {
                    index: tc.index,
                    id: tc.id.filter(|id| !id.is_empty()),
                    name,
                    arguments,
                }));
            }
        }
        if let Some(reason) = choice.finish_reason.filter(|r| !r.is_empty()) {
            chunks.push(StreamChunk::done(FinishReason::parse(&reason)));
        }
    }
    Ok(ParsedEvent {
        chunks,
        usage: event.usage,
    })
}

/// Turns a raw SSE byte stream into chunks. Lines may be split across network
/// reads, so bytes are buffered until a full line is available.
///
/// The `Done` chunk is held back until the stream ends because the usage
/// event, when requested, arrives after the finish reason.
pub(crate) fn parse_stream<S, B, E>(bytes: S) -> impl Stream<Item = Result<StreamChunk, LLMError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: fmt::Display + Send,
{
    async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer: Vec<u8> = Vec::new();
        let mut done: Option<StreamChunk> = None;
        let mut usage: Option<Usage> = None;

        'read: while let Some(next) = bytes.next().await {
            match next {
                Ok(data) => buffer.extend_from_slice(data.as_ref()),
                Err(e) => {
                    yield Err(LLMError::RequestFailed(e.to_string()));
                    return;
                }
            }

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim();

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    break 'read;
                }

                match parse_stream_event(data) {
                    Ok(event) => {
                        if event.usage.is_some() {
                            usage = event.usage;
                        }
                        for chunk in event.chunks {
                            if chunk.chunk_type == ChunkType::Done {
                                done = Some(chunk);
                            } else {
                                yield Ok(chunk);
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        let mut done = done.unwrap_or_else(|| {
            debug!("stream ended without a finish reason");
            StreamChunk::done(FinishReason::Stop)
        });
        done.usage = usage;
        yield Ok(done);
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let body = build_request(&request, false);
        debug!(model = %request.params.model, messages = request.messages.len(), "sending completion request");

        let response = self.send("chat/completions", &body).await?;
        let text = response
            .text()
            .await
            .map_err(|e| LLMError::RequestFailed(e.to_string()))?;
        parse_completion(&text)
    }

    async fn stream_complete(&self, request: CompletionRequest) -> Result<ChunkStream, LLMError> {
        let body = build_request(&request, true);
        debug!(model = %request.params.model, messages = request.messages.len(), "sending streaming request");

        let response = self.send("chat/completions", &body).await?;
        Ok(Box::pin(parse_stream(response.bytes_stream())))
    }

    async fn embed(&self, model: &str, input: &str) -> Result<Vec<f32>, LLMError> {
        let body = serde_json::json!({ "model": model, "input": input });
        let response = self.send("embeddings", &body).await?;
        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(e.to_string()))?;

        parsed.data.sort_by_key(|d| d.index);
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| LLMError::ParseError("no embedding returned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{GenerationParams, MessageRole};
    use futures::stream;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> CompletionRequest {
        CompletionRequest::new(
            GenerationParams::new("test-model").with_temperature(0.0),
            vec![Message::system("be brief"), Message::user("hello")],
        )
    }

    #[test]
    fn test_build_request_includes_tools_and_ids() {
        let mut req = request();
        req.messages.push(Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("call_1", "say_hello", r#"{"name":"Bob"}"#)],
        ));
        req.messages.push(Message::tool("call_1", "hello Bob"));
        req.tools.push(ToolDefinition {
            name: "say_hello".to_string(),
            description: "greets".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        });
        req.params.parallel_tool_calls = Some(true);

        let body = build_request(&req, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(build_request(&req, false).get("stream_options").is_none());
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["parallel_tool_calls"], true);
        assert_eq!(body["tools"][0]["function"]["name"], "say_hello");
        assert!(body["messages"][2]["content"].is_null());
        assert_eq!(body["messages"][2]["tool_calls"][0]["id"], "call_1");
        assert_eq!(body["messages"][3]["tool_call_id"], "call_1");
        assert_eq!(body["messages"][3]["role"], MessageRole::Tool.as_str());
    }

    #[test]
    fn test_classify_error_context_exceeded() {
        let err = classify_error(400, "This model's maximum context length is 4096 tokens".to_string());
        assert!(err.is_context_exceeded());

        let err = classify_error(500, "boom".to_string());
        assert!(matches!(err, LLMError::ApiError { status: 500, .. }));
    }

    #[test]
    fn test_parse_stream_event_reasoning_and_tools() {
        let data = r#"{"choices":[{"delta":{"reasoning_content":"hmm","content":"Hi","tool_calls":[{"index":1,"id":"call_9","function":{"name":"f","arguments":"{\"a\""}}]},"finish_reason":null}]}"#;
        let event = parse_stream_event(data).unwrap();
        assert!(event.usage.is_none());
        let chunks = event.chunks;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chunk_type, ChunkType::Reasoning);
        assert_eq!(chunks[1].content, "Hi");
        let delta = chunks[2].tool_call.as_ref().unwrap();
        assert_eq!(delta.index, 1);
        assert_eq!(delta.id.as_deref(), Some("call_9"));
        assert_eq!(delta.arguments, "{\"a\"");
    }

    #[tokio::test]
    async fn test_parse_stream_handles_split_lines() {
        let parts: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel".to_vec()),
            Ok(b"lo\"}}]}\n\ndata: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n".to_vec()),
            Ok(b"data: [DONE]\n".to_vec()),
        ];
        let chunks: Vec<_> = parse_stream(stream::iter(parts)).collect().await;
        let chunks: Vec<StreamChunk> = chunks.into_iter().map(|c| c.unwrap()).collect();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "Hello");
        assert_eq!(chunks[1].finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn test_parse_stream_attaches_trailing_usage_to_done() {
        let parts: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"},\"finish_reason\":\"stop\"}]}\n".to_vec()),
            Ok(b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":3,\"total_tokens\":15}}\n".to_vec()),
            Ok(b"data: [DONE]\n".to_vec()),
        ];
        let chunks: Vec<StreamChunk> = parse_stream(stream::iter(parts))
            .map(|c| c.unwrap())
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "Hi");
        assert_eq!(chunks[1].chunk_type, ChunkType::Done);
        assert_eq!(chunks[1].finish_reason, Some(FinishReason::Stop));
        assert_eq!(chunks[1].usage, Some(Usage::new(12, 3)));
    }

    #[tokio::test]
    async fn test_parse_stream_without_finish_reason_ends_with_stop() {
        let parts: Vec<Result<Vec<u8>, String>> =
            vec![Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n".to_vec())];
        let chunks: Vec<_> = parse_stream(stream::iter(parts)).collect().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[1].as_ref().unwrap().finish_reason,
            Some(FinishReason::Stop)
        );
    }

    #[tokio::test]
    async fn test_complete_against_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{
                    "message": {
                        "content": "",
                        "tool_calls": [
                            {"id": "a", "type": "function", "function": {"name": "say_hello", "arguments": "{\"name\":\"Alice\"}"}},
                            {"id": "b", "type": "function", "function": {"name": "say_hello", "arguments": "{\"name\":\"Bob\"}"}}
                        ]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 40, "completion_tokens": 20, "total_tokens": 60}
            })))
            .mount(&server)
            .await;

        let client = OpenAIClient::new(None, Some(format!("{}/v1/", server.uri())));
        let response = client.complete(request()).await.unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.tool_calls.len(), 2);
        assert_eq!(response.tool_calls[1].id, "b");
        assert_eq!(response.usage, Some(Usage::new(40, 20)));
    }

    #[tokio::test]
    async fn test_context_exceeded_is_distinct() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"{"error":{"code":"context_length_exceeded","message":"too long"}}"#,
            ))
            .mount(&server)
            .await;

        let client = OpenAIClient::new(Some("key".to_string()), Some(server.uri()));
        let err = client.complete(request()).await.unwrap_err();
        assert!(err.is_context_exceeded());
    }

    #[tokio::test]
    async fn test_stream_complete_against_server() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n"
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = OpenAIClient::new(None, Some(server.uri()));
        let stream = client.stream_complete(request()).await.unwrap();
        let chunks: Vec<StreamChunk> = stream.map(|c| c.unwrap()).collect().await;
        let text: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(text, "Hello world");
        assert_eq!(chunks.last().unwrap().finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn test_embed_against_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.5, -0.25, 1.0], "index": 0}]
            })))
            .mount(&server)
            .await;

        let client = OpenAIClient::new(None, Some(server.uri()));
        let vector = client.embed("embed-model", "text").await.unwrap();
        assert_eq!(vector, vec![0.5, -0.25, 1.0]);
    }
}
