//! Drives the model/tool round trip until the model answers in plain text.

use futures::StreamExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ToolError, ToolExecutor};
use crate::clients::{
    ChunkType, CompletionRequest, CompletionResponse, FinishReason, GenerationParams, LLMError,
    Message, SharedClient, ToolCall, ToolDefinition,
};
use crate::core::stream::{CallbackError, StopHandle};
use crate::core::telemetry::Telemetry;
use crate::prompts::{EMPTY_TOOL_RESULT, build_tool_denied_result, build_tool_error_result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationResponse {
    Confirmed,
    Denied,
    Quit,
}

/// Asked with `(function_name, arguments)` before each tool runs.
pub type ConfirmationCallback = Arc<dyn Fn(&str, &str) -> ConfirmationResponse + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The model answered without requesting tools.
    Stop,
    /// The final answer was truncated by the token limit.
    Length,
    TurnLimit,
    /// A tool reported a fatal error.
    Aborted(String),
    UserQuit,
}

impl Termination {
    pub fn finish_reason(&self) -> &'static str {
        match self {
            Termination::Stop => "stop",
            Termination::Length => "length",
            Termination::TurnLimit => "turn_limit",
            Termination::Aborted(_) => "exit_loop",
            Termination::UserQuit => "user_quit",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(String),
    Failed(String),
    Denied,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub call_id: String,
    pub function_name: String,
    pub outcome: ToolOutcome,
}

impl ToolCallResult {
    /// Text fed back to the model as the tool-role message.
    pub fn content(&self) -> String {
        match &self.outcome {
            ToolOutcome::Success(text) => text.clone(),
            ToolOutcome::Failed(error) => build_tool_error_result(error),
            ToolOutcome::Denied => build_tool_denied_result(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolLoopOutcome {
    pub termination: Termination,
    /// Results in the order the model requested them.
    pub results: Vec<ToolCallResult>,
    pub last_assistant_message: String,
    pub rounds: usize,
    /// The running message list, tool calls and results included.
    pub messages: Vec<Message>,
}

impl ToolLoopOutcome {
    pub fn finish_reason(&self) -> &'static str {
        self.termination.finish_reason()
    }
}

#[derive(Debug, Error)]
pub enum ToolLoopError {
    #[error("Tool loop request failed: {source}")]
    Llm {
        source: LLMError,
        partial: Box<ToolLoopOutcome>,
    },
    #[error("Tool loop callback failed: {source}")]
    Callback {
        source: CallbackError,
        partial: Box<ToolLoopOutcome>,
    },
}

impl ToolLoopError {
    /// Whatever the loop had accumulated when it failed.
    pub fn partial(&self) -> &ToolLoopOutcome {
        match self {
            ToolLoopError::Llm { partial, .. } | ToolLoopError::Callback { partial, .. } => partial,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ToolLoopError::Llm {
                source: LLMError::Cancelled,
                ..
            }
        )
    }
}

struct LoopState {
    messages: Vec<Message>,
    results: Vec<ToolCallResult>,
    last_assistant_message: String,
    rounds: usize,
}

impl LoopState {
    fn finish(self, termination: Termination) -> ToolLoopOutcome {
        ToolLoopOutcome {
            termination,
            results: self.results,
            last_assistant_message: self.last_assistant_message,
            rounds: self.rounds,
            messages: self.messages,
        }
    }

    fn fail(self, source: LLMError) -> ToolLoopError {
        let partial = Box::new(self.finish(Termination::Stop));
        ToolLoopError::Llm { source, partial }
    }

    fn fail_callback(self, source: CallbackError) -> ToolLoopError {
        let partial = Box::new(self.finish(Termination::Stop));
        ToolLoopError::Callback { source, partial }
    }
}

enum RoundEnd {
    Continue,
    Done(Termination),
}

pub struct ToolCallLoop {
    client: SharedClient,
    params: GenerationParams,
    executor: Arc<dyn ToolExecutor>,
    mode: ExecutionMode,
    max_rounds: usize,
    confirmation: Option<ConfirmationCallback>,
    stop: StopHandle,
    telemetry: Arc<Telemetry>,
}

impl ToolCallLoop {
    pub fn new(client: SharedClient, params: GenerationParams, executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            client,
            params,
            executor,
            mode: ExecutionMode::Sequential,
            max_rounds: 10,
            confirmation: None,
            stop: StopHandle::new(),
            telemetry: Arc::new(Telemetry::new()),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn with_confirmation(mut self, confirmation: ConfirmationCallback) -> Self {
        self.confirmation = Some(confirmation);
        self
    }

    /// Shares a stop handle, typically the session's.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Records every round's request and response into `telemetry`.
    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    fn effective_mode(&self) -> ExecutionMode {
        match self.mode {
            ExecutionMode::Parallel if !self.executor.supports_concurrency() => {
                debug!("executor is not reentrant, running tools sequentially");
                ExecutionMode::Sequential
            }
            mode => mode,
        }
    }

    fn request(&self, messages: &[Message], catalog: &[ToolDefinition]) -> CompletionRequest {
        CompletionRequest::new(self.params.clone(), messages.to_vec()).with_tools(catalog.to_vec())
    }

    pub async fn run(
        &self,
        messages: Vec<Message>,
        catalog: &[ToolDefinition],
    ) -> Result<ToolLoopOutcome, ToolLoopError> {
        let token = self.stop.arm();
        let mut state = LoopState {
            messages,
            results: Vec::new(),
            last_assistant_message: String::new(),
            rounds: 0,
        };

        loop {
            if state.rounds >= self.max_rounds {
                warn!(rounds = state.rounds, "tool loop reached its round limit");
                return Ok(state.finish(Termination::TurnLimit));
            }
            state.rounds += 1;

            let request = self.request(&state.messages, catalog);
            let started = self.telemetry.capture_request(&request, false);
            let response = tokio::select! {
                biased;
                _ = token.cancelled() => Err(LLMError::Cancelled),
                response = self.client.complete(request) => response,
            };
            let response = match response {
                Ok(response) => {
                    self.telemetry.capture_response(&self.params.model, &response, started);
                    response
                }
                Err(e) => {
                    self.telemetry.capture_error(&e, "tool round");
                    return Err(state.fail(e));
                }
            };

            match self.handle_response(&mut state, response, &token).await {
                Ok(RoundEnd::Continue) => {}
                Ok(RoundEnd::Done(termination)) => return Ok(state.finish(termination)),
                Err(e) => return Err(state.fail(e)),
            }
        }
    }

    /// Same loop over streamed responses. `on_chunk` sees the assistant text of
    /// every round and a final `("", finish_reason)` call.
    pub async fn run_streaming<F>(
        &self,
        messages: Vec<Message>,
        catalog: &[ToolDefinition],
        mut on_chunk: F,
    ) -> Result<ToolLoopOutcome, ToolLoopError>
    where
        F: FnMut(&str, &str) -> Result<(), CallbackError> + Send,
    {
        let token = self.stop.arm();
        let mut state = LoopState {
            messages,
            results: Vec::new(),
            last_assistant_message: String::new(),
            rounds: 0,
        };

        loop {
            if state.rounds >= self.max_rounds {
                warn!(rounds = state.rounds, "tool loop reached its round limit");
                let outcome = state.finish(Termination::TurnLimit);
                return match on_chunk("", outcome.finish_reason()) {
                    Ok(()) => Ok(outcome),
                    Err(source) => Err(ToolLoopError::Callback {
                        source,
                        partial: Box::new(outcome),
                    }),
                };
            }
            state.rounds += 1;

            let request = self.request(&state.messages, catalog);
            let started = self.telemetry.capture_request(&request, true);
            let response = match self.stream_round(request, &token, &mut on_chunk).await {
                Ok(response) => {
                    self.telemetry.capture_response(&self.params.model, &response, started);
                    response
                }
                Err(StreamFailure::Llm(e)) => {
                    self.telemetry.capture_error(&e, "tool round");
                    return Err(state.fail(e));
                }
                Err(StreamFailure::Callback(e)) => return Err(state.fail_callback(e)),
            };

            match self.handle_response(&mut state, response, &token).await {
                Ok(RoundEnd::Continue) => {}
                Ok(RoundEnd::Done(termination)) => {
                    if let Err(e) = on_chunk("", termination.finish_reason()) {
                        return Err(state.fail_callback(e));
                    }
                    return Ok(state.finish(termination));
                }
                Err(e) => return Err(state.fail(e)),
            }
        }
    }

    async fn stream_round<F>(
        &self,
        request: CompletionRequest,
        token: &CancellationToken,
        on_chunk: &mut F,
    ) -> Result<CompletionResponse, StreamFailure>
    where
        F: FnMut(&str, &str) -> Result<(), CallbackError> + Send,
    {
        let mut stream = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(StreamFailure::Llm(LLMError::Cancelled)),
            stream = self.client.stream_complete(request) => stream.map_err(StreamFailure::Llm)?,
        };

        let mut content = String::new();
        let mut reasoning = String::new();
        let mut partial_calls: BTreeMap<usize, ToolCall> = BTreeMap::new();
        let mut finish_reason = FinishReason::Stop;
        let mut usage = None;
        let mut index = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(StreamFailure::Llm(LLMError::Cancelled)),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(StreamFailure::Llm)?;
            match chunk.chunk_type {
                ChunkType::Content if !chunk.content.is_empty() => {
                    self.telemetry.capture_chunk(&chunk.content, index);
                    index += 1;
                    on_chunk(&chunk.content, "").map_err(StreamFailure::Callback)?;
                    content.push_str(&chunk.content);
                }
                ChunkType::Reasoning => reasoning.push_str(&chunk.content),
                ChunkType::ToolCall => {
                    if let Some(delta) = chunk.tool_call {
                        let call = partial_calls
                            .entry(delta.index)
                            .or_insert_with(|| ToolCall::new(String::new(), String::new(), String::new()));
                        if let Some(id) = delta.id {
                            call.id = id;
                        }
                        if let Some(name) = delta.name {
                            call.function.name.push_str(&name);
                        }
                        call.function.arguments.push_str(&delta.arguments);
                    }
                }
                ChunkType::Done => {
                    if let Some(reason) = chunk.finish_reason {
                        finish_reason = reason;
                    }
                    usage = chunk.usage;
                    break;
                }
                _ => {}
            }
        }

        let tool_calls: Vec<ToolCall> = partial_calls
            .into_iter()
            .map(|(index, mut call)| {
                if call.id.is_empty() {
                    call.id = format!("call_{}", index);
                }
                call
            })
            .collect();
        if !tool_calls.is_empty() {
            finish_reason = FinishReason::ToolCalls;
        }

        Ok(CompletionResponse {
            content,
            reasoning: (!reasoning.is_empty()).then_some(reasoning),
            finish_reason,
            tool_calls,
            usage,
        })
    }

    async fn handle_response(
        &self,
        state: &mut LoopState,
        response: CompletionResponse,
        token: &CancellationToken,
    ) -> Result<RoundEnd, LLMError> {
        if response.tool_calls.is_empty() {
            debug!(round = state.rounds, finish_reason = %response.finish_reason, "model answered");
            state.messages.push(Message::assistant(response.content.clone()));
            state.last_assistant_message = response.content;
            let termination = match response.finish_reason {
                FinishReason::Length => Termination::Length,
                _ => Termination::Stop,
            };
            return Ok(RoundEnd::Done(termination));
        }

        info!(
            round = state.rounds,
            calls = response.tool_calls.len(),
            "model requested tools"
        );
        if !response.content.is_empty() {
            state.last_assistant_message = response.content.clone();
        }
        let calls = response.tool_calls;
        state
            .messages
            .push(Message::assistant_with_tool_calls(response.content, calls.clone()));

        match self.effective_mode() {
            ExecutionMode::Sequential => self.execute_sequential(state, &calls, token).await,
            ExecutionMode::Parallel => self.execute_parallel(state, &calls, token).await,
        }
    }

    fn confirm(&self, call: &ToolCall) -> ConfirmationResponse {
        match &self.confirmation {
            Some(confirm) => confirm(&call.function.name, &call.function.arguments),
            None => ConfirmationResponse::Confirmed,
        }
    }

    async fn execute_sequential(
        &self,
        state: &mut LoopState,
        calls: &[ToolCall],
        token: &CancellationToken,
    ) -> Result<RoundEnd, LLMError> {
        for call in calls {
            let outcome = match self.confirm(call) {
                ConfirmationResponse::Quit => {
                    warn!(tool = %call.function.name, "user quit the tool loop");
                    return Ok(RoundEnd::Done(Termination::UserQuit));
                }
                ConfirmationResponse::Denied => Ok(ToolOutcome::Denied),
                ConfirmationResponse::Confirmed => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(LLMError::Cancelled),
                        outcome = invoke(self.executor.as_ref(), call) => outcome,
                    }
                }
            };
            if let Some(end) = record(state, call, outcome) {
                return Ok(end);
            }
        }
        Ok(RoundEnd::Continue)
    }

    async fn execute_parallel(
        &self,
        state: &mut LoopState,
        calls: &[ToolCall],
        token: &CancellationToken,
    ) -> Result<RoundEnd, LLMError> {
        let mut decisions = Vec::with_capacity(calls.len());
        for call in calls {
            match self.confirm(call) {
                ConfirmationResponse::Quit => {
                    warn!(tool = %call.function.name, "user quit the tool loop");
                    return Ok(RoundEnd::Done(Termination::UserQuit));
                }
                decision => decisions.push(decision),
            }
        }

        let executor = self.executor.as_ref();
        let pending = calls.iter().zip(&decisions).map(|(call, decision)| async move {
            match decision {
                ConfirmationResponse::Confirmed => invoke(executor, call).await,
                _ => Ok(ToolOutcome::Denied),
            }
        });
        let outcomes = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(LLMError::Cancelled),
            outcomes = join_all(pending) => outcomes,
        };

        // Every call of the round has already run, so keep the results of the
        // others even when one of them was fatal.
        let mut end = None;
        for (call, outcome) in calls.iter().zip(outcomes) {
            if let Some(fatal) = record(state, call, outcome) {
                end.get_or_insert(fatal);
            }
        }
        Ok(end.unwrap_or(RoundEnd::Continue))
    }
}

enum StreamFailure {
    Llm(LLMError),
    Callback(CallbackError),
}

async fn invoke(executor: &dyn ToolExecutor, call: &ToolCall) -> Result<ToolOutcome, ToolError> {
    let name = &call.function.name;
    info!(tool = %name, call_id = %call.id, "executing tool");
    match executor.execute(name, &call.function.arguments).await {
        Ok(text) if text.is_empty() => Ok(ToolOutcome::Success(EMPTY_TOOL_RESULT.to_string())),
        Ok(text) => Ok(ToolOutcome::Success(text)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!(tool = %name, error = %e, "tool failed");
            Ok(ToolOutcome::Failed(e.to_string()))
        }
    }
}

/// Appends one result to the running state. Returns the loop end on a fatal
/// tool error.
fn record(
    state: &mut LoopState,
    call: &ToolCall,
    outcome: Result<ToolOutcome, ToolError>,
) -> Option<RoundEnd> {
    match outcome {
        Ok(outcome) => {
            let result = ToolCallResult {
                call_id: call.id.clone(),
                function_name: call.function.name.clone(),
                outcome,
            };
            state.messages.push(Message::tool(call.id.clone(), result.content()));
            state.results.push(result);
            None
        }
        Err(e) => {
            warn!(tool = %call.function.name, error = %e, "fatal tool error, leaving the loop");
            Some(RoundEnd::Done(Termination::Aborted(e.to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{MessageRole, Usage};
    use crate::clients::mock::{MockClient, Scripted};
    use crate::tools::test_support::{greeter, say_hello_tool};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn hello(id: &str, name: &str) -> ToolCall {
        ToolCall::new(id, "say_hello", format!(r#"{{"name":"{}"}}"#, name))
    }

    fn alice_and_bob() -> Scripted {
        Scripted::Response(CompletionResponse::with_tool_calls(vec![
            hello("call_1", "Alice"),
            hello("call_2", "Bob"),
        ]))
    }

    fn tool_loop(mock: &Arc<MockClient>, executor: Arc<dyn ToolExecutor>) -> ToolCallLoop {
        let client: SharedClient = Arc::clone(mock) as SharedClient;
        ToolCallLoop::new(client, GenerationParams::new("tools"), executor)
    }

    /// Sleeps per call and tracks how many calls overlap.
    struct SlowExecutor {
        reentrant: bool,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowExecutor {
        fn new(reentrant: bool) -> Self {
            Self {
                reentrant,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ToolExecutor for SlowExecutor {
        async fn execute(&self, name: &str, arguments: &str) -> Result<String, ToolError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = if arguments.contains("Alice") { 40 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            match name {
                "explode" => Err(ToolError::ExecutionFailed("kaboom".to_string())),
                "halt" => Err(ToolError::Fatal("disk on fire".to_string())),
                "silent" => Ok(String::new()),
                _ => Ok(format!("done {}", arguments)),
            }
        }

        fn supports_concurrency(&self) -> bool {
            self.reentrant
        }
    }

    #[tokio::test]
    async fn test_parallel_alice_and_bob() {
        let mock = Arc::new(MockClient::new(vec![
            alice_and_bob(),
            Scripted::Response(CompletionResponse::text("I greeted Alice and Bob.")),
        ]));
        let runner = tool_loop(&mock, Arc::new(greeter())).with_mode(ExecutionMode::Parallel);

        let outcome = runner
            .run(vec![Message::user("Say hello to Alice and Bob")], &[say_hello_tool().definition()])
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::Stop);
        assert_eq!(outcome.finish_reason(), "stop");
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.last_assistant_message, "I greeted Alice and Bob.");
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results[0].content().contains("Alice"));
        assert!(outcome.results[1].content().contains("Bob"));

        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.len(), 1);
        let second = &requests[1].messages;
        assert_eq!(second.len(), 4);
        assert_eq!(second[1].tool_calls.as_ref().map(Vec::len), Some(2));
        assert_eq!(second[2].role, MessageRole::Tool);
        assert_eq!(second[2].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(second[3].tool_call_id.as_deref(), Some("call_2"));
    }

    #[tokio::test]
    async fn test_parallel_results_keep_request_order() {
        let mock = Arc::new(MockClient::new(vec![
            alice_and_bob(),
            Scripted::Response(CompletionResponse::text("ok")),
        ]));
        let executor = Arc::new(SlowExecutor::new(true));
        let runner = tool_loop(&mock, Arc::clone(&executor) as Arc<dyn ToolExecutor>)
            .with_mode(ExecutionMode::Parallel);

        let outcome = runner.run(vec![Message::user("hi")], &[]).await.unwrap();

        assert_eq!(executor.peak.load(Ordering::SeqCst), 2);
        let ids: Vec<&str> = outcome.results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["call_1", "call_2"]);
        assert!(outcome.results[0].content().contains("Alice"));
    }

    #[tokio::test]
    async fn test_non_reentrant_executor_runs_sequentially() {
        let mock = Arc::new(MockClient::new(vec![
            alice_and_bob(),
            Scripted::Response(CompletionResponse::text("ok")),
        ]));
        let executor = Arc::new(SlowExecutor::new(false));
        let runner = tool_loop(&mock, Arc::clone(&executor) as Arc<dyn ToolExecutor>)
            .with_mode(ExecutionMode::Parallel);

        let outcome = runner.run(vec![Message::user("hi")], &[]).await.unwrap();

        assert_eq!(executor.peak.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.results.len(), 2);
    }

    #[tokio::test]
    async fn test_turn_limit_when_model_never_stops() {
        let mock = Arc::new(MockClient::new(vec![
            Scripted::Response(CompletionResponse::with_tool_calls(vec![hello("a", "Alice")])),
            Scripted::Response(CompletionResponse::with_tool_calls(vec![hello("b", "Bob")])),
            Scripted::Response(CompletionResponse::with_tool_calls(vec![hello("c", "Carol")])),
        ]));
        let runner = tool_loop(&mock, Arc::new(greeter())).with_max_rounds(2);

        let outcome = runner.run(vec![Message::user("hi")], &[]).await.unwrap();

        assert_eq!(outcome.termination, Termination::TurnLimit);
        assert_eq!(outcome.finish_reason(), "turn_limit");
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_tool_failure_is_fed_back() {
        let mock = Arc::new(MockClient::new(vec![
            Scripted::Response(CompletionResponse::with_tool_calls(vec![
                ToolCall::new("x", "explode", "{}"),
                ToolCall::new("y", "silent", "{}"),
            ])),
            Scripted::Response(CompletionResponse::text("the tool failed")),
        ]));
        let runner = tool_loop(&mock, Arc::new(SlowExecutor::new(true)));

        let outcome = runner.run(vec![Message::user("hi")], &[]).await.unwrap();

        assert_eq!(outcome.termination, Termination::Stop);
        assert!(!outcome.results[0].is_success());
        let fed_back = &mock.requests()[1].messages[2].content;
        assert!(fed_back.contains("Function execution failed"));
        assert!(fed_back.contains("kaboom"));
        assert_eq!(outcome.results[1].content(), EMPTY_TOOL_RESULT);
    }

    #[tokio::test]
    async fn test_rounds_accumulate_token_usage() {
        let mock = Arc::new(MockClient::new(vec![
            Scripted::Response(
                CompletionResponse::with_tool_calls(vec![hello("call_1", "Alice")])
                    .with_usage(Usage::new(50, 10)),
            ),
            Scripted::Response(CompletionResponse::text("Done.").with_usage(Usage::new(80, 5))),
        ]));
        let telemetry = Arc::new(Telemetry::new());
        let runner = tool_loop(&mock, Arc::new(greeter())).with_telemetry(Arc::clone(&telemetry));

        runner.run(vec![Message::user("hi")], &[]).await.unwrap();

        assert_eq!(telemetry.total_tokens_used(), 145);
        let last = telemetry.last_response_metadata().unwrap();
        assert_eq!(last.finish_reason, "stop");
        assert_eq!(last.usage, Usage::new(80, 5));
        assert!(telemetry.last_request_json().unwrap().contains("tool_call_id"));
    }

    #[tokio::test]
    async fn test_fatal_error_aborts() {
        let mock = Arc::new(MockClient::new(vec![Scripted::Response(
            CompletionResponse::with_tool_calls(vec![
                ToolCall::new("x", "halt", "{}"),
                ToolCall::new("y", "say_hello", "{}"),
            ]),
        )]));
        let runner = tool_loop(&mock, Arc::new(SlowExecutor::new(true)));

        let outcome = runner.run(vec![Message::user("hi")], &[]).await.unwrap();

        assert!(matches!(outcome.termination, Termination::Aborted(ref m) if m.contains("disk on fire")));
        assert_eq!(outcome.finish_reason(), "exit_loop");
        assert!(outcome.results.is_empty());
        assert_eq!(mock.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_error_in_parallel_round_keeps_completed_results() {
        let mock = Arc::new(MockClient::new(vec![Scripted::Response(
            CompletionResponse::with_tool_calls(vec![
                ToolCall::new("x", "halt", "{}"),
                hello("y", "Alice"),
                hello("z", "Bob"),
            ]),
        )]));
        let runner = tool_loop(&mock, Arc::new(SlowExecutor::new(true)))
            .with_mode(ExecutionMode::Parallel);

        let outcome = runner.run(vec![Message::user("hi")], &[]).await.unwrap();

        assert!(matches!(outcome.termination, Termination::Aborted(ref m) if m.contains("disk on fire")));
        let ids: Vec<_> = outcome.results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["y", "z"]);
        assert!(outcome.results.iter().all(|r| r.is_success()));
        let tool_messages = outcome
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .count();
        assert_eq!(tool_messages, 2);
        assert_eq!(mock.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_confirmation_denied_and_quit() {
        let mock = Arc::new(MockClient::new(vec![
            alice_and_bob(),
            Scripted::Response(CompletionResponse::with_tool_calls(vec![hello("c", "Carol")])),
        ]));
        let confirm: ConfirmationCallback = Arc::new(|_name: &str, args: &str| {
            if args.contains("Bob") {
                ConfirmationResponse::Denied
            } else if args.contains("Carol") {
                ConfirmationResponse::Quit
            } else {
                ConfirmationResponse::Confirmed
            }
        });
        let runner = tool_loop(&mock, Arc::new(greeter())).with_confirmation(confirm);

        let outcome = runner.run(vec![Message::user("hi")], &[]).await.unwrap();

        assert_eq!(outcome.termination, Termination::UserQuit);
        assert_eq!(outcome.finish_reason(), "user_quit");
        assert!(outcome.results[0].is_success());
        assert_eq!(outcome.results[1].outcome, ToolOutcome::Denied);
        assert!(outcome.results[1].content().contains("denied"));
        assert_eq!(outcome.results.len(), 2);
    }

    #[tokio::test]
    async fn test_request_failure_keeps_partial_results() {
        let mock = Arc::new(MockClient::new(vec![
            Scripted::Response(CompletionResponse::with_tool_calls(vec![hello("a", "Alice")])),
            Scripted::Error(LLMError::RequestFailed("engine down".to_string())),
        ]));
        let runner = tool_loop(&mock, Arc::new(greeter()));

        let err = runner.run(vec![Message::user("hi")], &[]).await.unwrap_err();

        assert!(matches!(err, ToolLoopError::Llm { .. }));
        assert!(!err.is_cancelled());
        assert_eq!(err.partial().results.len(), 1);
        assert_eq!(err.partial().rounds, 2);
    }

    #[tokio::test]
    async fn test_stop_cancels_loop() {
        let mock = Arc::new(MockClient::new(vec![Scripted::Hang(vec![])]));
        let stop = StopHandle::new();
        let runner = tool_loop(&mock, Arc::new(greeter())).with_stop_handle(stop.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stop.stop();
        });

        let err = runner
            .run_streaming(vec![Message::user("hi")], &[], |_, _| Ok(()))
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_streaming_accumulates_tool_calls() {
        let mock = Arc::new(MockClient::new(vec![
            alice_and_bob(),
            Scripted::Response(CompletionResponse::text("Hello to both!")),
        ]));
        let runner = tool_loop(&mock, Arc::new(greeter())).with_mode(ExecutionMode::Parallel);
        let mut chunks = Vec::new();

        let outcome = runner
            .run_streaming(vec![Message::user("hi")], &[], |text, reason| {
                chunks.push((text.to_string(), reason.to_string()));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[1].call_id, "call_2");
        assert_eq!(outcome.last_assistant_message, "Hello to both!");
        assert_eq!(
            chunks,
            vec![
                ("Hello to both!".to_string(), String::new()),
                (String::new(), "stop".to_string())
            ]
        );
    }
}
