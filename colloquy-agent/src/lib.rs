pub mod clients;
pub mod config;
pub mod core;
pub mod mcp;
pub mod memory;
pub mod prompts;
pub mod rag;
pub mod tools;

pub use clients::{
    CompletionRequest, CompletionResponse, FinishReason, GenerationParams, LLMClient, LLMError,
    Message, MessageRole, OpenAIClient, SharedClient, StreamChunk, ToolCall, ToolDefinition,
    Usage, create_llm_client,
};
pub use config::{AgentConfig, ConfigError};
pub use core::{
    AgentError, CallbackError, ConversationSession, GenerationResult, StopHandle, StreamingEngine,
    Telemetry, TelemetryCallback,
};
pub use mcp::{MCPConfig, MCPError, MCPManager, load_mcp_config};
pub use memory::{CompressionTrigger, ContextCompressor, ConversationHistory};
pub use rag::{EmbeddingRecord, SearchResult, StoreError, VectorStore};
pub use tools::{
    ExecutionMode, Tool, ToolCallLoop, ToolError, ToolExecutor, ToolLoopOutcome, ToolManager,
};
