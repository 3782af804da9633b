use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use crate::clients::GenerationParams;
use crate::memory::compression::DEFAULT_COMPRESSION_THRESHOLD;
use crate::prompts::CompressionPrompt;
use crate::tools::runner::ExecutionMode;

pub const DEFAULT_ENGINE_URL: &str = "http://localhost:12434/engines/llama.cpp/v1";
pub const DEFAULT_CHAT_MODEL: &str = "ai/qwen2.5:1.5B-F16";
pub const DEFAULT_EMBEDDING_MODEL: &str = "ai/mxbai-embed-large";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Every knob a session reads. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub engine_url: String,
    pub api_key: Option<String>,
    pub session_name: String,
    pub system_instructions: String,

    pub chat_model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,

    /// Summarization model. Compression is disabled when unset.
    pub compressor_model: Option<String>,
    pub compression_threshold: usize,
    pub compression_prompt: CompressionPrompt,
    pub preserve_system_instructions: bool,

    pub keep_history: bool,

    pub max_tool_rounds: usize,
    pub parallel_tool_calls: bool,
    pub tool_execution: ExecutionMode,

    pub embedding_model: String,
    pub min_similarity: f32,
    pub top_n: usize,
    pub chunk_size: usize,
    pub store_path: PathBuf,
    pub documents_path: PathBuf,

    pub mcp_config_path: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            engine_url: DEFAULT_ENGINE_URL.to_string(),
            api_key: None,
            session_name: "colloquy".to_string(),
            system_instructions: String::new(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            compressor_model: None,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            compression_prompt: CompressionPrompt::default(),
            preserve_system_instructions: false,
            keep_history: true,
            max_tool_rounds: 10,
            parallel_tool_calls: false,
            tool_execution: ExecutionMode::Sequential,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            min_similarity: 0.6,
            top_n: 3,
            chunk_size: 1024,
            store_path: PathBuf::from("./store/vectors.json"),
            documents_path: PathBuf::from("./data"),
            mcp_config_path: PathBuf::from("mcp.json"),
        }
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string()))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(key, format!("expected a boolean, got {:?}", other))),
    }
}

impl AgentConfig {
    /// Reads `.env` (if present) and then the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        Self::default().merge_vars(|key| std::env::var(key).ok())
    }

    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AgentConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlays variables from `lookup` onto `self`.
    pub fn merge_vars<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("ENGINE_URL") {
            self.engine_url = v;
        }
        if let Some(v) = var("OPENAI_API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = var("SESSION_NAME") {
            self.session_name = v;
        }
        if let Some(v) = var("SYSTEM_INSTRUCTIONS") {
            self.system_instructions = v;
        }
        if let Some(v) = var("CHAT_MODEL") {
            self.chat_model = v;
        }
        if let Some(v) = var("TEMPERATURE") {
            self.temperature = Some(parse_var("TEMPERATURE", &v)?);
        }
        if let Some(v) = var("TOP_P") {
            self.top_p = Some(parse_var("TOP_P", &v)?);
        }
        if let Some(v) = var("MAX_TOKENS") {
            self.max_tokens = Some(parse_var("MAX_TOKENS", &v)?);
        }
        if let Some(v) = var("COMPRESSOR_MODEL") {
            self.compressor_model = Some(v);
        }
        if let Some(v) = var("CONTEXT_COMPRESSING_THRESHOLD") {
            self.compression_threshold = parse_var("CONTEXT_COMPRESSING_THRESHOLD", &v)?;
        }
        if let Some(v) = var("COMPRESSION_PROMPT") {
            self.compression_prompt = v
                .parse()
                .map_err(|e: String| ConfigError::invalid("COMPRESSION_PROMPT", e))?;
        }
        if let Some(v) = var("PRESERVE_SYSTEM_INSTRUCTIONS") {
            self.preserve_system_instructions = parse_bool("PRESERVE_SYSTEM_INSTRUCTIONS", &v)?;
        }
        if let Some(v) = var("KEEP_HISTORY") {
            self.keep_history = parse_bool("KEEP_HISTORY", &v)?;
        }
        if let Some(v) = var("MAX_TOOL_ROUNDS") {
            self.max_tool_rounds = parse_var("MAX_TOOL_ROUNDS", &v)?;
        }
        if let Some(v) = var("PARALLEL_TOOL_CALLS") {
            self.parallel_tool_calls = parse_bool("PARALLEL_TOOL_CALLS", &v)?;
            self.tool_execution = if self.parallel_tool_calls {
                ExecutionMode::Parallel
            } else {
                ExecutionMode::Sequential
            };
        }
        if let Some(v) = var("EMBEDDING_MODEL") {
            self.embedding_model = v;
        }
        if let Some(v) = var("RAG_MIN_SIMILARITY") {
            self.min_similarity = parse_var("RAG_MIN_SIMILARITY", &v)?;
        }
        if let Some(v) = var("RAG_TOP_N") {
            self.top_n = parse_var("RAG_TOP_N", &v)?;
        }
        if let Some(v) = var("RAG_CHUNK_SIZE") {
            self.chunk_size = parse_var("RAG_CHUNK_SIZE", &v)?;
        }
        if let Some(v) = var("RAG_STORE_PATH") {
            self.store_path = PathBuf::from(v);
        }
        if let Some(v) = var("RAG_DOCUMENTS_PATH") {
            self.documents_path = PathBuf::from(v);
        }
        if let Some(v) = var("MCP_CONFIG") {
            self.mcp_config_path = PathBuf::from(v);
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine_url.trim().is_empty() {
            return Err(ConfigError::invalid("engine_url", "must not be empty"));
        }
        if self.chat_model.trim().is_empty() {
            return Err(ConfigError::invalid("chat_model", "must not be empty"));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ConfigError::invalid("temperature", format!("{} is outside 0.0..=2.0", t)));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::invalid("top_p", format!("{} is outside 0.0..=1.0", p)));
            }
        }
        if self.compression_threshold == 0 {
            return Err(ConfigError::invalid("compression_threshold", "must be positive"));
        }
        if self.max_tool_rounds == 0 {
            return Err(ConfigError::invalid("max_tool_rounds", "must be at least 1"));
        }
        if !(-1.0..=1.0).contains(&self.min_similarity) {
            return Err(ConfigError::invalid(
                "min_similarity",
                format!("{} is outside -1.0..=1.0", self.min_similarity),
            ));
        }
        if self.top_n == 0 {
            return Err(ConfigError::invalid("top_n", "must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::invalid("chunk_size", "must be positive"));
        }
        Ok(())
    }

    pub fn chat_params(&self) -> GenerationParams {
        GenerationParams {
            model: self.chat_model.clone(),
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            parallel_tool_calls: None,
        }
    }

    /// Chat parameters plus the parallel-tool-calls flag sent with tool rounds.
    pub fn tool_params(&self) -> GenerationParams {
        self.chat_params()
            .with_parallel_tool_calls(self.parallel_tool_calls)
    }
}
