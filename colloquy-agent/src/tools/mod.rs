use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::clients::ToolDefinition;

pub mod runner;

pub use runner::{
    ConfirmationCallback, ConfirmationResponse, ExecutionMode, Termination, ToolCallLoop,
    ToolCallResult, ToolLoopError, ToolLoopOutcome,
};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Unknown tool: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    IoError(String),
    /// Stops the tool-call loop instead of being reported to the model.
    #[error("Fatal tool error: {0}")]
    Fatal(String),
}

impl ToolError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ToolError::Fatal(_))
    }
}

impl From<std::io::Error> for ToolError {
    fn from(error: std::io::Error) -> Self {
        ToolError::IoError(error.to_string())
    }
}

/// Runs named tools with JSON-encoded arguments.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, arguments: &str) -> Result<String, ToolError>;

    /// Whether `execute` may be called again before a previous call returns.
    fn supports_concurrency(&self) -> bool {
        true
    }

    /// Tools advertised to the model.
    fn catalog(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    #[serde(rename = "type")]
    pub param_type: String,
    pub description: String,
}

/// Fluent description of a function tool.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Vec<(String, Parameter)>,
    pub required: Vec<String>,
}

impl Tool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// `param_type` is a JSON schema type: string, number, boolean, object or array.
    pub fn parameter(
        mut self,
        name: impl Into<String>,
        param_type: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        let name = name.into();
        if required {
            self.required.push(name.clone());
        }
        self.parameters.push((
            name,
            Parameter {
                param_type: param_type.into(),
                description: description.into(),
            },
        ));
        self
    }

    pub fn definition(&self) -> ToolDefinition {
        let properties: serde_json::Map<String, Value> = self
            .parameters
            .iter()
            .map(|(name, param)| {
                (
                    name.clone(),
                    serde_json::json!({
                        "type": param.param_type,
                        "description": param.description,
                    }),
                )
            })
            .collect();

        let mut parameters = serde_json::json!({
            "type": "object",
            "properties": properties,
        });
        if !self.required.is_empty() {
            parameters["required"] = serde_json::json!(self.required);
        }

        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters,
        }
    }
}

pub trait ToolTrait: Send + Sync {
    fn info(&self) -> ToolDefinition;
    fn execute(&self, arguments: Value) -> BoxFuture<'static, Result<Value, ToolError>>;
}

type Handler = dyn Fn(Value) -> Result<Value, ToolError> + Send + Sync;

/// Tool backed by a plain function.
pub struct FunctionTool {
    tool: Tool,
    handler: Arc<Handler>,
}

impl FunctionTool {
    pub fn new<F>(tool: Tool, handler: F) -> Self
    where
        F: Fn(Value) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        Self {
            tool,
            handler: Arc::new(handler),
        }
    }
}

impl ToolTrait for FunctionTool {
    fn info(&self) -> ToolDefinition {
        self.tool.definition()
    }

    fn execute(&self, arguments: Value) -> BoxFuture<'static, Result<Value, ToolError>> {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move { handler(arguments) })
    }
}

/// Reads a required string argument.
pub fn string_arg<'a>(arguments: &'a Value, name: &str) -> Result<&'a str, ToolError> {
    arguments
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{}' argument", name)))
}

/// Local tool registry. Definitions are listed in registration order.
#[derive(Default)]
pub struct ToolManager {
    tools: HashMap<String, Arc<dyn ToolTrait>>,
    order: Vec<String>,
}

impl ToolManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn ToolTrait>) {
        let name = tool.info().name;
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
    }

    pub fn register_fn<F>(&mut self, tool: Tool, handler: F)
    where
        F: Fn(Value) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        self.register(Arc::new(FunctionTool::new(tool, handler)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolTrait>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn list(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn get_definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.info())
            .collect()
    }
}

#[async_trait]
impl ToolExecutor for ToolManager {
    async fn execute(&self, name: &str, arguments: &str) -> Result<String, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        let arguments: Value = if arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))?
        };

        match tool.execute(arguments).await? {
            Value::String(text) => Ok(text),
            Value::Null => Ok(String::new()),
            other => Ok(other.to_string()),
        }
    }

    fn catalog(&self) -> Vec<ToolDefinition> {
        self.get_definitions()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn say_hello_tool() -> Tool {
        Tool::new("say_hello")
            .description("Say hello to the given person name")
            .parameter("name", "string", "The name of the person to greet", true)
    }

    pub(crate) fn greeter() -> ToolManager {
        let mut manager = ToolManager::new();
        manager.register_fn(say_hello_tool(), |args| {
            let name = string_arg(&args, "name")?;
            Ok(serde_json::json!({ "message": format!("👋 Hello {}!🙂", name) }))
        });
        manager
    }
}
