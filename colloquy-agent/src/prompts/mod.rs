use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::str::FromStr;

use crate::clients::Message;

/// System instructions given to the summarization agent.
pub const COMPRESSOR_SYSTEM_INSTRUCTIONS: &str = "You are a context compression assistant. Your task is to summarize conversations concisely, preserving key facts, decisions, and context needed for continuation.";

/// Fixed compaction instruction sent as the first user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionPrompt {
    #[default]
    Minimalist,
    Structured,
    UltraShort,
    ContinuityFocus,
}

impl CompressionPrompt {
    pub fn text(&self) -> &'static str {
        match self {
            CompressionPrompt::Minimalist => {
                "Summarize the conversation history concisely, preserving key facts, decisions, and context needed for continuation."
            }
            CompressionPrompt::Structured => {
                "Compress this conversation into a brief summary including:\n- Main topics discussed\n- Key decisions/conclusions\n- Important context for next exchanges\nKeep it under 200 words."
            }
            CompressionPrompt::UltraShort => {
                "Summarize this conversation: extract key facts, decisions, and essential context only."
            }
            CompressionPrompt::ContinuityFocus => {
                "Create a compact summary of this conversation that preserves all information needed to continue the discussion naturally."
            }
        }
    }
}

impl FromStr for CompressionPrompt {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "minimalist" => Ok(CompressionPrompt::Minimalist),
            "structured" => Ok(CompressionPrompt::Structured),
            "ultra_short" | "ultrashort" => Ok(CompressionPrompt::UltraShort),
            "continuity_focus" | "continuity" => Ok(CompressionPrompt::ContinuityFocus),
            other => Err(format!("unknown compression prompt: {}", other)),
        }
    }
}

/// Flattens a history into `role: content` lines under a `CONVERSATION:` header.
pub fn build_conversation_transcript(messages: &[Message]) -> String {
    let mut transcript = String::from("CONVERSATION:\n");
    for msg in messages {
        let _ = writeln!(transcript, "{}: {}", msg.role, msg.content);
    }
    transcript
}

/// Seeds the compressed history. With `preserved_instructions` the original
/// instruction is kept ahead of the summary in the same system message.
pub fn build_compressed_system_message(summary: &str, preserved_instructions: Option<&str>) -> String {
    match preserved_instructions {
        Some(instructions) if !instructions.trim().is_empty() => format!(
            "{}\n\n## Summary of the conversation so far\n{}",
            instructions.trim_end(),
            summary
        ),
        _ => summary.to_string(),
    }
}

pub const RAG_CONTEXT_SEPARATOR: &str = "\n---\n";

pub fn build_rag_context_prompt(context: &str) -> String {
    format!(
        "Relevant information to help you answer the question:\n{}",
        context
    )
}

pub fn build_tool_error_result(error: &str) -> String {
    serde_json::json!({ "error": format!("Function execution failed: {}", error) }).to_string()
}

pub fn build_tool_denied_result() -> String {
    serde_json::json!({
        "status": "denied",
        "message": "Tool execution was denied by user"
    })
    .to_string()
}

pub const EMPTY_TOOL_RESULT: &str = r#"{"error": "Function execution returned empty result"}"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MessageRole;

    #[test]
    fn test_transcript_format() {
        let messages = vec![
            Message::new(MessageRole::System, "be nice"),
            Message::user("hi"),
            Message::assistant("hello"),
        ];
        let transcript = build_conversation_transcript(&messages);
        assert_eq!(
            transcript,
            "CONVERSATION:\nsystem: be nice\nuser: hi\nassistant: hello\n"
        );
    }

    #[test]
    fn test_compressed_system_message() {
        assert_eq!(build_compressed_system_message("sum", None), "sum");
        assert_eq!(build_compressed_system_message("sum", Some("  ")), "sum");
        let kept = build_compressed_system_message("sum", Some("You are Bob"));
        assert!(kept.starts_with("You are Bob"));
        assert!(kept.ends_with("sum"));
    }

    #[test]
    fn test_compression_prompt_from_str() {
        assert_eq!(
            "ultra-short".parse::<CompressionPrompt>().unwrap(),
            CompressionPrompt::UltraShort
        );
        assert!("verbose".parse::<CompressionPrompt>().is_err());
        assert!(CompressionPrompt::default().text().starts_with("Summarize"));
    }

    #[test]
    fn test_tool_error_result_is_json() {
        let result = build_tool_error_result("boom \"quoted\"");
        let parsed: serde_json::Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["error"], "Function execution failed: boom \"quoted\"");
    }
}
