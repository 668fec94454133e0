//! Core domain types for bimlink.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer: the tool contract, the engine, and hosts.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod document;

pub use document::{Document, DocumentError};

use serde::{Deserialize, Serialize};

// ============================================================================
// Tool Calling Types
// ============================================================================

/// Definition of a tool as advertised to the agent provider.
///
/// Follows the function calling schema used by the common providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The name of the tool (function name). Stable across versions.
    pub name: String,
    /// A description of what the tool does.
    pub description: String,
    /// JSON Schema describing the tool's parameters.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A tool invocation issued by the agent.
///
/// Immutable once received: the id correlates the invocation with its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call (used to match results).
    pub id: String,
    /// The name of the tool being called.
    pub name: String,
    /// The arguments to pass to the tool, as parsed JSON.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Inline image attached to a tool result (e.g. a rendered view).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    /// MIME type such as `image/png`.
    pub media_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

/// Terminal state of a tool invocation as reported to the agent.
///
/// `Cancelled` is not a failure: it lets the agent and UI render an interrupted
/// call differently from one that ran and failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
    Cancelled,
}

/// The result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The ID of the tool call this result is for.
    pub tool_call_id: String,
    /// The name of the tool that was called.
    pub tool_name: String,
    /// The result content, or the error message.
    pub content: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImagePayload>,
}

impl ToolResult {
    /// Create a successful tool result.
    pub fn success(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: content.into(),
            status: ToolStatus::Success,
            image: None,
        }
    }

    /// Create an error tool result.
    pub fn error(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: error.into(),
            status: ToolStatus::Error,
            image: None,
        }
    }

    /// Create a cancelled tool result.
    pub fn cancelled(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: reason.into(),
            status: ToolStatus::Cancelled,
            image: None,
        }
    }

    #[must_use]
    pub fn with_image(mut self, image: Option<ImagePayload>) -> Self {
        self.image = image;
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.status == ToolStatus::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_call_arguments_default_to_null() {
        let call: ToolCall = serde_json::from_value(json!({"id": "c1", "name": "get_levels"}))
            .expect("deserialize");
        assert_eq!(call.arguments, serde_json::Value::Null);
    }

    #[test]
    fn result_status_serializes_snake_case() {
        let result = ToolResult::cancelled("c1", "place_element", "Cancelled");
        let value = serde_json::to_value(&result).expect("serialize");
        assert_eq!(value["status"], "cancelled");
        assert!(value.get("image").is_none());
    }

    #[test]
    fn cancelled_is_neither_success_nor_error() {
        let result = ToolResult::cancelled("c1", "x", "stop");
        assert!(!result.is_success());
        assert!(!result.is_error());
        assert!(result.is_cancelled());
    }
}
