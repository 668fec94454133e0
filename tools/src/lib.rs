//! Tool contract, registry, and reference model tools.

pub mod builtins;

use std::collections::HashMap;
use std::future::Future;
use std::iter::Peekable;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use base64::Engine as _;
use bimlink_types::{Document, ImagePayload, ToolDefinition};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Tool execution future type alias.
///
/// Tools run on the document thread, so the future is not required to be `Send`.
pub type ToolFut<'a> = Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + 'a>>;

/// Successful tool output.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub image: Option<ImagePayload>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            image: None,
        }
    }

    /// Attach raw image bytes, base64-encoding them for the wire.
    #[must_use]
    pub fn with_image(mut self, media_type: impl Into<String>, bytes: &[u8]) -> Self {
        self.image = Some(ImagePayload {
            media_type: media_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        });
        self
    }
}

/// Error types for tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Bad tool args: {message}")]
    BadArgs { message: String },
    #[error("Tool timed out: {tool} (after {}s)", elapsed.as_secs())]
    Timeout { tool: String, elapsed: Duration },
    #[error("Tool execution failed: {tool}: {message}")]
    ExecutionFailed { tool: String, message: String },
    #[error("Unknown tool '{name}'. Available tools: {}", available.join(", "))]
    UnknownTool {
        name: String,
        available: Vec<String>,
    },
    #[error("Duplicate tool registered: {name}")]
    DuplicateTool { name: String },
    #[error("Duplicate tool call id: {id}")]
    DuplicateToolCallId { id: String },
    #[error("Limit exceeded: {message}")]
    LimitExceeded { message: String },
    #[error("Tool '{tool}' cannot use this document: {message}")]
    UnsupportedDocument { tool: String, message: String },
    #[error("Cancelled")]
    Cancelled,
}

/// Per-call tool context, built on the document thread.
pub struct ToolCtx<'d> {
    pub document: &'d mut dyn Document,
    pub tool_call_id: String,
    pub cancel: CancellationToken,
}

impl ToolCtx<'_> {
    /// Downcast the opaque document handle to the concrete host model.
    pub fn document_as<T: Document + 'static>(&mut self, tool: &str) -> Result<&mut T, ToolError> {
        let title = self.document.title().to_string();
        self.document
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| ToolError::UnsupportedDocument {
                tool: tool.to_string(),
                message: format!("'{title}' is not a supported model type"),
            })
    }

    pub fn check_cancelled(&self) -> Result<(), ToolError> {
        if self.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        Ok(())
    }
}

/// A named capability the agent can invoke.
pub trait ToolExecutor: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn schema(&self) -> Value;
    /// Whether invoking this tool mutates the document.
    fn requires_transaction(&self) -> bool;
    /// Whether this tool is destructive enough to need human approval.
    fn requires_confirmation(&self) -> bool {
        false
    }
    /// What the call would do, used for dry runs and approval prompts.
    fn dry_run_description(&self, args: &Value) -> String {
        format!("Would execute '{}' with arguments {args}", self.name())
    }
    fn timeout(&self) -> Option<Duration> {
        None
    }
    fn execute<'a>(&'a self, args: Value, ctx: &'a mut ToolCtx<'_>) -> ToolFut<'a>;
}

pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, ToolError> {
    serde_json::from_value(args.clone()).map_err(|e| ToolError::BadArgs {
        message: e.to_string(),
    })
}

/// Tool registry.
///
/// Append-only: tools are registered at startup and never removed. Lookups are
/// case-insensitive and may race with registration.
#[derive(Default)]
pub struct ToolRegistry {
    executors: RwLock<HashMap<String, Arc<dyn ToolExecutor>>>,
}

impl ToolRegistry {
    pub fn register(&self, executor: Arc<dyn ToolExecutor>) -> Result<(), ToolError> {
        let key = executor.name().to_ascii_lowercase();
        let mut executors = self
            .executors
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if executors.contains_key(&key) {
            return Err(ToolError::DuplicateTool {
                name: executor.name().to_string(),
            });
        }
        tracing::debug!(tool = executor.name(), "registered tool");
        executors.insert(key, executor);
        Ok(())
    }

    /// Case-insensitive lookup; `None` when not registered.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.executors
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    /// Like [`ToolRegistry::get`], but builds an error naming the available tools.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn ToolExecutor>, ToolError> {
        self.get(name).ok_or_else(|| ToolError::UnknownTool {
            name: name.to_string(),
            available: self.names(),
        })
    }

    /// Registered tool names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .executors
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .map(|exec| exec.name().to_string())
            .collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.executors
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of tool definitions for the agent provider, sorted by name.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .executors
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .map(|exec| ToolDefinition::new(exec.name(), exec.description(), exec.schema()))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

/// Validate arguments against a JSON schema.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), ToolError> {
    let validator = jsonschema::validator_for(schema).map_err(|e| ToolError::BadArgs {
        message: format!("Invalid tool schema: {e}"),
    })?;
    if let Err(err) = validator.validate(args) {
        return Err(ToolError::BadArgs {
            message: err.to_string(),
        });
    }
    Ok(())
}

/// Truncate tool output to the effective maximum length.
#[must_use]
pub fn truncate_output(output: String, effective_max: usize) -> String {
    if output.len() <= effective_max {
        return output;
    }
    let marker = "\n\n... [output truncated]";
    if effective_max <= marker.len() {
        return marker[..effective_max].to_string();
    }
    let max_body = effective_max - marker.len();
    let mut end = max_body;
    while end > 0 && !output.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = output;
    truncated.truncate(end);
    truncated.push_str(marker);
    truncated
}

const ESC: char = '\x1b';
const BEL: char = '\x07';

/// Strip terminal escape sequences and control characters from tool output.
///
/// Newlines and tabs survive; everything else in C0/C1 and DEL is dropped.
/// OSC payloads (hyperlinks, titles, clipboard writes) are dropped with their
/// sequence, up to BEL or ST.
#[must_use]
pub fn sanitize_output(output: &str) -> String {
    let mut clean = String::with_capacity(output.len());
    let mut chars = output.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            ESC => skip_escape_sequence(&mut chars),
            '\n' | '\t' => clean.push(ch),
            // C1 CSI
            '\u{009b}' => skip_csi_params(&mut chars),
            c if c.is_control() => {}
            c => clean.push(c),
        }
    }
    clean
}

fn skip_escape_sequence<I: Iterator<Item = char>>(chars: &mut Peekable<I>) {
    let Some(&next) = chars.peek() else {
        return;
    };
    match next {
        '[' => {
            chars.next();
            skip_csi_params(chars);
        }
        ']' => {
            chars.next();
            skip_osc_sequence(chars);
        }
        // DCS, PM, APC
        'P' | '^' | '_' => {
            chars.next();
            skip_until_st(chars);
        }
        // Charset and line-attribute selections take one argument.
        '(' | ')' | '*' | '+' | '#' | ' ' => {
            chars.next();
            chars.next();
        }
        '7' | '8' | 'c' | 'D' | 'E' | 'H' | 'M' | 'N' | 'O' | 'Z' | '=' | '>' | '<' => {
            chars.next();
        }
        _ => {}
    }
}

/// Parameter and intermediate bytes, then one final byte in '@'..='~'.
fn skip_csi_params<I: Iterator<Item = char>>(chars: &mut Peekable<I>) {
    while let Some(&c) = chars.peek() {
        if ('@'..='~').contains(&c) {
            chars.next();
            return;
        } else if (' '..='?').contains(&c) {
            chars.next();
        } else {
            return;
        }
    }
}

fn skip_osc_sequence<I: Iterator<Item = char>>(chars: &mut Peekable<I>) {
    while let Some(c) = chars.next() {
        if c == BEL {
            return;
        }
        if c == ESC && chars.peek() == Some(&'\\') {
            chars.next();
            return;
        }
    }
}

fn skip_until_st<I: Iterator<Item = char>>(chars: &mut Peekable<I>) {
    while let Some(c) = chars.next() {
        if c == ESC && chars.peek() == Some(&'\\') {
            chars.next();
            return;
        }
    }
}
