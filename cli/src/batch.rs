//! Batch files and the JSON report printed after a run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use bimlink_engine::{BatchDisposition, BatchOutcome};
use bimlink_types::{ToolCall, ToolResult};

/// A tool call as written in a batch file. The id may be left out.
#[derive(Debug, Deserialize)]
struct CallSpec {
    id: Option<String>,
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Either a list of turns or a single turn.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BatchFile {
    Turns(Vec<Vec<CallSpec>>),
    Single(Vec<CallSpec>),
}

/// Parse a batch file into turns of tool calls, assigning ids where missing.
pub fn parse_turns(raw: &str) -> Result<Vec<Vec<ToolCall>>> {
    let file: BatchFile = serde_json::from_str(raw)
        .context("batch file must be an array of tool calls or an array of turns")?;
    let turns = match file {
        BatchFile::Turns(turns) => turns,
        BatchFile::Single(calls) => vec![calls],
    };
    Ok(turns
        .into_iter()
        .map(|calls| calls.into_iter().map(into_call).collect())
        .collect())
}

fn into_call(spec: CallSpec) -> ToolCall {
    let id = spec
        .id
        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
    ToolCall::new(id, spec.name, spec.arguments)
}

#[derive(Debug, Serialize)]
pub struct TurnReport {
    pub turn: usize,
    pub disposition: BatchDisposition,
    pub results: Vec<ToolResult>,
}

impl TurnReport {
    pub fn new(turn: usize, outcome: BatchOutcome) -> Self {
        Self {
            turn,
            disposition: outcome.disposition,
            results: outcome.results,
        }
    }
}
