//! Tool dispatcher: runs one agent turn's tool calls against the document.
//!
//! ```text
//! plan ──▶ dry run ──▶ confirm ──▶ route ──┬─▶ grouped: one command, one group, N scopes
//!                                          └─▶ ungrouped: one command per call
//! ```
//!
//! Planning resolves everything that can fail without the document (limits,
//! duplicate ids, unknown tools, bad arguments) into independent error results.
//! Only what survives reaches the document thread. Results always come back in
//! input order, one per call.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bimlink_tools::{
    ToolCtx, ToolError, ToolExecutor, ToolRegistry, sanitize_output, truncate_output,
    validate_args,
};
use bimlink_types::{Document, ToolCall, ToolDefinition, ToolResult, ToolStatus};
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::marshal::{DocumentSession, Marshal, MarshalError};
use crate::safety::{CANCELLED_BY_USER, SafetyGate};
use crate::settings::ToolLimits;
use crate::transaction::TransactionManager;
use crate::util::panic_payload_to_string;

pub const NO_DOCUMENT_MESSAGE: &str = "No document is open. Open a model and retry.";
pub const SKIPPED_PREFIX: &str = "Skipped due to earlier failure";

const BATCH_DENIED_MESSAGE: &str = "Cancelled by user: the batch was denied";

/// What happened to the batch as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchDisposition {
    /// Every call succeeded; the group became one undo entry.
    Committed,
    /// `failed_call_id` failed; the group was reverted and later calls skipped.
    RolledBack { failed_call_id: String },
    /// Calls ran in their own scopes, or nothing needed the document.
    Ungrouped,
    /// The batch stopped early (denial, cancellation, no document, channel down).
    Aborted { reason: String },
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub results: Vec<ToolResult>,
    pub disposition: BatchDisposition,
}

struct PlannedCall {
    index: usize,
    call: ToolCall,
    tool: Arc<dyn ToolExecutor>,
}

enum DocumentRun {
    NoDocument,
    Ran {
        results: Vec<(usize, ToolResult)>,
        disposition: BatchDisposition,
    },
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    gate: Arc<SafetyGate>,
    marshal: Marshal,
    limits: ToolLimits,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        gate: Arc<SafetyGate>,
        marshal: Marshal,
        limits: ToolLimits,
    ) -> Self {
        Self {
            registry,
            gate,
            marshal,
            limits,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<SafetyGate> {
        &self.gate
    }

    /// Definitions of every registered tool, for the agent provider.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    /// Run a batch and return only the ordered results.
    pub async fn dispatch(&self, calls: Vec<ToolCall>, cancel: &CancellationToken) -> Vec<ToolResult> {
        self.dispatch_batch(calls, cancel).await.results
    }

    /// Run a batch. Never fails: every path ends in one result per call.
    pub async fn dispatch_batch(
        &self,
        calls: Vec<ToolCall>,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let heads: Vec<(String, String)> = calls
            .iter()
            .map(|call| (call.id.clone(), call.name.clone()))
            .collect();
        let snapshot = self.gate.flags().snapshot();
        tracing::debug!(calls = heads.len(), ?snapshot, "dispatching tool batch");

        if heads.is_empty() {
            return BatchOutcome {
                results: Vec::new(),
                disposition: BatchDisposition::Ungrouped,
            };
        }

        // Nothing is planned, described or confirmed against a missing document.
        match self.marshal.run(cancel, |ctx| Ok(ctx.has_document())).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("tool batch arrived with no document open");
                return no_document_outcome(&heads);
            }
            Err(err) => {
                tracing::warn!("document check did not complete: {err}");
                return BatchOutcome {
                    results: heads
                        .iter()
                        .map(|(id, name)| marshal_error_result(id, name, &err))
                        .collect(),
                    disposition: BatchDisposition::Aborted {
                        reason: err.to_string(),
                    },
                };
            }
        }

        let mut slots: Vec<Option<ToolResult>> = vec![None; heads.len()];
        let planned = self.plan(calls, &mut slots);

        let mut pending = Vec::with_capacity(planned.len());
        for planned in planned {
            match self
                .gate
                .dry_run_result(&planned.call, planned.tool.as_ref(), snapshot)
            {
                Some(result) => slots[planned.index] = Some(result),
                None => pending.push(planned),
            }
        }

        let mut denied = false;
        if pending.len() > 1 {
            let entries: Vec<(&ToolCall, &dyn ToolExecutor)> = pending
                .iter()
                .map(|planned| (&planned.call, planned.tool.as_ref()))
                .collect();
            if !self.gate.confirm_batch(&entries, snapshot).await {
                denied = true;
                for planned in pending.drain(..) {
                    slots[planned.index] = Some(ToolResult::error(
                        planned.call.id,
                        planned.call.name,
                        BATCH_DENIED_MESSAGE,
                    ));
                }
            }
        } else if let Some(planned) = pending.first()
            && let Some(result) = self
                .gate
                .confirm(&planned.call, planned.tool.as_ref(), snapshot)
                .await
        {
            denied = true;
            slots[planned.index] = Some(result);
            pending.clear();
        }

        let disposition = if pending.is_empty() {
            if denied {
                BatchDisposition::Aborted {
                    reason: "denied by user".to_string(),
                }
            } else {
                BatchDisposition::Ungrouped
            }
        } else {
            let grouped =
                pending.len() > 1 && pending.iter().any(|p| p.tool.requires_transaction());
            let run = if grouped {
                self.run_grouped(pending, cancel, &mut slots).await
            } else {
                self.run_each(pending, cancel, &mut slots).await
            };
            match run {
                Some(disposition) => disposition,
                None => {
                    tracing::warn!("document closed while the tool batch was being prepared");
                    return no_document_outcome(&heads);
                }
            }
        };

        let results = slots
            .into_iter()
            .zip(heads)
            .map(|(slot, (id, name))| {
                slot.unwrap_or_else(|| ToolResult::error(id, name, "Tool call produced no result"))
            })
            .collect();
        tracing::debug!(?disposition, "tool batch finished");
        BatchOutcome {
            results,
            disposition,
        }
    }

    /// Resolve calls that can be settled without the document.
    fn plan(&self, calls: Vec<ToolCall>, slots: &mut [Option<ToolResult>]) -> Vec<PlannedCall> {
        let mut seen_ids = HashSet::new();
        let mut planned = Vec::with_capacity(calls.len());

        for (index, mut call) in calls.into_iter().enumerate() {
            if index >= self.limits.max_tool_calls_per_batch {
                slots[index] = Some(tool_error_result(
                    &call,
                    ToolError::LimitExceeded {
                        message: format!(
                            "at most {} tool calls are allowed per batch",
                            self.limits.max_tool_calls_per_batch
                        ),
                    },
                ));
                continue;
            }

            if !seen_ids.insert(call.id.clone()) {
                slots[index] = Some(tool_error_result(
                    &call,
                    ToolError::DuplicateToolCallId {
                        id: call.id.clone(),
                    },
                ));
                continue;
            }

            let args_size = serde_json::to_vec(&call.arguments).map_or(0, |v| v.len());
            if args_size > self.limits.max_tool_args_bytes {
                slots[index] = Some(tool_error_result(
                    &call,
                    ToolError::LimitExceeded {
                        message: format!(
                            "tool arguments are {args_size} bytes, the limit is {}",
                            self.limits.max_tool_args_bytes
                        ),
                    },
                ));
                continue;
            }

            let tool = match self.registry.lookup(&call.name) {
                Ok(tool) => tool,
                Err(err) => {
                    slots[index] = Some(tool_error_result(&call, err));
                    continue;
                }
            };

            if call.arguments.is_null() {
                call.arguments = Value::Object(Map::new());
            }

            if self.limits.validate_args
                && let Err(err) = validate_args(&tool.schema(), &call.arguments)
            {
                slots[index] = Some(tool_error_result(&call, err));
                continue;
            }

            planned.push(PlannedCall { index, call, tool });
        }
        planned
    }

    /// One marshalled command wrapping a transaction group. `None` if no document is open.
    async fn run_grouped(
        &self,
        pending: Vec<PlannedCall>,
        cancel: &CancellationToken,
        slots: &mut [Option<ToolResult>],
    ) -> Option<BatchDisposition> {
        let heads: Vec<(usize, String, String)> = pending
            .iter()
            .map(|p| (p.index, p.call.id.clone(), p.call.name.clone()))
            .collect();
        let label = format!("Agent batch ({} tool calls)", pending.len());
        let limits = self.limits;
        let token = cancel.clone();

        let run = self
            .marshal
            .run(cancel, move |ctx| {
                let Some(session) = ctx.session() else {
                    return Ok(DocumentRun::NoDocument);
                };
                Ok(execute_grouped(session, &pending, &label, &token, limits))
            })
            .await;

        match run {
            Ok(DocumentRun::NoDocument) => None,
            Ok(DocumentRun::Ran {
                results,
                disposition,
            }) => {
                for (index, result) in results {
                    slots[index] = Some(result);
                }
                Some(disposition)
            }
            Err(err) => {
                tracing::warn!("grouped tool batch did not complete: {err}");
                for (index, id, name) in &heads {
                    slots[*index] = Some(marshal_error_result(id, name, &err));
                }
                Some(BatchDisposition::Aborted {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// One marshalled command per call, in order. `None` if no document is open.
    async fn run_each(
        &self,
        pending: Vec<PlannedCall>,
        cancel: &CancellationToken,
        slots: &mut [Option<ToolResult>],
    ) -> Option<BatchDisposition> {
        let mut unavailable: Option<MarshalError> = None;

        for planned in pending {
            let index = planned.index;
            let (id, name) = (planned.call.id.clone(), planned.call.name.clone());

            if let Some(err) = &unavailable {
                slots[index] = Some(marshal_error_result(&id, &name, err));
                continue;
            }
            if cancel.is_cancelled() {
                slots[index] = Some(ToolResult::cancelled(id, name, CANCELLED_BY_USER));
                continue;
            }

            let limits = self.limits;
            let token = cancel.clone();
            let run = self
                .marshal
                .run(cancel, move |ctx| {
                    let Some(DocumentSession {
                        document,
                        transactions,
                        runtime,
                    }) = ctx.session()
                    else {
                        return Ok(None);
                    };
                    Ok(Some(execute_call(
                        document,
                        transactions,
                        runtime,
                        &planned,
                        &token,
                        limits,
                    )))
                })
                .await;

            match run {
                Ok(Some(result)) => slots[index] = Some(result),
                Ok(None) => return None,
                Err(err) => {
                    slots[index] = Some(marshal_error_result(&id, &name, &err));
                    if let MarshalError::Unavailable { .. } = err {
                        tracing::warn!("document thread unavailable mid-batch: {err}");
                        unavailable = Some(err);
                    }
                }
            }
        }
        Some(match unavailable {
            Some(err) => BatchDisposition::Aborted {
                reason: err.to_string(),
            },
            None => BatchDisposition::Ungrouped,
        })
    }
}

fn execute_grouped(
    session: DocumentSession<'_>,
    calls: &[PlannedCall],
    label: &str,
    cancel: &CancellationToken,
    limits: ToolLimits,
) -> DocumentRun {
    let DocumentSession {
        document,
        transactions,
        runtime,
    } = session;
    let mut results = Vec::with_capacity(calls.len());

    if let Err(err) = transactions.start_group(document, label) {
        tracing::warn!("could not start transaction group: {err}");
        let message = format!("Could not start the batch transaction: {err}");
        return DocumentRun::Ran {
            results: calls
                .iter()
                .map(|p| {
                    let result = ToolResult::error(&p.call.id, &p.call.name, message.clone());
                    (p.index, result)
                })
                .collect(),
            disposition: BatchDisposition::Aborted { reason: message },
        };
    }

    for (position, planned) in calls.iter().enumerate() {
        if cancel.is_cancelled() {
            return cancel_group(document, transactions, results, &calls[position..]);
        }

        let result = execute_call(document, transactions, runtime, planned, cancel, limits);
        let status = result.status;
        results.push((planned.index, result));

        match status {
            ToolStatus::Success => {}
            ToolStatus::Cancelled => {
                return cancel_group(document, transactions, results, &calls[position + 1..]);
            }
            ToolStatus::Error => {
                match transactions.rollback_group(document) {
                    Ok(scopes) => tracing::info!(
                        label,
                        scopes,
                        failed = %planned.call.id,
                        "tool batch rolled back"
                    ),
                    Err(err) => {
                        tracing::warn!("group rollback failed: {err}");
                        transactions.ensure_group_closed(document);
                    }
                }
                let reason = format!(
                    "{SKIPPED_PREFIX}: '{}' ({}) failed",
                    planned.call.name, planned.call.id
                );
                for skipped in &calls[position + 1..] {
                    results.push((
                        skipped.index,
                        ToolResult::error(&skipped.call.id, &skipped.call.name, reason.clone()),
                    ));
                }
                return DocumentRun::Ran {
                    results,
                    disposition: BatchDisposition::RolledBack {
                        failed_call_id: planned.call.id.clone(),
                    },
                };
            }
        }
    }

    match transactions.commit_group(document) {
        Ok(scopes) => {
            tracing::info!(label, scopes, "tool batch committed");
            DocumentRun::Ran {
                results,
                disposition: BatchDisposition::Committed,
            }
        }
        Err(err) => {
            tracing::warn!("tool batch commit failed: {err}");
            let message = format!("Batch commit failed, all changes were reverted: {err}");
            let results = results
                .into_iter()
                .map(|(index, result)| {
                    let result = if result.is_success() {
                        ToolResult::error(result.tool_call_id, result.tool_name, message.clone())
                    } else {
                        result
                    };
                    (index, result)
                })
                .collect();
            DocumentRun::Ran {
                results,
                disposition: BatchDisposition::Aborted { reason: message },
            }
        }
    }
}

fn cancel_group(
    document: &mut dyn Document,
    transactions: &mut TransactionManager,
    mut results: Vec<(usize, ToolResult)>,
    remaining: &[PlannedCall],
) -> DocumentRun {
    transactions.ensure_group_closed(document);
    tracing::info!(remaining = remaining.len(), "tool batch cancelled; group rolled back");
    for planned in remaining {
        results.push((
            planned.index,
            ToolResult::cancelled(&planned.call.id, &planned.call.name, CANCELLED_BY_USER),
        ));
    }
    DocumentRun::Ran {
        results,
        disposition: BatchDisposition::Aborted {
            reason: "cancelled".to_string(),
        },
    }
}

/// Run one call, inside its own scope when the tool mutates.
fn execute_call(
    document: &mut dyn Document,
    transactions: &mut TransactionManager,
    runtime: &Runtime,
    planned: &PlannedCall,
    cancel: &CancellationToken,
    limits: ToolLimits,
) -> ToolResult {
    let call = &planned.call;
    let tool = planned.tool.as_ref();
    tracing::debug!(
        tool = %call.name,
        id = %call.id,
        mutates = tool.requires_transaction(),
        "executing tool call"
    );

    if !tool.requires_transaction() {
        return run_tool(document, runtime, call, tool, cancel, limits);
    }

    let mut scope = match transactions.start_transaction(document, tool.name()) {
        Ok(scope) => scope,
        Err(err) => {
            return ToolResult::error(
                &call.id,
                &call.name,
                format!("Could not open a transaction for '{}': {err}", call.name),
            );
        }
    };
    let result = run_tool(scope.document(), runtime, call, tool, cancel, limits);
    if !result.is_success() {
        // Dropping the scope rolls it back.
        drop(scope);
        return result;
    }
    match scope.commit() {
        Ok(()) => result,
        Err(err) => ToolResult::error(
            &call.id,
            &call.name,
            format!("'{}' ran but its changes could not be committed: {err}", call.name),
        ),
    }
}

fn run_tool(
    document: &mut dyn Document,
    runtime: &Runtime,
    call: &ToolCall,
    tool: &dyn ToolExecutor,
    cancel: &CancellationToken,
    limits: ToolLimits,
) -> ToolResult {
    let mut ctx = ToolCtx {
        document,
        tool_call_id: call.id.clone(),
        cancel: cancel.clone(),
    };
    let timeout = tool.timeout().unwrap_or(limits.default_timeout);
    // A panic while building the tool's future counts as a tool panic too.
    let exec_future =
        AssertUnwindSafe(async { tool.execute(call.arguments.clone(), &mut ctx).await })
            .catch_unwind();

    let outcome = runtime.block_on(async {
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = tokio::time::timeout(timeout, exec_future) => Some(result),
        }
    });

    match outcome {
        None => ToolResult::cancelled(&call.id, &call.name, CANCELLED_BY_USER),
        Some(Err(_elapsed)) => tool_error_result(
            call,
            ToolError::Timeout {
                tool: call.name.clone(),
                elapsed: timeout,
            },
        ),
        Some(Ok(Err(panic_payload))) => {
            let panic_msg = panic_payload_to_string(&panic_payload);
            let message = format!("Tool panicked: {panic_msg}");
            ToolResult::error(&call.id, &call.name, sanitize_output(&message))
        }
        Some(Ok(Ok(Ok(output)))) => {
            let content = truncate_output(sanitize_output(&output.content), limits.max_output_bytes);
            ToolResult::success(&call.id, &call.name, content).with_image(output.image)
        }
        Some(Ok(Ok(Err(err)))) => tool_error_result(call, err),
    }
}

fn no_document_outcome(heads: &[(String, String)]) -> BatchOutcome {
    BatchOutcome {
        results: heads
            .iter()
            .map(|(id, name)| ToolResult::error(id, name, NO_DOCUMENT_MESSAGE))
            .collect(),
        disposition: BatchDisposition::Aborted {
            reason: NO_DOCUMENT_MESSAGE.to_string(),
        },
    }
}

fn tool_error_result(call: &ToolCall, err: ToolError) -> ToolResult {
    if let ToolError::Cancelled = err {
        return ToolResult::cancelled(&call.id, &call.name, CANCELLED_BY_USER);
    }
    ToolResult::error(&call.id, &call.name, sanitize_output(&err.to_string()))
}

fn marshal_error_result(id: &str, name: &str, err: &MarshalError) -> ToolResult {
    match err {
        MarshalError::Cancelled => ToolResult::cancelled(id, name, CANCELLED_BY_USER),
        MarshalError::Faulted { message } => ToolResult::error(
            id,
            name,
            format!("'{name}' failed on the document thread: {message}"),
        ),
        MarshalError::Unavailable { reason } => {
            ToolResult::error(id, name, format!("Document thread unavailable: {reason}"))
        }
    }
}
