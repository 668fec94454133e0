//! Dry-run substitution and confirmation gating.
//!
//! Dry run is checked before confirmation: a substituted call never prompts.
//! "Approve for session" lives in memory only and is keyed by tool name.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bimlink_tools::{ToolExecutor, sanitize_output};
use bimlink_types::{ToolCall, ToolResult};
use serde_json::Value;

use crate::util::truncate_with_ellipsis;

pub const DRY_RUN_PREFIX: &str = "[DRY RUN]";
pub const DENIED_BY_USER: &str = "Denied by user";
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

const SUMMARY_MAX_CHARS: usize = 200;

/// Global switches the host may flip at any time. Read once per dispatch.
#[derive(Debug, Default)]
pub struct SafetyFlags {
    dry_run: AtomicBool,
    skip_confirmations: AtomicBool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafetySnapshot {
    pub dry_run: bool,
    pub skip_confirmations: bool,
}

impl SafetyFlags {
    #[must_use]
    pub fn new(dry_run: bool, skip_confirmations: bool) -> Self {
        Self {
            dry_run: AtomicBool::new(dry_run),
            skip_confirmations: AtomicBool::new(skip_confirmations),
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run.load(Ordering::Relaxed)
    }

    pub fn set_dry_run(&self, enabled: bool) {
        self.dry_run.store(enabled, Ordering::Relaxed);
    }

    pub fn skip_confirmations(&self) -> bool {
        self.skip_confirmations.load(Ordering::Relaxed)
    }

    pub fn set_skip_confirmations(&self, enabled: bool) {
        self.skip_confirmations.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> SafetySnapshot {
        SafetySnapshot {
            dry_run: self.dry_run(),
            skip_confirmations: self.skip_confirmations(),
        }
    }
}

/// Confirmation request for a tool call.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub tool_call_id: String,
    pub tool_name: String,
    /// Sanitized, truncated dry-run description.
    pub summary: String,
    pub arguments: Value,
    /// False for calls listed in a batch prompt only for context.
    pub requires_confirmation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    /// Approve, and stop asking for these tools until the process exits.
    ApproveForSession,
    Deny,
}

impl ApprovalDecision {
    #[must_use]
    pub fn is_approved(self) -> bool {
        !matches!(self, ApprovalDecision::Deny)
    }
}

pub type ApprovalFut<'a> = Pin<Box<dyn Future<Output = ApprovalDecision> + Send + 'a>>;

/// The user-approval channel.
pub trait ApprovalHandler: Send + Sync {
    fn confirm<'a>(&'a self, request: &'a ConfirmationRequest) -> ApprovalFut<'a>;

    /// One combined prompt for a whole batch: all-approve or all-deny.
    fn confirm_batch<'a>(&'a self, requests: &'a [ConfirmationRequest]) -> ApprovalFut<'a>;
}

/// Answers every prompt the same way. For headless hosts.
#[derive(Debug, Clone, Copy)]
pub struct StaticApprover(pub ApprovalDecision);

impl ApprovalHandler for StaticApprover {
    fn confirm<'a>(&'a self, _request: &'a ConfirmationRequest) -> ApprovalFut<'a> {
        let decision = self.0;
        Box::pin(async move { decision })
    }

    fn confirm_batch<'a>(&'a self, _requests: &'a [ConfirmationRequest]) -> ApprovalFut<'a> {
        let decision = self.0;
        Box::pin(async move { decision })
    }
}

pub struct SafetyGate {
    flags: Arc<SafetyFlags>,
    approver: Arc<dyn ApprovalHandler>,
    session_allowed: Mutex<HashSet<String>>,
}

impl SafetyGate {
    pub fn new(flags: Arc<SafetyFlags>, approver: Arc<dyn ApprovalHandler>) -> Self {
        Self {
            flags,
            approver,
            session_allowed: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn flags(&self) -> &Arc<SafetyFlags> {
        &self.flags
    }

    fn allowed(&self) -> MutexGuard<'_, HashSet<String>> {
        self.session_allowed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn allow_for_session(&self, tool_name: &str) {
        tracing::info!(tool = tool_name, "tool approved for the rest of the session");
        self.allowed().insert(tool_name.to_lowercase());
    }

    #[must_use]
    pub fn is_session_allowed(&self, tool_name: &str) -> bool {
        self.allowed().contains(&tool_name.to_lowercase())
    }

    /// `Some` with a `[DRY RUN]` result when dry run applies to this call.
    #[must_use]
    pub fn dry_run_result(
        &self,
        call: &ToolCall,
        tool: &dyn ToolExecutor,
        snapshot: SafetySnapshot,
    ) -> Option<ToolResult> {
        if !snapshot.dry_run || !tool.requires_transaction() {
            return None;
        }
        let description = sanitize_output(&tool.dry_run_description(&call.arguments));
        tracing::debug!(tool = %call.name, id = %call.id, "dry run substituted");
        Some(ToolResult::success(
            call.id.clone(),
            call.name.clone(),
            format!("{DRY_RUN_PREFIX} {description}"),
        ))
    }

    #[must_use]
    pub fn needs_confirmation(&self, tool: &dyn ToolExecutor, snapshot: SafetySnapshot) -> bool {
        tool.requires_confirmation()
            && !snapshot.skip_confirmations
            && !self.is_session_allowed(tool.name())
    }

    /// Single-call confirmation. `Some` with the denial result when the user says no.
    pub async fn confirm(
        &self,
        call: &ToolCall,
        tool: &dyn ToolExecutor,
        snapshot: SafetySnapshot,
    ) -> Option<ToolResult> {
        if !self.needs_confirmation(tool, snapshot) {
            return None;
        }
        let request = confirmation_request(call, tool, true);
        match self.approver.confirm(&request).await {
            ApprovalDecision::Approve => None,
            ApprovalDecision::ApproveForSession => {
                self.allow_for_session(tool.name());
                None
            }
            ApprovalDecision::Deny => {
                tracing::info!(tool = %call.name, id = %call.id, "tool call denied by user");
                Some(ToolResult::error(
                    call.id.clone(),
                    call.name.clone(),
                    DENIED_BY_USER,
                ))
            }
        }
    }

    /// Batch confirmation. Prompts once, listing every call, if any call needs it.
    ///
    /// Returns `false` when the user denied the batch.
    pub async fn confirm_batch(
        &self,
        calls: &[(&ToolCall, &dyn ToolExecutor)],
        snapshot: SafetySnapshot,
    ) -> bool {
        let requests: Vec<ConfirmationRequest> = calls
            .iter()
            .map(|(call, tool)| {
                confirmation_request(call, *tool, self.needs_confirmation(*tool, snapshot))
            })
            .collect();
        if !requests.iter().any(|request| request.requires_confirmation) {
            return true;
        }

        let decision = self.approver.confirm_batch(&requests).await;
        if decision == ApprovalDecision::ApproveForSession {
            for request in requests.iter().filter(|r| r.requires_confirmation) {
                self.allow_for_session(&request.tool_name);
            }
        }
        if !decision.is_approved() {
            tracing::info!(calls = requests.len(), "tool batch denied by user");
        }
        decision.is_approved()
    }
}

fn confirmation_request(
    call: &ToolCall,
    tool: &dyn ToolExecutor,
    requires_confirmation: bool,
) -> ConfirmationRequest {
    let summary = sanitize_output(&tool.dry_run_description(&call.arguments));
    ConfirmationRequest {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        summary: truncate_with_ellipsis(&summary, SUMMARY_MAX_CHARS),
        arguments: call.arguments.clone(),
        requires_confirmation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bimlink_tools::builtins::{DeleteElementTool, GetLevelsTool, PlaceElementTool};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct CountingApprover {
        decision: ApprovalDecision,
        single: AtomicUsize,
        batch: Mutex<Vec<Vec<String>>>,
    }

    impl CountingApprover {
        fn new(decision: ApprovalDecision) -> Arc<Self> {
            Arc::new(Self {
                decision,
                single: AtomicUsize::new(0),
                batch: Mutex::new(Vec::new()),
            })
        }
    }

    impl ApprovalHandler for CountingApprover {
        fn confirm<'a>(&'a self, _request: &'a ConfirmationRequest) -> ApprovalFut<'a> {
            self.single.fetch_add(1, Ordering::SeqCst);
            let decision = self.decision;
            Box::pin(async move { decision })
        }

        fn confirm_batch<'a>(&'a self, requests: &'a [ConfirmationRequest]) -> ApprovalFut<'a> {
            self.batch
                .lock()
                .unwrap()
                .push(requests.iter().map(|r| r.tool_name.clone()).collect());
            let decision = self.decision;
            Box::pin(async move { decision })
        }
    }

    fn gate(approver: Arc<CountingApprover>) -> SafetyGate {
        SafetyGate::new(Arc::new(SafetyFlags::default()), approver)
    }

    fn delete_call() -> ToolCall {
        ToolCall::new("c1", "delete_element", json!({"element_id": 1}))
    }

    #[test]
    fn dry_run_only_applies_to_mutating_tools() {
        let gate = gate(CountingApprover::new(ApprovalDecision::Approve));
        let snapshot = SafetySnapshot {
            dry_run: true,
            skip_confirmations: false,
        };
        let place = ToolCall::new(
            "p1",
            "place_element",
            json!({"category": "Walls", "name": "Basic", "level": "Level 1"}),
        );
        let result = gate
            .dry_run_result(&place, &PlaceElementTool, snapshot)
            .unwrap();
        assert!(result.is_success());
        assert!(result.content.starts_with(DRY_RUN_PREFIX));

        let read = ToolCall::new("r1", "get_levels", json!({}));
        assert!(gate.dry_run_result(&read, &GetLevelsTool, snapshot).is_none());
        assert!(
            gate.dry_run_result(&place, &PlaceElementTool, SafetySnapshot::default())
                .is_none()
        );
    }

    #[tokio::test]
    async fn denial_produces_error_result() {
        let approver = CountingApprover::new(ApprovalDecision::Deny);
        let gate = gate(approver.clone());
        let result = gate
            .confirm(&delete_call(), &DeleteElementTool, SafetySnapshot::default())
            .await
            .unwrap();
        assert!(result.is_error());
        assert_eq!(result.content, DENIED_BY_USER);
        assert_eq!(approver.single.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skip_confirmations_bypasses_prompt() {
        let approver = CountingApprover::new(ApprovalDecision::Deny);
        let gate = gate(approver.clone());
        let snapshot = SafetySnapshot {
            dry_run: false,
            skip_confirmations: true,
        };
        assert!(
            gate.confirm(&delete_call(), &DeleteElementTool, snapshot)
                .await
                .is_none()
        );
        assert_eq!(approver.single.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn approve_for_session_stops_asking() {
        let approver = CountingApprover::new(ApprovalDecision::ApproveForSession);
        let gate = gate(approver.clone());
        for _ in 0..3 {
            assert!(
                gate.confirm(&delete_call(), &DeleteElementTool, SafetySnapshot::default())
                    .await
                    .is_none()
            );
        }
        assert_eq!(approver.single.load(Ordering::SeqCst), 1);
        assert!(gate.is_session_allowed("Delete_Element"));
    }

    #[tokio::test]
    async fn batch_prompts_once_listing_every_call() {
        let approver = CountingApprover::new(ApprovalDecision::Deny);
        let gate = gate(approver.clone());
        let place = ToolCall::new("p1", "place_element", json!({}));
        let delete = delete_call();
        let calls: [(&ToolCall, &dyn ToolExecutor); 2] =
            [(&place, &PlaceElementTool), (&delete, &DeleteElementTool)];
        let approved = gate.confirm_batch(&calls, SafetySnapshot::default()).await;
        assert!(!approved);
        let batches = approver.batch.lock().unwrap();
        assert_eq!(
            *batches,
            vec![vec!["place_element".to_string(), "delete_element".to_string()]]
        );
        assert_eq!(approver.single.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn batch_without_confirmable_tools_never_prompts() {
        let approver = CountingApprover::new(ApprovalDecision::Deny);
        let gate = gate(approver.clone());
        let a = ToolCall::new("a", "place_element", json!({}));
        let b = ToolCall::new("b", "get_levels", json!({}));
        let calls: [(&ToolCall, &dyn ToolExecutor); 2] =
            [(&a, &PlaceElementTool), (&b, &GetLevelsTool)];
        assert!(gate.confirm_batch(&calls, SafetySnapshot::default()).await);
        assert!(approver.batch.lock().unwrap().is_empty());
    }

    #[test]
    fn flags_snapshot_reflects_runtime_changes() {
        let flags = SafetyFlags::new(false, false);
        flags.set_dry_run(true);
        assert_eq!(
            flags.snapshot(),
            SafetySnapshot {
                dry_run: true,
                skip_confirmations: false
            }
        );
        flags.set_skip_confirmations(true);
        assert!(flags.snapshot().skip_confirmations);
    }
}
