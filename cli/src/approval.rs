//! Confirmation prompts on the controlling terminal.

use std::io::{self, BufRead, Write};

use bimlink_engine::{ApprovalDecision, ApprovalFut, ApprovalHandler, ConfirmationRequest};

/// Asks on stderr, reads the answer from stdin.
///
/// Anything other than an explicit yes denies, including EOF and read errors.
pub struct TerminalApprover;

impl ApprovalHandler for TerminalApprover {
    fn confirm<'a>(&'a self, request: &'a ConfirmationRequest) -> ApprovalFut<'a> {
        let prompt = format!(
            "{} wants to run: {}\nAllow?",
            request.tool_name, request.summary
        );
        Box::pin(ask(prompt))
    }

    fn confirm_batch<'a>(&'a self, requests: &'a [ConfirmationRequest]) -> ApprovalFut<'a> {
        Box::pin(ask(batch_prompt(requests)))
    }
}

fn batch_prompt(requests: &[ConfirmationRequest]) -> String {
    let mut prompt = format!("The agent wants to run {} tool calls:\n", requests.len());
    for request in requests {
        let marker = if request.requires_confirmation { '*' } else { ' ' };
        prompt.push_str(&format!(
            " {marker} {}: {}\n",
            request.tool_name, request.summary
        ));
    }
    prompt.push_str("Allow the whole batch?");
    prompt
}

async fn ask(prompt: String) -> ApprovalDecision {
    match tokio::task::spawn_blocking(move || read_decision(&prompt)).await {
        Ok(Ok(decision)) => decision,
        Ok(Err(e)) => {
            tracing::warn!("failed to read confirmation answer: {e}");
            ApprovalDecision::Deny
        }
        Err(e) => {
            tracing::warn!("confirmation prompt task failed: {e}");
            ApprovalDecision::Deny
        }
    }
}

fn read_decision(prompt: &str) -> io::Result<ApprovalDecision> {
    {
        let mut stderr = io::stderr().lock();
        write!(stderr, "{prompt} [y]es / [a]lways / [N]o: ")?;
        stderr.flush()?;
    }
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(parse_decision(&line))
}

fn parse_decision(answer: &str) -> ApprovalDecision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ApprovalDecision::Approve,
        "a" | "always" => ApprovalDecision::ApproveForSession,
        _ => ApprovalDecision::Deny,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(name: &str, requires_confirmation: bool) -> ConfirmationRequest {
        ConfirmationRequest {
            tool_call_id: format!("call_{name}"),
            tool_name: name.to_string(),
            summary: format!("Would run {name}"),
            arguments: json!({}),
            requires_confirmation,
        }
    }

    #[test]
    fn answers_map_to_decisions() {
        assert_eq!(parse_decision("y\n"), ApprovalDecision::Approve);
        assert_eq!(parse_decision("  YES "), ApprovalDecision::Approve);
        assert_eq!(parse_decision("a"), ApprovalDecision::ApproveForSession);
        assert_eq!(parse_decision("always\r\n"), ApprovalDecision::ApproveForSession);
        assert_eq!(parse_decision(""), ApprovalDecision::Deny);
        assert_eq!(parse_decision("n"), ApprovalDecision::Deny);
        assert_eq!(parse_decision("sure"), ApprovalDecision::Deny);
    }

    #[test]
    fn batch_prompt_lists_every_call_and_marks_gated_ones() {
        let prompt = batch_prompt(&[
            request("place_element", false),
            request("delete_element", true),
        ]);
        assert!(prompt.starts_with("The agent wants to run 2 tool calls:"));
        assert!(prompt.contains("   place_element: Would run place_element"));
        assert!(prompt.contains(" * delete_element: Would run delete_element"));
        assert!(prompt.ends_with("Allow the whole batch?"));
    }
}
