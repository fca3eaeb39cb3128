//! Interactive confirmation on the terminal.

use async_trait::async_trait;
use std::io::Write;
use tokio_util::sync::CancellationToken;

use crate::error::{KeelError, PipelineError, Result};
use crate::pipeline::ApprovalGate;
use crate::planner::ChangePlan;

/// Asks a question on stderr and reads one line from stdin.
fn ask(question: &str) -> Result<String> {
    eprint!("{question}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// Asks `question` on a blocking thread, giving up when `cancel` fires.
///
/// Returns `None` if cancelled before an answer arrived.
///
/// # Errors
///
/// Returns an error if the terminal cannot be read.
pub async fn ask_cancellable(
    question: &str,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    if cancel.is_cancelled() {
        return Ok(None);
    }
    let question = question.to_string();
    let answer = tokio::task::spawn_blocking(move || ask(&question));

    tokio::select! {
        biased;
        () = cancel.cancelled() => Ok(None),
        answer = answer => answer
            .map_err(|e| KeelError::internal(format!("prompt task failed: {e}")))?
            .map(Some),
    }
}

/// Returns true if the answer to `question` is `y`; false if cancelled.
///
/// # Errors
///
/// Returns an error if the terminal cannot be read.
pub async fn confirm_cancellable(question: &str, cancel: &CancellationToken) -> Result<bool> {
    let answer = ask_cancellable(&format!("{question} [y/N]: "), cancel).await?;
    Ok(answer.is_some_and(|a| a.eq_ignore_ascii_case("y")))
}

/// Approval gate that asks on the terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptApproval;

#[async_trait]
impl ApprovalGate for PromptApproval {
    async fn approve(
        &self,
        plan: &ChangePlan,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), PipelineError> {
        let question = format!("{plan}\nApply this plan to '{}'? [y/N]: ", plan.environment);

        match ask_cancellable(&question, cancel).await {
            Ok(None) => Err(PipelineError::Cancelled),
            Ok(Some(answer)) if answer.eq_ignore_ascii_case("y") => Ok(()),
            Ok(Some(_)) => Err(PipelineError::ApprovalRejected {
                reason: String::from("declined at prompt"),
            }),
            Err(err) => Err(PipelineError::ApprovalRejected {
                reason: format!("could not read answer: {err}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_prompt_gives_up() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let answer = ask_cancellable("Continue? ", &cancel).await.expect("no error");
        assert!(answer.is_none());
        assert!(!confirm_cancellable("Continue?", &cancel).await.expect("no error"));
    }

    #[tokio::test]
    async fn test_cancelled_gate_reports_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let plan = ChangePlan::new("prod", Vec::new());

        let err = PromptApproval.approve(&plan, &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
