//! Progress reporting: one status comment per session, re-rendered from the
//! step log on every transition.

use std::sync::Arc;
use std::time::Duration;

use super::db::DbHandle;
use super::github::{CodeHost, CommentTarget, Reaction};
use super::models::{ErrorKind, Session, SessionState, Step, StepEntry, StepStatus};
use crate::errors::WorkflowError;

/// Render the status comment for a session. Pure: the same session always
/// renders to the same text.
pub fn render(session: &Session) -> String {
    if session
        .error
        .as_ref()
        .is_some_and(|e| e.kind == ErrorKind::Unauthorized)
    {
        return "Request rejected.".to_string();
    }

    let command = session
        .command
        .map(|c| c.as_str())
        .unwrap_or("request");
    let mut out = String::new();

    // An error recorded on a live session means it is on its way down.
    let stopping = !session.state.is_terminal() && session.error.is_some();
    let header = match session.state {
        SessionState::Completed => format!("✅ **{}** completed", command),
        SessionState::Failed => format!("❌ **{}** failed", command),
        SessionState::TimedOut => format!("⏱️ **{}** timed out", command),
        SessionState::Cancelled => format!("🛑 **{}** cancelled", command),
        _ if stopping => format!("❌ **{}** stopping", command),
        _ => format!("🤖 **{}** running", command),
    };
    out.push_str(&header);
    out.push_str("\n\n");

    for step in Step::ALL {
        out.push_str(&render_row(step, latest_entry(&session.step_log, step)));
        out.push('\n');
    }
    out.push('\n');

    match session.state {
        SessionState::Completed => {
            match &session.pr_url {
                Some(url) => out.push_str(&format!("🔗 [View PR]({})\n\n", url)),
                None if session.command.is_some_and(|c| !c.pushes_changes()) => {
                    out.push_str("Review posted.\n\n")
                }
                None => out.push_str("No changes were produced.\n\n"),
            }
        }
        SessionState::Failed | SessionState::TimedOut => render_error(session, &mut out),
        _ if stopping => render_error(session, &mut out),
        _ => {}
    }

    out.push_str(&format!("_Session: {}_", session.id));
    out
}

fn render_error(session: &Session, out: &mut String) {
    if let Some(error) = &session.error {
        out.push_str("```\n");
        out.push_str(error.message.trim_end());
        out.push_str("\n```\n\n");
        if error.retryable {
            out.push_str("This can be retried by triggering the command again.\n\n");
        }
    }
}

fn latest_entry(log: &[StepEntry], step: Step) -> Option<&StepEntry> {
    log.iter().rev().find(|e| e.step == step)
}

fn render_row(step: Step, entry: Option<&StepEntry>) -> String {
    let label = step.label();
    let Some(entry) = entry else {
        return format!("- [ ] {}", label);
    };
    match entry.status {
        StepStatus::Done => {
            let secs = entry.duration_ms.unwrap_or(0) / 1000;
            match &entry.detail {
                Some(detail) => format!("- [x] {} ({}s): {}", label, secs, detail),
                None => format!("- [x] {} ({}s)", label, secs),
            }
        }
        StepStatus::Running => format!("- [ ] {} ← running", label),
        StepStatus::Failed => format!("- [ ] {} ← failed", label),
        StepStatus::Interrupted => match &entry.detail {
            Some(detail) => format!("- [ ] {} ↻ {}", label, detail),
            None => format!("- [ ] {} ↻ interrupted", label),
        },
    }
}

/// Pushes rendered status to the code host. Never fails the workflow.
#[derive(Clone)]
pub struct ProgressReporter {
    host: Arc<dyn CodeHost>,
    store: DbHandle,
    /// A host call slower than this is abandoned.
    timeout: Duration,
}

impl ProgressReporter {
    pub fn new(host: Arc<dyn CodeHost>, store: DbHandle, timeout: Duration) -> Self {
        Self {
            host,
            store,
            timeout,
        }
    }

    /// Post or edit the status comment. Returns the comment id on success;
    /// failures are logged and left for the next transition to retry.
    pub async fn update(&self, session: &Session) -> Option<u64> {
        let body = render(session);
        let target = CommentTarget {
            repo: session.repo.clone(),
            number: session.scope_number(),
            comment_id: session.progress_comment_id,
        };
        let posted = tokio::time::timeout(
            self.timeout,
            self.host.post_or_update_comment(&target, &body),
        )
        .await
        .unwrap_or_else(|_| {
            Err(anyhow::anyhow!(
                "comment update timed out after {:?}",
                self.timeout
            ))
        });
        match posted {
            Ok(id) => {
                if session.progress_comment_id != Some(id) {
                    let session_id = session.id.clone();
                    if let Err(e) = self
                        .store
                        .call(move |db| db.set_progress_comment(&session_id, id))
                        .await
                    {
                        tracing::warn!(session_id = %session.id, error = %format!("{:#}", e), "Failed to record progress comment id");
                    }
                }
                Some(id)
            }
            Err(e) => {
                let err = WorkflowError::Reporting {
                    message: format!("{:#}", e),
                };
                tracing::warn!(session_id = %session.id, error = %err, "Progress update failed");
                None
            }
        }
    }

    /// React on the trigger comment, best effort.
    pub async fn react(&self, session: &Session, reaction: Reaction) {
        let Some(comment_id) = session.comment_id else {
            return;
        };
        let added = tokio::time::timeout(
            self.timeout,
            self.host.add_reaction(&session.repo, comment_id, reaction),
        )
        .await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("reaction timed out after {:?}", self.timeout)));
        if let Err(e) = added {
            tracing::debug!(session_id = %session.id, reaction = reaction.as_str(), error = %format!("{:#}", e), "Failed to add reaction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::models::{ErrorRecord, WorkflowCommand};

    fn session(state: SessionState, log: Vec<StepEntry>) -> Session {
        Session {
            id: "s-1".into(),
            repo: "acme/widgets".into(),
            issue: 42,
            pr: None,
            command: Some(WorkflowCommand::Plan),
            instruction: None,
            state,
            sandbox_ref: None,
            branch: Some("relay/issue-42-plan".into()),
            checkpoint: None,
            author: "alice".into(),
            trigger_text: "@relay plan".into(),
            comment_id: Some(5),
            progress_comment_id: None,
            pr_url: None,
            error: None,
            step_log: log,
            created_at: "2024-01-01T00:00:00.000Z".into(),
            updated_at: "2024-01-01T00:00:00.000Z".into(),
            terminal_at: None,
        }
    }

    fn done(step: Step, ms: u64) -> Vec<StepEntry> {
        vec![
            StepEntry::running(step),
            StepEntry::closed(step, StepStatus::Done, ms, None),
        ]
    }

    #[test]
    fn test_render_running_session() {
        let mut log = done(Step::Authorize, 20);
        log.extend(done(Step::ConcurrencyCheck, 1500));
        log.push(StepEntry::running(Step::Provision));
        let text = render(&session(SessionState::SandboxProvisioning, log));

        assert!(text.starts_with("🤖 **plan** running\n\n"));
        assert!(text.contains("- [x] Authorize sender (0s)\n"));
        assert!(text.contains("- [x] Check for active session (1s)\n"));
        assert!(text.contains("- [ ] Provision sandbox ← running\n"));
        assert!(text.contains("- [ ] Run agent\n"));
        assert!(text.ends_with("_Session: s-1_"));
    }

    #[test]
    fn test_render_is_idempotent() {
        let s = session(SessionState::AgentRunning, done(Step::Authorize, 10));
        assert_eq!(render(&s), render(&s));
    }

    #[test]
    fn test_render_interrupted_agent_after_reboot() {
        let mut log = done(Step::Agent, 3_600_000);
        log.pop();
        log.push(StepEntry::closed(
            Step::Agent,
            StepStatus::Interrupted,
            3_480_000,
            Some("checkpoint 1/2, rebooting".into()),
        ));
        log.push(StepEntry::running(Step::Provision));
        let text = render(&session(SessionState::SandboxProvisioning, log));
        assert!(text.contains("- [ ] Run agent ↻ checkpoint 1/2, rebooting"));
        assert!(text.contains("- [ ] Provision sandbox ← running"));
    }

    #[test]
    fn test_render_completed_with_pr() {
        let mut s = session(SessionState::Completed, done(Step::Publish, 2000));
        s.pr_url = Some("https://github.com/acme/widgets/pull/7".into());
        let text = render(&s);
        assert!(text.starts_with("✅ **plan** completed"));
        assert!(text.contains("🔗 [View PR](https://github.com/acme/widgets/pull/7)"));
        assert!(text.contains("- [x] Publish changes (2s)"));
    }

    #[test]
    fn test_render_completed_without_changes() {
        let text = render(&session(SessionState::Completed, Vec::new()));
        assert!(text.contains("No changes were produced."));
    }

    #[test]
    fn test_render_failed_shows_error() {
        let mut log = vec![StepEntry::running(Step::Publish)];
        log.push(StepEntry::closed(Step::Publish, StepStatus::Failed, 10, None));
        let mut s = session(SessionState::Failed, log);
        s.error = Some(ErrorRecord {
            kind: ErrorKind::PushConflict,
            message: "Push to relay/issue-42-plan rejected".into(),
            retryable: false,
        });
        let text = render(&s);
        assert!(text.starts_with("❌ **plan** failed"));
        assert!(text.contains("- [ ] Publish changes ← failed"));
        assert!(text.contains("```\nPush to relay/issue-42-plan rejected\n```"));
        assert!(!text.contains("retried"));
    }

    #[test]
    fn test_render_error_on_live_session() {
        let mut s = session(SessionState::AgentRunning, done(Step::Agent, 10));
        s.error = Some(ErrorRecord {
            kind: ErrorKind::AgentCrashed,
            message: "agent exited with status 137".into(),
            retryable: false,
        });
        let text = render(&s);
        assert!(text.starts_with("❌ **plan** stopping"));
        assert!(text.contains("```\nagent exited with status 137\n```"));
    }

    #[tokio::test]
    async fn test_update_gives_up_on_hanging_host() {
        use crate::workflow::db::SessionDb;
        use crate::workflow::testing::FakeCodeHost;

        let host = Arc::new(FakeCodeHost::new().with_stalled_writes());
        let store = DbHandle::new(SessionDb::new_in_memory().unwrap());
        let reporter = ProgressReporter::new(host.clone(), store, Duration::from_millis(50));
        let s = session(SessionState::AgentRunning, Vec::new());

        let started = std::time::Instant::now();
        assert_eq!(reporter.update(&s).await, None);
        reporter.react(&s, Reaction::Eyes).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(host.comments().is_empty());
    }

    #[test]
    fn test_render_timed_out_and_cancelled_headers() {
        assert!(render(&session(SessionState::TimedOut, Vec::new())).starts_with("⏱️ **plan** timed out"));
        assert!(render(&session(SessionState::Cancelled, Vec::new())).starts_with("🛑 **plan** cancelled"));
    }

    #[test]
    fn test_render_unauthorized_is_generic() {
        let mut s = session(SessionState::Failed, done(Step::Authorize, 1));
        s.command = None;
        s.error = Some(ErrorRecord {
            kind: ErrorKind::Unauthorized,
            message: "Request rejected".into(),
            retryable: false,
        });
        assert_eq!(render(&s), "Request rejected.");
    }

    #[test]
    fn test_render_unknown_command() {
        let mut s = session(SessionState::Failed, Vec::new());
        s.command = None;
        assert!(render(&s).starts_with("❌ **request** failed"));
    }
}
