//! Typed error hierarchy for relay.
//!
//! `WorkflowError` carries every way a session can end badly. Each variant
//! maps onto a persisted [`ErrorRecord`] (kind, message, retryable flag) and
//! onto the terminal state the session lands in.

use relay_common::{ErrorKind, ErrorRecord, SessionState, WorkflowCommand};
use thiserror::Error;

/// Failures that end (or, for `Reporting`, annotate) a workflow session.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Request rejected")]
    Unauthorized,

    #[error("{}", unrecognized_message(.token.as_deref()))]
    UnrecognizedCommand { token: Option<String> },

    #[error("`{command}` {reason}")]
    InvalidScope {
        command: WorkflowCommand,
        reason: String,
    },

    #[error("Session {active_session} is already {state} for this scope")]
    ConcurrentSession {
        active_session: String,
        state: SessionState,
    },

    #[error("Failed to fetch context: {message}")]
    ContextFetch { message: String },

    #[error("Sandbox provisioning failed after {attempts} attempt(s): {message}")]
    SandboxProvisioning { attempts: u32, message: String },

    #[error("Agent did not finish within the execution budget after {reboots} reboot(s)")]
    AgentBudgetExceeded { reboots: u32 },

    #[error("Checkpoint capture failed: {message}")]
    CheckpointFailed { message: String },

    #[error("Agent crashed: {reason}")]
    AgentCrashed { reason: String },

    #[error("Push to {branch} rejected after re-fetching; manual resolution required")]
    PushConflict { branch: String },

    #[error("Publishing failed: {message}")]
    Publish { message: String },

    #[error("Progress update failed: {message}")]
    Reporting { message: String },

    #[error("Orchestrator restarted while the session was {state}")]
    OrchestratorRestart { state: SessionState },

    #[error("Session cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn unrecognized_message(token: Option<&str>) -> String {
    let valid = WorkflowCommand::ALL
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    match token {
        Some(token) => format!("Unrecognized command `{}`. Valid commands: {}", token, valid),
        None => format!("No command found. Valid commands: {}", valid),
    }
}

impl WorkflowError {
    /// Persisted kind, or `None` for cancellation (which is a state, not an error).
    pub fn kind(&self) -> Option<ErrorKind> {
        let kind = match self {
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::UnrecognizedCommand { .. } => ErrorKind::UnrecognizedCommand,
            Self::InvalidScope { .. } => ErrorKind::InvalidScope,
            Self::ConcurrentSession { .. } => ErrorKind::ConcurrentSession,
            Self::ContextFetch { .. } => ErrorKind::ContextFetch,
            Self::SandboxProvisioning { .. } => ErrorKind::SandboxProvisioning,
            Self::AgentBudgetExceeded { .. } | Self::CheckpointFailed { .. } => {
                ErrorKind::AgentBudgetExceeded
            }
            Self::AgentCrashed { .. } => ErrorKind::AgentCrashed,
            Self::PushConflict { .. } => ErrorKind::PushConflict,
            Self::Publish { .. } => ErrorKind::Publish,
            Self::Reporting { .. } => ErrorKind::Reporting,
            Self::OrchestratorRestart { .. } => ErrorKind::OrchestratorRestart,
            Self::Cancelled => return None,
            Self::Other(_) => ErrorKind::Internal,
        };
        Some(kind)
    }

    /// Whether re-triggering the same command later can be expected to work.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unauthorized
            | Self::UnrecognizedCommand { .. }
            | Self::InvalidScope { .. }
            | Self::PushConflict { .. }
            | Self::Cancelled
            | Self::Other(_) => false,
            Self::ConcurrentSession { .. }
            | Self::ContextFetch { .. }
            | Self::SandboxProvisioning { .. }
            | Self::AgentBudgetExceeded { .. }
            | Self::CheckpointFailed { .. }
            | Self::AgentCrashed { .. }
            | Self::Publish { .. }
            | Self::Reporting { .. }
            | Self::OrchestratorRestart { .. } => true,
        }
    }

    /// Terminal state a session enters when this error ends it.
    pub fn terminal_state(&self) -> SessionState {
        match self {
            Self::Cancelled => SessionState::Cancelled,
            Self::AgentBudgetExceeded { .. } => SessionState::TimedOut,
            _ => SessionState::Failed,
        }
    }

    pub fn to_record(&self) -> Option<ErrorRecord> {
        self.kind().map(|kind| ErrorRecord {
            kind,
            message: format!("{:#}", self),
            retryable: self.is_retryable(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_discloses_nothing() {
        let err = WorkflowError::Unauthorized;
        let msg = err.to_string();
        assert_eq!(msg, "Request rejected");
        for cmd in WorkflowCommand::ALL {
            assert!(!msg.contains(cmd.as_str()));
        }
        let record = err.to_record().unwrap();
        assert_eq!(record.kind, ErrorKind::Unauthorized);
        assert!(!record.retryable);
    }

    #[test]
    fn unrecognized_command_lists_valid_commands() {
        let err = WorkflowError::UnrecognizedCommand {
            token: Some("deploy".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("`deploy`"));
        assert!(msg.contains("plan"));
        assert!(msg.contains("codereview"));

        let err = WorkflowError::UnrecognizedCommand { token: None };
        assert!(err.to_string().starts_with("No command found"));
    }

    #[test]
    fn budget_exceeded_ends_in_timed_out() {
        let err = WorkflowError::AgentBudgetExceeded { reboots: 2 };
        assert_eq!(err.terminal_state(), SessionState::TimedOut);
        assert_eq!(err.kind(), Some(ErrorKind::AgentBudgetExceeded));
        assert!(err.to_string().contains("2 reboot"));
    }

    #[test]
    fn checkpoint_failure_is_a_budget_failure_but_not_a_timeout() {
        let err = WorkflowError::CheckpointFailed {
            message: "push rejected".into(),
        };
        assert_eq!(err.kind(), Some(ErrorKind::AgentBudgetExceeded));
        assert_eq!(err.terminal_state(), SessionState::Failed);
    }

    #[test]
    fn push_conflict_is_not_retryable() {
        let err = WorkflowError::PushConflict {
            branch: "relay/issue-1-build".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.terminal_state(), SessionState::Failed);
        assert!(err.to_string().contains("relay/issue-1-build"));
    }

    #[test]
    fn cancellation_has_no_error_record() {
        let err = WorkflowError::Cancelled;
        assert!(err.to_record().is_none());
        assert_eq!(err.terminal_state(), SessionState::Cancelled);
    }

    #[test]
    fn restart_recovery_is_retryable() {
        let err = WorkflowError::OrchestratorRestart {
            state: SessionState::AgentRunning,
        };
        let record = err.to_record().unwrap();
        assert_eq!(record.kind, ErrorKind::OrchestratorRestart);
        assert!(record.retryable);
        assert!(record.message.contains("agent_running"));
    }

    #[test]
    fn anyhow_errors_become_internal() {
        let err: WorkflowError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.kind(), Some(ErrorKind::Internal));
        assert!(matches!(err, WorkflowError::Other(_)));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn workflow_error_implements_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&WorkflowError::Unauthorized);
    }
}
