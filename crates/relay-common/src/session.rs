use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Session states ────────────────────────────────────────────────────

/// Lifecycle state of a workflow session.
///
/// ```text
/// created → authorizing → concurrency_check → sandbox_provisioning
///     → context_injected → agent_running → result_extraction
///     → publishing → completed
///
/// agent_running → sandbox_provisioning   (checkpoint/reboot, crash retry)
/// any non-terminal → failed | timed_out | cancelled
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Authorizing,
    ConcurrencyCheck,
    SandboxProvisioning,
    ContextInjected,
    AgentRunning,
    ResultExtraction,
    Publishing,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl SessionState {
    pub const ALL: [SessionState; 12] = [
        Self::Created,
        Self::Authorizing,
        Self::ConcurrencyCheck,
        Self::SandboxProvisioning,
        Self::ContextInjected,
        Self::AgentRunning,
        Self::ResultExtraction,
        Self::Publishing,
        Self::Completed,
        Self::Failed,
        Self::TimedOut,
        Self::Cancelled,
    ];

    /// States a session occupies once it has been admitted for its scope.
    /// At most one session per scope may be in any of these at a time.
    pub const ADMITTED: [SessionState; 5] = [
        Self::SandboxProvisioning,
        Self::ContextInjected,
        Self::AgentRunning,
        Self::ResultExtraction,
        Self::Publishing,
    ];

    pub const TERMINAL: [SessionState; 4] = [
        Self::Completed,
        Self::Failed,
        Self::TimedOut,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Authorizing => "authorizing",
            Self::ConcurrencyCheck => "concurrency_check",
            Self::SandboxProvisioning => "sandbox_provisioning",
            Self::ContextInjected => "context_injected",
            Self::AgentRunning => "agent_running",
            Self::ResultExtraction => "result_extraction",
            Self::Publishing => "publishing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    pub fn is_admitted(&self) -> bool {
        Self::ADMITTED.contains(self)
    }

    /// Whether `self → next` is an edge of the session state machine.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Self::Failed | Self::TimedOut | Self::Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Self::Created, Self::Authorizing)
                | (Self::Authorizing, Self::ConcurrencyCheck)
                | (Self::ConcurrencyCheck, Self::SandboxProvisioning)
                | (Self::SandboxProvisioning, Self::ContextInjected)
                | (Self::ContextInjected, Self::AgentRunning)
                | (Self::AgentRunning, Self::ResultExtraction)
                | (Self::AgentRunning, Self::SandboxProvisioning)
                | (Self::ResultExtraction, Self::Publishing)
                | (Self::Publishing, Self::Completed)
        )
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Invalid session state: {}", s))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Commands ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowCommand {
    Plan,
    Refine,
    Build,
    Oneshot,
    Iterate,
    Codereview,
}

impl WorkflowCommand {
    pub const ALL: [WorkflowCommand; 6] = [
        Self::Plan,
        Self::Refine,
        Self::Build,
        Self::Oneshot,
        Self::Iterate,
        Self::Codereview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Refine => "refine",
            Self::Build => "build",
            Self::Oneshot => "oneshot",
            Self::Iterate => "iterate",
            Self::Codereview => "codereview",
        }
    }

    /// `plan` and `oneshot` start from an issue; everything else works on
    /// an existing pull request.
    pub fn requires_pull_request(&self) -> bool {
        !matches!(self, Self::Plan | Self::Oneshot)
    }

    /// `codereview` only reads the branch and reports back.
    pub fn pushes_changes(&self) -> bool {
        !matches!(self, Self::Codereview)
    }

    /// One-line brief handed to the agent ahead of any user instruction.
    pub fn brief(&self) -> &'static str {
        match self {
            Self::Plan => {
                "Write an implementation plan for the issue described in the context file. \
                 Commit the plan as a Markdown document; do not implement it."
            }
            Self::Refine => {
                "Refine the implementation plan on this branch using the review feedback \
                 in the context file. Commit the updated plan."
            }
            Self::Build => {
                "Implement the plan committed on this branch. Commit your work in small, \
                 coherent commits."
            }
            Self::Oneshot => {
                "Plan and implement the issue described in the context file in one pass. \
                 Commit your work."
            }
            Self::Iterate => {
                "Address the feedback on this pull request described in the context file. \
                 Commit your changes."
            }
            Self::Codereview => {
                "Review the changes on this branch against the pull request description. \
                 Write your review to the summary file; do not modify the repository."
            }
        }
    }
}

impl FromStr for WorkflowCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|cmd| cmd.as_str() == s)
            .ok_or_else(|| format!("Invalid command: {}", s))
    }
}

impl fmt::Display for WorkflowCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Step log ──────────────────────────────────────────────────────────

/// Checklist step shown in the progress comment, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Authorize,
    ConcurrencyCheck,
    Provision,
    Inject,
    Agent,
    Extract,
    Publish,
}

impl Step {
    pub const ALL: [Step; 7] = [
        Self::Authorize,
        Self::ConcurrencyCheck,
        Self::Provision,
        Self::Inject,
        Self::Agent,
        Self::Extract,
        Self::Publish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authorize => "authorize",
            Self::ConcurrencyCheck => "concurrency_check",
            Self::Provision => "provision",
            Self::Inject => "inject",
            Self::Agent => "agent",
            Self::Extract => "extract",
            Self::Publish => "publish",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Authorize => "Authorize sender",
            Self::ConcurrencyCheck => "Check for active session",
            Self::Provision => "Provision sandbox",
            Self::Inject => "Inject context",
            Self::Agent => "Run agent",
            Self::Extract => "Extract results",
            Self::Publish => "Publish changes",
        }
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| format!("Invalid step: {}", s))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Done,
    Failed,
    /// The attempt ended but the session carries on (reboot, crash retry).
    Interrupted,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "interrupted" => Ok(Self::Interrupted),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

/// One immutable step-log record. A step normally produces a `Running`
/// entry followed by a closing entry carrying the duration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepEntry {
    pub step: Step,
    pub status: StepStatus,
    pub duration_ms: Option<u64>,
    pub detail: Option<String>,
}

impl StepEntry {
    pub fn running(step: Step) -> Self {
        Self {
            step,
            status: StepStatus::Running,
            duration_ms: None,
            detail: None,
        }
    }

    pub fn closed(step: Step, status: StepStatus, duration_ms: u64, detail: Option<String>) -> Self {
        Self {
            step,
            status,
            duration_ms: Some(duration_ms),
            detail,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    UnrecognizedCommand,
    InvalidScope,
    ConcurrentSession,
    ContextFetch,
    SandboxProvisioning,
    AgentBudgetExceeded,
    AgentCrashed,
    PushConflict,
    Publish,
    Reporting,
    OrchestratorRestart,
    Internal,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 13] = [
        Self::Unauthorized,
        Self::UnrecognizedCommand,
        Self::InvalidScope,
        Self::ConcurrentSession,
        Self::ContextFetch,
        Self::SandboxProvisioning,
        Self::AgentBudgetExceeded,
        Self::AgentCrashed,
        Self::PushConflict,
        Self::Publish,
        Self::Reporting,
        Self::OrchestratorRestart,
        Self::Internal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::UnrecognizedCommand => "unrecognized_command",
            Self::InvalidScope => "invalid_scope",
            Self::ConcurrentSession => "concurrent_session",
            Self::ContextFetch => "context_fetch",
            Self::SandboxProvisioning => "sandbox_provisioning",
            Self::AgentBudgetExceeded => "agent_budget_exceeded",
            Self::AgentCrashed => "agent_crashed",
            Self::PushConflict => "push_conflict",
            Self::Publish => "publish",
            Self::Reporting => "reporting",
            Self::OrchestratorRestart => "orchestrator_restart",
            Self::Internal => "internal",
        }
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Invalid error kind: {}", s))
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

// ── Checkpoint ────────────────────────────────────────────────────────

/// State captured before a sandbox reboot, enough for a fresh environment
/// to pick up where the previous one stopped.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    /// Last commit pushed to the session branch.
    pub head: Option<String>,
    /// Number of agent transcript lines consumed so far.
    pub transcript_offset: u64,
    /// Reboot cycles completed when this checkpoint was taken.
    pub reboots: u32,
}

impl Checkpoint {
    pub fn to_blob(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_blob(blob: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in SessionState::ALL {
            assert_eq!(SessionState::from_str(state.as_str()).unwrap(), state);
        }
        assert!(SessionState::from_str("running").is_err());
    }

    #[test]
    fn test_state_serde_snake_case() {
        let json = serde_json::to_string(&SessionState::AgentRunning).unwrap();
        assert_eq!(json, "\"agent_running\"");
        let json = serde_json::to_string(&SessionState::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
    }

    #[test]
    fn test_terminal_and_admitted_sets_are_disjoint() {
        for state in SessionState::ALL {
            assert!(!(state.is_terminal() && state.is_admitted()));
        }
        assert!(SessionState::Publishing.is_admitted());
        assert!(!SessionState::ConcurrencyCheck.is_admitted());
    }

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            SessionState::Created,
            SessionState::Authorizing,
            SessionState::ConcurrencyCheck,
            SessionState::SandboxProvisioning,
            SessionState::ContextInjected,
            SessionState::AgentRunning,
            SessionState::ResultExtraction,
            SessionState::Publishing,
            SessionState::Completed,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be valid",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_reboot_edge_only_from_agent_running() {
        assert!(SessionState::AgentRunning.can_transition_to(SessionState::SandboxProvisioning));
        assert!(!SessionState::ResultExtraction.can_transition_to(SessionState::SandboxProvisioning));
        assert!(!SessionState::Publishing.can_transition_to(SessionState::AgentRunning));
    }

    #[test]
    fn test_failure_states_reachable_from_any_non_terminal() {
        for state in SessionState::ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(state.can_transition_to(SessionState::Failed));
            assert!(state.can_transition_to(SessionState::TimedOut));
            assert!(state.can_transition_to(SessionState::Cancelled));
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in SessionState::TERMINAL {
            for next in SessionState::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_no_skipping_forward() {
        assert!(!SessionState::Created.can_transition_to(SessionState::AgentRunning));
        assert!(!SessionState::Authorizing.can_transition_to(SessionState::SandboxProvisioning));
        assert!(!SessionState::ContextInjected.can_transition_to(SessionState::Publishing));
    }

    #[test]
    fn test_command_scope_rules() {
        assert!(!WorkflowCommand::Plan.requires_pull_request());
        assert!(!WorkflowCommand::Oneshot.requires_pull_request());
        assert!(WorkflowCommand::Build.requires_pull_request());
        assert!(WorkflowCommand::Codereview.requires_pull_request());
        assert!(!WorkflowCommand::Codereview.pushes_changes());
        assert!(WorkflowCommand::Iterate.pushes_changes());
    }

    #[test]
    fn test_command_round_trip() {
        for cmd in WorkflowCommand::ALL {
            assert_eq!(WorkflowCommand::from_str(cmd.as_str()).unwrap(), cmd);
        }
        assert!(WorkflowCommand::from_str("deploy").is_err());
    }

    #[test]
    fn test_step_order_matches_declaration() {
        let mut sorted = Step::ALL;
        sorted.sort();
        assert_eq!(sorted, Step::ALL);
        assert!(Step::Provision < Step::Agent);
    }

    #[test]
    fn test_error_kind_round_trip() {
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::from_str(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn test_checkpoint_blob_round_trip() {
        let cp = Checkpoint {
            head: Some("abc123".into()),
            transcript_offset: 42,
            reboots: 1,
        };
        let blob = cp.to_blob().unwrap();
        assert_eq!(Checkpoint::from_blob(&blob).unwrap(), cp);
    }
}
