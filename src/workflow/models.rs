use serde::{Deserialize, Serialize};

pub use relay_common::{
    Checkpoint, ErrorKind, ErrorRecord, SessionState, Step, StepEntry, StepStatus,
    WorkflowCommand,
};

/// Who asked for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "login", rename_all = "snake_case")]
pub enum Sender {
    /// A code-host account; subject to the allowlist.
    User(String),
    /// Local operator using the manual trigger surface.
    Operator,
}

impl Sender {
    pub fn login(&self) -> &str {
        match self {
            Self::User(login) => login,
            Self::Operator => "operator",
        }
    }
}

/// Trigger event as delivered by the webhook receiver, already verified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub repo: String,
    /// Issue or PR number the comment was posted on.
    pub number: u64,
    pub author: String,
    pub body: String,
    #[serde(default)]
    pub is_pull_request: bool,
    #[serde(default)]
    pub comment_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerText {
    /// Raw comment text, parsed during authorization.
    Comment(String),
    /// Pre-parsed manual trigger.
    Manual {
        command: WorkflowCommand,
        instruction: Option<String>,
    },
}

/// Everything the orchestrator needs to start a session.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub repo: String,
    pub number: u64,
    pub is_pull_request: bool,
    pub sender: Sender,
    pub text: TriggerText,
    pub comment_id: Option<u64>,
}

impl Trigger {
    pub fn manual(
        repo: impl Into<String>,
        number: u64,
        is_pull_request: bool,
        command: WorkflowCommand,
        instruction: Option<String>,
    ) -> Self {
        Self {
            repo: repo.into(),
            number,
            is_pull_request,
            sender: Sender::Operator,
            text: TriggerText::Manual {
                command,
                instruction,
            },
            comment_id: None,
        }
    }

    /// Text recorded on the session and quoted in the context bundle.
    pub fn raw_text(&self) -> String {
        match &self.text {
            TriggerText::Comment(body) => body.clone(),
            TriggerText::Manual {
                command,
                instruction: Some(instruction),
            } => format!("{} {}", command, instruction),
            TriggerText::Manual { command, .. } => command.to_string(),
        }
    }
}

impl From<TriggerEvent> for Trigger {
    fn from(event: TriggerEvent) -> Self {
        Self {
            repo: event.repo,
            number: event.number,
            is_pull_request: event.is_pull_request,
            sender: Sender::User(event.author),
            text: TriggerText::Comment(event.body),
            comment_id: event.comment_id,
        }
    }
}

/// Fields supplied when a session record is first written.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub repo: String,
    pub issue: u64,
    pub pr: Option<u64>,
    pub author: String,
    pub trigger_text: String,
    pub comment_id: Option<u64>,
}

impl NewSession {
    pub fn from_trigger(trigger: &Trigger) -> Self {
        Self {
            repo: trigger.repo.clone(),
            issue: trigger.number,
            pr: trigger.is_pull_request.then_some(trigger.number),
            author: trigger.sender.login().to_string(),
            trigger_text: trigger.raw_text(),
            comment_id: trigger.comment_id,
        }
    }
}

/// One workflow invocation, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub repo: String,
    pub issue: u64,
    pub pr: Option<u64>,
    pub command: Option<WorkflowCommand>,
    pub instruction: Option<String>,
    pub state: SessionState,
    pub sandbox_ref: Option<String>,
    pub branch: Option<String>,
    pub checkpoint: Option<Checkpoint>,
    pub author: String,
    pub trigger_text: String,
    pub comment_id: Option<u64>,
    pub progress_comment_id: Option<u64>,
    pub pr_url: Option<String>,
    pub error: Option<ErrorRecord>,
    pub step_log: Vec<StepEntry>,
    pub created_at: String,
    pub updated_at: String,
    pub terminal_at: Option<String>,
}

impl Session {
    /// Issue-or-PR number that, with the repo, forms the concurrency scope.
    pub fn scope_number(&self) -> u64 {
        self.pr.unwrap_or(self.issue)
    }
}

/// Filters for listing sessions, newest first.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionFilter {
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub state: Option<SessionState>,
    #[serde(default = "default_list_limit")]
    pub limit: u32,
}

fn default_list_limit() -> u32 {
    50
}

impl Default for SessionFilter {
    fn default() -> Self {
        Self {
            repo: None,
            state: None,
            limit: default_list_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_from_event() {
        let trigger = Trigger::from(TriggerEvent {
            repo: "acme/widgets".into(),
            number: 124,
            author: "alice".into(),
            body: "@relay build".into(),
            is_pull_request: true,
            comment_id: Some(9),
        });
        assert_eq!(trigger.sender, Sender::User("alice".into()));
        assert_eq!(trigger.raw_text(), "@relay build");

        let new = NewSession::from_trigger(&trigger);
        assert_eq!(new.pr, Some(124));
        assert_eq!(new.issue, 124);
        assert_eq!(new.author, "alice");
    }

    #[test]
    fn test_manual_trigger_raw_text() {
        let trigger = Trigger::manual(
            "acme/widgets",
            42,
            false,
            WorkflowCommand::Plan,
            Some("keep it small".into()),
        );
        assert_eq!(trigger.raw_text(), "plan keep it small");
        assert_eq!(trigger.sender.login(), "operator");
        assert_eq!(NewSession::from_trigger(&trigger).pr, None);
    }

    #[test]
    fn test_sender_serde() {
        let json = serde_json::to_value(Sender::User("bob".into())).unwrap();
        assert_eq!(json["type"], "user");
        assert_eq!(json["login"], "bob");
        let json = serde_json::to_value(Sender::Operator).unwrap();
        assert_eq!(json["type"], "operator");
    }

    #[test]
    fn test_trigger_event_defaults() {
        let event: TriggerEvent = serde_json::from_str(
            r#"{"repo": "acme/widgets", "number": 7, "author": "a", "body": "@relay plan"}"#,
        )
        .unwrap();
        assert!(!event.is_pull_request);
        assert!(event.comment_id.is_none());
    }

    #[test]
    fn test_session_filter_default_limit() {
        let filter: SessionFilter = serde_json::from_str("{}").unwrap();
        assert_eq!(filter.limit, 50);
        assert!(filter.repo.is_none());
    }
}
