//! Trigger text parsing and sender authorization.

use std::collections::HashSet;

use anyhow::{Context, Result};
use regex::Regex;

use super::models::{Sender, Trigger, TriggerText, WorkflowCommand};
use crate::errors::WorkflowError;

/// A command extracted from trigger text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: WorkflowCommand,
    /// Everything after the command token, verbatim. `None` when empty.
    pub instruction: Option<String>,
}

/// Finds `@<bot> <command> [instruction]` in a comment body.
#[derive(Debug, Clone)]
pub struct CommandParser {
    mention: Regex,
}

impl CommandParser {
    pub fn new(bot_name: &str) -> Result<Self> {
        // The name must stand alone: `@relay-bot` and `me@relay` are not mentions.
        let pattern = format!(r"(?i)(?:^|\s)@{}(?:\s|$)", regex::escape(bot_name.trim()));
        let mention = Regex::new(&pattern).context("Failed to compile mention pattern")?;
        Ok(Self { mention })
    }

    pub fn parse(&self, text: &str) -> Result<ParsedCommand, WorkflowError> {
        let Some(found) = self.mention.find(text) else {
            return Err(WorkflowError::UnrecognizedCommand { token: None });
        };

        let rest = text[found.end()..].trim_start();
        let token_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let token = &rest[..token_end];
        if token.is_empty() {
            return Err(WorkflowError::UnrecognizedCommand { token: None });
        }

        let command = token
            .to_lowercase()
            .parse::<WorkflowCommand>()
            .map_err(|_| WorkflowError::UnrecognizedCommand {
                token: Some(token.to_string()),
            })?;

        let instruction = rest[token_end..].trim_start().trim_end();
        Ok(ParsedCommand {
            command,
            instruction: (!instruction.is_empty()).then(|| instruction.to_string()),
        })
    }
}

/// Allowlist of code-host logins that may trigger workflows.
#[derive(Debug, Clone, Default)]
pub struct Authorizer {
    allowed: HashSet<String>,
}

impl Authorizer {
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: users.into_iter().map(Into::into).collect(),
        }
    }

    /// The operator is always allowed; users must be listed exactly.
    pub fn authorize(&self, sender: &Sender) -> Result<(), WorkflowError> {
        match sender {
            Sender::Operator => Ok(()),
            Sender::User(login) if self.allowed.contains(login) => Ok(()),
            Sender::User(_) => Err(WorkflowError::Unauthorized),
        }
    }
}

/// Reject commands aimed at the wrong kind of scope.
pub fn validate_scope(
    command: WorkflowCommand,
    is_pull_request: bool,
) -> Result<(), WorkflowError> {
    match (command.requires_pull_request(), is_pull_request) {
        (true, false) => Err(WorkflowError::InvalidScope {
            command,
            reason: "must be run on a pull request".to_string(),
        }),
        (false, true) => Err(WorkflowError::InvalidScope {
            command,
            reason: "must be run on an issue, not a pull request".to_string(),
        }),
        _ => Ok(()),
    }
}

/// Authorize the sender, then parse and scope-check the command.
///
/// Authorization runs first so a rejected sender never learns anything
/// about the command set.
pub fn resolve(
    trigger: &Trigger,
    parser: &CommandParser,
    authorizer: &Authorizer,
) -> Result<ParsedCommand, WorkflowError> {
    authorizer.authorize(&trigger.sender)?;
    let parsed = match &trigger.text {
        TriggerText::Comment(body) => parser.parse(body)?,
        TriggerText::Manual {
            command,
            instruction,
        } => ParsedCommand {
            command: *command,
            instruction: instruction
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
        },
    };
    validate_scope(parsed.command, trigger.is_pull_request)?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::models::TriggerEvent;

    fn parser() -> CommandParser {
        CommandParser::new("relay").unwrap()
    }

    #[test]
    fn test_parse_command_without_instruction() {
        let parsed = parser().parse("@relay plan").unwrap();
        assert_eq!(parsed.command, WorkflowCommand::Plan);
        assert_eq!(parsed.instruction, None);
    }

    #[test]
    fn test_parse_is_case_and_whitespace_tolerant() {
        let parsed = parser().parse("   @Relay    BUILD   ").unwrap();
        assert_eq!(parsed.command, WorkflowCommand::Build);
        assert_eq!(parsed.instruction, None);
    }

    #[test]
    fn test_instruction_preserved_verbatim() {
        let parsed = parser()
            .parse("@relay iterate fix the tests\n\n- keep `Foo` public\n  - indented\n")
            .unwrap();
        assert_eq!(parsed.command, WorkflowCommand::Iterate);
        assert_eq!(
            parsed.instruction.as_deref(),
            Some("fix the tests\n\n- keep `Foo` public\n  - indented")
        );
    }

    #[test]
    fn test_instruction_keeps_case() {
        let parsed = parser().parse("@relay oneshot Use the NEW API").unwrap();
        assert_eq!(parsed.instruction.as_deref(), Some("Use the NEW API"));
    }

    #[test]
    fn test_mention_inside_text() {
        let parsed = parser()
            .parse("Looks good to me. @relay codereview please")
            .unwrap();
        assert_eq!(parsed.command, WorkflowCommand::Codereview);
        assert_eq!(parsed.instruction.as_deref(), Some("please"));
    }

    #[test]
    fn test_unknown_token_is_unrecognized() {
        match parser().parse("@relay deploy now") {
            Err(WorkflowError::UnrecognizedCommand { token }) => {
                assert_eq!(token.as_deref(), Some("deploy"));
            }
            other => panic!("expected UnrecognizedCommand, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_mention_or_token_is_unrecognized() {
        for text in ["plan this please", "@relay", "@relay   \n  ", ""] {
            assert!(matches!(
                parser().parse(text),
                Err(WorkflowError::UnrecognizedCommand { token: None })
            ));
        }
    }

    #[test]
    fn test_longer_bot_name_does_not_match() {
        assert!(parser().parse("@relaybot plan").is_err());
        assert!(parser().parse("@relay-bot plan").is_err());
        assert!(parser().parse("@relay.dev plan").is_err());
        assert!(parser().parse("mail ops@relay plan").is_err());
    }

    #[test]
    fn test_mention_at_line_start() {
        let parsed = parser().parse("Thanks!\n@relay plan\nfocus on tests").unwrap();
        assert_eq!(parsed.command, WorkflowCommand::Plan);
        assert_eq!(parsed.instruction.as_deref(), Some("focus on tests"));
    }

    #[test]
    fn test_custom_bot_name_is_escaped() {
        let parser = CommandParser::new("dev.bot").unwrap();
        assert!(parser.parse("@dev.bot plan").is_ok());
        assert!(parser.parse("@devxbot plan").is_err());
    }

    #[test]
    fn test_authorizer_exact_match() {
        let auth = Authorizer::new(["alice"]);
        assert!(auth.authorize(&Sender::User("alice".into())).is_ok());
        assert!(matches!(
            auth.authorize(&Sender::User("Alice".into())),
            Err(WorkflowError::Unauthorized)
        ));
        assert!(auth.authorize(&Sender::Operator).is_ok());
    }

    #[test]
    fn test_empty_allowlist_denies_everyone() {
        let auth = Authorizer::default();
        assert!(auth.authorize(&Sender::User("alice".into())).is_err());
    }

    #[test]
    fn test_validate_scope() {
        assert!(validate_scope(WorkflowCommand::Plan, false).is_ok());
        assert!(validate_scope(WorkflowCommand::Build, true).is_ok());
        assert!(matches!(
            validate_scope(WorkflowCommand::Plan, true),
            Err(WorkflowError::InvalidScope { .. })
        ));
        let err = validate_scope(WorkflowCommand::Iterate, false).unwrap_err();
        assert!(err.to_string().contains("pull request"));
    }

    #[test]
    fn test_resolve_checks_sender_before_parsing() {
        let trigger = Trigger::from(TriggerEvent {
            repo: "acme/widgets".into(),
            number: 1,
            author: "mallory".into(),
            body: "@relay not-a-command".into(),
            is_pull_request: false,
            comment_id: None,
        });
        let err = resolve(&trigger, &parser(), &Authorizer::new(["alice"])).unwrap_err();
        assert!(matches!(err, WorkflowError::Unauthorized));
        assert!(!err.to_string().contains("plan"));
    }

    #[test]
    fn test_resolve_manual_trigger_skips_parsing() {
        let trigger = Trigger::manual(
            "acme/widgets",
            42,
            false,
            WorkflowCommand::Plan,
            Some("  small steps \n".into()),
        );
        let parsed = resolve(&trigger, &parser(), &Authorizer::default()).unwrap();
        assert_eq!(parsed.command, WorkflowCommand::Plan);
        assert_eq!(parsed.instruction.as_deref(), Some("small steps"));
    }
}
