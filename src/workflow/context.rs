//! Context snapshot builder.
//!
//! Renders the Markdown bundle handed to the agent. The output depends only
//! on the inputs: the same host context, git state and trigger always yield
//! byte-identical text. The only timestamps are the comments' own.

use std::fmt::Write;

use chrono::DateTime;

use super::github::{CommentData, HostContext};
use super::sandbox::{CommitSummary, DiffSummary};

/// Git state of the session branch at injection time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitState {
    pub branch: String,
    /// Newest first.
    pub commits: Vec<CommitSummary>,
    pub diff: DiffSummary,
}

/// The comment (or manual request) that started the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerComment {
    pub author: String,
    pub body: String,
}

pub fn build_bundle(host: &HostContext, git: &GitState, trigger: &TriggerComment) -> String {
    let mut out = String::new();

    let issue = &host.issue;
    let _ = writeln!(out, "# Issue #{}: {}", issue.number, issue.title);
    push_body(&mut out, &issue.body);
    push_comments(&mut out, "## Issue Comments", &issue.comments);

    if let Some(pr) = &host.pull_request {
        let _ = writeln!(out, "# Pull Request #{}: {}", pr.number, pr.title);
        out.push('\n');
        let _ = writeln!(out, "Branch: `{}` → `{}`", pr.head_branch, pr.base_branch);
        out.push('\n');
        push_body(&mut out, &pr.body);
        push_comments(&mut out, "## Pull Request Comments", &pr.comments);
    }

    out.push_str("# Repository State\n\n");
    let _ = writeln!(out, "Branch: `{}`", git.branch);
    out.push('\n');
    if git.commits.is_empty() {
        out.push_str("No commits on this branch yet.\n\n");
    } else {
        out.push_str("Recent commits:\n\n");
        for commit in &git.commits {
            let _ = writeln!(out, "- `{}` {}", commit.short_sha(), commit.subject);
        }
        out.push('\n');
    }
    let _ = writeln!(
        out,
        "Files changed: {} (+{} -{})",
        git.diff.files_changed, git.diff.insertions, git.diff.deletions
    );
    out.push('\n');

    out.push_str("# Trigger\n\n");
    let _ = writeln!(out, "@{} wrote:", trigger.author);
    out.push('\n');
    for line in trigger.body.trim_end().lines() {
        if line.is_empty() {
            out.push_str(">\n");
        } else {
            let _ = writeln!(out, "> {}", line);
        }
    }

    out
}

fn push_body(out: &mut String, body: &str) {
    out.push('\n');
    let body = body.trim_end();
    if body.is_empty() {
        out.push_str("_No description provided._\n\n");
    } else {
        out.push_str(body);
        out.push_str("\n\n");
    }
}

fn push_comments(out: &mut String, heading: &str, comments: &[CommentData]) {
    if comments.is_empty() {
        return;
    }
    let mut sorted: Vec<&CommentData> = comments.iter().collect();
    // Stable: comments with equal timestamps keep their fetched order.
    sorted.sort_by_key(|c| sort_key(&c.created_at));

    out.push_str(heading);
    out.push_str("\n\n");
    for comment in sorted {
        let _ = write!(
            out,
            "### @{} ({})",
            comment.author,
            display_time(&comment.created_at)
        );
        if let Some(path) = &comment.path {
            let _ = write!(out, " [Review comment on {}]", path);
        }
        out.push_str("\n\n");
        out.push_str(comment.body.trim_end());
        out.push_str("\n\n");
    }
}

fn sort_key(timestamp: &str) -> (i64, String) {
    match DateTime::parse_from_rfc3339(timestamp) {
        Ok(dt) => (dt.timestamp_millis(), String::new()),
        Err(_) => (i64::MAX, timestamp.to_string()),
    }
}

fn display_time(timestamp: &str) -> String {
    match DateTime::parse_from_rfc3339(timestamp) {
        Ok(dt) => dt.naive_utc().format("%Y-%m-%d %H:%M").to_string(),
        Err(_) => timestamp.to_string(),
    }
}
