//! In-memory `Sandbox` and `CodeHost` implementations for driving the
//! orchestrator in tests and dry runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use super::github::{
    CodeHost, CommentTarget, HostContext, IssueData, PullRequestData, PullRequestRef, Reaction,
};
use super::models::Checkpoint;
use super::sandbox::{
    CommitSummary, DiffSummary, Extraction, PushOutcome, RunOutcome, Sandbox, SandboxHandle,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Sandbox ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct FakeEnv {
    branch: String,
    /// Oldest first.
    commits: Vec<CommitSummary>,
    terminated: bool,
}

#[derive(Debug, Default)]
struct SandboxState {
    runs: VecDeque<RunOutcome>,
    pushes: VecDeque<PushOutcome>,
    provision_failures: u32,
    fail_checkpoint: bool,
    fail_refetch: bool,
    summary: Option<String>,
    /// Branch name to commits, oldest first.
    remote: HashMap<String, Vec<CommitSummary>>,
    envs: HashMap<String, FakeEnv>,
    provisioned: Vec<String>,
    terminated: Vec<String>,
    injected: Vec<(String, String)>,
    push_attempts: u32,
    next_id: u64,
}

impl SandboxState {
    fn next_commit(&mut self, subject: &str) -> CommitSummary {
        self.next_id += 1;
        CommitSummary {
            sha: format!("{:040x}", self.next_id),
            subject: subject.to_string(),
        }
    }
}

/// Scripted sandbox. Runs complete unless told otherwise; every run that
/// does not crash adds one commit to the environment's branch.
#[derive(Debug)]
pub struct FakeSandbox {
    state: Mutex<SandboxState>,
    runs: Gate,
    injects: Gate,
    pushes: Gate,
    /// Signalled (with a stored permit) each time a run starts.
    pub run_started: Notify,
    /// Signalled each time an inject call is entered.
    pub inject_started: Notify,
    /// Signalled each time a push call is entered.
    pub push_started: Notify,
}

/// Optional barrier in front of one sandbox operation.
#[derive(Debug)]
struct Gate {
    hold: AtomicBool,
    permits: Semaphore,
}

impl Gate {
    fn new() -> Self {
        Self {
            hold: AtomicBool::new(false),
            permits: Semaphore::new(0),
        }
    }

    async fn pass(&self) -> Result<()> {
        if self.hold.load(Ordering::SeqCst) {
            self.permits.acquire().await?.forget();
        }
        Ok(())
    }
}

impl Default for FakeSandbox {
    fn default() -> Self {
        Self {
            state: Mutex::new(SandboxState::default()),
            runs: Gate::new(),
            injects: Gate::new(),
            pushes: Gate::new(),
            run_started: Notify::new(),
            inject_started: Notify::new(),
            push_started: Notify::new(),
        }
    }
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes for successive runs; `Completed` once exhausted.
    pub fn with_runs(self, runs: impl IntoIterator<Item = RunOutcome>) -> Self {
        lock(&self.state).runs.extend(runs);
        self
    }

    /// Outcomes for successive pushes; `Pushed` once exhausted.
    pub fn with_pushes(self, pushes: impl IntoIterator<Item = PushOutcome>) -> Self {
        lock(&self.state).pushes.extend(pushes);
        self
    }

    pub fn with_provision_failures(self, failures: u32) -> Self {
        lock(&self.state).provision_failures = failures;
        self
    }

    pub fn with_failing_checkpoint(self) -> Self {
        lock(&self.state).fail_checkpoint = true;
        self
    }

    pub fn with_failing_refetch(self) -> Self {
        lock(&self.state).fail_refetch = true;
        self
    }

    pub fn with_summary(self, summary: &str) -> Self {
        lock(&self.state).summary = Some(summary.to_string());
        self
    }

    /// Seed the remote with an existing branch holding `commits` commits.
    pub fn with_remote_branch(self, branch: &str, commits: usize) -> Self {
        {
            let mut state = lock(&self.state);
            let existing: Vec<_> = (0..commits)
                .map(|i| state.next_commit(&format!("Existing work {}", i + 1)))
                .collect();
            state.remote.insert(branch.to_string(), existing);
        }
        self
    }

    /// Block every run until `release_runs` hands out a permit.
    pub fn hold_runs(self) -> Self {
        self.runs.hold.store(true, Ordering::SeqCst);
        self
    }

    pub fn release_runs(&self, runs: usize) {
        self.runs.permits.add_permits(runs);
    }

    /// Block every inject until `release_injects`.
    pub fn hold_injects(self) -> Self {
        self.injects.hold.store(true, Ordering::SeqCst);
        self
    }

    pub fn release_injects(&self, injects: usize) {
        self.injects.permits.add_permits(injects);
    }

    /// Block every push until `release_pushes`.
    pub fn hold_pushes(self) -> Self {
        self.pushes.hold.store(true, Ordering::SeqCst);
        self
    }

    pub fn release_pushes(&self, pushes: usize) {
        self.pushes.permits.add_permits(pushes);
    }

    pub fn provisioned(&self) -> Vec<String> {
        lock(&self.state).provisioned.clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        lock(&self.state).terminated.clone()
    }

    /// `(bundle, instruction)` per injection, in order.
    pub fn injected(&self) -> Vec<(String, String)> {
        lock(&self.state).injected.clone()
    }

    pub fn push_attempts(&self) -> u32 {
        lock(&self.state).push_attempts
    }

    pub fn remote_commits(&self, branch: &str) -> usize {
        lock(&self.state).remote.get(branch).map_or(0, Vec::len)
    }

    /// Handles provisioned and not yet terminated.
    pub fn live(&self) -> Vec<String> {
        let state = lock(&self.state);
        state
            .envs
            .iter()
            .filter(|(_, env)| !env.terminated)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn provision(&self, _repo: &str, branch: &str) -> Result<SandboxHandle> {
        let mut state = lock(&self.state);
        if state.provision_failures > 0 {
            state.provision_failures -= 1;
            bail!("no capacity");
        }
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        let commits = state.remote.get(branch).cloned().unwrap_or_default();
        state.envs.insert(
            id.clone(),
            FakeEnv {
                branch: branch.to_string(),
                commits,
                terminated: false,
            },
        );
        state.provisioned.push(id.clone());
        Ok(SandboxHandle(id))
    }

    async fn inject(&self, handle: &SandboxHandle, bundle: &str, instruction: &str) -> Result<()> {
        self.inject_started.notify_one();
        self.injects.pass().await?;
        let mut state = lock(&self.state);
        match state.envs.get(handle.as_str()) {
            Some(env) if !env.terminated => {}
            _ => bail!("sandbox {} is gone", handle),
        }
        state
            .injected
            .push((bundle.to_string(), instruction.to_string()));
        Ok(())
    }

    async fn run(&self, handle: &SandboxHandle, _budget: Duration) -> Result<RunOutcome> {
        self.run_started.notify_one();
        self.runs.pass().await?;

        let mut state = lock(&self.state);
        let outcome = state.runs.pop_front().unwrap_or(RunOutcome::Completed);
        let alive = state
            .envs
            .get(handle.as_str())
            .is_some_and(|env| !env.terminated);
        if !alive {
            return Ok(RunOutcome::Crashed {
                reason: format!("sandbox {} terminated", handle),
            });
        }
        if !matches!(outcome, RunOutcome::Crashed { .. }) {
            let commit = state.next_commit("Agent work");
            if let Some(env) = state.envs.get_mut(handle.as_str()) {
                env.commits.push(commit);
            }
        }
        Ok(outcome)
    }

    async fn checkpoint(&self, handle: &SandboxHandle) -> Result<Checkpoint> {
        let mut state = lock(&self.state);
        if state.fail_checkpoint {
            bail!("checkpoint push failed");
        }
        let Some(env) = state.envs.get(handle.as_str()) else {
            bail!("unknown sandbox {}", handle);
        };
        let branch = env.branch.clone();
        let commits = env.commits.clone();
        let head = commits.last().map(|c| c.sha.clone());
        state.remote.insert(branch, commits);
        Ok(Checkpoint {
            head,
            transcript_offset: 10,
            reboots: 0,
        })
    }

    async fn extract(&self, handle: &SandboxHandle) -> Result<Extraction> {
        let state = lock(&self.state);
        let Some(env) = state.envs.get(handle.as_str()) else {
            bail!("unknown sandbox {}", handle);
        };
        let commits: Vec<CommitSummary> = env.commits.iter().rev().cloned().collect();
        Ok(Extraction {
            head: env.commits.last().map(|c| c.sha.clone()),
            diff: DiffSummary {
                files_changed: commits.len() as u32,
                insertions: 10 * commits.len() as u32,
                deletions: 0,
            },
            commits,
            summary: state.summary.clone(),
        })
    }

    async fn push(&self, handle: &SandboxHandle, branch: &str) -> Result<PushOutcome> {
        self.push_started.notify_one();
        self.pushes.pass().await?;
        let mut state = lock(&self.state);
        state.push_attempts += 1;
        let outcome = state.pushes.pop_front().unwrap_or(PushOutcome::Pushed);
        if outcome == PushOutcome::Pushed {
            let env = match state.envs.get(handle.as_str()) {
                Some(env) if !env.terminated => env,
                _ => bail!("sandbox {} is gone", handle),
            };
            let commits = env.commits.clone();
            state.remote.insert(branch.to_string(), commits);
        }
        Ok(outcome)
    }

    async fn refetch(&self, _handle: &SandboxHandle, branch: &str) -> Result<()> {
        let state = lock(&self.state);
        if state.fail_refetch {
            bail!("rebase onto origin/{} failed", branch);
        }
        Ok(())
    }

    async fn terminate(&self, handle: &SandboxHandle) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(env) = state.envs.get_mut(handle.as_str()) {
            env.terminated = true;
        }
        state.terminated.push(handle.0.clone());
        Ok(())
    }
}

// ── Code host ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedComment {
    pub number: u64,
    pub comment_id: u64,
    pub body: String,
    /// False for the first post, true for edits.
    pub edit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedPullRequest {
    pub repo: String,
    pub branch: String,
    pub title: String,
    pub body: String,
    pub number: u64,
}

#[derive(Debug, Default)]
struct HostState {
    pr_heads: HashMap<u64, String>,
    linked_issue: Option<u64>,
    fail_context: bool,
    fail_comments: bool,
    stall_writes: bool,
    pr_failures: u32,
    comments: Vec<PostedComment>,
    pull_requests: Vec<OpenedPullRequest>,
    reactions: Vec<(u64, Reaction)>,
    next_id: u64,
}

/// Records everything posted; serves synthetic issues and pull requests.
#[derive(Debug, Default)]
pub struct FakeCodeHost {
    state: Mutex<HostState>,
}

impl FakeCodeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pull_request(self, number: u64, head_branch: &str) -> Self {
        lock(&self.state)
            .pr_heads
            .insert(number, head_branch.to_string());
        self
    }

    /// Issue that pull request bodies reference.
    pub fn with_linked_issue(self, issue: u64) -> Self {
        lock(&self.state).linked_issue = Some(issue);
        self
    }

    pub fn with_failing_context(self) -> Self {
        lock(&self.state).fail_context = true;
        self
    }

    pub fn with_failing_comments(self) -> Self {
        lock(&self.state).fail_comments = true;
        self
    }

    /// Comment and reaction calls never return.
    pub fn with_stalled_writes(self) -> Self {
        lock(&self.state).stall_writes = true;
        self
    }

    pub fn with_pr_failures(self, failures: u32) -> Self {
        lock(&self.state).pr_failures = failures;
        self
    }

    pub fn comments(&self) -> Vec<PostedComment> {
        lock(&self.state).comments.clone()
    }

    pub fn pull_requests(&self) -> Vec<OpenedPullRequest> {
        lock(&self.state).pull_requests.clone()
    }

    pub fn reactions(&self) -> Vec<(u64, Reaction)> {
        lock(&self.state).reactions.clone()
    }

    async fn stall(&self) {
        let stalled = lock(&self.state).stall_writes;
        if stalled {
            std::future::pending::<()>().await;
        }
    }

    /// Latest body of each status comment, keyed by comment id.
    pub fn latest_comment(&self, comment_id: u64) -> Option<String> {
        lock(&self.state)
            .comments
            .iter()
            .rev()
            .find(|c| c.comment_id == comment_id)
            .map(|c| c.body.clone())
    }
}

#[async_trait]
impl CodeHost for FakeCodeHost {
    async fn fetch_context(&self, _repo: &str, issue: u64, pr: Option<u64>) -> Result<HostContext> {
        let state = lock(&self.state);
        if state.fail_context {
            bail!("GitHub API returned 502 Bad Gateway");
        }
        let pull_request = match pr {
            Some(number) => {
                let Some(head) = state.pr_heads.get(&number) else {
                    bail!("pull request #{} not found", number);
                };
                Some(PullRequestData {
                    number,
                    title: format!("Pull request {}", number),
                    body: state
                        .linked_issue
                        .map(|i| format!("Closes #{}", i))
                        .unwrap_or_default(),
                    head_branch: head.clone(),
                    base_branch: "main".to_string(),
                    comments: Vec::new(),
                })
            }
            None => None,
        };
        let number = match pr {
            Some(_) => state.linked_issue.unwrap_or(issue),
            None => issue,
        };
        Ok(HostContext {
            issue: IssueData {
                number,
                title: format!("Issue {}", number),
                body: "Something needs doing.".to_string(),
                comments: Vec::new(),
            },
            pull_request,
        })
    }

    async fn create_or_update_pr(
        &self,
        repo: &str,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequestRef> {
        let mut state = lock(&self.state);
        if state.pr_failures > 0 {
            state.pr_failures -= 1;
            bail!("GitHub API returned 500");
        }
        if let Some(existing) = state
            .pull_requests
            .iter_mut()
            .find(|p| p.repo == repo && p.branch == branch)
        {
            existing.title = title.to_string();
            existing.body = body.to_string();
            return Ok(PullRequestRef {
                number: existing.number,
                url: format!("https://github.com/{}/pull/{}", repo, existing.number),
            });
        }
        state.next_id += 1;
        let number = 1000 + state.next_id;
        state.pull_requests.push(OpenedPullRequest {
            repo: repo.to_string(),
            branch: branch.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            number,
        });
        Ok(PullRequestRef {
            number,
            url: format!("https://github.com/{}/pull/{}", repo, number),
        })
    }

    async fn post_or_update_comment(&self, target: &CommentTarget, body: &str) -> Result<u64> {
        self.stall().await;
        let mut state = lock(&self.state);
        if state.fail_comments {
            bail!("GitHub API returned 403");
        }
        let (comment_id, edit) = match target.comment_id {
            Some(id) => (id, true),
            None => {
                state.next_id += 1;
                (state.next_id, false)
            }
        };
        state.comments.push(PostedComment {
            number: target.number,
            comment_id,
            body: body.to_string(),
            edit,
        });
        Ok(comment_id)
    }

    async fn add_reaction(&self, _repo: &str, comment_id: u64, reaction: Reaction) -> Result<()> {
        self.stall().await;
        lock(&self.state).reactions.push((comment_id, reaction));
        Ok(())
    }
}
