//! Session orchestrator: drives one session per trigger through the state
//! machine, from authorization to a terminal state.
//!
//! Each session runs in its own tokio task. There is no orchestrator-wide
//! lock; every state write is a compare-and-set in the session store, and
//! admission for a scope is a single conditional update there.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::command::{self, Authorizer, CommandParser, ParsedCommand};
use super::context::{self, GitState, TriggerComment};
use super::db::{Admission, DbHandle};
use super::github::{CodeHost, CommentTarget, HostContext, Reaction};
use super::models::*;
use super::progress::ProgressReporter;
use super::sandbox::{Extraction, PushOutcome, RunOutcome, Sandbox, SandboxHandle};
use crate::config::RelayConfig;
use crate::errors::WorkflowError;

/// What to do with a trigger whose scope already has an active session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// Fail the new session; the active one is untouched.
    #[default]
    Reject,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub bot_name: String,
    pub allowed_users: Vec<String>,
    /// Hard budget of one sandbox run.
    pub execution_budget: Duration,
    /// The orchestrator's own deadline sits this far inside the budget.
    pub deadline_margin: Duration,
    pub max_reboots: u32,
    pub provision_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub publish_attempts: u32,
    /// Bound on each progress comment or reaction call.
    pub report_timeout: Duration,
    pub concurrency_policy: ConcurrencyPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

impl OrchestratorConfig {
    pub fn from_config(config: &RelayConfig) -> Self {
        let o = &config.orchestrator;
        Self {
            bot_name: config.github.bot_name.clone(),
            allowed_users: config.allowed_users(),
            execution_budget: config.execution_budget(),
            deadline_margin: Duration::from_secs(o.deadline_margin_secs),
            max_reboots: o.max_reboots,
            provision_attempts: o.provision_attempts,
            backoff_base: Duration::from_millis(o.backoff_base_ms),
            backoff_cap: Duration::from_millis(o.backoff_cap_ms),
            publish_attempts: o.publish_attempts,
            report_timeout: Duration::from_secs(o.report_timeout_secs),
            concurrency_policy: ConcurrencyPolicy::Reject,
        }
    }

    /// When the orchestrator stops waiting for the agent.
    pub fn agent_deadline(&self) -> Duration {
        match self.execution_budget.checked_sub(self.deadline_margin) {
            Some(d) if !d.is_zero() => d,
            _ => self.execution_budget,
        }
    }

    /// `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

/// Cooperative cancellation flag with a wake-up for sleepers.
#[derive(Debug, Default)]
pub struct CancelToken {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

struct ActiveRun {
    cancel: Arc<CancelToken>,
    sandbox: Option<SandboxHandle>,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Flag set and live sandbox torn down; the session task finishes it.
    Cancelling,
    /// Session exists but is not running in this process.
    NotActive,
    NotFound,
}

/// A spawned session task.
pub struct SessionTask {
    pub session_id: String,
    handle: JoinHandle<Result<Session>>,
}

impl SessionTask {
    /// Wait for the session to reach a terminal state.
    pub async fn wait(self) -> Result<Session> {
        self.handle.await.context("Session task panicked")?
    }
}

/// Per-session bookkeeping owned by the session's task.
struct SessionRun {
    id: String,
    repo: String,
    scope_number: u64,
    author: String,
    trigger_text: String,
    /// Last state this task wrote; the expected value for the next CAS.
    state: SessionState,
    handle: Option<SandboxHandle>,
    open_step: Option<(Step, Instant)>,
    cancel: Arc<CancelToken>,
}

pub struct SessionOrchestrator {
    store: DbHandle,
    sandbox: Arc<dyn Sandbox>,
    host: Arc<dyn CodeHost>,
    parser: CommandParser,
    authorizer: Authorizer,
    reporter: ProgressReporter,
    config: OrchestratorConfig,
    active: Mutex<HashMap<String, ActiveRun>>,
}

impl SessionOrchestrator {
    pub fn new(
        store: DbHandle,
        sandbox: Arc<dyn Sandbox>,
        host: Arc<dyn CodeHost>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let parser = CommandParser::new(&config.bot_name)?;
        let authorizer = Authorizer::new(config.allowed_users.iter().cloned());
        let reporter = ProgressReporter::new(
            host.clone(),
            store.clone(),
            config.report_timeout,
        );
        Ok(Self {
            store,
            sandbox,
            host,
            parser,
            authorizer,
            reporter,
            config,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &DbHandle {
        &self.store
    }

    /// Record a session for the trigger and drive it on its own task.
    pub async fn start(self: &Arc<Self>, trigger: Trigger) -> Result<SessionTask> {
        let new = NewSession::from_trigger(&trigger);
        let session = self.store.call(move |db| db.create_session(&new)).await?;
        let cancel = Arc::new(CancelToken::default());
        self.lock_active()?.insert(
            session.id.clone(),
            ActiveRun {
                cancel: cancel.clone(),
                sandbox: None,
            },
        );
        tracing::info!(
            session_id = %session.id,
            repo = %session.repo,
            number = session.scope_number(),
            author = %session.author,
            "Session created"
        );

        let this = Arc::clone(self);
        let session_id = session.id.clone();
        let handle = tokio::spawn(async move { this.drive(session, trigger, cancel).await });
        Ok(SessionTask { session_id, handle })
    }

    /// Start a session and wait for it to finish.
    pub async fn run(self: &Arc<Self>, trigger: Trigger) -> Result<Session> {
        self.start(trigger).await?.wait().await
    }

    /// Request cancellation: set the flag and tear down the live sandbox now.
    pub async fn cancel(&self, session_id: &str) -> Result<CancelOutcome> {
        let live = {
            let active = self.lock_active()?;
            active
                .get(session_id)
                .map(|run| (run.cancel.clone(), run.sandbox.clone()))
        };
        let Some((cancel, sandbox)) = live else {
            let id = session_id.to_string();
            let exists = self.store.call(move |db| db.get_session(&id)).await?;
            return Ok(match exists {
                Some(_) => CancelOutcome::NotActive,
                None => CancelOutcome::NotFound,
            });
        };

        cancel.cancel();
        tracing::info!(session_id, "Cancellation requested");
        if let Some(handle) = sandbox
            && let Err(e) = self.sandbox.terminate(&handle).await
        {
            tracing::warn!(session_id, sandbox = %handle, error = %format!("{:#}", e), "Failed to terminate sandbox on cancel");
        }
        Ok(CancelOutcome::Cancelling)
    }

    /// Fail every non-terminal session left behind by a previous process and
    /// tear down its sandbox. Sessions driven by this process are skipped.
    pub async fn recover_orphans(&self) -> Result<Vec<String>> {
        let sessions = self.store.call(|db| db.list_non_terminal()).await?;
        let live: HashSet<String> = self.lock_active()?.keys().cloned().collect();
        let mut recovered = Vec::new();

        for session in sessions.into_iter().filter(|s| !live.contains(&s.id)) {
            if let Some(sandbox_ref) = &session.sandbox_ref {
                let handle = SandboxHandle(sandbox_ref.clone());
                if let Err(e) = self.sandbox.terminate(&handle).await {
                    tracing::warn!(session_id = %session.id, sandbox = %handle, error = %format!("{:#}", e), "Failed to terminate orphaned sandbox");
                }
            }

            let err = WorkflowError::OrchestratorRestart {
                state: session.state,
            };
            let record = err.to_record();
            if let Some(record) = record.clone() {
                let id = session.id.clone();
                if self.store.call(move |db| db.set_error(&id, &record)).await? {
                    let id = session.id.clone();
                    if let Some(fresh) = self.store.call(move |db| db.get_session(&id)).await? {
                        self.reporter.update(&fresh).await;
                    }
                }
            }
            let open_step = session
                .step_log
                .last()
                .filter(|e| e.status == StepStatus::Running)
                .map(|e| e.step);
            let id = session.id.clone();
            let from = session.state;
            let finished = self
                .store
                .call(move |db| {
                    let finished = db.finish(&id, from, SessionState::Failed, record.as_ref())?;
                    if finished && let Some(step) = open_step {
                        db.append_step(
                            &id,
                            &StepEntry {
                                step,
                                status: StepStatus::Failed,
                                duration_ms: None,
                                detail: Some("orchestrator restarted".to_string()),
                            },
                        )?;
                    }
                    Ok(finished)
                })
                .await?;
            if !finished {
                tracing::debug!(session_id = %session.id, "Orphan changed state during recovery; skipped");
                continue;
            }

            tracing::warn!(session_id = %session.id, state = %from, "Recovered orphaned session");
            let id = session.id.clone();
            if let Some(fresh) = self.store.call(move |db| db.get_session(&id)).await? {
                self.reporter.update(&fresh).await;
            }
            recovered.push(session.id);
        }
        Ok(recovered)
    }

    /// Ids of sessions driven by this process right now.
    pub fn active_sessions(&self) -> Vec<String> {
        self.lock_active()
            .map(|active| active.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn lock_active(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ActiveRun>>> {
        self.active
            .lock()
            .map_err(|e| anyhow::anyhow!("Active session map poisoned: {}", e))
    }

    // ── Session task ──────────────────────────────────────────────────

    async fn drive(
        self: Arc<Self>,
        session: Session,
        trigger: Trigger,
        cancel: Arc<CancelToken>,
    ) -> Result<Session> {
        let mut run = SessionRun {
            id: session.id.clone(),
            repo: session.repo.clone(),
            scope_number: session.scope_number(),
            author: session.author.clone(),
            trigger_text: session.trigger_text.clone(),
            state: session.state,
            handle: None,
            open_step: None,
            cancel,
        };
        let result = match self.advance(&mut run, &trigger).await {
            // Cancellation tears the sandbox down underneath whatever call is
            // in flight; that call's failure is the cancel, not a new error.
            Err(e) if run.cancel.is_cancelled() && !matches!(e, WorkflowError::Cancelled) => {
                tracing::debug!(session_id = %run.id, error = %e, "Step failed after cancellation");
                Err(WorkflowError::Cancelled)
            }
            other => other,
        };
        let finished = self.finalize(&mut run, result).await;
        if let Ok(mut active) = self.lock_active() {
            active.remove(&run.id);
        }
        finished
    }

    async fn advance(&self, run: &mut SessionRun, trigger: &Trigger) -> Result<(), WorkflowError> {
        // Authorize. Nothing is posted until the sender passes.
        self.transition(run, SessionState::Authorizing).await?;
        self.open_step(run, Step::Authorize).await?;
        let parsed = command::resolve(trigger, &self.parser, &self.authorizer)?;
        {
            let id = run.id.clone();
            let ParsedCommand {
                command,
                instruction,
            } = parsed.clone();
            self.store
                .call(move |db| db.set_command(&id, command, instruction.as_deref()))
                .await?;
        }
        self.end_step(run, StepStatus::Done, None).await?;
        self.check_cancel(run)?;

        // Concurrency check and admission
        self.transition(run, SessionState::ConcurrencyCheck).await?;
        self.begin_step(run, Step::ConcurrencyCheck).await?;
        self.check_scope_free(run).await?;
        let host = self
            .host
            .fetch_context(
                &run.repo,
                trigger.number,
                trigger.is_pull_request.then_some(trigger.number),
            )
            .await
            .map_err(|e| WorkflowError::ContextFetch {
                message: format!("{:#}", e),
            })?;
        if trigger.is_pull_request && host.issue.number != trigger.number {
            let id = run.id.clone();
            let issue = host.issue.number;
            self.store.call(move |db| db.set_issue(&id, issue)).await?;
        }
        let branch = branch_name(parsed.command, &host, trigger)?;
        self.admit(run, &branch).await?;
        self.end_step(run, StepStatus::Done, None).await?;
        self.react(run, Reaction::Eyes).await;
        self.check_cancel(run)?;

        // Provision → inject → agent, with checkpoint/reboot and one crash retry.
        let mut checkpoint: Option<Checkpoint> = None;
        let mut baseline: Option<Extraction> = None;
        let mut crash_retried = false;
        let handle = loop {
            let handle = self.provision(run, &branch).await?;
            self.check_cancel(run)?;

            self.begin_step(run, Step::Inject).await?;
            let current = self
                .sandbox
                .extract(&handle)
                .await
                .context("Failed to read branch state")?;
            let git = GitState {
                branch: branch.clone(),
                commits: current.commits.clone(),
                diff: current.diff,
            };
            if baseline.is_none() {
                baseline = Some(current);
            }
            let bundle = context::build_bundle(
                &host,
                &git,
                &TriggerComment {
                    author: run.author.clone(),
                    body: run.trigger_text.clone(),
                },
            );
            let instruction = compose_instruction(&parsed, checkpoint.as_ref());
            self.sandbox
                .inject(&handle, &bundle, &instruction)
                .await
                .context("Failed to inject context")?;
            self.transition(run, SessionState::ContextInjected).await?;
            self.end_step(run, StepStatus::Done, None).await?;
            self.check_cancel(run)?;

            self.transition(run, SessionState::AgentRunning).await?;
            self.begin_step(run, Step::Agent).await?;
            let outcome = match tokio::time::timeout(
                self.config.agent_deadline(),
                self.sandbox.run(&handle, self.config.execution_budget),
            )
            .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => RunOutcome::Crashed {
                    reason: format!("{:#}", e),
                },
                Err(_) => RunOutcome::BudgetExhausted,
            };
            self.check_cancel(run)?;

            match outcome {
                RunOutcome::Completed => {
                    self.end_step(run, StepStatus::Done, None).await?;
                    break handle;
                }
                RunOutcome::BudgetExhausted => {
                    let reboots = checkpoint.as_ref().map_or(0, |c| c.reboots);
                    if reboots >= self.config.max_reboots {
                        return Err(WorkflowError::AgentBudgetExceeded { reboots });
                    }
                    let captured = self.sandbox.checkpoint(&handle).await.map_err(|e| {
                        WorkflowError::CheckpointFailed {
                            message: format!("{:#}", e),
                        }
                    })?;
                    let next = Checkpoint {
                        head: captured.head,
                        transcript_offset: checkpoint.as_ref().map_or(0, |c| c.transcript_offset)
                            + captured.transcript_offset,
                        reboots: reboots + 1,
                    };
                    {
                        let id = run.id.clone();
                        let next = next.clone();
                        self.store
                            .call(move |db| db.set_checkpoint(&id, &next))
                            .await?;
                    }
                    tracing::info!(
                        session_id = %run.id,
                        reboot = next.reboots,
                        max_reboots = self.config.max_reboots,
                        "Execution budget exhausted; rebooting from checkpoint"
                    );
                    let detail = format!(
                        "checkpoint {}/{}, rebooting",
                        next.reboots, self.config.max_reboots
                    );
                    checkpoint = Some(next);
                    self.end_step(run, StepStatus::Interrupted, Some(detail)).await?;
                    self.release_sandbox(run).await;
                    self.transition(run, SessionState::SandboxProvisioning).await?;
                }
                RunOutcome::Crashed { reason } => {
                    if crash_retried {
                        return Err(WorkflowError::AgentCrashed { reason });
                    }
                    crash_retried = true;
                    tracing::warn!(session_id = %run.id, reason = %reason, "Sandbox crashed; re-provisioning once");
                    self.end_step(
                        run,
                        StepStatus::Interrupted,
                        Some("sandbox crashed, retrying".to_string()),
                    )
                    .await?;
                    self.release_sandbox(run).await;
                    self.transition(run, SessionState::SandboxProvisioning).await?;
                }
            }
        };

        // Extract
        self.transition(run, SessionState::ResultExtraction).await?;
        self.begin_step(run, Step::Extract).await?;
        let extraction = self
            .sandbox
            .extract(&handle)
            .await
            .context("Failed to extract results")?;
        let known: HashSet<&str> = baseline
            .iter()
            .flat_map(|b| b.commits.iter().map(|c| c.sha.as_str()))
            .collect();
        let new_commits = extraction
            .commits
            .iter()
            .filter(|c| !known.contains(c.sha.as_str()))
            .count();
        self.end_step(
            run,
            StepStatus::Done,
            Some(format!("{} new commit(s)", new_commits)),
        )
        .await?;
        self.check_cancel(run)?;

        // Publish
        self.transition(run, SessionState::Publishing).await?;
        self.begin_step(run, Step::Publish).await?;
        if parsed.command.pushes_changes() {
            if new_commits == 0 {
                self.end_step(run, StepStatus::Done, Some("no changes".to_string()))
                    .await?;
            } else {
                self.push_branch(&handle, &branch).await?;
                let title = pr_title(parsed.command, &host);
                let body = pr_body(parsed.command, &host, &extraction);
                let pr = self
                    .with_publish_retries("create pull request", || {
                        self.host
                            .create_or_update_pr(&run.repo, &branch, &title, &body)
                    })
                    .await?;
                let id = run.id.clone();
                let url = pr.url.clone();
                self.store.call(move |db| db.set_pr_url(&id, &url)).await?;
                self.end_step(run, StepStatus::Done, None).await?;
            }
        } else {
            let review = extraction
                .summary
                .clone()
                .unwrap_or_else(|| "The review produced no summary.".to_string());
            let body = format!("## Code review\n\n{}", review);
            let target = CommentTarget {
                repo: run.repo.clone(),
                number: run.scope_number,
                comment_id: None,
            };
            self.with_publish_retries("post review", || {
                self.host.post_or_update_comment(&target, &body)
            })
            .await?;
            self.end_step(run, StepStatus::Done, Some("review posted".to_string()))
                .await?;
        }
        Ok(())
    }

    /// Record the outcome, tear down the sandbox and render the final status.
    async fn finalize(
        &self,
        run: &mut SessionRun,
        result: Result<(), WorkflowError>,
    ) -> Result<Session> {
        let (target, record) = match &result {
            Ok(()) => (SessionState::Completed, None),
            Err(e) => (e.terminal_state(), e.to_record()),
        };
        match &result {
            Ok(()) => tracing::info!(session_id = %run.id, "Session completed"),
            Err(WorkflowError::Cancelled) => tracing::info!(session_id = %run.id, "Session cancelled"),
            Err(e) => tracing::warn!(
                session_id = %run.id,
                state = %run.state,
                error = %format!("{:#}", e),
                "Session failed"
            ),
        }

        if run.open_step.is_some() {
            let (status, detail) = match &result {
                Err(WorkflowError::Cancelled) => (StepStatus::Interrupted, Some("cancelled".to_string())),
                _ => (StepStatus::Failed, None),
            };
            if let Err(e) = self.end_step(run, status, detail).await {
                tracing::warn!(session_id = %run.id, error = %e, "Failed to close step");
            }
        }

        self.release_sandbox(run).await;

        // The failure is on the status comment before the session goes terminal.
        if let Some(record) = record.clone() {
            let id = run.id.clone();
            match self.store.call(move |db| db.set_error(&id, &record)).await {
                Ok(true) => self.report(run).await,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(session_id = %run.id, error = %format!("{:#}", e), "Failed to record error before finishing")
                }
            }
        }

        let id = run.id.clone();
        let from = run.state;
        let finished = self
            .store
            .call(move |db| db.finish(&id, from, target, record.as_ref()))
            .await?;
        if finished {
            run.state = target;
        } else {
            tracing::warn!(session_id = %run.id, expected = %from, "Session moved underneath its task; final state left as recorded");
        }

        self.report(run).await;
        match target {
            SessionState::Completed => self.react(run, Reaction::Rocket).await,
            SessionState::Failed | SessionState::TimedOut => {
                self.react(run, Reaction::Confused).await
            }
            _ => {}
        }

        let id = run.id.clone();
        self.store
            .call(move |db| db.get_session(&id))
            .await?
            .with_context(|| format!("Session {} disappeared", run.id))
    }

    // ── Steps ─────────────────────────────────────────────────────────

    async fn transition(&self, run: &mut SessionRun, to: SessionState) -> Result<(), WorkflowError> {
        let id = run.id.clone();
        let from = run.state;
        let moved = self
            .store
            .call(move |db| db.transition(&id, from, to))
            .await?;
        if !moved {
            return Err(anyhow::anyhow!(
                "Session {} is no longer {}; refusing to move it to {}",
                run.id,
                from,
                to
            )
            .into());
        }
        tracing::debug!(session_id = %run.id, from = %from, to = %to, "Session transition");
        run.state = to;
        Ok(())
    }

    async fn begin_step(&self, run: &mut SessionRun, step: Step) -> Result<(), WorkflowError> {
        self.open_step(run, step).await?;
        self.report(run).await;
        Ok(())
    }

    /// Append the running entry without touching the status comment.
    async fn open_step(&self, run: &mut SessionRun, step: Step) -> Result<(), WorkflowError> {
        let id = run.id.clone();
        self.store
            .call(move |db| db.append_step(&id, &StepEntry::running(step)))
            .await?;
        run.open_step = Some((step, Instant::now()));
        Ok(())
    }

    async fn end_step(
        &self,
        run: &mut SessionRun,
        status: StepStatus,
        detail: Option<String>,
    ) -> Result<(), WorkflowError> {
        let Some((step, started)) = run.open_step.take() else {
            return Ok(());
        };
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let entry = StepEntry::closed(step, status, elapsed, detail);
        let id = run.id.clone();
        self.store
            .call(move |db| db.append_step(&id, &entry))
            .await?;
        if status == StepStatus::Interrupted {
            self.report(run).await;
        }
        Ok(())
    }

    fn check_cancel(&self, run: &SessionRun) -> Result<(), WorkflowError> {
        if run.cancel.is_cancelled() {
            Err(WorkflowError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn report(&self, run: &SessionRun) {
        let id = run.id.clone();
        match self.store.call(move |db| db.get_session(&id)).await {
            Ok(Some(session)) => {
                self.reporter.update(&session).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(session_id = %run.id, error = %format!("{:#}", e), "Failed to load session for progress update")
            }
        }
    }

    async fn react(&self, run: &SessionRun, reaction: Reaction) {
        let id = run.id.clone();
        if let Ok(Some(session)) = self.store.call(move |db| db.get_session(&id)).await {
            self.reporter.react(&session, reaction).await;
        }
    }

    // ── Admission ─────────────────────────────────────────────────────

    async fn check_scope_free(&self, run: &SessionRun) -> Result<(), WorkflowError> {
        let repo = run.repo.clone();
        let number = run.scope_number;
        let active = self
            .store
            .call(move |db| db.find_active_by_scope(&repo, number))
            .await?;
        match (active, self.config.concurrency_policy) {
            (Some(active), ConcurrencyPolicy::Reject) => Err(WorkflowError::ConcurrentSession {
                active_session: active.id,
                state: active.state,
            }),
            (None, _) => Ok(()),
        }
    }

    async fn admit(&self, run: &mut SessionRun, branch: &str) -> Result<(), WorkflowError> {
        let id = run.id.clone();
        let branch = branch.to_string();
        let admission = self.store.call(move |db| db.admit(&id, &branch)).await?;
        match admission {
            Admission::Admitted => {
                run.state = SessionState::SandboxProvisioning;
                tracing::info!(session_id = %run.id, "Session admitted");
                Ok(())
            }
            Admission::Rejected {
                active_session,
                state,
            } => Err(WorkflowError::ConcurrentSession {
                active_session,
                state,
            }),
        }
    }

    // ── Sandbox ───────────────────────────────────────────────────────

    async fn provision(
        &self,
        run: &mut SessionRun,
        branch: &str,
    ) -> Result<SandboxHandle, WorkflowError> {
        self.begin_step(run, Step::Provision).await?;
        let attempts = self.config.provision_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            self.check_cancel(run)?;
            match self.sandbox.provision(&run.repo, branch).await {
                Ok(handle) => {
                    if let Ok(mut active) = self.lock_active()
                        && let Some(entry) = active.get_mut(&run.id)
                    {
                        entry.sandbox = Some(handle.clone());
                    }
                    run.handle = Some(handle.clone());

                    let id = run.id.clone();
                    let sandbox_ref = handle.0.clone();
                    let recorded = self
                        .store
                        .call(move |db| db.set_sandbox_ref(&id, &sandbox_ref))
                        .await?;
                    if !recorded {
                        return Err(anyhow::anyhow!(
                            "Session {} reached a terminal state during provisioning",
                            run.id
                        )
                        .into());
                    }
                    // A cancel that raced the provision call missed this handle.
                    self.check_cancel(run)?;

                    let detail = (attempt > 1).then(|| format!("attempt {}", attempt));
                    self.end_step(run, StepStatus::Done, detail).await?;
                    return Ok(handle);
                }
                Err(e) => {
                    last_error = format!("{:#}", e);
                    tracing::warn!(
                        session_id = %run.id,
                        attempt,
                        attempts,
                        error = %last_error,
                        "Sandbox provisioning failed"
                    );
                    if attempt < attempts {
                        let delay = self.config.backoff(attempt);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = run.cancel.cancelled() => {}
                        }
                    }
                }
            }
        }

        Err(WorkflowError::SandboxProvisioning {
            attempts,
            message: last_error,
        })
    }

    async fn release_sandbox(&self, run: &mut SessionRun) {
        let Some(handle) = run.handle.take() else {
            return;
        };
        if let Ok(mut active) = self.lock_active()
            && let Some(entry) = active.get_mut(&run.id)
        {
            entry.sandbox = None;
        }
        if let Err(e) = self.sandbox.terminate(&handle).await {
            tracing::warn!(session_id = %run.id, sandbox = %handle, error = %format!("{:#}", e), "Failed to terminate sandbox");
        }
    }

    /// Push, and on a non-fast-forward rejection re-fetch and try once more.
    async fn push_branch(&self, handle: &SandboxHandle, branch: &str) -> Result<(), WorkflowError> {
        let publish_err = |e: anyhow::Error| WorkflowError::Publish {
            message: format!("{:#}", e),
        };
        match self.sandbox.push(handle, branch).await.map_err(publish_err)? {
            PushOutcome::Pushed => return Ok(()),
            PushOutcome::Rejected { reason } => {
                tracing::info!(branch, reason = %reason, "Push rejected; re-fetching and retrying once");
            }
        }
        if let Err(e) = self.sandbox.refetch(handle, branch).await {
            tracing::warn!(branch, error = %format!("{:#}", e), "Re-fetch before push retry failed");
            return Err(WorkflowError::PushConflict {
                branch: branch.to_string(),
            });
        }
        match self.sandbox.push(handle, branch).await.map_err(publish_err)? {
            PushOutcome::Pushed => Ok(()),
            PushOutcome::Rejected { .. } => Err(WorkflowError::PushConflict {
                branch: branch.to_string(),
            }),
        }
    }

    async fn with_publish_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, WorkflowError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let attempts = self.config.publish_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last_error = format!("{:#}", e);
                    tracing::warn!(attempt, attempts, error = %last_error, "Failed to {}", what);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.backoff(attempt)).await;
                    }
                }
            }
        }
        Err(WorkflowError::Publish {
            message: format!("Failed to {} after {} attempt(s): {}", what, attempts, last_error),
        })
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Issue-scoped commands get a namespaced branch; pull request commands work
/// on the PR's own head branch.
pub fn branch_name(
    command: WorkflowCommand,
    host: &HostContext,
    trigger: &Trigger,
) -> Result<String, WorkflowError> {
    if trigger.is_pull_request {
        host.pull_request
            .as_ref()
            .map(|pr| pr.head_branch.clone())
            .ok_or_else(|| WorkflowError::ContextFetch {
                message: format!("Pull request #{} was not returned by the host", trigger.number),
            })
    } else {
        Ok(issue_branch(trigger.number, command))
    }
}

pub fn issue_branch(issue: u64, command: WorkflowCommand) -> String {
    format!("relay/issue-{}-{}", issue, command)
}

fn compose_instruction(parsed: &ParsedCommand, checkpoint: Option<&Checkpoint>) -> String {
    let mut text = parsed.command.brief().to_string();
    if let Some(instruction) = &parsed.instruction {
        text.push_str("\n\nAdditional instructions from the requester:\n\n");
        text.push_str(instruction);
    }
    if let Some(cp) = checkpoint {
        text.push_str(&format!(
            "\n\nThis session is resuming after reboot {}. Work from the previous \
             environment is already committed on this branch{}. Review it and continue \
             from where it stopped; do not start over.",
            cp.reboots,
            cp.head
                .as_deref()
                .map(|h| format!(" (HEAD {})", h.get(..12).unwrap_or(h)))
                .unwrap_or_default(),
        ));
    }
    text
}

fn pr_title(command: WorkflowCommand, host: &HostContext) -> String {
    match &host.pull_request {
        Some(pr) => pr.title.clone(),
        None => {
            let prefix = match command {
                WorkflowCommand::Plan => "Plan",
                _ => "Implement",
            };
            format!("{}: {} (#{})", prefix, host.issue.title, host.issue.number)
        }
    }
}

fn pr_body(command: WorkflowCommand, host: &HostContext, extraction: &Extraction) -> String {
    let link = match command {
        WorkflowCommand::Plan => format!("Plan for #{}", host.issue.number),
        _ => format!("Closes #{}", host.issue.number),
    };
    let summary = extraction
        .summary
        .as_deref()
        .unwrap_or("No summary was provided.");
    format!("{}\n\n## Summary\n\n{}\n\n---\n*Created by relay `{}`*", link, summary, command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::github::{IssueData, PullRequestData};

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let config = OrchestratorConfig {
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(30),
            ..OrchestratorConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(2), Duration::from_secs(4));
        assert_eq!(config.backoff(3), Duration::from_secs(8));
        assert_eq!(config.backoff(5), Duration::from_secs(30));
        assert_eq!(config.backoff(64), Duration::from_secs(30));
    }

    #[test]
    fn test_agent_deadline_inside_budget() {
        let config = OrchestratorConfig {
            execution_budget: Duration::from_secs(3600),
            deadline_margin: Duration::from_secs(120),
            ..OrchestratorConfig::default()
        };
        assert_eq!(config.agent_deadline(), Duration::from_secs(3480));

        let config = OrchestratorConfig {
            execution_budget: Duration::from_secs(60),
            deadline_margin: Duration::from_secs(120),
            ..OrchestratorConfig::default()
        };
        assert_eq!(config.agent_deadline(), Duration::from_secs(60));
    }

    #[test]
    fn test_issue_branch_is_deterministic() {
        assert_eq!(issue_branch(42, WorkflowCommand::Plan), "relay/issue-42-plan");
        assert_eq!(
            issue_branch(42, WorkflowCommand::Plan),
            issue_branch(42, WorkflowCommand::Plan)
        );
        assert_ne!(
            issue_branch(42, WorkflowCommand::Plan),
            issue_branch(42, WorkflowCommand::Oneshot)
        );
    }

    fn host(pr: Option<&str>) -> HostContext {
        HostContext {
            issue: IssueData {
                number: 42,
                title: "Add retries".into(),
                body: String::new(),
                comments: Vec::new(),
            },
            pull_request: pr.map(|head| PullRequestData {
                number: 124,
                title: "Retries".into(),
                body: "Closes #42".into(),
                head_branch: head.into(),
                base_branch: "main".into(),
                comments: Vec::new(),
            }),
        }
    }

    #[test]
    fn test_pull_request_commands_use_head_branch() {
        let trigger = Trigger::manual("acme/widgets", 124, true, WorkflowCommand::Build, None);
        let branch = branch_name(WorkflowCommand::Build, &host(Some("feature/retries")), &trigger).unwrap();
        assert_eq!(branch, "feature/retries");

        let err = branch_name(WorkflowCommand::Build, &host(None), &trigger).unwrap_err();
        assert!(matches!(err, WorkflowError::ContextFetch { .. }));
    }

    #[test]
    fn test_compose_instruction() {
        let parsed = ParsedCommand {
            command: WorkflowCommand::Build,
            instruction: Some("use tokio".into()),
        };
        let text = compose_instruction(&parsed, None);
        assert!(text.starts_with(WorkflowCommand::Build.brief()));
        assert!(text.ends_with("use tokio"));

        let cp = Checkpoint {
            head: Some("0123456789abcdef".into()),
            transcript_offset: 10,
            reboots: 1,
        };
        let text = compose_instruction(&parsed, Some(&cp));
        assert!(text.contains("reboot 1"));
        assert!(text.contains("HEAD 0123456789ab"));

        // Heads from other sandboxes need not be 40 ASCII hex characters.
        for head in ["abc", "aéééééé"] {
            let cp = Checkpoint {
                head: Some(head.into()),
                ..cp.clone()
            };
            let text = compose_instruction(&parsed, Some(&cp));
            assert!(text.contains(&format!("(HEAD {})", head)));
        }
    }

    #[test]
    fn test_pr_title_and_body() {
        let h = host(None);
        assert_eq!(pr_title(WorkflowCommand::Plan, &h), "Plan: Add retries (#42)");
        let body = pr_body(WorkflowCommand::Oneshot, &h, &Extraction::default());
        assert!(body.starts_with("Closes #42"));
        assert!(body.contains("No summary was provided."));
        assert_eq!(pr_title(WorkflowCommand::Build, &host(Some("f"))), "Retries");
    }

    #[tokio::test]
    async fn test_cancel_token_wakes_waiters() {
        let token = Arc::new(CancelToken::default());
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
        // Already-cancelled tokens return immediately.
        token.cancelled().await;
    }
}
