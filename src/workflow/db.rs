use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the session database.
///
/// Wraps `SessionDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so SQLite I/O never ties up
/// async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<SessionDb>>,
}

impl DbHandle {
    pub fn new(db: SessionDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SessionDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, SessionDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Result of trying to admit a session for its scope.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted,
    /// Another session already holds the scope.
    Rejected {
        active_session: String,
        state: SessionState,
    },
}

const SESSION_COLUMNS: &str = "id, repo, issue, pr, command, instruction, state, sandbox_ref, branch, \
     checkpoint, author, trigger_text, comment_id, progress_comment_id, pr_url, error_kind, \
     error_message, retryable, created_at, updated_at, terminal_at";

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `'a', 'b', ...` list for an `IN (...)` clause over fixed state names.
fn state_list(states: &[SessionState]) -> String {
    states
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct SessionDb {
    conn: Connection,
}

impl SessionDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL journal")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        let admitted = state_list(&SessionState::ADMITTED);
        let terminal = state_list(&SessionState::TERMINAL);
        self.conn
            .execute_batch(&format!(
                "
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    repo TEXT NOT NULL,
                    scope_number INTEGER NOT NULL,
                    issue INTEGER NOT NULL,
                    pr INTEGER,
                    command TEXT,
                    instruction TEXT,
                    state TEXT NOT NULL DEFAULT 'created',
                    sandbox_ref TEXT,
                    branch TEXT,
                    checkpoint TEXT,
                    author TEXT NOT NULL,
                    trigger_text TEXT NOT NULL DEFAULT '',
                    comment_id INTEGER,
                    progress_comment_id INTEGER,
                    pr_url TEXT,
                    error_kind TEXT,
                    error_message TEXT,
                    retryable INTEGER,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    terminal_at TEXT
                );

                CREATE TABLE IF NOT EXISTS session_steps (
                    session_id TEXT NOT NULL REFERENCES sessions(id),
                    seq INTEGER NOT NULL,
                    step TEXT NOT NULL,
                    status TEXT NOT NULL,
                    duration_ms INTEGER,
                    detail TEXT,
                    PRIMARY KEY (session_id, seq)
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_scope ON sessions(repo, scope_number);
                CREATE INDEX IF NOT EXISTS idx_sessions_state ON sessions(state);
                CREATE INDEX IF NOT EXISTS idx_sessions_created ON sessions(created_at);

                CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_admitted_scope
                    ON sessions(repo, scope_number)
                    WHERE state IN ({admitted});

                CREATE TRIGGER IF NOT EXISTS trg_session_steps_no_update
                    BEFORE UPDATE ON session_steps
                BEGIN
                    SELECT RAISE(ABORT, 'session_steps is append-only');
                END;

                CREATE TRIGGER IF NOT EXISTS trg_session_steps_no_delete
                    BEFORE DELETE ON session_steps
                BEGIN
                    SELECT RAISE(ABORT, 'session_steps is append-only');
                END;

                CREATE TRIGGER IF NOT EXISTS trg_sessions_branch_immutable
                    BEFORE UPDATE OF branch ON sessions
                    WHEN OLD.branch IS NOT NULL AND NEW.branch IS NOT OLD.branch
                BEGIN
                    SELECT RAISE(ABORT, 'branch is immutable once assigned');
                END;

                CREATE TRIGGER IF NOT EXISTS trg_sessions_terminal_no_sandbox
                    BEFORE UPDATE OF sandbox_ref ON sessions
                    WHEN OLD.state IN ({terminal}) AND NEW.sandbox_ref IS NOT OLD.sandbox_ref
                BEGIN
                    SELECT RAISE(ABORT, 'terminal sessions cannot acquire a sandbox');
                END;
                "
            ))
            .context("Failed to create session tables")?;
        Ok(())
    }

    // ── Sessions ──────────────────────────────────────────────────────

    pub fn create_session(&self, new: &NewSession) -> Result<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO sessions (id, repo, scope_number, issue, pr, author, trigger_text, comment_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id,
                    new.repo,
                    new.pr.unwrap_or(new.issue),
                    new.issue,
                    new.pr,
                    new.author,
                    new.trigger_text,
                    new.comment_id,
                    ts,
                ],
            )
            .context("Failed to insert session")?;
        self.get_session(&id)?
            .context("Session not found after insert")
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                params![id],
                SessionRow::from_row,
            )
            .optional()
            .context("Failed to query session")?;
        match row {
            Some(row) => {
                let steps = self.get_steps(id)?;
                Ok(Some(row.into_session(steps)?))
            }
            None => Ok(None),
        }
    }

    /// Current admitted (non-terminal) session for a scope, if any.
    pub fn find_active_by_scope(&self, repo: &str, scope_number: u64) -> Result<Option<Session>> {
        let id: Option<String> = self
            .conn
            .query_row(
                &format!(
                    "SELECT id FROM sessions WHERE repo = ?1 AND scope_number = ?2 AND state IN ({})",
                    state_list(&SessionState::ADMITTED)
                ),
                params![repo, scope_number],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query active session for scope")?;
        match id {
            Some(id) => self.get_session(&id),
            None => Ok(None),
        }
    }

    pub fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM sessions
                 WHERE (?1 IS NULL OR repo = ?1) AND (?2 IS NULL OR state = ?2)
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?3",
                SESSION_COLUMNS
            ))
            .context("Failed to prepare list_sessions")?;
        let rows = stmt
            .query_map(
                params![
                    filter.repo,
                    filter.state.map(|s| s.as_str()),
                    filter.limit
                ],
                SessionRow::from_row,
            )
            .context("Failed to query sessions")?;
        self.collect_sessions(rows)
    }

    /// Sessions that never reached a terminal state (recovery candidates).
    pub fn list_non_terminal(&self) -> Result<Vec<Session>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM sessions WHERE state NOT IN ({}) ORDER BY created_at ASC, rowid ASC",
                SESSION_COLUMNS,
                state_list(&SessionState::TERMINAL)
            ))
            .context("Failed to prepare list_non_terminal")?;
        let rows = stmt
            .query_map([], SessionRow::from_row)
            .context("Failed to query non-terminal sessions")?;
        self.collect_sessions(rows)
    }

    fn collect_sessions(
        &self,
        rows: impl Iterator<Item = rusqlite::Result<SessionRow>>,
    ) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for row in rows {
            let row = row.context("Failed to read session row")?;
            let steps = self.get_steps(&row.id)?;
            sessions.push(row.into_session(steps)?);
        }
        Ok(sessions)
    }

    /// Compare-and-set state write. Returns `false` when the session is no
    /// longer in `from` (someone else moved it).
    pub fn transition(&self, id: &str, from: SessionState, to: SessionState) -> Result<bool> {
        if !from.can_transition_to(to) {
            anyhow::bail!("Invalid session transition: {} -> {}", from, to);
        }
        let ts = now();
        let changed = self
            .conn
            .execute(
                "UPDATE sessions
                 SET state = ?1, updated_at = ?2,
                     terminal_at = CASE WHEN ?3 THEN ?2 ELSE terminal_at END
                 WHERE id = ?4 AND state = ?5",
                params![to.as_str(), ts, to.is_terminal(), id, from.as_str()],
            )
            .context("Failed to update session state")?;
        Ok(changed == 1)
    }

    /// Move `concurrency_check → sandbox_provisioning` and assign the branch,
    /// unless another session already holds the scope.
    pub fn admit(&self, id: &str, branch: &str) -> Result<Admission> {
        let ts = now();
        let result = self.conn.execute(
            &format!(
                "UPDATE sessions
                 SET state = ?1, branch = COALESCE(branch, ?2), updated_at = ?3
                 WHERE id = ?4 AND state = ?5
                   AND NOT EXISTS (
                       SELECT 1 FROM sessions other
                       WHERE other.repo = sessions.repo
                         AND other.scope_number = sessions.scope_number
                         AND other.id <> sessions.id
                         AND other.state IN ({})
                   )",
                state_list(&SessionState::ADMITTED)
            ),
            params![
                SessionState::SandboxProvisioning.as_str(),
                branch,
                ts,
                id,
                SessionState::ConcurrencyCheck.as_str(),
            ],
        );

        let changed = match result {
            Ok(changed) => changed,
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => 0,
            Err(e) => return Err(e).context("Failed to admit session"),
        };
        if changed == 1 {
            return Ok(Admission::Admitted);
        }

        let session = self
            .get_session(id)?
            .with_context(|| format!("Session {} not found", id))?;
        if session.state != SessionState::ConcurrencyCheck {
            anyhow::bail!(
                "Session {} is {}, expected {}",
                id,
                session.state,
                SessionState::ConcurrencyCheck
            );
        }
        match self.find_active_by_scope(&session.repo, session.scope_number())? {
            Some(active) => Ok(Admission::Rejected {
                active_session: active.id,
                state: active.state,
            }),
            None => anyhow::bail!("Admission of session {} failed without a competing session", id),
        }
    }

    /// CAS into a terminal state, recording the error (if any).
    pub fn finish(
        &self,
        id: &str,
        from: SessionState,
        to: SessionState,
        error: Option<&ErrorRecord>,
    ) -> Result<bool> {
        if !to.is_terminal() {
            anyhow::bail!("finish() requires a terminal state, got {}", to);
        }
        if !from.can_transition_to(to) {
            anyhow::bail!("Invalid session transition: {} -> {}", from, to);
        }
        let ts = now();
        let changed = self
            .conn
            .execute(
                "UPDATE sessions
                 SET state = ?1, updated_at = ?2, terminal_at = ?2,
                     error_kind = ?3, error_message = ?4, retryable = ?5
                 WHERE id = ?6 AND state = ?7",
                params![
                    to.as_str(),
                    ts,
                    error.map(|e| e.kind.as_str()),
                    error.map(|e| e.message.as_str()),
                    error.map(|e| e.retryable),
                    id,
                    from.as_str(),
                ],
            )
            .context("Failed to finish session")?;
        Ok(changed == 1)
    }

    /// Record the error ahead of the terminal write so it can be reported
    /// first. Returns `false` once the session is terminal.
    pub fn set_error(&self, id: &str, error: &ErrorRecord) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE sessions
                     SET error_kind = ?1, error_message = ?2, retryable = ?3, updated_at = ?4
                     WHERE id = ?5 AND state NOT IN ({})",
                    state_list(&SessionState::TERMINAL)
                ),
                params![
                    error.kind.as_str(),
                    error.message,
                    error.retryable,
                    now(),
                    id,
                ],
            )
            .context("Failed to record session error")?;
        Ok(changed == 1)
    }

    pub fn set_command(
        &self,
        id: &str,
        command: WorkflowCommand,
        instruction: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET command = ?1, instruction = ?2, updated_at = ?3 WHERE id = ?4",
                params![command.as_str(), instruction, now(), id],
            )
            .context("Failed to record session command")?;
        Ok(())
    }

    pub fn set_issue(&self, id: &str, issue: u64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET issue = ?1, updated_at = ?2 WHERE id = ?3",
                params![issue, now(), id],
            )
            .context("Failed to record session issue")?;
        Ok(())
    }

    /// Record the live sandbox handle. Returns `false` if the session is
    /// already terminal; the caller owns tearing the handle down.
    pub fn set_sandbox_ref(&self, id: &str, sandbox_ref: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE sessions SET sandbox_ref = ?1, updated_at = ?2
                     WHERE id = ?3 AND state NOT IN ({})",
                    state_list(&SessionState::TERMINAL)
                ),
                params![sandbox_ref, now(), id],
            )
            .context("Failed to record sandbox handle")?;
        Ok(changed == 1)
    }

    pub fn set_checkpoint(&self, id: &str, checkpoint: &Checkpoint) -> Result<()> {
        let blob = checkpoint
            .to_blob()
            .context("Failed to serialize checkpoint")?;
        self.conn
            .execute(
                "UPDATE sessions SET checkpoint = ?1, updated_at = ?2 WHERE id = ?3",
                params![blob, now(), id],
            )
            .context("Failed to record checkpoint")?;
        Ok(())
    }

    pub fn set_progress_comment(&self, id: &str, comment_id: u64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET progress_comment_id = ?1 WHERE id = ?2",
                params![comment_id, id],
            )
            .context("Failed to record progress comment")?;
        Ok(())
    }

    pub fn set_pr_url(&self, id: &str, pr_url: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET pr_url = ?1, updated_at = ?2 WHERE id = ?3",
                params![pr_url, now(), id],
            )
            .context("Failed to record PR url")?;
        Ok(())
    }

    // ── Step log ──────────────────────────────────────────────────────

    /// Append one entry; sequence numbers are allocated inside the insert.
    pub fn append_step(&self, id: &str, entry: &StepEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO session_steps (session_id, seq, step, status, duration_ms, detail)
                 SELECT ?1, COALESCE(MAX(seq), 0) + 1, ?2, ?3, ?4, ?5
                 FROM session_steps WHERE session_id = ?1",
                params![
                    id,
                    entry.step.as_str(),
                    entry.status.as_str(),
                    entry.duration_ms,
                    entry.detail,
                ],
            )
            .context("Failed to append step")?;
        Ok(())
    }

    pub fn get_steps(&self, id: &str) -> Result<Vec<StepEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT step, status, duration_ms, detail FROM session_steps
                 WHERE session_id = ?1 ORDER BY seq ASC",
            )
            .context("Failed to prepare get_steps")?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(StepRow {
                    step: row.get(0)?,
                    status: row.get(1)?,
                    duration_ms: row.get(2)?,
                    detail: row.get(3)?,
                })
            })
            .context("Failed to query steps")?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row.context("Failed to read step row")?.into_step_entry()?);
        }
        Ok(steps)
    }
}

// ── Row conversion ────────────────────────────────────────────────────

/// Intermediate row struct for sessions.
struct SessionRow {
    id: String,
    repo: String,
    issue: u64,
    pr: Option<u64>,
    command: Option<String>,
    instruction: Option<String>,
    state: String,
    sandbox_ref: Option<String>,
    branch: Option<String>,
    checkpoint: Option<String>,
    author: String,
    trigger_text: String,
    comment_id: Option<u64>,
    progress_comment_id: Option<u64>,
    pr_url: Option<String>,
    error_kind: Option<String>,
    error_message: Option<String>,
    retryable: Option<bool>,
    created_at: String,
    updated_at: String,
    terminal_at: Option<String>,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repo: row.get(1)?,
            issue: row.get(2)?,
            pr: row.get(3)?,
            command: row.get(4)?,
            instruction: row.get(5)?,
            state: row.get(6)?,
            sandbox_ref: row.get(7)?,
            branch: row.get(8)?,
            checkpoint: row.get(9)?,
            author: row.get(10)?,
            trigger_text: row.get(11)?,
            comment_id: row.get(12)?,
            progress_comment_id: row.get(13)?,
            pr_url: row.get(14)?,
            error_kind: row.get(15)?,
            error_message: row.get(16)?,
            retryable: row.get(17)?,
            created_at: row.get(18)?,
            updated_at: row.get(19)?,
            terminal_at: row.get(20)?,
        })
    }

    fn into_session(self, step_log: Vec<StepEntry>) -> Result<Session> {
        let state = SessionState::from_str(&self.state)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse session state")?;
        let command = self
            .command
            .as_deref()
            .map(WorkflowCommand::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse session command")?;
        let checkpoint = self
            .checkpoint
            .as_deref()
            .map(Checkpoint::from_blob)
            .transpose()
            .context("Failed to parse session checkpoint")?;
        let error = match self.error_kind {
            Some(kind) => Some(ErrorRecord {
                kind: ErrorKind::from_str(&kind)
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("Failed to parse error kind")?,
                message: self.error_message.unwrap_or_default(),
                retryable: self.retryable.unwrap_or(false),
            }),
            None => None,
        };
        Ok(Session {
            id: self.id,
            repo: self.repo,
            issue: self.issue,
            pr: self.pr,
            command,
            instruction: self.instruction,
            state,
            sandbox_ref: self.sandbox_ref,
            branch: self.branch,
            checkpoint,
            author: self.author,
            trigger_text: self.trigger_text,
            comment_id: self.comment_id,
            progress_comment_id: self.progress_comment_id,
            pr_url: self.pr_url,
            error,
            step_log,
            created_at: self.created_at,
            updated_at: self.updated_at,
            terminal_at: self.terminal_at,
        })
    }
}

struct StepRow {
    step: String,
    status: String,
    duration_ms: Option<u64>,
    detail: Option<String>,
}

impl StepRow {
    fn into_step_entry(self) -> Result<StepEntry> {
        Ok(StepEntry {
            step: Step::from_str(&self.step)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse step")?,
            status: StepStatus::from_str(&self.status)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse step status")?,
            duration_ms: self.duration_ms,
            detail: self.detail,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
