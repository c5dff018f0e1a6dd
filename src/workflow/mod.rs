//! Workflow sessions: comment-triggered agent runs against a repository.
//!
//! ## Overview
//!
//! A trigger (an `@relay <command>` comment, or an operator request) becomes
//! a session. The orchestrator authorizes it, admits at most one session per
//! issue or pull request, provisions a sandbox, injects a context bundle,
//! runs the agent under an execution budget (checkpointing and rebooting
//! when the budget runs out), then publishes the result as a pull request
//! or review comment. Progress is mirrored into a single status comment.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐  HTTP  ┌──────────────────────────────────────────────────┐
//! │ webhook  │ ─────> │  server.rs  (router, adapters wiring)            │
//! │ / CLI    │ <───── │    └─ api.rs  (handlers, AppState, ApiError)     │
//! └──────────┘        │         │                                        │
//!                     │         │ SessionOrchestrator::start()           │
//!                     │         v                                        │
//!                     │  orchestrator.rs  (state machine, reboot loop)   │
//!                     │     │        │         │            │            │
//!                     │  command.rs  db.rs  sandbox.rs   github.rs       │
//!                     │     │                   │            │            │
//!                     │  context.rs (bundle)  progress.rs (status comment)│
//!                     └──────────────────────────────────────────────────┘
//! ```
//!
//! | Module         | Responsibility                                         |
//! |----------------|--------------------------------------------------------|
//! | `models`       | Triggers, senders, `Session`, re-exported common types |
//! | `db`           | SQLite store via `DbHandle`; CAS transitions, admission|
//! | `command`      | `@bot <command>` parsing, allowlist, scope validation  |
//! | `github`       | `CodeHost` trait and the GitHub REST adapter           |
//! | `sandbox`      | `Sandbox` trait and the local git-checkout adapter     |
//! | `context`      | Deterministic Markdown context bundle                  |
//! | `progress`     | Status comment rendering and posting                   |
//! | `testing`      | In-memory `Sandbox` and `CodeHost` doubles             |

pub mod api;
pub mod command;
pub mod context;
pub mod db;
pub mod github;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod sandbox;
pub mod server;
pub mod testing;
