//! Shared domain types for relay.
//!
//! Everything here is plain data: session states and their transition
//! table, the command set, step-log entries, error records and the
//! checkpoint blob. Nothing in this crate performs I/O.

pub mod session;

pub use session::{
    Checkpoint, ErrorKind, ErrorRecord, SessionState, Step, StepEntry, StepStatus,
    WorkflowCommand,
};
