//! CLI command implementations.
//!
//! | Module     | Commands handled            |
//! |------------|-----------------------------|
//! | `serve`    | `Serve`                     |
//! | `trigger`  | `Trigger`                   |
//! | `sessions` | `Sessions list`, `show`     |
//! | `cancel`   | `Cancel`                    |
//! | `recover`  | `Recover`                   |
//! | `config`   | `Config`                    |

pub mod cancel;
pub mod config;
pub mod recover;
pub mod serve;
pub mod sessions;
pub mod trigger;

pub use cancel::cmd_cancel;
pub use config::cmd_config;
pub use recover::cmd_recover;
pub use serve::cmd_serve;
pub use sessions::cmd_sessions;
pub use trigger::cmd_trigger;
