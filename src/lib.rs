//! mirage_term: a telnet terminal whose shell and filesystem are invented
//! by a language model, kept consistent by a per-session state store.
//!
//! This library crate re-exports modules so integration tests
//! (under `tests/`) can access them.

pub mod config;
pub mod context;
pub mod decoder;
pub mod models;
pub mod render;
pub mod server;
pub mod session;
pub mod terminal;
pub mod tools;
pub mod vfs;

/// Return the Mirage home directory.
///
/// Resolution order:
/// 1. `MIRAGE_HOME` environment variable
/// 2. `$HOME/.mirage`
pub fn mirage_home() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("MIRAGE_HOME") {
        std::path::PathBuf::from(p)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".mirage")
    }
}
