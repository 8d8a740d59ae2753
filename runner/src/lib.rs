//! The extension runner.
//!
//! One runner process serves one (project, environment) pair: it holds the
//! handler registries for that env, executes action runs on behalf of the
//! supervisor, and reaches back over the same connection for client-owned
//! documents. The `burnish-runner` binary in this crate is what the
//! supervisor spawns out of `<project>/.venvs/<env>/bin`.

pub mod cache;
pub mod engine;
pub mod error;
pub mod fs;
pub mod handlers;
pub mod server;

pub use engine::ActionEngine;
pub use error::{FileError, RunnerError};
pub use server::{ServeOptions, serve};
