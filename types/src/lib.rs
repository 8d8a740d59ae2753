//! Core domain types for Burnish.
//!
//! Everything here is plain data shared between the supervisor, the
//! extension runners, and the CLI: project and runner statuses, action and
//! handler definitions, run requests/responses, and lint/format result
//! payloads. No IO, no async.

mod action;
mod lint;
mod run;
mod status;

pub use action::{ActionDefinition, ActionHandlerDefinition, ActionSource, UpdateConfigRequest};
pub use lint::{LintMessage, LintMessageSeverity, Position, Range, TextEdit};
pub use run::{
    ClassifyResult, FormatFileResult, FormatResult, LintResult, PartialResult, RunActionOptions,
    RunActionRequest, RunActionResponse, RunPayload, RunResult, RunStatus, path_key,
};
pub use status::{ProjectStatus, RunnerStatus};

/// Name of the dependency group that hosts preset resolution and must exist
/// for every Burnish-enabled project.
pub const DEV_WORKSPACE_ENV: &str = "dev_workspace";

/// Name of the dependency group synthesized from `project.dependencies`.
pub const RUNTIME_ENV: &str = "runtime";

/// Directory that holds per-environment runner installations.
pub const ENVS_DIR_NAME: &str = ".venvs";

/// Directory a resolved configuration is dumped into.
pub const CONFIG_DUMP_DIR_NAME: &str = "burnish_config_dump";

/// Project definition file name.
pub const PROJECT_DEF_FILENAME: &str = "pyproject.toml";
