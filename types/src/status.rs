//! Project and runner lifecycle statuses.

use serde::{Deserialize, Serialize};

/// Status of a discovered project.
///
/// A project reaches [`ProjectStatus::Running`] only after its required
/// runner finished the initialize handshake and its configuration resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Configuration parsed and fully resolved.
    ConfigValid,
    /// A `pyproject.toml` exists but the project is not Burnish-enabled.
    NoBurnish,
    /// The project's runner is initialized and serving.
    Running,
    /// The runner failed during startup or configuration.
    RunnerFailed,
    /// The required environment directory is missing.
    NoVenv,
    /// The runner process exited.
    Exited,
}

impl ProjectStatus {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::ConfigValid => "config_valid",
            Self::NoBurnish => "no_burnish",
            Self::Running => "running",
            Self::RunnerFailed => "runner_failed",
            Self::NoVenv => "no_venv",
            Self::Exited => "exited",
        }
    }
}

/// Status of a single (project, environment) runner process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    /// Spawned; handshake not yet complete.
    Initializing,
    /// Handshake and configuration push succeeded.
    Running,
    /// Startup or configuration failed.
    Failed,
    /// The environment's runner executable is missing.
    NoVenv,
    /// The process ended, by request or by death.
    Exited,
}

impl RunnerStatus {
    /// Whether requests may be sent to this runner.
    #[must_use]
    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    /// Whether this is a terminal state that a restart can leave.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::NoVenv | Self::Exited)
    }
}
