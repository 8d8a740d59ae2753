use std::path::PathBuf;

use burnish_rpc::RpcError;

/// Errors surfaced by the workspace manager.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("no project containing {} declares the requested action", .0.display())]
    ActionNotFound(PathBuf),

    #[error("project '{}' is not registered in the workspace", .0.display())]
    ProjectNotFound(PathBuf),

    #[error("runner for {} env '{env}' failed to start: {reason}", .project.display())]
    RunnerFailedToStart {
        project: PathBuf,
        env: String,
        reason: String,
    },

    #[error("environment '{env}' of {} has no runner installed", .project.display())]
    NoVenv { project: PathBuf, env: String },

    #[error("action run failed: {0}")]
    ActionRunFailed(String),

    #[error(transparent)]
    Config(#[from] burnish_config::ConfigError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
