use burnish_rpc::ErrorObject;

/// Errors surfaced by the action engine and its handlers.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("action '{0}' not found")]
    ActionNotFound(String),

    #[error("action '{action}' has no handler for this environment")]
    NoHandlersForEnv { action: String },

    #[error("invalid payload for action '{action}': {message}")]
    InvalidPayload { action: String, message: String },

    #[error("handler '{handler}' failed: {message}")]
    HandlerFailed { handler: String, message: String },

    #[error("unknown handler source '{0}'")]
    UnknownHandlerSource(String),

    #[error("action '{action}' declares unknown source '{source_name}'")]
    UnknownActionSource { action: String, source_name: String },

    #[error("runner is not configured yet")]
    NotConfigured,

    #[error(transparent)]
    Config(#[from] burnish_config::ConfigError),

    #[error("file access failed: {0}")]
    File(#[from] FileError),
}

impl RunnerError {
    /// Wire representation for a failed `workspace/executeCommand`.
    #[must_use]
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            Self::ActionNotFound(_) | Self::NoHandlersForEnv { .. } => {
                ErrorObject::invalid_params(self.to_string())
            }
            Self::InvalidPayload { .. } => ErrorObject::invalid_params(self.to_string()),
            _ => ErrorObject::internal(self.to_string()),
        }
    }
}

/// Errors from the file manager and the file-scoped cache.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to write {path}: {message}")]
    Write { path: String, message: String },

    #[error("client did not return document {path}: {message}")]
    ClientDocument { path: String, message: String },

    #[error("stale version for {path}: cache holds {offered}, current is {current}")]
    StaleVersion {
        path: String,
        offered: String,
        current: String,
    },
}
