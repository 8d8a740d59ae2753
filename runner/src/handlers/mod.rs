//! Action handlers and the built-in handler registry.
//!
//! A handler is the unit of work inside an action: it consumes the run
//! payload, folds its findings into the run's aggregate through
//! [`RunContext::emit_partial`], and cooperates with cancellation by
//! returning [`HandlerError::Cancelled`] when its token fires. The partial
//! aggregate folded so far is what a stopped run reports.

mod classify;
mod config_dump;
mod env;
mod format;
mod lint;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use burnish_rpc::CancelToken;
use burnish_types::{FormatFileResult, RunPayload, RunResult, path_key};

use crate::cache::FileCache;
use crate::error::RunnerError;
use crate::fs::FileManager;

pub use classify::ByExtension;
pub use config_dump::ConfigDump;
pub use env::PrepareEnvs;
pub use format::{FinalNewline, TrimWhitespace};
pub use lint::{Tabs, TrailingWhitespace};

/// Why a handler gave up.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The run's cancel token fired; the aggregate holds the partial result.
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Identity of the project this runner serves, fixed at configuration time.
#[derive(Debug, Clone)]
pub struct ProjectInfo {
    pub working_dir: PathBuf,
    pub name: String,
    pub def_path: PathBuf,
    /// The environment this runner process was started for.
    pub env_name: String,
}

/// Long-lived services handlers are constructed over.
#[derive(Clone)]
pub struct HandlerServices {
    pub files: Arc<FileManager>,
    pub cache: Arc<FileCache>,
    pub project: ProjectInfo,
}

/// Per-run state shared between the engine and the handlers it drives.
pub struct RunContext {
    cancel: CancelToken,
    aggregate: Arc<Mutex<RunResult>>,
    progress_tx: Option<mpsc::UnboundedSender<serde_json::Value>>,
}

impl RunContext {
    #[must_use]
    pub fn new(
        cancel: CancelToken,
        aggregate: Arc<Mutex<RunResult>>,
        progress_tx: Option<mpsc::UnboundedSender<serde_json::Value>>,
    ) -> Self {
        Self {
            cancel,
            aggregate,
            progress_tx,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fold a partial result into the run aggregate and stream it to the
    /// caller when a partial-result token was supplied.
    pub fn emit_partial(&self, partial: RunResult) {
        if let Some(tx) = &self.progress_tx
            && let Ok(value) = serde_json::to_value(&partial)
        {
            let _ = tx.send(value);
        }
        self.aggregate
            .lock()
            .expect("run aggregate poisoned")
            .update(partial);
    }

    /// Output of an earlier format handler for `path`, so chained format
    /// handlers operate on each other's code instead of the original.
    #[must_use]
    pub fn prior_format(&self, path: &Path) -> Option<FormatFileResult> {
        let aggregate = self.aggregate.lock().expect("run aggregate poisoned");
        match &*aggregate {
            RunResult::Format(format) => format.result_by_file_path.get(&path_key(path)).cloned(),
            _ => None,
        }
    }
}

/// One implementation unit of an action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Invoked once, when the instance is first used by a run.
    async fn on_initialize(&self) {}

    /// Execute over the payload, folding results via
    /// [`RunContext::emit_partial`].
    async fn run(&self, payload: &RunPayload, ctx: &RunContext) -> Result<(), HandlerError>;

    /// Invoked once when the runner receives `shutdown` or the owning
    /// action is reloaded.
    async fn on_shutdown(&self) {}

    /// Invoked on the `exit` notification, right before the process ends.
    async fn on_exit(&self) {}
}

/// Construct a built-in handler by its source identifier.
pub fn build_handler(
    source: &str,
    config: &serde_json::Value,
    services: &HandlerServices,
) -> Result<Arc<dyn ActionHandler>, RunnerError> {
    match source {
        "burnish.format.trim_whitespace" => Ok(Arc::new(TrimWhitespace::new(services.clone()))),
        "burnish.format.final_newline" => Ok(Arc::new(FinalNewline::new(services.clone()))),
        "burnish.lint.trailing_whitespace" => {
            Ok(Arc::new(TrailingWhitespace::new(config, services.clone())))
        }
        "burnish.lint.tabs" => Ok(Arc::new(Tabs::new(config, services.clone()))),
        "burnish.classify.by_extension" => Ok(Arc::new(ByExtension::new(config, services.clone()))),
        "burnish.env.prepare" => Ok(Arc::new(PrepareEnvs::new(services.clone()))),
        "burnish.config.dump" => Ok(Arc::new(ConfigDump::new(services.clone()))),
        other => Err(RunnerError::UnknownHandlerSource(other.to_string())),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Context over a fresh aggregate, no progress streaming.
    pub fn context_for(result: RunResult) -> (RunContext, Arc<Mutex<RunResult>>) {
        let aggregate = Arc::new(Mutex::new(result));
        let ctx = RunContext::new(CancelToken::new(), aggregate.clone(), None);
        (ctx, aggregate)
    }

    pub fn services_in(dir: &Path) -> HandlerServices {
        let files = Arc::new(FileManager::new());
        HandlerServices {
            cache: Arc::new(FileCache::new(files.clone())),
            files,
            project: ProjectInfo {
                working_dir: dir.to_path_buf(),
                name: "testproj".to_string(),
                def_path: dir.join("pyproject.toml"),
                env_name: "dev_workspace".to_string(),
            },
        }
    }
}
