//! Workspace management: project discovery, runner supervision, action
//! routing, and the IDE surface.
//!
//! [`WorkspaceManager`] is the single entry point the CLI uses. It owns the
//! project registry, starts extension runner processes on demand (one per
//! project and environment), and routes action runs to them.

pub mod context;
pub mod error;
pub mod ide;
pub mod progress;
pub mod routing;
pub mod supervisor;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use burnish_rpc::CancelToken;
use burnish_types::{RunActionOptions, RunActionRequest, RunActionResponse};

pub use context::{OpenedDocument, Project, WorkspaceContext};
pub use error::WorkspaceError;
pub use progress::ProgressHub;
pub use supervisor::{RunnerSupervisor, WorkspaceEvent};

pub struct WorkspaceManager {
    context: Arc<WorkspaceContext>,
    progress: Arc<ProgressHub>,
    supervisor: Arc<RunnerSupervisor>,
}

impl Default for WorkspaceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceManager {
    #[must_use]
    pub fn new() -> Self {
        let context = Arc::new(WorkspaceContext::new());
        let progress = Arc::new(ProgressHub::new());
        let supervisor = Arc::new(RunnerSupervisor::new(context.clone(), progress.clone()));
        Self {
            context,
            progress,
            supervisor,
        }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<WorkspaceContext> {
        &self.context
    }

    #[must_use]
    pub fn supervisor(&self) -> &Arc<RunnerSupervisor> {
        &self.supervisor
    }

    /// Register every project under a directory.
    pub fn add_workspace_dir(&self, dir: &Path) {
        self.context.add_workspace_dir(dir);
    }

    /// Subscribe to partial results published under a progress token.
    #[must_use]
    pub fn subscribe_progress(&self, token: &str) -> mpsc::UnboundedReceiver<Value> {
        self.progress.subscribe(token)
    }

    /// Run an action in the project owning `trigger_path` (deepest
    /// containing project that declares the action).
    pub async fn run_action(
        &self,
        trigger_path: &Path,
        action_name: &str,
        params: Value,
        cancel: &CancelToken,
    ) -> Result<RunActionResponse, WorkspaceError> {
        self.run_action_with_options(
            trigger_path,
            action_name,
            params,
            &RunActionOptions::default(),
            cancel,
        )
        .await
    }

    /// Like [`WorkspaceManager::run_action`] but with explicit run options,
    /// letting the caller attach a `partial_result_token` whose partial
    /// results arrive on the receiver from
    /// [`WorkspaceManager::subscribe_progress`].
    pub async fn run_action_with_options(
        &self,
        trigger_path: &Path,
        action_name: &str,
        params: Value,
        options: &RunActionOptions,
        cancel: &CancelToken,
    ) -> Result<RunActionResponse, WorkspaceError> {
        let request = RunActionRequest {
            action_name: action_name.to_string(),
            params,
        };
        routing::run_action_for_path(
            &self.context,
            &self.supervisor,
            trigger_path,
            &request,
            options,
            cancel,
        )
        .await
    }

    /// Run an action in every registered project that declares it.
    /// Projects that do not declare the action are skipped, not errors.
    pub async fn run_action_everywhere(
        &self,
        action_name: &str,
        params: Value,
        concurrently: bool,
        cancel: &CancelToken,
    ) -> Vec<(PathBuf, Result<RunActionResponse, WorkspaceError>)> {
        let mut roots = Vec::new();
        for root in self.context.project_roots() {
            match self.supervisor.resolved_config(&root).await {
                Ok(resolved) if resolved.action(action_name).is_some() => roots.push(root),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(project = %root.display(), error = %e, "skipping project");
                }
            }
        }
        let request = RunActionRequest {
            action_name: action_name.to_string(),
            params,
        };
        routing::run_action_in_projects(&self.supervisor, &roots, &request, concurrently, cancel)
            .await
    }

    /// Prepare environments for a project; an empty list prepares every
    /// declared environment.
    pub async fn prepare_envs(
        &self,
        project_root: &Path,
        envs: &[String],
    ) -> Result<RunActionResponse, WorkspaceError> {
        self.run_action(
            project_root,
            "prepare_envs",
            serde_json::json!({ "envs": envs }),
            &CancelToken::new(),
        )
        .await
    }

    /// Resolve a project's configuration and dump it to disk.
    pub async fn dump_config(
        &self,
        project_root: &Path,
    ) -> Result<RunActionResponse, WorkspaceError> {
        self.run_action(
            project_root,
            "dump_config",
            serde_json::json!({}),
            &CancelToken::new(),
        )
        .await
    }

    /// Serve the IDE surface over stdio until the client goes away.
    pub async fn serve_ide(&self) -> Result<i32, WorkspaceError> {
        ide::serve_stdio(self.context.clone(), self.supervisor.clone()).await
    }

    /// Serve the IDE surface to a single TCP client.
    pub async fn serve_ide_tcp(&self, host: &str, port: u16) -> Result<i32, WorkspaceError> {
        ide::serve_tcp(self.context.clone(), self.supervisor.clone(), host, port).await
    }

    /// Stop every runner this workspace started.
    pub async fn shutdown(&self) {
        self.supervisor.stop_all().await;
    }
}
