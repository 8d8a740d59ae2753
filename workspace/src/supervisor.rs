//! Runner process supervision.
//!
//! One runner child process exists per (project, environment) pair. The
//! supervisor spawns it, scans its stdout for the port announcement,
//! connects over loopback TCP, runs the initialize handshake, resolves and
//! pushes the project configuration, and replays open documents. Every
//! start is serialized through a per-pair async mutex so concurrent
//! callers share one process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, broadcast};

use burnish_config::{ConfigError, PackagePathResolver, ResolvedProject, resolve_project};
use burnish_rpc::{
    ErrorObject, PeerBuilder, PeerHandle, feature_fn, methods, methods::commands, notification_fn,
};
use burnish_types::{
    DEV_WORKSPACE_ENV, ENVS_DIR_NAME, ProjectStatus, RunActionOptions, RunActionRequest,
    RunActionResponse, RunStatus, RunnerStatus,
};

use crate::context::WorkspaceContext;
use crate::error::WorkspaceError;
use crate::progress::ProgressHub;

const RUNNER_BIN_NAME: &str = "burnish-runner";
const PORT_SCAN_TIMEOUT: Duration = Duration::from_secs(15);
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(20);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Events other layers (the IDE façade, the CLI) may want to observe.
#[derive(Debug, Clone)]
pub enum WorkspaceEvent {
    /// A runner edited a client-owned document. `previous` is the text the
    /// client held before the edit, for computing replacement ranges.
    DocumentEdited {
        path: PathBuf,
        previous: String,
        text: String,
    },
    /// A runner asked to surface a message to the user.
    ShowMessage { message: String },
    /// A project's status changed.
    ProjectChanged { root: PathBuf },
}

struct ActiveRunner {
    status: RunnerStatus,
    peer: PeerHandle,
    child: Arc<Mutex<Child>>,
}

type RunnerKey = (PathBuf, String);

pub struct RunnerSupervisor {
    context: Arc<WorkspaceContext>,
    progress: Arc<ProgressHub>,
    runners: Mutex<HashMap<RunnerKey, Arc<Mutex<Option<ActiveRunner>>>>>,
    events: broadcast::Sender<WorkspaceEvent>,
}

impl RunnerSupervisor {
    #[must_use]
    pub fn new(context: Arc<WorkspaceContext>, progress: Arc<ProgressHub>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            context,
            progress,
            runners: Mutex::new(HashMap::new()),
            events,
        }
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.events.subscribe()
    }

    /// Peer for the given (project, env), starting the runner if needed.
    pub async fn runner(
        &self,
        project_root: &Path,
        env_name: &str,
    ) -> Result<PeerHandle, WorkspaceError> {
        let slot = self.slot(project_root, env_name).await;
        let mut guard = slot.lock().await;
        if let Some(active) = guard.as_ref()
            && active.status.is_running()
            && !active.peer.is_stopped()
        {
            return Ok(active.peer.clone());
        }
        let active = self.start_runner(project_root, env_name).await?;
        let peer = active.peer.clone();
        *guard = Some(active);
        Ok(peer)
    }

    /// Stop the runner for one (project, env) pair, if running.
    pub async fn stop_runner(&self, project_root: &Path, env_name: &str) {
        let slot = self.slot(project_root, env_name).await;
        let mut guard = slot.lock().await;
        if let Some(active) = guard.take() {
            stop_active(active, project_root, env_name).await;
        }
    }

    /// Stop every running runner. Used on workspace shutdown.
    pub async fn stop_all(&self) {
        let keys: Vec<RunnerKey> = self.runners.lock().await.keys().cloned().collect();
        for (root, env) in keys {
            self.stop_runner(&root, &env).await;
        }
    }

    /// Environments that declared handlers for the project, dev_workspace
    /// first. Resolution runs on demand.
    pub async fn project_envs(&self, project_root: &Path) -> Result<Vec<String>, WorkspaceError> {
        let resolved = self.resolved_config(project_root).await?;
        let mut envs: Vec<String> = vec![DEV_WORKSPACE_ENV.to_string()];
        for action in &resolved.actions {
            for handler in &action.handlers {
                if !envs.contains(&handler.env) {
                    envs.push(handler.env.clone());
                }
            }
        }
        Ok(envs)
    }

    /// The project's resolved configuration, computing and caching it on
    /// first use. Preset resolution goes through the dev_workspace runner.
    pub async fn resolved_config(
        &self,
        project_root: &Path,
    ) -> Result<ResolvedProject, WorkspaceError> {
        if let Some(project) = self.context.project(project_root)
            && let Some(resolved) = project.resolved
        {
            return Ok(resolved);
        }
        // Starting the dev_workspace runner resolves and caches the config.
        let _ = self.runner(project_root, DEV_WORKSPACE_ENV).await?;
        let project = self
            .context
            .project(project_root)
            .ok_or_else(|| WorkspaceError::ProjectNotFound(project_root.to_path_buf()))?;
        project.resolved.ok_or_else(|| {
            WorkspaceError::RunnerFailedToStart {
                project: project_root.to_path_buf(),
                env: DEV_WORKSPACE_ENV.to_string(),
                reason: "configuration did not resolve".to_string(),
            }
        })
    }

    async fn slot(&self, project_root: &Path, env_name: &str) -> Arc<Mutex<Option<ActiveRunner>>> {
        self.runners
            .lock()
            .await
            .entry((project_root.to_path_buf(), env_name.to_string()))
            .or_default()
            .clone()
    }

    async fn start_runner(
        &self,
        project_root: &Path,
        env_name: &str,
    ) -> Result<ActiveRunner, WorkspaceError> {
        tracing::info!(project = %project_root.display(), env = env_name, "starting runner");
        let exe = self.runner_executable(project_root, env_name).await?;

        let (peer, child) = self.spawn_and_connect(&exe, project_root, env_name).await?;

        let init_params = json!({
            "processId": std::process::id(),
            "clientName": "burnish",
            "clientVersion": env!("CARGO_PKG_VERSION"),
        });
        peer.request_with_timeout(
            methods::INITIALIZE,
            Some(init_params),
            Some(INITIALIZE_TIMEOUT),
        )
        .await
        .map_err(|e| self.startup_failure(project_root, env_name, format!("initialize: {e}")))?;
        peer.notify(methods::INITIALIZED, None)
            .await
            .map_err(|e| self.startup_failure(project_root, env_name, e.to_string()))?;

        // dev_workspace resolves the project configuration for everyone;
        // other envs reuse the cached result.
        let resolved = if env_name == DEV_WORKSPACE_ENV {
            let resolved = self.resolve_with_peer(project_root, &peer).await?;
            self.context.set_resolved(project_root, resolved.clone());
            resolved
        } else {
            // Boxed: resolved_config may start the dev_workspace runner,
            // which re-enters this function.
            Box::pin(self.resolved_config(project_root)).await?
        };

        let update = resolved.to_update_config_request();
        let update = serde_json::to_value(&update).map_err(|e| {
            self.startup_failure(project_root, env_name, format!("config encode: {e}"))
        })?;
        peer.request(
            methods::EXECUTE_COMMAND,
            Some(json!({
                "command": commands::UPDATE_CONFIG,
                "arguments": [update],
            })),
        )
        .await
        .map_err(|e| self.startup_failure(project_root, env_name, format!("updateConfig: {e}")))?;

        for path in self.context.documents_under(project_root) {
            let _ = peer
                .notify(methods::DID_OPEN, Some(json!({ "file_path": path })))
                .await;
        }

        self.context.set_status(project_root, ProjectStatus::Running);
        let _ = self.events.send(WorkspaceEvent::ProjectChanged {
            root: project_root.to_path_buf(),
        });
        tracing::info!(project = %project_root.display(), env = env_name, "runner running");

        Ok(ActiveRunner {
            status: RunnerStatus::Running,
            peer,
            child,
        })
    }

    async fn resolve_with_peer(
        &self,
        project_root: &Path,
        peer: &PeerHandle,
    ) -> Result<ResolvedProject, WorkspaceError> {
        let project = self
            .context
            .project(project_root)
            .ok_or_else(|| WorkspaceError::ProjectNotFound(project_root.to_path_buf()))?;
        let resolver = RunnerPathResolver { peer: peer.clone() };
        Ok(resolve_project(project.definition, Some(&resolver)).await?)
    }

    /// Find the runner executable for an environment, preparing the
    /// environment through the dev_workspace runner when it is missing.
    async fn runner_executable(
        &self,
        project_root: &Path,
        env_name: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let venv_exe = env_runner_path(project_root, env_name);
        if venv_exe.is_file() {
            return Ok(venv_exe);
        }
        if env_name == DEV_WORKSPACE_ENV {
            // The manager's own binary ships next to a runner binary; fall
            // back to it (or PATH) so a fresh checkout can bootstrap.
            if let Ok(current) = std::env::current_exe()
                && let Some(dir) = current.parent()
            {
                let sibling = dir.join(RUNNER_BIN_NAME);
                if sibling.is_file() {
                    return Ok(sibling);
                }
            }
            if let Ok(found) = which::which(RUNNER_BIN_NAME) {
                return Ok(found);
            }
            self.context.set_status(project_root, ProjectStatus::NoVenv);
            return Err(WorkspaceError::NoVenv {
                project: project_root.to_path_buf(),
                env: env_name.to_string(),
            });
        }

        tracing::info!(env = env_name, "environment missing, preparing");
        self.prepare_env(project_root, env_name).await?;
        if venv_exe.is_file() {
            Ok(venv_exe)
        } else {
            self.context.set_status(project_root, ProjectStatus::NoVenv);
            Err(WorkspaceError::NoVenv {
                project: project_root.to_path_buf(),
                env: env_name.to_string(),
            })
        }
    }

    /// Run `prepare_envs` for one environment through the dev_workspace
    /// runner. Environment preparation installs packages, so no timeout.
    async fn prepare_env(&self, project_root: &Path, env_name: &str) -> Result<(), WorkspaceError> {
        // Boxed: starting the dev_workspace runner re-enters the
        // runner/start_runner cycle this call sits inside.
        let dev = Box::pin(self.runner(project_root, DEV_WORKSPACE_ENV)).await?;
        let request = RunActionRequest {
            action_name: "prepare_envs".to_string(),
            params: json!({ "envs": [env_name] }),
        };
        let result = dev
            .request_with_timeout(
                methods::EXECUTE_COMMAND,
                Some(json!({
                    "command": commands::ACTIONS_RUN,
                    "arguments": [request, RunActionOptions::default()],
                })),
                None,
            )
            .await?;
        let response: RunActionResponse = serde_json::from_value(result)
            .map_err(|e| WorkspaceError::ActionRunFailed(format!("prepare_envs: {e}")))?;
        if response.status == RunStatus::Success && response.return_code == 0 {
            Ok(())
        } else {
            Err(WorkspaceError::ActionRunFailed(format!(
                "prepare_envs failed for env '{env_name}'"
            )))
        }
    }

    async fn spawn_and_connect(
        &self,
        exe: &Path,
        project_root: &Path,
        env_name: &str,
    ) -> Result<(PeerHandle, Arc<Mutex<Child>>), WorkspaceError> {
        let mut child = Command::new(exe)
            .arg("start")
            .arg("--project-path")
            .arg(project_root)
            .arg("--env-name")
            .arg(env_name)
            .env_remove("VIRTUAL_ENV")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.startup_failure(project_root, env_name, format!("spawn: {e}")))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            self.startup_failure(project_root, env_name, "no stdout from runner".to_string())
        })?;
        if let Some(stderr) = child.stderr.take() {
            let env = env_name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(env, line, "runner stderr");
                }
            });
        }

        let port = tokio::time::timeout(PORT_SCAN_TIMEOUT, scan_for_port(stdout))
            .await
            .map_err(|_| {
                self.startup_failure(
                    project_root,
                    env_name,
                    "no port announcement before timeout".to_string(),
                )
            })?
            .map_err(|e| self.startup_failure(project_root, env_name, e))?;

        let stream = TcpStream::connect(("127.0.0.1", port)).await.map_err(|e| {
            self.startup_failure(project_root, env_name, format!("connect to port {port}: {e}"))
        })?;
        stream.set_nodelay(true).map_err(|e| WorkspaceError::io("set_nodelay", e))?;
        let (read, write) = stream.into_split();

        let peer = self
            .build_supervisor_peer(project_root, env_name)
            .start(read, write);
        Ok((peer, Arc::new(Mutex::new(child))))
    }

    /// The supervisor side of the connection: reverse services runners call
    /// back into, plus progress fan-out.
    fn build_supervisor_peer(&self, project_root: &Path, env_name: &str) -> PeerBuilder {
        let name = format!("{}:{env_name}", project_root.display());
        let builder = PeerBuilder::new(name);

        let ctx = self.context.clone();
        let builder = builder.feature(
            methods::DOCUMENTS_GET,
            feature_fn(move |params, _token| {
                let ctx = ctx.clone();
                async move {
                    let path = file_path_param(&params)?;
                    let doc = ctx.document(&path).ok_or_else(|| {
                        ErrorObject::invalid_params(format!(
                            "document is not open: {}",
                            path.display()
                        ))
                    })?;
                    Ok(json!({ "text": doc.text, "version": doc.version }))
                }
            }),
        );

        let ctx = self.context.clone();
        let builder = builder.feature(
            methods::GET_RAW_CONFIG,
            feature_fn(move |params, _token| {
                let ctx = ctx.clone();
                async move {
                    let def_path = serde_json::from_value::<GetRawConfigParams>(params)
                        .map_err(|e| ErrorObject::invalid_params(e.to_string()))?
                        .project_def_path;
                    let root = def_path.parent().unwrap_or(Path::new(".")).to_path_buf();
                    let project = ctx.project(&root).ok_or_else(|| {
                        ErrorObject::invalid_params(format!(
                            "unknown project: {}",
                            root.display()
                        ))
                    })?;
                    let document = project
                        .resolved
                        .map_or_else(|| project.definition.document().clone(), |r| {
                            r.definition.document().clone()
                        });
                    let config = toml::to_string(&document)
                        .map_err(|e| ErrorObject::internal(format!("config encode: {e}")))?;
                    Ok(json!({ "config": config }))
                }
            }),
        );

        let ctx = self.context.clone();
        let events = self.events.clone();
        let builder = builder.feature(
            methods::APPLY_EDIT,
            feature_fn(move |params, _token| {
                let ctx = ctx.clone();
                let events = events.clone();
                async move {
                    let edit: ApplyEditParams = serde_json::from_value(params)
                        .map_err(|e| ErrorObject::invalid_params(e.to_string()))?;
                    let before = ctx.document(&edit.file_path);
                    let version = before.as_ref().map_or(1, |doc| doc.version + 1);
                    ctx.update_document(&edit.file_path, edit.text.clone(), version);
                    let _ = events.send(WorkspaceEvent::DocumentEdited {
                        path: edit.file_path,
                        previous: before.map(|doc| doc.text).unwrap_or_default(),
                        text: edit.text,
                    });
                    Ok(json!({ "applied": true }))
                }
            }),
        );

        let progress = self.progress.clone();
        let builder = builder.feature(
            methods::PROGRESS,
            notification_fn(move |params| {
                let progress = progress.clone();
                async move {
                    if let Some(token) = params.get("token").and_then(|t| t.as_str())
                        && let Some(value) = params.get("value")
                    {
                        progress.publish(token, value.clone());
                    }
                }
            }),
        );

        let events = self.events.clone();
        let builder = builder.feature(
            methods::SHOW_MESSAGE,
            notification_fn(move |params| {
                let events = events.clone();
                async move {
                    if let Some(message) = params.get("message").and_then(|m| m.as_str()) {
                        tracing::info!(message, "runner message");
                        let _ = events.send(WorkspaceEvent::ShowMessage {
                            message: message.to_string(),
                        });
                    }
                }
            }),
        );

        let ctx = self.context.clone();
        let events = self.events.clone();
        let root = project_root.to_path_buf();
        let env = env_name.to_string();
        builder.on_exit(move || {
            tracing::warn!(project = %root.display(), env, "runner connection lost");
            ctx.set_status(&root, ProjectStatus::Exited);
            let _ = events.send(WorkspaceEvent::ProjectChanged { root: root.clone() });
        })
    }

    fn startup_failure(
        &self,
        project_root: &Path,
        env_name: &str,
        reason: String,
    ) -> WorkspaceError {
        self.context
            .set_status(project_root, ProjectStatus::RunnerFailed);
        WorkspaceError::RunnerFailedToStart {
            project: project_root.to_path_buf(),
            env: env_name.to_string(),
            reason,
        }
    }
}

/// Preset package lookup that asks a running dev_workspace runner where a
/// package is installed.
struct RunnerPathResolver {
    peer: PeerHandle,
}

#[async_trait]
impl PackagePathResolver for RunnerPathResolver {
    async fn resolve_package_path(&self, package: &str) -> Result<PathBuf, ConfigError> {
        let result = self
            .peer
            .request(
                methods::EXECUTE_COMMAND,
                Some(json!({
                    "command": commands::RESOLVE_PACKAGE_PATH,
                    "arguments": [package],
                })),
            )
            .await
            .map_err(|e| ConfigError::PresetResolution {
                source_name: package.to_string(),
                message: e.to_string(),
            })?;
        result
            .get("packagePath")
            .and_then(|p| p.as_str())
            .map(PathBuf::from)
            .ok_or_else(|| ConfigError::PresetResolution {
                source_name: package.to_string(),
                message: "runner returned no package path".to_string(),
            })
    }
}

#[derive(serde::Deserialize)]
struct GetRawConfigParams {
    project_def_path: PathBuf,
}

#[derive(serde::Deserialize)]
struct ApplyEditParams {
    file_path: PathBuf,
    text: String,
}

fn file_path_param(params: &serde_json::Value) -> Result<PathBuf, ErrorObject> {
    params
        .get("file_path")
        .and_then(|p| p.as_str())
        .map(PathBuf::from)
        .ok_or_else(|| ErrorObject::invalid_params("missing file_path"))
}

fn env_runner_path(project_root: &Path, env_name: &str) -> PathBuf {
    project_root
        .join(ENVS_DIR_NAME)
        .join(env_name)
        .join("bin")
        .join(RUNNER_BIN_NAME)
}

/// Read runner stdout until the port announcement appears.
async fn scan_for_port<R>(stdout: R) -> Result<u16, String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await.map_err(|e| e.to_string())? {
        if let Some(port) = parse_port_line(&line) {
            return Ok(port);
        }
        tracing::debug!(line, "runner stdout");
    }
    Err("runner closed stdout before announcing a port".to_string())
}

fn parse_port_line(line: &str) -> Option<u16> {
    let rest = line.strip_prefix("Serving on (")?;
    let (_host, rest) = rest.split_once(", ")?;
    let port = rest.strip_suffix(')')?;
    port.trim().parse().ok()
}

async fn stop_active(active: ActiveRunner, project_root: &Path, env_name: &str) {
    tracing::info!(project = %project_root.display(), env = env_name, "stopping runner");
    let _ = active
        .peer
        .request_with_timeout(methods::SHUTDOWN, None, Some(SHUTDOWN_TIMEOUT))
        .await;
    let _ = active.peer.notify(methods::EXIT, None).await;

    let mut child = active.child.lock().await;
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait())
        .await
        .is_err()
    {
        tracing::debug!(env = env_name, "runner did not exit in time, killing");
        let _ = child.kill().await;
    }
    active.peer.stop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_announcement() {
        assert_eq!(parse_port_line("Serving on ('127.0.0.1', 54321)"), Some(54321));
        assert_eq!(parse_port_line("Serving on ('127.0.0.1', 80)"), Some(80));
        assert_eq!(parse_port_line("something else"), None);
        assert_eq!(parse_port_line("Serving on ('127.0.0.1', nope)"), None);
    }

    #[test]
    fn env_runner_path_layout() {
        let path = env_runner_path(Path::new("/ws/app"), "runtime");
        assert_eq!(
            path,
            Path::new("/ws/app/.venvs/runtime/bin/burnish-runner")
        );
    }

    #[tokio::test]
    async fn scan_skips_noise_lines() {
        let input: &[u8] = b"warming up\nServing on ('127.0.0.1', 9001)\n";
        assert_eq!(scan_for_port(input).await.unwrap(), 9001);
    }

    #[tokio::test]
    async fn scan_reports_eof() {
        let input: &[u8] = b"no port here\n";
        assert!(scan_for_port(input).await.is_err());
    }
}
