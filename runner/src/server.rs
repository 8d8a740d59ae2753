//! Runner process surface.
//!
//! A runner serves exactly one supervisor connection. It binds an ephemeral
//! loopback port, announces it on stdout (the supervisor scans for the
//! `Serving on` line), and then speaks framed JSON-RPC until `exit` or
//! connection loss. Logging goes to a file; stdout belongs to the port
//! announcement.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use burnish_rpc::{
    ErrorObject, FeatureReply, PeerBuilder, PeerHandle, feature_fn, methods, notification_fn,
};
use burnish_types::{RunActionOptions, RunActionRequest, UpdateConfigRequest};

use crate::cache::FileCache;
use crate::engine::ActionEngine;
use crate::fs::FileManager;

pub struct ServeOptions {
    pub project_path: PathBuf,
    pub env_name: String,
}

pub(crate) struct RunnerState {
    project_path: PathBuf,
    env_name: String,
    files: Arc<FileManager>,
    cache: Arc<FileCache>,
    engine: Mutex<Option<Arc<ActionEngine>>>,
    initialized: AtomicBool,
    peer: OnceLock<PeerHandle>,
    exit_tx: Mutex<Option<oneshot::Sender<i32>>>,
}

impl RunnerState {
    fn new(options: &ServeOptions, exit_tx: oneshot::Sender<i32>) -> Arc<Self> {
        let files = Arc::new(FileManager::new());
        Arc::new(Self {
            project_path: options.project_path.clone(),
            env_name: options.env_name.clone(),
            cache: Arc::new(FileCache::new(files.clone())),
            files,
            engine: Mutex::new(None),
            initialized: AtomicBool::new(false),
            peer: OnceLock::new(),
            exit_tx: Mutex::new(Some(exit_tx)),
        })
    }

    fn bind_peer(&self, peer: PeerHandle) {
        self.files.set_peer(peer.clone());
        let _ = self.peer.set(peer);
    }

    fn engine(&self) -> Result<Arc<ActionEngine>, ErrorObject> {
        self.engine
            .lock()
            .expect("engine slot poisoned")
            .clone()
            .ok_or_else(|| ErrorObject::invalid_params("runner is not configured yet"))
    }

    fn request_exit(&self, code: i32) {
        if let Some(tx) = self.exit_tx.lock().expect("exit slot poisoned").take() {
            let _ = tx.send(code);
        }
    }
}

#[derive(Deserialize)]
struct InitializeParams {
    #[serde(rename = "processId")]
    process_id: Option<u64>,
    #[serde(rename = "clientName", default)]
    client_name: Option<String>,
    #[serde(rename = "clientVersion", default)]
    client_version: Option<String>,
}

#[derive(Deserialize)]
struct ExecuteCommandParams {
    command: String,
    #[serde(default)]
    arguments: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct DocumentParams {
    file_path: PathBuf,
}

/// Wire the runner's feature set onto a peer builder.
pub(crate) fn build_peer(state: Arc<RunnerState>) -> PeerBuilder {
    let builder = PeerBuilder::new("runner");

    let init_state = state.clone();
    let builder = builder.feature(
        methods::INITIALIZE,
        feature_fn(move |params, _token| {
            let state = init_state.clone();
            async move {
                let params: InitializeParams = serde_json::from_value(params)
                    .map_err(|e| ErrorObject::invalid_params(format!("initialize: {e}")))?;
                tracing::info!(
                    client = params.client_name.as_deref().unwrap_or("unknown"),
                    client_version = params.client_version.as_deref().unwrap_or("unknown"),
                    client_pid = params.process_id,
                    project = %state.project_path.display(),
                    env = %state.env_name,
                    "initialize"
                );
                state.initialized.store(true, Ordering::SeqCst);
                Ok(serde_json::json!({
                    "serverInfo": {
                        "name": "burnish-runner",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "capabilities": {},
                }))
            }
        }),
    );

    let builder = builder.feature(
        methods::INITIALIZED,
        notification_fn(|_params| async {
            tracing::debug!("client reported initialized");
        }),
    );

    let exec_state = state.clone();
    let builder = builder.feature(
        methods::EXECUTE_COMMAND,
        feature_fn(move |params, token| {
            let state = exec_state.clone();
            async move {
                let params: ExecuteCommandParams = serde_json::from_value(params)
                    .map_err(|e| ErrorObject::invalid_params(format!("executeCommand: {e}")))?;
                execute_command(&state, params, token).await
            }
        }),
    );

    let open_state = state.clone();
    let builder = builder.feature(
        methods::DID_OPEN,
        notification_fn(move |params| {
            let state = open_state.clone();
            async move {
                match serde_json::from_value::<DocumentParams>(params) {
                    Ok(doc) => {
                        tracing::debug!(path = %doc.file_path.display(), "document opened");
                        state.files.document_opened(doc.file_path);
                    }
                    Err(e) => tracing::warn!("malformed didOpen: {e}"),
                }
            }
        }),
    );

    let close_state = state.clone();
    let builder = builder.feature(
        methods::DID_CLOSE,
        notification_fn(move |params| {
            let state = close_state.clone();
            async move {
                match serde_json::from_value::<DocumentParams>(params) {
                    Ok(doc) => state.files.document_closed(&doc.file_path),
                    Err(e) => tracing::warn!("malformed didClose: {e}"),
                }
            }
        }),
    );

    let shutdown_state = state.clone();
    let builder = builder.feature(
        methods::SHUTDOWN,
        feature_fn(move |_params, _token| {
            let state = shutdown_state.clone();
            async move {
                tracing::info!("shutdown requested");
                if let Ok(engine) = state.engine() {
                    engine.shutdown().await;
                }
                Ok(serde_json::Value::Null)
            }
        }),
    );

    let exit_state = state.clone();
    let builder = builder.feature(
        methods::EXIT,
        notification_fn(move |_params| {
            let state = exit_state.clone();
            async move {
                tracing::info!("exit requested");
                if let Ok(engine) = state.engine() {
                    engine.exit().await;
                }
                state.request_exit(0);
            }
        }),
    );

    let lost_state = state;
    builder.on_exit(move || {
        // Connection loss without `exit` still ends the process.
        lost_state.request_exit(1);
    })
}

async fn execute_command(
    state: &Arc<RunnerState>,
    params: ExecuteCommandParams,
    token: burnish_rpc::CancelToken,
) -> FeatureReply {
    match params.command.as_str() {
        methods::commands::UPDATE_CONFIG => {
            let request: UpdateConfigRequest = params
                .arguments
                .first()
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| ErrorObject::invalid_params(format!("updateConfig: {e}")))?
                .ok_or_else(|| ErrorObject::invalid_params("updateConfig needs a request"))?;
            tracing::info!(
                project = %request.project_name,
                actions = request.actions.len(),
                "applying configuration"
            );
            let engine = ActionEngine::new(
                request,
                state.env_name.clone(),
                state.files.clone(),
                state.cache.clone(),
            );
            state.cache.clear();
            *state.engine.lock().expect("engine slot poisoned") = Some(Arc::new(engine));
            Ok(serde_json::Value::Null)
        }
        methods::commands::ACTIONS_RUN => {
            let request: RunActionRequest = params
                .arguments
                .first()
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| ErrorObject::invalid_params(format!("actions/run: {e}")))?
                .ok_or_else(|| ErrorObject::invalid_params("actions/run needs a request"))?;
            let options: RunActionOptions = params
                .arguments
                .get(1)
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| ErrorObject::invalid_params(format!("actions/run options: {e}")))?
                .unwrap_or_default();
            let engine = state.engine()?;
            let peer = state.peer.get().cloned();
            let response = engine
                .run_action(request, options, token, peer)
                .await
                .map_err(|e| e.to_error_object())?;
            serde_json::to_value(&response)
                .map_err(|e| ErrorObject::internal(format!("unserialisable response: {e}")))
        }
        methods::commands::ACTIONS_RELOAD => {
            let action: String = params
                .arguments
                .first()
                .and_then(|v| v.as_str())
                .ok_or_else(|| ErrorObject::invalid_params("actions/reload needs an action name"))?
                .to_string();
            state.engine()?.reload_action(&action).await;
            Ok(serde_json::Value::Null)
        }
        methods::commands::RESOLVE_PACKAGE_PATH => {
            let package = params
                .arguments
                .first()
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    ErrorObject::invalid_params("packages/resolvePath needs a package name")
                })?;
            let path = state
                .project_path
                .join(burnish_types::ENVS_DIR_NAME)
                .join(&state.env_name)
                .join("packages")
                .join(package);
            if path.is_dir() {
                Ok(serde_json::json!({ "packagePath": path }))
            } else {
                Err(ErrorObject::invalid_params(format!(
                    "package '{package}' is not installed in env '{}'",
                    state.env_name
                )))
            }
        }
        other => Err(ErrorObject::method_not_found(other)),
    }
}

/// Serve one supervisor connection; resolves to the process exit code.
pub async fn serve(options: ServeOptions) -> anyhow::Result<i32> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    // The supervisor scans stdout for exactly this shape.
    println!("Serving on ('127.0.0.1', {port})");

    let (stream, addr) = listener.accept().await?;
    stream.set_nodelay(true)?;
    tracing::info!(%addr, "supervisor connected");
    let (read, write) = stream.into_split();

    let (exit_tx, exit_rx) = oneshot::channel();
    let state = RunnerState::new(&options, exit_tx);
    let peer = build_peer(state.clone()).start(read, write);
    state.bind_peer(peer);

    let code = exit_rx.await.unwrap_or(0);
    // Safety net: handlers that never saw shutdown/exit get them now.
    if let Ok(engine) = state.engine() {
        engine.shutdown().await;
        engine.exit().await;
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burnish_types::{RunStatus, path_key};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU64;

    struct Harness {
        supervisor: PeerHandle,
        _state: Arc<RunnerState>,
        exit_rx: oneshot::Receiver<i32>,
        dir: tempfile::TempDir,
    }

    /// A connected supervisor/runner pair over an in-memory stream. The
    /// supervisor side serves `documents/get` from `docs`.
    fn harness(docs: BTreeMap<String, (String, u64)>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (exit_tx, exit_rx) = oneshot::channel();
        let state = RunnerState::new(
            &ServeOptions {
                project_path: dir.path().to_path_buf(),
                env_name: "dev_workspace".to_string(),
            },
            exit_tx,
        );

        let (sup_io, run_io) = tokio::io::duplex(256 * 1024);
        let (sup_read, sup_write) = tokio::io::split(sup_io);
        let (run_read, run_write) = tokio::io::split(run_io);

        let docs = Arc::new(docs);
        let supervisor = PeerBuilder::new("supervisor")
            .feature(
                methods::DOCUMENTS_GET,
                feature_fn(move |params, _token| {
                    let docs = docs.clone();
                    async move {
                        let req: DocumentParams = serde_json::from_value(params)
                            .map_err(|e| ErrorObject::invalid_params(e.to_string()))?;
                        let key = path_key(&req.file_path);
                        match docs.get(&key) {
                            Some((text, version)) => Ok(serde_json::json!({
                                "text": text,
                                "version": version,
                            })),
                            None => Err(ErrorObject::invalid_params("unknown document")),
                        }
                    }
                }),
            )
            .start(sup_read, sup_write);

        let runner_peer = build_peer(state.clone()).start(run_read, run_write);
        state.bind_peer(runner_peer);

        Harness {
            supervisor,
            _state: state,
            exit_rx,
            dir,
        }
    }

    async fn handshake_and_configure(h: &Harness, actions: serde_json::Value) {
        let init = h
            .supervisor
            .request(
                methods::INITIALIZE,
                Some(serde_json::json!({
                    "processId": 4242,
                    "clientName": "burnish",
                    "clientVersion": "test",
                })),
            )
            .await
            .unwrap();
        assert_eq!(init["serverInfo"]["name"], "burnish-runner");
        h.supervisor
            .notify(methods::INITIALIZED, None)
            .await
            .unwrap();

        h.supervisor
            .request(
                methods::EXECUTE_COMMAND,
                Some(serde_json::json!({
                    "command": methods::commands::UPDATE_CONFIG,
                    "arguments": [{
                        "working_dir": h.dir.path(),
                        "project_name": "app",
                        "project_def_path": h.dir.path().join("pyproject.toml"),
                        "actions": actions,
                        "action_handler_configs": {},
                    }],
                })),
            )
            .await
            .unwrap();
    }

    fn format_actions() -> serde_json::Value {
        serde_json::json!([{
            "name": "format",
            "source": "burnish.action.format",
            "handlers": [{
                "name": "trim",
                "source": "burnish.format.trim_whitespace",
                "env": "dev_workspace",
            }],
            "config": null,
        }])
    }

    #[tokio::test]
    async fn full_run_over_the_wire() {
        let h = harness(BTreeMap::new());
        let path = h.dir.path().join("a.py");
        tokio::fs::write(&path, "x = 1  \n").await.unwrap();
        handshake_and_configure(&h, format_actions()).await;

        let result = h
            .supervisor
            .request(
                methods::EXECUTE_COMMAND,
                Some(serde_json::json!({
                    "command": methods::commands::ACTIONS_RUN,
                    "arguments": [
                        {"action_name": "format", "params": {"file_paths": [path]}},
                    ],
                })),
            )
            .await
            .unwrap();
        let response: burnish_types::RunActionResponse =
            serde_json::from_value(result).unwrap();
        assert_eq!(response.status, RunStatus::Success);
        let parsed: serde_json::Value =
            serde_json::from_str(response.result.as_deref().unwrap()).unwrap();
        assert_eq!(
            parsed["result_by_file_path"][path.to_string_lossy().as_ref()]["code"],
            "x = 1\n"
        );
    }

    #[tokio::test]
    async fn open_documents_are_read_from_the_supervisor() {
        let path_str = "/ws/app/open.py".to_string();
        let docs = BTreeMap::from([(path_str.clone(), ("x = 1    \n".to_string(), 7))]);
        let h = harness(docs);
        handshake_and_configure(&h, format_actions()).await;

        h.supervisor
            .notify(
                methods::DID_OPEN,
                Some(serde_json::json!({"file_path": path_str})),
            )
            .await
            .unwrap();
        // Notifications race the next request; didOpen must land first.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let result = h
            .supervisor
            .request(
                methods::EXECUTE_COMMAND,
                Some(serde_json::json!({
                    "command": methods::commands::ACTIONS_RUN,
                    "arguments": [
                        {"action_name": "format", "params": {"file_paths": [path_str.clone()]}},
                    ],
                })),
            )
            .await
            .unwrap();
        let response: burnish_types::RunActionResponse =
            serde_json::from_value(result).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(response.result.as_deref().unwrap()).unwrap();
        assert_eq!(
            parsed["result_by_file_path"][&path_str]["code"],
            "x = 1\n"
        );
    }

    #[tokio::test]
    async fn progress_notifications_stream_partials() {
        let h = harness(BTreeMap::new());
        let path = h.dir.path().join("a.py");
        tokio::fs::write(&path, "x = 1  \n").await.unwrap();
        handshake_and_configure(&h, format_actions()).await;

        let received = Arc::new(AtomicU64::new(0));
        // A second supervisor-side peer would be overkill; instead count
        // progress notifications through a dedicated harness.
        let (sup_io, run_io) = tokio::io::duplex(256 * 1024);
        let (sup_read, sup_write) = tokio::io::split(sup_io);
        let (run_read, run_write) = tokio::io::split(run_io);
        let counter = received.clone();
        let supervisor = PeerBuilder::new("supervisor")
            .feature(
                methods::PROGRESS,
                notification_fn(move |params| {
                    let counter = counter.clone();
                    async move {
                        assert_eq!(params["token"], "tok-1");
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .start(sup_read, sup_write);
        let (exit_tx, _exit_rx) = oneshot::channel();
        let state = RunnerState::new(
            &ServeOptions {
                project_path: h.dir.path().to_path_buf(),
                env_name: "dev_workspace".to_string(),
            },
            exit_tx,
        );
        let runner_peer = build_peer(state.clone()).start(run_read, run_write);
        state.bind_peer(runner_peer);

        supervisor
            .request(methods::INITIALIZE, Some(serde_json::json!({"processId": 1})))
            .await
            .unwrap();
        supervisor
            .request(
                methods::EXECUTE_COMMAND,
                Some(serde_json::json!({
                    "command": methods::commands::UPDATE_CONFIG,
                    "arguments": [{
                        "working_dir": h.dir.path(),
                        "project_name": "app",
                        "project_def_path": h.dir.path().join("pyproject.toml"),
                        "actions": format_actions(),
                        "action_handler_configs": {},
                    }],
                })),
            )
            .await
            .unwrap();
        supervisor
            .request(
                methods::EXECUTE_COMMAND,
                Some(serde_json::json!({
                    "command": methods::commands::ACTIONS_RUN,
                    "arguments": [
                        {"action_name": "format", "params": {"file_paths": [path]}},
                        {"partial_result_token": "tok-1"},
                    ],
                })),
            )
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_before_configuration_is_rejected() {
        let h = harness(BTreeMap::new());
        let err = h
            .supervisor
            .request(
                methods::EXECUTE_COMMAND,
                Some(serde_json::json!({
                    "command": methods::commands::ACTIONS_RUN,
                    "arguments": [{"action_name": "format", "params": {}}],
                })),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[tokio::test]
    async fn exit_notification_resolves_the_exit_code() {
        let h = harness(BTreeMap::new());
        handshake_and_configure(&h, format_actions()).await;
        h.supervisor.notify(methods::EXIT, None).await.unwrap();
        let code = tokio::time::timeout(std::time::Duration::from_secs(2), h.exit_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn resolve_package_path_finds_installed_packages() {
        let h = harness(BTreeMap::new());
        handshake_and_configure(&h, format_actions()).await;
        let package_dir = h
            .dir
            .path()
            .join(".venvs/dev_workspace/packages/burnish_preset_common");
        std::fs::create_dir_all(&package_dir).unwrap();

        let result = h
            .supervisor
            .request(
                methods::EXECUTE_COMMAND,
                Some(serde_json::json!({
                    "command": methods::commands::RESOLVE_PACKAGE_PATH,
                    "arguments": ["burnish_preset_common"],
                })),
            )
            .await
            .unwrap();
        assert_eq!(
            result["packagePath"],
            serde_json::json!(package_dir.to_string_lossy())
        );

        let err = h
            .supervisor
            .request(
                methods::EXECUTE_COMMAND,
                Some(serde_json::json!({
                    "command": methods::commands::RESOLVE_PACKAGE_PATH,
                    "arguments": ["ghost_package"],
                })),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost_package"));
    }
}
