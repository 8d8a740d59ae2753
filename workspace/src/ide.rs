//! IDE surface: an LSP server over stdio in front of the workspace.
//!
//! Documents the client opens live in [`WorkspaceContext`]; runners pull
//! their contents through the `documents/get` reverse service instead of
//! reading disk. Formatting and diagnostics translate to action runs and
//! back: handlers speak one-based positions, LSP speaks zero-based, and the
//! conversion happens here and nowhere else.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use burnish_rpc::{
    CancelToken, ErrorObject, FeatureReply, PeerBuilder, PeerHandle, feature_fn, methods,
    notification_fn,
};
use burnish_types::{
    FormatResult, LintMessage, ProjectStatus, RunActionOptions, RunActionRequest,
    RunActionResponse, RunResult, TextEdit,
};

use crate::context::WorkspaceContext;
use crate::error::WorkspaceError;
use crate::routing;
use crate::supervisor::{RunnerSupervisor, WorkspaceEvent};

pub(crate) struct IdeState {
    context: Arc<WorkspaceContext>,
    supervisor: Arc<RunnerSupervisor>,
    client: OnceLock<PeerHandle>,
    exit_tx: Mutex<Option<oneshot::Sender<i32>>>,
}

impl IdeState {
    fn request_exit(&self, code: i32) {
        if let Some(tx) = self.exit_tx.lock().expect("exit slot poisoned").take() {
            let _ = tx.send(code);
        }
    }
}

#[derive(Deserialize)]
struct TextDocumentIdentifier {
    uri: String,
}

#[derive(Deserialize)]
struct DocumentParams {
    #[serde(rename = "textDocument")]
    text_document: TextDocumentIdentifier,
}

#[derive(Deserialize)]
struct DidOpenParams {
    #[serde(rename = "textDocument")]
    text_document: DidOpenTextDocument,
}

#[derive(Deserialize)]
struct DidOpenTextDocument {
    uri: String,
    #[serde(default)]
    version: u64,
    text: String,
}

#[derive(Deserialize)]
struct DidChangeParams {
    #[serde(rename = "textDocument")]
    text_document: VersionedTextDocument,
    #[serde(rename = "contentChanges")]
    content_changes: Vec<ContentChange>,
}

#[derive(Deserialize)]
struct VersionedTextDocument {
    uri: String,
    #[serde(default)]
    version: u64,
}

#[derive(Deserialize)]
struct ContentChange {
    text: String,
}

/// Convert a `file://` URI to a filesystem path.
fn uri_to_path(uri: &str) -> Result<PathBuf, ErrorObject> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
        .ok_or_else(|| ErrorObject::invalid_params(format!("not a file uri: {uri}")))
}

fn path_to_uri(path: &Path) -> String {
    url::Url::from_file_path(path)
        .map(String::from)
        .unwrap_or_else(|()| format!("file://{}", path.display()))
}

/// Lint messages (one-based) as LSP diagnostics (zero-based).
fn to_diagnostics(messages: &[LintMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            json!({
                "range": {
                    "start": {
                        "line": m.range.start.line.saturating_sub(1),
                        "character": m.range.start.column.saturating_sub(1),
                    },
                    "end": {
                        "line": m.range.end.line.saturating_sub(1),
                        "character": m.range.end.column.saturating_sub(1),
                    },
                },
                "severity": m.severity.to_lsp(),
                "code": m.code,
                "source": m.source,
                "message": m.message,
            })
        })
        .collect()
}

/// Pull the aggregate format result out of a run response and, when the
/// file changed, produce the whole-document edit for it.
fn format_edit_for(
    response: &RunActionResponse,
    path: &Path,
    old_text: &str,
) -> Option<TextEdit> {
    let result: RunResult = serde_json::from_str(response.result.as_deref()?).ok()?;
    let RunResult::Format(FormatResult { result_by_file_path }) = result else {
        return None;
    };
    let file = result_by_file_path.get(&burnish_types::path_key(path))?;
    if file.changed && file.code != old_text {
        Some(TextEdit::whole_document(old_text, file.code.clone()))
    } else {
        None
    }
}

fn lint_messages_for(response: &RunActionResponse, path: &Path) -> Vec<LintMessage> {
    let Some(raw) = response.result.as_deref() else {
        return Vec::new();
    };
    let Ok(RunResult::Lint(lint)) = serde_json::from_str::<RunResult>(raw) else {
        return Vec::new();
    };
    lint.messages
        .get(&burnish_types::path_key(path))
        .cloned()
        .unwrap_or_default()
}

/// Files a workspace-wide lint should cover for one project: the
/// classifier's view of the tree when the project declares it, else the
/// documents the client has open under the project dir.
async fn candidate_files(
    state: &IdeState,
    root: &Path,
    cancel: &CancelToken,
) -> Vec<PathBuf> {
    let request = RunActionRequest {
        action_name: "list_files_by_lang".to_string(),
        params: json!({}),
    };
    let classified = routing::run_action_in_project(
        &state.supervisor,
        root,
        &request,
        &RunActionOptions::default(),
        cancel,
    )
    .await;
    if let Ok(response) = classified
        && let Some(raw) = response.result.as_deref()
        && let Ok(RunResult::Classify(classify)) = serde_json::from_str::<RunResult>(raw)
    {
        let mut files: Vec<PathBuf> = classify
            .files_by_language
            .into_values()
            .flatten()
            .map(PathBuf::from)
            .collect();
        files.sort();
        files.dedup();
        return files;
    }
    state.context.documents_under(root)
}

async fn document_text(
    context: &WorkspaceContext,
    path: &Path,
) -> Result<String, ErrorObject> {
    if let Some(doc) = context.document(path) {
        return Ok(doc.text);
    }
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ErrorObject::internal(format!("read {}: {e}", path.display())))
}

async fn run_for_file(
    state: &IdeState,
    path: &Path,
    action_name: &str,
    params: Value,
    cancel: CancelToken,
) -> Result<RunActionResponse, WorkspaceError> {
    let request = RunActionRequest {
        action_name: action_name.to_string(),
        params,
    };
    routing::run_action_for_path(
        &state.context,
        &state.supervisor,
        path,
        &request,
        &RunActionOptions::default(),
        &cancel,
    )
    .await
}

/// Delegate a document-scoped query (inlay hints, code actions) to the
/// matching action. Projects that do not declare the action answer empty.
async fn run_document_query(
    state: &IdeState,
    params: Value,
    action_name: &str,
    token: CancelToken,
) -> FeatureReply {
    let p: DocumentParams =
        serde_json::from_value(params).map_err(|e| ErrorObject::invalid_params(e.to_string()))?;
    let path = uri_to_path(&p.text_document.uri)?;
    let response = match run_for_file(
        state,
        &path,
        action_name,
        json!({ "file_paths": [path] }),
        token,
    )
    .await
    {
        Ok(response) => response,
        Err(WorkspaceError::ActionNotFound(_)) => return Ok(json!([])),
        Err(e) => return Err(to_rpc_error(&e)),
    };
    Ok(plain_items(&response))
}

/// The plain JSON array carried by a run response, or an empty one.
fn plain_items(response: &RunActionResponse) -> Value {
    response
        .result
        .as_deref()
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .filter(Value::is_array)
        .unwrap_or_else(|| json!([]))
}

fn to_rpc_error(e: &WorkspaceError) -> ErrorObject {
    match e {
        WorkspaceError::ActionNotFound(_) | WorkspaceError::ProjectNotFound(_) => {
            ErrorObject::invalid_params(e.to_string())
        }
        _ => ErrorObject::internal(e.to_string()),
    }
}

pub(crate) fn build_ide_peer(state: Arc<IdeState>) -> PeerBuilder {
    let builder = PeerBuilder::new("ide");

    let init_state = state.clone();
    let builder = builder.feature(
        methods::INITIALIZE,
        feature_fn(move |params, _token| {
            let state = init_state.clone();
            async move {
                let mut dirs = Vec::new();
                if let Some(folders) = params.get("workspaceFolders").and_then(|f| f.as_array()) {
                    for folder in folders {
                        if let Some(uri) = folder.get("uri").and_then(|u| u.as_str())
                            && let Ok(path) = uri_to_path(uri)
                        {
                            dirs.push(path);
                        }
                    }
                }
                if dirs.is_empty()
                    && let Some(uri) = params.get("rootUri").and_then(|u| u.as_str())
                    && let Ok(path) = uri_to_path(uri)
                {
                    dirs.push(path);
                }
                for dir in &dirs {
                    state.context.add_workspace_dir(dir);
                }
                tracing::info!(folders = dirs.len(), "ide client initialized");
                Ok(json!({
                    "serverInfo": {
                        "name": "burnish",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "capabilities": {
                        "textDocumentSync": { "openClose": true, "change": 1 },
                        "documentFormattingProvider": true,
                        "diagnosticProvider": {
                            "interFileDependencies": false,
                            "workspaceDiagnostics": true,
                        },
                        "inlayHintProvider": true,
                        "codeActionProvider": true,
                        "executeCommandProvider": {
                            "commands": ["actions/run"],
                        },
                    },
                }))
            }
        }),
    );

    let builder = builder.feature(
        methods::INITIALIZED,
        notification_fn(move |_params| async {}),
    );

    let open_state = state.clone();
    let builder = builder.feature(
        methods::DID_OPEN,
        notification_fn(move |params| {
            let state = open_state.clone();
            async move {
                let Ok(p) = serde_json::from_value::<DidOpenParams>(params) else {
                    return;
                };
                let Ok(path) = uri_to_path(&p.text_document.uri) else {
                    return;
                };
                state.context.open_document(
                    path.clone(),
                    p.text_document.text,
                    p.text_document.version,
                );
                forward_document_event(&state, &path, methods::DID_OPEN).await;
            }
        }),
    );

    let change_state = state.clone();
    let builder = builder.feature(
        "textDocument/didChange",
        notification_fn(move |params| {
            let state = change_state.clone();
            async move {
                let Ok(p) = serde_json::from_value::<DidChangeParams>(params) else {
                    return;
                };
                let Ok(path) = uri_to_path(&p.text_document.uri) else {
                    return;
                };
                // Full sync: the last change carries the whole document.
                if let Some(change) = p.content_changes.into_iter().last() {
                    state
                        .context
                        .update_document(&path, change.text, p.text_document.version);
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
                let Ok(p) = serde_json::from_value::<DocumentParams>(params) else {
                    return;
                };
                let Ok(path) = uri_to_path(&p.text_document.uri) else {
                    return;
                };
                forward_document_event(&state, &path, methods::DID_CLOSE).await;
                state.context.close_document(&path);
            }
        }),
    );

    let fmt_state = state.clone();
    let builder = builder.feature(
        methods::FORMATTING,
        feature_fn(move |params, token| {
            let state = fmt_state.clone();
            async move {
                let p: DocumentParams = serde_json::from_value(params)
                    .map_err(|e| ErrorObject::invalid_params(e.to_string()))?;
                let path = uri_to_path(&p.text_document.uri)?;
                let old_text = document_text(&state.context, &path).await?;
                let response = run_for_file(
                    &state,
                    &path,
                    "format",
                    json!({ "file_paths": [path], "save": false }),
                    token,
                )
                .await
                .map_err(|e| to_rpc_error(&e))?;
                match format_edit_for(&response, &path, &old_text) {
                    Some(edit) => Ok(json!([edit])),
                    None => Ok(json!([])),
                }
            }
        }),
    );

    let diag_state = state.clone();
    let builder = builder.feature(
        methods::DOCUMENT_DIAGNOSTIC,
        feature_fn(move |params, token| {
            let state = diag_state.clone();
            async move {
                let p: DocumentParams = serde_json::from_value(params)
                    .map_err(|e| ErrorObject::invalid_params(e.to_string()))?;
                let path = uri_to_path(&p.text_document.uri)?;
                let response = run_for_file(
                    &state,
                    &path,
                    "lint",
                    json!({ "file_paths": [path] }),
                    token,
                )
                .await
                .map_err(|e| to_rpc_error(&e))?;
                let items = to_diagnostics(&lint_messages_for(&response, &path));
                Ok(json!({ "kind": "full", "items": items }))
            }
        }),
    );

    let ws_diag_state = state.clone();
    let builder = builder.feature(
        methods::WORKSPACE_DIAGNOSTIC,
        feature_fn(move |_params, token| {
            let state = ws_diag_state.clone();
            async move {
                let mut items = Vec::new();
                for root in state.context.project_roots() {
                    let candidates = candidate_files(&state, &root, &token).await;
                    if candidates.is_empty() {
                        continue;
                    }
                    let request = RunActionRequest {
                        action_name: "lint".to_string(),
                        params: json!({ "file_paths": candidates.clone() }),
                    };
                    let response = match routing::run_action_in_project(
                        &state.supervisor,
                        &root,
                        &request,
                        &RunActionOptions::default(),
                        &token,
                    )
                    .await
                    {
                        Ok(response) => response,
                        Err(WorkspaceError::ActionNotFound(_)) => continue,
                        Err(e) => {
                            tracing::warn!(project = %root.display(), error = %e, "workspace lint failed");
                            continue;
                        }
                    };
                    for path in candidates {
                        let messages = lint_messages_for(&response, &path);
                        items.push(json!({
                            "uri": path_to_uri(&path),
                            "kind": "full",
                            "items": to_diagnostics(&messages),
                        }));
                    }
                }
                Ok(json!({ "items": items }))
            }
        }),
    );

    let hint_state = state.clone();
    let builder = builder.feature(
        methods::INLAY_HINT,
        feature_fn(move |params, token| {
            let state = hint_state.clone();
            async move { run_document_query(&state, params, "inlay_hints", token).await }
        }),
    );
    let action_state = state.clone();
    let builder = builder.feature(
        methods::CODE_ACTION,
        feature_fn(move |params, token| {
            let state = action_state.clone();
            async move { run_document_query(&state, params, "code_actions", token).await }
        }),
    );

    let exec_state = state.clone();
    let builder = builder.feature(
        methods::EXECUTE_COMMAND,
        feature_fn(move |params, token| {
            let state = exec_state.clone();
            async move {
                #[derive(Deserialize)]
                struct ExecuteCommandParams {
                    command: String,
                    #[serde(default)]
                    arguments: Vec<Value>,
                }
                let p: ExecuteCommandParams = serde_json::from_value(params)
                    .map_err(|e| ErrorObject::invalid_params(e.to_string()))?;
                if p.command != "actions/run" {
                    return Err(ErrorObject::method_not_found(&p.command));
                }
                let request: RunActionRequest = p
                    .arguments
                    .first()
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| ErrorObject::invalid_params(format!("actions/run: {e}")))?
                    .ok_or_else(|| ErrorObject::invalid_params("actions/run needs a request"))?;
                let trigger = p
                    .arguments
                    .get(1)
                    .and_then(|v| v.as_str())
                    .map(PathBuf::from)
                    .or_else(|| state.context.project_roots().into_iter().next())
                    .ok_or_else(|| ErrorObject::invalid_params("no project to run in"))?;
                let response = routing::run_action_for_path(
                    &state.context,
                    &state.supervisor,
                    &trigger,
                    &request,
                    &RunActionOptions::default(),
                    &token,
                )
                .await
                .map_err(|e| to_rpc_error(&e))?;
                serde_json::to_value(response)
                    .map_err(|e| ErrorObject::internal(e.to_string()))
            }
        }),
    );

    let shutdown_state = state.clone();
    let builder = builder.feature(
        methods::SHUTDOWN,
        feature_fn(move |_params, _token| {
            let state = shutdown_state.clone();
            async move {
                state.supervisor.stop_all().await;
                Ok(Value::Null)
            }
        }),
    );

    let exit_state = state.clone();
    let builder = builder.feature(
        methods::EXIT,
        notification_fn(move |_params| {
            let state = exit_state.clone();
            async move {
                state.request_exit(0);
            }
        }),
    );

    let lost_state = state;
    builder.on_exit(move || {
        tracing::info!("ide client disconnected");
        lost_state.request_exit(1);
    })
}

/// Replay a document lifecycle notification to runners of projects that are
/// already running. Projects started later replay open documents themselves.
async fn forward_document_event(state: &IdeState, path: &Path, method: &'static str) {
    for project in state.context.projects_containing(path) {
        if project.status != ProjectStatus::Running {
            continue;
        }
        let root = project.root().to_path_buf();
        match state
            .supervisor
            .runner(&root, burnish_types::DEV_WORKSPACE_ENV)
            .await
        {
            Ok(peer) => {
                let _ = peer
                    .notify(method, Some(json!({ "file_path": path })))
                    .await;
            }
            Err(e) => {
                tracing::debug!(project = %root.display(), error = %e, "document replay skipped")
            }
        }
    }
}

/// Forward supervisor events to the LSP client for as long as it is
/// connected.
fn spawn_event_forwarder(state: &Arc<IdeState>) {
    let mut events = state.supervisor.subscribe_events();
    let state = state.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let Some(client) = state.client.get() else {
                continue;
            };
            match event {
                WorkspaceEvent::DocumentEdited {
                    path,
                    previous,
                    text,
                } => {
                    let edit = TextEdit::whole_document(&previous, text);
                    let mut changes = serde_json::Map::new();
                    changes.insert(path_to_uri(&path), json!([edit]));
                    let params = json!({ "edit": { "changes": changes } });
                    if let Err(e) = client.request(methods::APPLY_EDIT, Some(params)).await {
                        tracing::warn!(error = %e, "applyEdit not accepted by client");
                    }
                }
                WorkspaceEvent::ShowMessage { message } => {
                    let _ = client
                        .notify(
                            methods::SHOW_MESSAGE,
                            Some(json!({ "type": 3, "message": message })),
                        )
                        .await;
                }
                WorkspaceEvent::ProjectChanged { root } => {
                    tracing::debug!(project = %root.display(), "project changed");
                }
            }
        }
    });
}

fn new_ide_state(
    context: Arc<WorkspaceContext>,
    supervisor: Arc<RunnerSupervisor>,
) -> (Arc<IdeState>, oneshot::Receiver<i32>) {
    let (exit_tx, exit_rx) = oneshot::channel();
    let state = Arc::new(IdeState {
        context,
        supervisor,
        client: OnceLock::new(),
        exit_tx: Mutex::new(Some(exit_tx)),
    });
    spawn_event_forwarder(&state);
    (state, exit_rx)
}

async fn serve_until_exit(
    state: Arc<IdeState>,
    peer: PeerHandle,
    exit_rx: oneshot::Receiver<i32>,
) -> Result<i32, WorkspaceError> {
    let _ = state.client.set(peer.clone());
    let code = exit_rx.await.unwrap_or(1);
    state.supervisor.stop_all().await;
    peer.stop();
    Ok(code)
}

/// Serve the IDE surface over stdio until `exit` or client disconnect.
/// Resolves to the process exit code.
pub async fn serve_stdio(
    context: Arc<WorkspaceContext>,
    supervisor: Arc<RunnerSupervisor>,
) -> Result<i32, WorkspaceError> {
    let (state, exit_rx) = new_ide_state(context, supervisor);
    let peer = build_ide_peer(state.clone()).start(tokio::io::stdin(), tokio::io::stdout());
    tracing::info!("ide server listening on stdio");
    serve_until_exit(state, peer, exit_rx).await
}

/// Serve the IDE surface to a single TCP client.
pub async fn serve_tcp(
    context: Arc<WorkspaceContext>,
    supervisor: Arc<RunnerSupervisor>,
    host: &str,
    port: u16,
) -> Result<i32, WorkspaceError> {
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .map_err(|e| WorkspaceError::io("bind ide listener", e))?;
    let addr = listener
        .local_addr()
        .map_err(|e| WorkspaceError::io("ide listener address", e))?;
    tracing::info!(%addr, "ide server listening");

    let (stream, client_addr) = listener
        .accept()
        .await
        .map_err(|e| WorkspaceError::io("accept ide client", e))?;
    stream
        .set_nodelay(true)
        .map_err(|e| WorkspaceError::io("set_nodelay", e))?;
    tracing::info!(client = %client_addr, "ide client connected");
    let (read, write) = stream.into_split();

    let (state, exit_rx) = new_ide_state(context, supervisor);
    let peer = build_ide_peer(state.clone()).start(read, write);
    serve_until_exit(state, peer, exit_rx).await
}
