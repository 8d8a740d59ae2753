//! Action routing: which project answers a run, which runners execute it.
//!
//! A run targets one project (chosen deepest-first among the projects
//! containing the trigger path) and fans out to one runner per environment
//! the action's handlers declare. Each runner executes only its own-env
//! handlers; the per-env responses are folded back into one aggregate with
//! the action's reducer semantics.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinSet;

use burnish_rpc::{CancelToken, PeerHandle, RequestId, methods, methods::commands};
use burnish_types::{
    ActionDefinition, ActionSource, RunActionOptions, RunActionRequest, RunActionResponse,
    RunResult, RunStatus,
};

use crate::context::WorkspaceContext;
use crate::error::WorkspaceError;
use crate::supervisor::RunnerSupervisor;

/// Pick the project that answers `action_name` for a trigger path:
/// deepest-first among containing projects, first one declaring the action.
pub async fn route_action(
    context: &WorkspaceContext,
    supervisor: &RunnerSupervisor,
    trigger_path: &Path,
    action_name: &str,
) -> Result<PathBuf, WorkspaceError> {
    for project in context.projects_containing(trigger_path) {
        let root = project.root().to_path_buf();
        match supervisor.resolved_config(&root).await {
            Ok(resolved) if resolved.action(action_name).is_some() => return Ok(root),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(project = %root.display(), error = %e, "skipping project");
            }
        }
    }
    Err(WorkspaceError::ActionNotFound(trigger_path.to_path_buf()))
}

/// Run an action in one project, sharded across the environments its
/// handlers declare.
pub async fn run_action_in_project(
    supervisor: &RunnerSupervisor,
    project_root: &Path,
    request: &RunActionRequest,
    options: &RunActionOptions,
    cancel: &CancelToken,
) -> Result<RunActionResponse, WorkspaceError> {
    let resolved = supervisor.resolved_config(project_root).await?;
    let action = resolved
        .action(&request.action_name)
        .ok_or_else(|| WorkspaceError::ActionNotFound(project_root.to_path_buf()))?;
    let source = ActionSource::parse(&action.source).ok_or_else(|| {
        WorkspaceError::ActionRunFailed(format!("unknown action source '{}'", action.source))
    })?;
    let envs = handler_envs(action);

    let mut aggregate = RunResult::empty_for(source);
    let mut status = RunStatus::Success;
    let mut return_code = 0;
    for env in envs {
        let peer = supervisor.runner(project_root, &env).await?;
        let response = dispatch_run(&peer, request, options, cancel).await?;
        if response.status == RunStatus::Stopped {
            status = RunStatus::Stopped;
        }
        return_code = return_code.max(response.return_code);
        if let Some(result) = response.result.as_deref()
            && let Ok(shard) = serde_json::from_str::<RunResult>(result)
        {
            aggregate.update(shard);
        }
        if status == RunStatus::Stopped {
            break;
        }
    }

    Ok(RunActionResponse {
        status,
        result: Some(aggregate.to_json_string()),
        format: "json".to_string(),
        return_code: if status == RunStatus::Stopped {
            1
        } else {
            return_code.max(aggregate.return_code())
        },
    })
}

/// Route by trigger path, then run.
pub async fn run_action_for_path(
    context: &WorkspaceContext,
    supervisor: &RunnerSupervisor,
    trigger_path: &Path,
    request: &RunActionRequest,
    options: &RunActionOptions,
    cancel: &CancelToken,
) -> Result<RunActionResponse, WorkspaceError> {
    let root = route_action(context, supervisor, trigger_path, &request.action_name).await?;
    run_action_in_project(supervisor, &root, request, options, cancel).await
}

/// Run the same action in several projects, optionally concurrently.
/// Returns per-project results in the order the roots were given.
pub async fn run_action_in_projects(
    supervisor: &Arc<RunnerSupervisor>,
    roots: &[PathBuf],
    request: &RunActionRequest,
    concurrently: bool,
    cancel: &CancelToken,
) -> Vec<(PathBuf, Result<RunActionResponse, WorkspaceError>)> {
    if !concurrently {
        let mut results = Vec::with_capacity(roots.len());
        for root in roots {
            let result =
                run_action_in_project(supervisor, root, request, &RunActionOptions::default(), cancel)
                    .await;
            results.push((root.clone(), result));
        }
        return results;
    }

    let mut set = JoinSet::new();
    for (index, root) in roots.iter().cloned().enumerate() {
        let supervisor = supervisor.clone();
        let request = request.clone();
        let cancel = cancel.clone();
        set.spawn(async move {
            let result = run_action_in_project(
                &supervisor,
                &root,
                &request,
                &RunActionOptions::default(),
                &cancel,
            )
            .await;
            (index, root, result)
        });
    }
    let mut indexed: Vec<(usize, PathBuf, Result<RunActionResponse, WorkspaceError>)> = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(entry) => indexed.push(entry),
            Err(e) => tracing::error!(error = %e, "run task panicked"),
        }
    }
    indexed.sort_by_key(|(index, _, _)| *index);
    indexed
        .into_iter()
        .map(|(_, root, result)| (root, result))
        .collect()
}

/// Send `actions/run` to one runner, forwarding cancellation downstream:
/// if `cancel` fires while the request is in flight, the runner receives
/// `$/cancelRequest` and its (partial) response is still awaited.
async fn dispatch_run(
    peer: &PeerHandle,
    request: &RunActionRequest,
    options: &RunActionOptions,
    cancel: &CancelToken,
) -> Result<RunActionResponse, WorkspaceError> {
    let id = peer.next_request_id();
    let params = json!({
        "command": commands::ACTIONS_RUN,
        "arguments": [request, options],
    });

    let request_fut = peer.request_with_id(id.clone(), methods::EXECUTE_COMMAND, Some(params), None);
    tokio::pin!(request_fut);

    let result = tokio::select! {
        result = &mut request_fut => result,
        () = cancel.cancelled() => {
            forward_cancel(peer, &id).await;
            request_fut.await
        }
    };

    let value = result.map_err(|e| WorkspaceError::ActionRunFailed(e.to_string()))?;
    serde_json::from_value(value)
        .map_err(|e| WorkspaceError::ActionRunFailed(format!("malformed run response: {e}")))
}

async fn forward_cancel(peer: &PeerHandle, id: &RequestId) {
    tracing::debug!(?id, "forwarding cancellation to runner");
    if let Err(e) = peer.cancel(id).await {
        tracing::warn!(error = %e, "failed to forward cancellation");
    }
}

fn handler_envs(action: &ActionDefinition) -> Vec<String> {
    let mut envs = Vec::new();
    for handler in &action.handlers {
        if !envs.contains(&handler.env) {
            envs.push(handler.env.clone());
        }
    }
    envs
}
