//! Action execution.
//!
//! The engine owns the registries built from `runner/updateConfig` and the
//! cached handler instances. A run executes the action's handlers for this
//! runner's environment in declaration order, folding each handler's
//! partials into the aggregate with the action's reducer; partials are
//! streamed as `$/progress` when the caller supplied a token. A fired
//! cancel token stops the run with the partial aggregate.
//!
//! Handlers bound to other environments are the supervisor's problem: it
//! shards a run across the runners of every env the action touches and
//! folds the per-env responses.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use burnish_rpc::{CancelToken, PeerHandle, methods};
use burnish_types::{
    ActionDefinition, ActionSource, PartialResult, RunActionOptions, RunActionRequest,
    RunActionResponse, RunPayload, RunResult, UpdateConfigRequest,
};

use crate::cache::FileCache;
use crate::error::RunnerError;
use crate::fs::FileManager;
use crate::handlers::{
    ActionHandler, HandlerError, HandlerServices, ProjectInfo, RunContext, build_handler,
};

pub struct ActionEngine {
    services: HandlerServices,
    env_name: String,
    actions: HashMap<String, ActionDefinition>,
    handler_configs: BTreeMap<String, serde_json::Value>,
    /// Cached handler instances keyed `<action>/<handler>`.
    instances: Mutex<HashMap<String, Arc<dyn ActionHandler>>>,
}

impl ActionEngine {
    #[must_use]
    pub fn new(
        request: UpdateConfigRequest,
        env_name: String,
        files: Arc<FileManager>,
        cache: Arc<FileCache>,
    ) -> Self {
        let services = HandlerServices {
            files,
            cache,
            project: ProjectInfo {
                working_dir: request.working_dir,
                name: request.project_name,
                def_path: request.project_def_path,
                env_name: env_name.clone(),
            },
        };
        let actions = request
            .actions
            .into_iter()
            .map(|action| (action.name.clone(), action))
            .collect();
        Self {
            services,
            env_name,
            actions,
            handler_configs: request.action_handler_configs,
            instances: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn action(&self, name: &str) -> Option<&ActionDefinition> {
        self.actions.get(name)
    }

    /// Action names in sorted order, for listings.
    #[must_use]
    pub fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn run_action(
        &self,
        request: RunActionRequest,
        options: RunActionOptions,
        cancel: CancelToken,
        peer: Option<PeerHandle>,
    ) -> Result<RunActionResponse, RunnerError> {
        let action = self
            .actions
            .get(&request.action_name)
            .ok_or_else(|| RunnerError::ActionNotFound(request.action_name.clone()))?;
        let source = ActionSource::parse(&action.source).ok_or_else(|| {
            RunnerError::UnknownActionSource {
                action: action.name.clone(),
                source_name: action.source.clone(),
            }
        })?;
        let payload =
            RunPayload::from_params(source, &request.params).map_err(|e| {
                RunnerError::InvalidPayload {
                    action: action.name.clone(),
                    message: e.to_string(),
                }
            })?;

        let shard: Vec<_> = action
            .handlers
            .iter()
            .filter(|h| h.env == self.env_name)
            .collect();
        if shard.is_empty() {
            return Err(RunnerError::NoHandlersForEnv {
                action: action.name.clone(),
            });
        }

        let aggregate = Arc::new(Mutex::new(RunResult::empty_for(source)));
        let progress_tx = options
            .partial_result_token
            .as_ref()
            .zip(peer)
            .map(|(token, peer)| spawn_progress_forwarder(token.clone(), peer));

        for handler_def in shard {
            let key = format!("{}/{}", action.name, handler_def.name);
            let instance = self.instance(&key, &handler_def.source, &handler_def.config).await?;
            let ctx = RunContext::new(cancel.clone(), aggregate.clone(), progress_tx.clone());
            tracing::debug!(action = %action.name, handler = %handler_def.name, "running handler");
            match instance.run(&payload, &ctx).await {
                Ok(()) => {}
                Err(HandlerError::Cancelled) => {
                    tracing::info!(action = %action.name, handler = %handler_def.name, "run cancelled");
                    let aggregate = aggregate.lock().expect("run aggregate poisoned");
                    return Ok(RunActionResponse::stopped(&aggregate));
                }
                Err(HandlerError::Failed(message)) => {
                    return Err(RunnerError::HandlerFailed {
                        handler: handler_def.name.clone(),
                        message,
                    });
                }
            }
        }

        let result = {
            let aggregate = aggregate.lock().expect("run aggregate poisoned");
            aggregate.clone()
        };
        if let RunPayload::Format { save: true, .. } = &payload {
            self.save_changed_files(&result).await?;
        }
        Ok(RunActionResponse::success(&result))
    }

    /// Drop the action's cached instances so the next run rebuilds them
    /// with fresh state.
    pub async fn reload_action(&self, action_name: &str) {
        let prefix = format!("{action_name}/");
        let dropped: Vec<Arc<dyn ActionHandler>> = {
            let mut instances = self.instances.lock().expect("instance map poisoned");
            let keys: Vec<String> = instances
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect();
            keys.iter().filter_map(|k| instances.remove(k)).collect()
        };
        for instance in dropped {
            instance.on_shutdown().await;
        }
        tracing::info!(action = action_name, "reloaded action handlers");
    }

    /// `shutdown` request: give every cached handler its shutdown callback.
    pub async fn shutdown(&self) {
        for instance in self.drain_instances() {
            instance.on_shutdown().await;
        }
    }

    /// `exit` notification: last-gasp callbacks before the process ends.
    pub async fn exit(&self) {
        for instance in self.drain_instances() {
            instance.on_exit().await;
        }
    }

    fn drain_instances(&self) -> Vec<Arc<dyn ActionHandler>> {
        let mut instances = self.instances.lock().expect("instance map poisoned");
        instances.drain().map(|(_, v)| v).collect()
    }

    async fn instance(
        &self,
        key: &str,
        source: &str,
        inline_config: &serde_json::Value,
    ) -> Result<Arc<dyn ActionHandler>, RunnerError> {
        if let Some(existing) = self
            .instances
            .lock()
            .expect("instance map poisoned")
            .get(key)
        {
            return Ok(existing.clone());
        }
        let config = self
            .handler_configs
            .get(key)
            .unwrap_or(inline_config)
            .clone();
        let handler = build_handler(source, &config, &self.services)?;
        handler.on_initialize().await;
        self.instances
            .lock()
            .expect("instance map poisoned")
            .insert(key.to_string(), handler.clone());
        Ok(handler)
    }

    async fn save_changed_files(&self, result: &RunResult) -> Result<(), RunnerError> {
        let RunResult::Format(format) = result else {
            return Ok(());
        };
        for (path, file) in &format.result_by_file_path {
            if file.changed {
                self.services
                    .files
                    .save_document(std::path::Path::new(path), &file.code)
                    .await?;
            }
        }
        Ok(())
    }
}

fn spawn_progress_forwarder(
    token: String,
    peer: PeerHandle,
) -> mpsc::UnboundedSender<serde_json::Value> {
    let (tx, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();
    tokio::spawn(async move {
        while let Some(value) = rx.recv().await {
            let partial = PartialResult {
                token: token.clone(),
                value,
            };
            if let Ok(params) = serde_json::to_value(&partial)
                && peer.notify(methods::PROGRESS, Some(params)).await.is_err()
            {
                break;
            }
        }
    });
    tx
}
