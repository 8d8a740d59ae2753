//! Resolved-configuration dump handler.

use async_trait::async_trait;
use serde::Deserialize;

use burnish_rpc::methods;
use burnish_types::{RunPayload, RunResult};

use crate::handlers::{ActionHandler, HandlerError, HandlerServices, RunContext};

/// Writes the fully-resolved configuration into the project's dump
/// directory. The resolved document comes from the supervisor when a
/// channel is up; standalone runs resolve locally without presets.
pub struct ConfigDump {
    services: HandlerServices,
}

#[derive(Deserialize)]
struct RawConfigReply {
    config: String,
}

impl ConfigDump {
    #[must_use]
    pub fn new(services: HandlerServices) -> Self {
        Self { services }
    }

    async fn resolved_definition(
        &self,
    ) -> Result<burnish_config::ProjectDefinition, HandlerError> {
        let def_path = &self.services.project.def_path;
        if let Some(peer) = self.services.files.peer() {
            let reply = peer
                .request(
                    methods::GET_RAW_CONFIG,
                    Some(serde_json::json!({ "project_def_path": def_path })),
                )
                .await
                .map_err(|e| HandlerError::failed(format!("getRawConfig failed: {e}")))?;
            let raw: RawConfigReply = serde_json::from_value(reply)
                .map_err(|e| HandlerError::failed(format!("malformed getRawConfig reply: {e}")))?;
            return burnish_config::ProjectDefinition::parse(def_path, &raw.config)
                .map_err(|e| HandlerError::failed(e.to_string()));
        }
        let definition = burnish_config::ProjectDefinition::read(def_path)
            .map_err(|e| HandlerError::failed(e.to_string()))?;
        burnish_config::resolve_project(definition, None)
            .await
            .map(|resolved| resolved.definition)
            .map_err(|e| HandlerError::failed(e.to_string()))
    }
}

#[async_trait]
impl ActionHandler for ConfigDump {
    async fn run(&self, payload: &RunPayload, ctx: &RunContext) -> Result<(), HandlerError> {
        if !matches!(payload, RunPayload::DumpConfig) {
            return Err(HandlerError::failed("dump_config takes no payload"));
        }
        if ctx.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }
        let definition = self.resolved_definition().await?;
        let dump_path = burnish_config::dump_config(&definition)
            .map_err(|e| HandlerError::failed(e.to_string()))?;
        ctx.emit_partial(RunResult::Plain(serde_json::json!({
            "dump_path": dump_path,
        })));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::{context_for, services_in};
    use burnish_types::{ActionSource, CONFIG_DUMP_DIR_NAME, PROJECT_DEF_FILENAME};

    #[tokio::test]
    async fn dumps_resolved_config_with_base_actions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PROJECT_DEF_FILENAME),
            "[project]\nname = \"app\"\n\n[dependency-groups]\ndev_workspace = [\"burnish>=0.1\"]\n",
        )
        .unwrap();
        let services = services_in(dir.path());
        let (ctx, aggregate) = context_for(RunResult::empty_for(ActionSource::DumpConfig));

        ConfigDump::new(services)
            .run(&RunPayload::DumpConfig, &ctx)
            .await
            .unwrap();

        let dump_path = dir
            .path()
            .join(CONFIG_DUMP_DIR_NAME)
            .join(PROJECT_DEF_FILENAME);
        assert!(dump_path.is_file());
        // The dump carries the resolved document, base actions included.
        let dumped = std::fs::read_to_string(&dump_path).unwrap();
        assert!(dumped.contains("prepare_envs"));

        let aggregate = aggregate.lock().unwrap();
        let RunResult::Plain(value) = &*aggregate else {
            panic!("expected plain aggregate");
        };
        assert_eq!(
            value["dump_path"],
            serde_json::json!(dump_path.to_string_lossy())
        );
    }
}
