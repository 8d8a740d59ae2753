//! Environment preparation.
//!
//! An environment is a directory `<project>/.venvs/<env>` holding a copy of
//! the runner executable under `bin/`, the env's dependency group frozen
//! into `requirements.txt` (installation itself is the package manager's
//! job), and a `packages/` directory preset resolution looks packages up
//! in.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use burnish_rpc::methods;
use burnish_types::{DEV_WORKSPACE_ENV, ENVS_DIR_NAME, RunPayload, RunResult};

use crate::handlers::{ActionHandler, HandlerError, HandlerServices, RunContext};

pub const RUNNER_BIN_NAME: &str = "burnish-runner";

pub struct PrepareEnvs {
    services: HandlerServices,
}

#[derive(Deserialize)]
struct RawConfigReply {
    config: String,
}

impl PrepareEnvs {
    #[must_use]
    pub fn new(services: HandlerServices) -> Self {
        Self { services }
    }

    /// The resolved project definition: from the supervisor when a channel
    /// is up (it holds the preset-resolved document), otherwise from disk.
    async fn resolved_definition(
        &self,
    ) -> Result<burnish_config::ProjectDefinition, HandlerError> {
        let def_path = &self.services.project.def_path;
        if let Some(peer) = self.services.files.peer() {
            let reply = peer
                .request(
                    methods::GET_RAW_CONFIG,
                    Some(serde_json::json!({
                        "project_def_path": def_path,
                    })),
                )
                .await
                .map_err(|e| HandlerError::failed(format!("getRawConfig failed: {e}")))?;
            let raw: RawConfigReply = serde_json::from_value(reply)
                .map_err(|e| HandlerError::failed(format!("malformed getRawConfig reply: {e}")))?;
            return burnish_config::ProjectDefinition::parse(def_path, &raw.config)
                .map_err(|e| HandlerError::failed(e.to_string()));
        }
        burnish_config::ProjectDefinition::read(def_path)
            .map_err(|e| HandlerError::failed(e.to_string()))
    }

    fn prepare_one(
        &self,
        definition: &burnish_config::ProjectDefinition,
        env: &str,
    ) -> Result<PathBuf, HandlerError> {
        let env_dir = self
            .services
            .project
            .working_dir
            .join(ENVS_DIR_NAME)
            .join(env);
        let bin_dir = env_dir.join("bin");
        std::fs::create_dir_all(&bin_dir)
            .and_then(|()| std::fs::create_dir_all(env_dir.join("packages")))
            .map_err(|e| HandlerError::failed(format!("creating {}: {e}", env_dir.display())))?;

        let requirements = definition.dependency_group(env).join("\n");
        std::fs::write(env_dir.join("requirements.txt"), requirements + "\n")
            .map_err(|e| HandlerError::failed(format!("writing requirements: {e}")))?;

        install_runner_binary(&bin_dir)?;
        Ok(env_dir)
    }
}

#[async_trait]
impl ActionHandler for PrepareEnvs {
    async fn run(&self, payload: &RunPayload, ctx: &RunContext) -> Result<(), HandlerError> {
        let RunPayload::PrepareEnvs { envs } = payload else {
            return Err(HandlerError::failed("prepare_envs expects an env payload"));
        };
        let definition = self.resolved_definition().await?;

        // No explicit envs means every declared dependency group.
        let targets: Vec<String> = if envs.is_empty() {
            let section = definition
                .burnish_section()
                .map_err(|e| HandlerError::failed(e.to_string()))?;
            let mut groups: Vec<String> = section.envs.keys().cloned().collect();
            if !groups.iter().any(|g| g == DEV_WORKSPACE_ENV) {
                groups.insert(0, DEV_WORKSPACE_ENV.to_string());
            }
            groups
        } else {
            envs.clone()
        };

        let mut prepared = Vec::with_capacity(targets.len());
        for env in &targets {
            if ctx.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }
            let env_dir = self.prepare_one(&definition, env)?;
            tracing::info!(env, path = %env_dir.display(), "prepared environment");
            prepared.push(env.clone());
        }
        ctx.emit_partial(RunResult::Plain(serde_json::json!({
            "prepared_envs": prepared,
        })));
        Ok(())
    }
}

/// Copy the current runner executable into the env so the supervisor can
/// spawn it from there.
fn install_runner_binary(bin_dir: &Path) -> Result<(), HandlerError> {
    let current = std::env::current_exe()
        .map_err(|e| HandlerError::failed(format!("cannot locate own executable: {e}")))?;
    let target = bin_dir.join(RUNNER_BIN_NAME);
    std::fs::copy(&current, &target)
        .map_err(|e| HandlerError::failed(format!("installing runner binary: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::{context_for, services_in};
    use burnish_types::ActionSource;

    const DEF: &str = r#"
[project]
name = "app"
dependencies = ["requests>=2"]

[dependency-groups]
dev_workspace = ["burnish>=0.1"]
dev = ["pytest"]
"#;

    #[tokio::test]
    async fn prepares_requested_envs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), DEF).unwrap();
        let services = services_in(dir.path());
        let (ctx, aggregate) = context_for(RunResult::empty_for(ActionSource::PrepareEnvs));

        PrepareEnvs::new(services)
            .run(
                &RunPayload::PrepareEnvs {
                    envs: vec!["dev".to_string()],
                },
                &ctx,
            )
            .await
            .unwrap();

        let env_dir = dir.path().join(ENVS_DIR_NAME).join("dev");
        assert!(env_dir.join("bin").join(RUNNER_BIN_NAME).is_file());
        assert!(env_dir.join("packages").is_dir());
        let requirements = std::fs::read_to_string(env_dir.join("requirements.txt")).unwrap();
        assert!(requirements.contains("pytest"));

        let aggregate = aggregate.lock().unwrap();
        let RunResult::Plain(value) = &*aggregate else {
            panic!("expected plain aggregate");
        };
        assert_eq!(value["prepared_envs"], serde_json::json!(["dev"]));
    }

    #[tokio::test]
    async fn empty_env_list_prepares_dev_workspace_at_least() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), DEF).unwrap();
        let services = services_in(dir.path());
        let (ctx, _) = context_for(RunResult::empty_for(ActionSource::PrepareEnvs));

        PrepareEnvs::new(services)
            .run(&RunPayload::PrepareEnvs { envs: vec![] }, &ctx)
            .await
            .unwrap();

        assert!(
            dir.path()
                .join(ENVS_DIR_NAME)
                .join(DEV_WORKSPACE_ENV)
                .join("bin")
                .join(RUNNER_BIN_NAME)
                .is_file()
        );
    }
}
