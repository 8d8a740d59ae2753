//! Project discovery and configuration resolution.
//!
//! A project definition is a `pyproject.toml` whose `dev_workspace`
//! dependency group names `burnish`. Resolution folds presets into the
//! document, merges the built-in base config underneath, normalises
//! dependency groups, and extracts the typed action registry that runners
//! are configured with.

mod discover;
mod dump;
mod error;
mod merge;
mod normalize;
mod resolve;
mod schema;

pub use discover::{DiscoveredProject, discover_projects, load_project};
pub use dump::dump_config;
pub use error::ConfigError;
pub use merge::{base_config, merge_tables};
pub use normalize::{RUNNER_PACKAGE, normalize};
pub use resolve::{PackagePathResolver, resolve_presets};
pub use schema::{
    ActionEntry, BurnishSection, DependencySpec, DependencyTable, EnvEntry, HandlerEntry,
    PresetEntry, ProjectDefinition, definition_path, requirement_name, toml_to_json,
};

use std::collections::BTreeMap;
use std::path::Path;

use burnish_types::{ActionDefinition, UpdateConfigRequest};

/// A project definition after the full resolution pipeline.
#[derive(Debug, Clone)]
pub struct ResolvedProject {
    pub definition: ProjectDefinition,
    pub actions: Vec<ActionDefinition>,
    pub handler_configs: BTreeMap<String, serde_json::Value>,
}

impl ResolvedProject {
    /// Find a declared action by name.
    #[must_use]
    pub fn action(&self, name: &str) -> Option<&ActionDefinition> {
        self.actions.iter().find(|a| a.name == name)
    }

    /// The `runner/updateConfig` payload for this project.
    #[must_use]
    pub fn to_update_config_request(&self) -> UpdateConfigRequest {
        UpdateConfigRequest {
            working_dir: self.definition.root().to_path_buf(),
            project_name: self.definition.name().to_string(),
            project_def_path: self.definition.def_path().to_path_buf(),
            actions: self.actions.clone(),
            action_handler_configs: self.handler_configs.clone(),
        }
    }
}

/// Run the resolution pipeline over a parsed definition.
///
/// Without a resolver, declared presets are left alone; the project then
/// only gets base-config and normalisation treatment. Callers that can
/// reach a `dev_workspace` runner pass one to get the full pipeline.
pub async fn resolve_project(
    mut definition: ProjectDefinition,
    resolver: Option<&dyn PackagePathResolver>,
) -> Result<ResolvedProject, ConfigError> {
    let with_base = merge_tables(definition.document(), &base_config());
    definition.replace_document(with_base);

    if let Some(resolver) = resolver {
        resolve_presets(&mut definition, resolver).await?;
    }
    normalize(&mut definition)?;

    let section = definition.burnish_section()?;
    let (actions, handler_configs) = section.to_actions()?;
    tracing::debug!(
        project = definition.name(),
        actions = actions.len(),
        "resolved project configuration"
    );
    Ok(ResolvedProject {
        definition,
        actions,
        handler_configs,
    })
}

/// Convenience for the CLI: load and resolve the project at `project_dir`.
pub async fn resolve_project_at(
    project_dir: &Path,
    resolver: Option<&dyn PackagePathResolver>,
) -> Result<ResolvedProject, ConfigError> {
    let definition = load_project(project_dir)?;
    resolve_project(definition, resolver).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pipeline_adds_base_actions_and_normalises_groups() {
        let raw = r#"
[project]
name = "app"
dependencies = ["requests>=2"]

[dependency-groups]
dev_workspace = ["burnish>=0.1"]

[tool.burnish.action.format]
handlers = [{ name = "trim", source = "burnish.format.trim_whitespace" }]
"#;
        let definition =
            ProjectDefinition::parse(Path::new("/ws/app/pyproject.toml"), raw).unwrap();
        let resolved = resolve_project(definition, None).await.unwrap();

        // User action plus the three built-ins.
        assert!(resolved.action("format").is_some());
        assert!(resolved.action("prepare_envs").is_some());
        assert!(resolved.action("dump_config").is_some());
        assert!(resolved.action("list_files_by_lang").is_some());

        let runtime = resolved.definition.dependency_group("runtime");
        assert_eq!(runtime[0], "requests>=2");

        let request = resolved.to_update_config_request();
        assert_eq!(request.project_name, "app");
        assert_eq!(request.working_dir, Path::new("/ws/app"));
    }

    #[tokio::test]
    async fn declared_presets_without_resolver_are_left_in_place() {
        let raw = "[[tool.burnish.presets]]\nsource = \"p\"\n";
        let definition =
            ProjectDefinition::parse(Path::new("/ws/app/pyproject.toml"), raw).unwrap();
        let resolved = resolve_project(definition, None).await.unwrap();
        let section = resolved.definition.burnish_section().unwrap();
        assert_eq!(section.presets.len(), 1);
    }
}
