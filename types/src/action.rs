//! Action and handler definitions as exchanged between the supervisor and
//! the extension runners.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Well-known action sources.
///
/// The source of an action is a fully-qualified identifier that designates
/// its payload, context, and result types. Unknown sources are rejected at
/// runner configuration time with an error naming the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionSource {
    /// Document formatting; results compose by "last changed code wins".
    Format,
    /// Per-file linting; results union per-file message lists.
    Lint,
    /// Batch linting over many files at once.
    LintMany,
    /// File classification by language; results union per-language lists.
    ListFilesByLang,
    /// Inlay hints for documents; result arrays concatenate.
    InlayHints,
    /// Code actions for documents; result arrays concatenate.
    CodeActions,
    /// Environment preparation (create env dirs, install the runner).
    PrepareEnvs,
    /// Resolved-configuration dump.
    DumpConfig,
}

impl ActionSource {
    /// Parse a fully-qualified source identifier.
    #[must_use]
    pub fn parse(source: &str) -> Option<Self> {
        match source {
            "burnish.action.format" => Some(Self::Format),
            "burnish.action.lint" => Some(Self::Lint),
            "burnish.action.lint_many" => Some(Self::LintMany),
            "burnish.action.list_files_by_lang" => Some(Self::ListFilesByLang),
            "burnish.action.inlay_hints" => Some(Self::InlayHints),
            "burnish.action.code_actions" => Some(Self::CodeActions),
            "burnish.action.prepare_envs" => Some(Self::PrepareEnvs),
            "burnish.action.dump_config" => Some(Self::DumpConfig),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Format => "burnish.action.format",
            Self::Lint => "burnish.action.lint",
            Self::LintMany => "burnish.action.lint_many",
            Self::ListFilesByLang => "burnish.action.list_files_by_lang",
            Self::InlayHints => "burnish.action.inlay_hints",
            Self::CodeActions => "burnish.action.code_actions",
            Self::PrepareEnvs => "burnish.action.prepare_envs",
            Self::DumpConfig => "burnish.action.dump_config",
        }
    }
}

/// One concrete implementation unit of an action, bound to an environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionHandlerDefinition {
    /// Unique within the owning action.
    pub name: String,
    /// Fully-qualified identifier of the implementation.
    pub source: String,
    /// Environment (and therefore runner) that must execute this handler.
    pub env: String,
    /// Extra dependencies appended to the env's dependency group.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Handler-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A named operation with one result type, composed of ordered handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    /// Unique within the project.
    pub name: String,
    /// Fully-qualified identifier of the action type.
    pub source: String,
    /// Handlers in declaration order. Runs shard these by env.
    #[serde(default)]
    pub handlers: Vec<ActionHandlerDefinition>,
    /// Default action configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ActionDefinition {
    /// The env of the first handler, used to pick the runner a run starts in.
    #[must_use]
    pub fn primary_env(&self) -> Option<&str> {
        self.handlers.first().map(|h| h.env.as_str())
    }

    /// Distinct envs across all handlers, in first-appearance order.
    #[must_use]
    pub fn envs(&self) -> Vec<&str> {
        let mut envs: Vec<&str> = Vec::new();
        for handler in &self.handlers {
            if !envs.contains(&handler.env.as_str()) {
                envs.push(&handler.env);
            }
        }
        envs
    }
}

/// Payload of `runner/updateConfig`: the fully-resolved configuration a
/// runner needs to build its registries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfigRequest {
    pub working_dir: PathBuf,
    pub project_name: String,
    pub project_def_path: PathBuf,
    pub actions: Vec<ActionDefinition>,
    /// Per-handler configs keyed by `<action>/<handler>`.
    #[serde(default)]
    pub action_handler_configs: std::collections::BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(name: &str, env: &str) -> ActionHandlerDefinition {
        ActionHandlerDefinition {
            name: name.to_string(),
            source: format!("pkg.{name}"),
            env: env.to_string(),
            dependencies: vec![],
            config: serde_json::Value::Null,
        }
    }

    #[test]
    fn action_source_roundtrip() {
        for source in [
            ActionSource::Format,
            ActionSource::Lint,
            ActionSource::LintMany,
            ActionSource::ListFilesByLang,
            ActionSource::InlayHints,
            ActionSource::CodeActions,
            ActionSource::PrepareEnvs,
            ActionSource::DumpConfig,
        ] {
            assert_eq!(ActionSource::parse(source.as_str()), Some(source));
        }
    }

    #[test]
    fn action_source_unknown_is_none() {
        assert_eq!(ActionSource::parse("pkg.something_else"), None);
        assert_eq!(ActionSource::parse(""), None);
    }

    #[test]
    fn primary_env_is_first_handler_env() {
        let action = ActionDefinition {
            name: "lint".to_string(),
            source: ActionSource::Lint.as_str().to_string(),
            handlers: vec![handler("a", "dev"), handler("b", "dev_workspace")],
            config: serde_json::Value::Null,
        };
        assert_eq!(action.primary_env(), Some("dev"));
    }

    #[test]
    fn envs_deduplicates_preserving_order() {
        let action = ActionDefinition {
            name: "lint".to_string(),
            source: ActionSource::Lint.as_str().to_string(),
            handlers: vec![handler("a", "dev"), handler("b", "other"), handler("c", "dev")],
            config: serde_json::Value::Null,
        };
        assert_eq!(action.envs(), vec!["dev", "other"]);
    }

    #[test]
    fn primary_env_none_without_handlers() {
        let action = ActionDefinition {
            name: "noop".to_string(),
            source: ActionSource::Format.as_str().to_string(),
            handlers: vec![],
            config: serde_json::Value::Null,
        };
        assert_eq!(action.primary_env(), None);
    }

    #[test]
    fn update_config_request_roundtrip() {
        let req = UpdateConfigRequest {
            working_dir: PathBuf::from("/ws/proj"),
            project_name: "proj".to_string(),
            project_def_path: PathBuf::from("/ws/proj/pyproject.toml"),
            actions: vec![],
            action_handler_configs: std::collections::BTreeMap::new(),
        };
        let json = serde_json::to_value(&req).unwrap();
        let back: UpdateConfigRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.project_name, "proj");
        assert_eq!(back.working_dir, PathBuf::from("/ws/proj"));
    }
}
