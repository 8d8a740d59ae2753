//! Typed view of the `tool.burnish` section of a project definition file.
//!
//! Everything here deserialises from the *merged* TOML document, after
//! presets have been folded in. The raw document is kept alongside the
//! typed view because merging and dumping operate on TOML values, not on
//! these structs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use burnish_types::{
    ActionDefinition, ActionHandlerDefinition, ActionSource, DEV_WORKSPACE_ENV,
    PROJECT_DEF_FILENAME,
};

use crate::error::ConfigError;

/// A project definition file together with its parsed TOML document.
#[derive(Debug, Clone)]
pub struct ProjectDefinition {
    name: String,
    def_path: PathBuf,
    document: toml::Table,
}

impl ProjectDefinition {
    /// Parse a `pyproject.toml` from disk.
    pub fn read(def_path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(def_path).map_err(|source| ConfigError::Io {
            path: def_path.to_path_buf(),
            source,
        })?;
        Self::parse(def_path, &raw)
    }

    pub fn parse(def_path: &Path, raw: &str) -> Result<Self, ConfigError> {
        let document: toml::Table = toml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: def_path.to_path_buf(),
            message: e.to_string(),
        })?;
        let name = document
            .get("project")
            .and_then(|p| p.get("name"))
            .and_then(toml::Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| {
                def_path
                    .parent()
                    .and_then(Path::file_name)
                    .map_or_else(|| "unnamed".to_string(), |n| n.to_string_lossy().to_string())
            });
        Ok(Self {
            name,
            def_path: def_path.to_path_buf(),
            document,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the `pyproject.toml` file itself.
    #[must_use]
    pub fn def_path(&self) -> &Path {
        &self.def_path
    }

    /// Directory containing the definition file.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.def_path.parent().unwrap_or(Path::new("."))
    }

    #[must_use]
    pub fn document(&self) -> &toml::Table {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut toml::Table {
        &mut self.document
    }

    pub fn replace_document(&mut self, document: toml::Table) {
        self.document = document;
    }

    /// PEP 735 dependency groups (`[dependency-groups]`).
    #[must_use]
    pub fn dependency_group(&self, group: &str) -> Vec<String> {
        self.document
            .get("dependency-groups")
            .and_then(|groups| groups.get(group))
            .and_then(toml::Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `[project] dependencies` (the runtime requirement list).
    #[must_use]
    pub fn project_dependencies(&self) -> Vec<String> {
        self.document
            .get("project")
            .and_then(|p| p.get("dependencies"))
            .and_then(toml::Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether this project opts into the tool: its `dev_workspace`
    /// dependency group names a `burnish` dependency.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.dependency_group(DEV_WORKSPACE_ENV)
            .iter()
            .any(|req| requirement_name(req) == "burnish")
    }

    /// The merged `tool.burnish` section, typed.
    pub fn burnish_section(&self) -> Result<BurnishSection, ConfigError> {
        let Some(section) = self
            .document
            .get("tool")
            .and_then(|tool| tool.get("burnish"))
        else {
            return Ok(BurnishSection::default());
        };
        section
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: self.def_path.clone(),
                message: format!("tool.burnish: {e}"),
            })
    }
}

/// Extract the distribution name from a PEP 508 requirement string.
#[must_use]
pub fn requirement_name(requirement: &str) -> &str {
    let end = requirement
        .find(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_' || c == '.'))
        .unwrap_or(requirement.len());
    &requirement[..end]
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BurnishSection {
    #[serde(default)]
    pub presets: Vec<PresetEntry>,
    #[serde(default, rename = "action")]
    pub actions: BTreeMap<String, ActionEntry>,
    #[serde(default, rename = "env")]
    pub envs: BTreeMap<String, EnvEntry>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PresetEntry {
    pub source: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionEntry {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub handlers: Vec<HandlerEntry>,
    #[serde(default)]
    pub config: toml::Table,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HandlerEntry {
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub config: toml::Table,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvEntry {
    #[serde(default)]
    pub dependencies: BTreeMap<String, DependencySpec>,
}

/// A dependency inside `[tool.burnish.env.<name>.dependencies]`: either a
/// bare version requirement or a table with extra metadata.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DependencySpec {
    Version(String),
    Detailed(DependencyTable),
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DependencyTable {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub editable: Option<bool>,
}

impl BurnishSection {
    /// Build the action registry handed to runners. Handler configs are
    /// collected into a flat map keyed by `<action>/<handler>`.
    ///
    /// An action without an explicit `source` gets `burnish.action.<name>`;
    /// a source no payload type is known for is a configuration error.
    pub fn to_actions(
        &self,
    ) -> Result<(Vec<ActionDefinition>, BTreeMap<String, serde_json::Value>), ConfigError> {
        let mut actions = Vec::with_capacity(self.actions.len());
        let mut handler_configs = BTreeMap::new();
        for (action_name, entry) in &self.actions {
            let source = entry
                .source
                .clone()
                .unwrap_or_else(|| format!("burnish.action.{action_name}"));
            if ActionSource::parse(&source).is_none() {
                return Err(ConfigError::UnknownActionSource {
                    action: action_name.clone(),
                    source_name: source,
                });
            }
            let mut handlers = Vec::with_capacity(entry.handlers.len());
            for handler in &entry.handlers {
                if !handler.config.is_empty() {
                    handler_configs.insert(
                        format!("{action_name}/{}", handler.name),
                        toml_to_json(&toml::Value::Table(handler.config.clone())),
                    );
                }
                handlers.push(ActionHandlerDefinition {
                    name: handler.name.clone(),
                    source: handler.source.clone(),
                    env: handler
                        .env
                        .clone()
                        .unwrap_or_else(|| DEV_WORKSPACE_ENV.to_string()),
                    dependencies: handler.dependencies.clone(),
                    config: toml_to_json(&toml::Value::Table(handler.config.clone())),
                });
            }
            actions.push(ActionDefinition {
                name: action_name.clone(),
                source,
                handlers,
                config: toml_to_json(&toml::Value::Table(entry.config.clone())),
            });
        }
        Ok((actions, handler_configs))
    }
}

/// Convert a TOML value into the JSON value sent over the wire.
#[must_use]
pub fn toml_to_json(value: &toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s.clone()),
        toml::Value::Integer(i) => serde_json::Value::from(*i),
        toml::Value::Float(f) => serde_json::Number::from_f64(*f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        toml::Value::Boolean(b) => serde_json::Value::Bool(*b),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        toml::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => serde_json::Value::Object(
            table
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_json(v)))
                .collect(),
        ),
    }
}

/// Locate the definition file for a project directory.
#[must_use]
pub fn definition_path(project_dir: &Path) -> PathBuf {
    project_dir.join(PROJECT_DEF_FILENAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[project]
name = "demo"
dependencies = ["requests>=2"]

[dependency-groups]
dev_workspace = ["burnish>=0.1"]

[[tool.burnish.presets]]
source = "burnish_preset_common"

[tool.burnish.action.format]
handlers = [
    { name = "trim", source = "burnish.format.trim_whitespace", env = "dev_workspace" },
]

[tool.burnish.action.lint]
handlers = [
    { name = "tabs", source = "burnish.lint.tabs", config = { allow_leading = true } },
]

[tool.burnish.env.dev_workspace.dependencies]
burnish = ">=0.1"
mytool = { version = "1.0", path = "../mytool" }
"#;

    fn sample() -> ProjectDefinition {
        ProjectDefinition::parse(Path::new("/ws/demo/pyproject.toml"), SAMPLE).unwrap()
    }

    #[test]
    fn parses_project_name_and_groups() {
        let def = sample();
        assert_eq!(def.name(), "demo");
        assert_eq!(def.root(), Path::new("/ws/demo"));
        assert_eq!(def.dependency_group("dev_workspace"), vec!["burnish>=0.1"]);
        assert_eq!(def.project_dependencies(), vec!["requests>=2"]);
        assert!(def.is_enabled());
    }

    #[test]
    fn missing_burnish_dep_means_disabled() {
        let raw = "[project]\nname = \"plain\"\n";
        let def = ProjectDefinition::parse(Path::new("/ws/plain/pyproject.toml"), raw).unwrap();
        assert!(!def.is_enabled());
    }

    #[test]
    fn typed_section_roundtrip() {
        let section = sample().burnish_section().unwrap();
        assert_eq!(section.presets.len(), 1);
        assert_eq!(section.presets[0].source, "burnish_preset_common");
        assert_eq!(section.actions.len(), 2);
        let lint = &section.actions["lint"];
        assert_eq!(lint.handlers[0].name, "tabs");
        assert_eq!(
            lint.handlers[0].config.get("allow_leading"),
            Some(&toml::Value::Boolean(true))
        );
        let deps = &section.envs["dev_workspace"].dependencies;
        assert_eq!(
            deps.get("burnish"),
            Some(&DependencySpec::Version(">=0.1".to_string()))
        );
    }

    #[test]
    fn to_actions_builds_registry_and_handler_configs() {
        let section = sample().burnish_section().unwrap();
        let (actions, configs) = section.to_actions().unwrap();
        assert_eq!(actions.len(), 2);
        let lint = actions.iter().find(|a| a.name == "lint").unwrap();
        assert_eq!(lint.source, "burnish.action.lint");
        assert_eq!(lint.handlers[0].env, "dev_workspace");
        assert_eq!(
            configs["lint/tabs"]["allow_leading"],
            serde_json::json!(true)
        );
    }

    #[test]
    fn unknown_action_source_is_a_config_error() {
        let raw = r#"
[tool.burnish.action.bake]
source = "vendor.unknown.thing"
handlers = [{ name = "x", source = "vendor.x" }]
"#;
        let def = ProjectDefinition::parse(Path::new("/ws/x/pyproject.toml"), raw).unwrap();
        let section = def.burnish_section().unwrap();
        let err = section.to_actions().unwrap_err();
        assert!(err.to_string().contains("vendor.unknown.thing"));
    }

    #[test]
    fn requirement_name_strips_specifiers() {
        assert_eq!(requirement_name("burnish>=0.1"), "burnish");
        assert_eq!(requirement_name("my-pkg == 1.0"), "my-pkg");
        assert_eq!(requirement_name("plain"), "plain");
        assert_eq!(requirement_name("pkg[extra]>=2"), "pkg");
    }

    #[test]
    fn toml_to_json_preserves_structure() {
        let value: toml::Value = toml::from_str("a = [1, 2]\n[b]\nc = \"x\"\n").unwrap();
        let json = toml_to_json(&value);
        assert_eq!(json, serde_json::json!({"a": [1, 2], "b": {"c": "x"}}));
    }
}
