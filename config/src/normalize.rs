//! Post-merge normalisation of dependency groups.
//!
//! Runs after preset resolution, once per project. The steps, in order:
//! synthesize the `runtime` group from `[project] dependencies`, inject the
//! extension-runner requirement everywhere except `dev_workspace`, append
//! each handler's dependencies to its env's group, de-duplicate, and
//! rewrite relative `path` dependency metadata to absolute `file://` URLs.

use std::path::{Component, Path, PathBuf};

use burnish_types::{DEV_WORKSPACE_ENV, RUNTIME_ENV};

use crate::error::ConfigError;
use crate::schema::{DependencySpec, ProjectDefinition, requirement_name};

/// Requirement injected into every dependency group so installed envs can
/// host a runner.
pub const RUNNER_PACKAGE: &str = "burnish_extension_runner";

pub fn normalize(definition: &mut ProjectDefinition) -> Result<(), ConfigError> {
    let section = definition.burnish_section()?;
    let project_deps = definition.project_dependencies();
    let root = definition.root().to_path_buf();

    // Handler dependencies, grouped by the env that must install them.
    let mut handler_deps: Vec<(String, String)> = Vec::new();
    for action in section.actions.values() {
        for handler in &action.handlers {
            let env = handler
                .env
                .clone()
                .unwrap_or_else(|| DEV_WORKSPACE_ENV.to_string());
            for dep in &handler.dependencies {
                handler_deps.push((env.clone(), dep.clone()));
            }
        }
    }

    // Dependency metadata with a relative path, per env.
    let mut path_rewrites: Vec<(String, String, PathBuf)> = Vec::new();
    for (env_name, env) in &section.envs {
        for (dep_name, spec) in &env.dependencies {
            if let DependencySpec::Detailed(table) = spec
                && let Some(rel_path) = &table.path
            {
                let absolute = lexical_join(&root, Path::new(rel_path));
                path_rewrites.push((env_name.clone(), dep_name.clone(), absolute));
            }
        }
    }

    let document = definition.document_mut();
    let groups = document
        .entry("dependency-groups".to_string())
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    let Some(groups) = groups.as_table_mut() else {
        return Ok(());
    };

    if !groups.contains_key(RUNTIME_ENV) {
        groups.insert(
            RUNTIME_ENV.to_string(),
            toml::Value::Array(
                project_deps
                    .iter()
                    .map(|d| toml::Value::String(d.clone()))
                    .collect(),
            ),
        );
    }

    let runner_requirement = format!("{RUNNER_PACKAGE} == {}", env!("CARGO_PKG_VERSION"));
    for (group_name, group) in groups.iter_mut() {
        if group_name == DEV_WORKSPACE_ENV {
            continue;
        }
        if let Some(entries) = group.as_array_mut() {
            entries.push(toml::Value::String(runner_requirement.clone()));
        }
    }

    for (env, dep) in handler_deps {
        let group = groups
            .entry(env)
            .or_insert_with(|| toml::Value::Array(Vec::new()));
        if let Some(entries) = group.as_array_mut() {
            entries.push(toml::Value::String(dep));
        }
    }

    for (_, group) in groups.iter_mut() {
        if let Some(entries) = group.as_array_mut() {
            dedup_requirements(entries);
        }
    }

    for (env, dep_name, absolute) in path_rewrites {
        let Some(entries) = groups.get_mut(&env).and_then(toml::Value::as_array_mut) else {
            continue;
        };
        let Ok(file_url) = url::Url::from_file_path(&absolute) else {
            tracing::warn!(
                dep = %dep_name,
                path = %absolute.display(),
                "cannot express dependency path as a file URL"
            );
            continue;
        };
        for entry in entries.iter_mut() {
            let matches = entry
                .as_str()
                .is_some_and(|req| requirement_name(req) == dep_name);
            if matches {
                *entry = toml::Value::String(format!("{dep_name} @ {file_url}"));
            }
        }
    }

    Ok(())
}

/// First occurrence wins; later duplicates of the same requirement string
/// are dropped.
fn dedup_requirements(entries: &mut Vec<toml::Value>) {
    let mut seen: Vec<String> = Vec::new();
    entries.retain(|entry| match entry.as_str() {
        Some(req) => {
            if seen.iter().any(|s| s == req) {
                false
            } else {
                seen.push(req.to_string());
                true
            }
        }
        None => true,
    });
}

/// Join and collapse `.`/`..` components without touching the filesystem,
/// so rewriting works before the referenced path exists.
/// Rewrite relative dependency `path` metadata under
/// `tool.burnish.env.*.dependencies.*` to absolute paths resolved against
/// `base_dir`, the directory of the file that declared them. Applied to
/// each preset document before merging, so a path keeps pointing into its
/// own package rather than into whichever project pulled the preset in.
pub(crate) fn absolutize_dependency_paths(document: &mut toml::Table, base_dir: &Path) {
    let Some(envs) = document
        .get_mut("tool")
        .and_then(|tool| tool.get_mut("burnish"))
        .and_then(|burnish| burnish.get_mut("env"))
        .and_then(toml::Value::as_table_mut)
    else {
        return;
    };
    for (_, env) in envs.iter_mut() {
        let Some(deps) = env
            .get_mut("dependencies")
            .and_then(toml::Value::as_table_mut)
        else {
            continue;
        };
        for (_, spec) in deps.iter_mut() {
            let Some(path) = spec
                .as_table_mut()
                .and_then(|table| table.get_mut("path"))
            else {
                continue;
            };
            if let Some(rel) = path.as_str().filter(|p| !Path::new(p).is_absolute()) {
                let absolute = lexical_join(base_dir, Path::new(rel));
                *path = toml::Value::String(absolute.to_string_lossy().into_owned());
            }
        }
    }
}

fn lexical_join(base: &Path, relative: &Path) -> PathBuf {
    if relative.is_absolute() {
        return relative.to_path_buf();
    }
    let mut result = base.to_path_buf();
    for component in relative.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            other => result.push(other),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use burnish_types::PROJECT_DEF_FILENAME;

    fn normalized(raw: &str) -> ProjectDefinition {
        let mut def = ProjectDefinition::parse(
            Path::new("/ws/app").join(PROJECT_DEF_FILENAME).as_path(),
            raw,
        )
        .unwrap();
        normalize(&mut def).unwrap();
        def
    }

    #[test]
    fn runtime_group_synthesized_from_project_dependencies() {
        let def = normalized("[project]\nname = \"app\"\ndependencies = [\"requests>=2\"]\n");
        let runtime = def.dependency_group(RUNTIME_ENV);
        assert_eq!(runtime[0], "requests>=2");
        assert!(runtime[1].starts_with(RUNNER_PACKAGE));
    }

    #[test]
    fn existing_runtime_group_is_kept() {
        let def = normalized(
            "[project]\nname = \"app\"\ndependencies = [\"requests>=2\"]\n\n[dependency-groups]\nruntime = [\"flask\"]\n",
        );
        let runtime = def.dependency_group(RUNTIME_ENV);
        assert_eq!(runtime[0], "flask");
        assert!(!runtime.contains(&"requests>=2".to_string()));
    }

    #[test]
    fn dev_workspace_group_never_gets_runner_injected() {
        let def = normalized(
            "[project]\nname = \"app\"\n\n[dependency-groups]\ndev_workspace = [\"burnish>=0.1\"]\ndev = [\"pytest\"]\n",
        );
        assert_eq!(def.dependency_group(DEV_WORKSPACE_ENV), vec!["burnish>=0.1"]);
        let dev = def.dependency_group("dev");
        assert_eq!(dev[0], "pytest");
        assert!(dev[1].starts_with(RUNNER_PACKAGE));
    }

    #[test]
    fn handler_dependencies_land_in_their_env_group() {
        let def = normalized(
            r#"
[project]
name = "app"

[tool.burnish.action.lint]
handlers = [
    { name = "flake", source = "pkg.flake", env = "dev", dependencies = ["flake8>=6"] },
]
"#,
        );
        let dev = def.dependency_group("dev");
        assert!(dev.contains(&"flake8>=6".to_string()));
    }

    #[test]
    fn groups_are_deduplicated_keeping_first() {
        let def = normalized(
            "[project]\nname = \"app\"\n\n[dependency-groups]\ndev = [\"pytest\", \"pytest\", \"ruff\"]\n",
        );
        let dev = def.dependency_group("dev");
        assert_eq!(dev.iter().filter(|d| *d == "pytest").count(), 1);
        assert_eq!(dev[0], "pytest");
        assert_eq!(dev[1], "ruff");
    }

    #[test]
    fn relative_path_dependency_becomes_file_url() {
        let def = normalized(
            r#"
[project]
name = "app"

[dependency-groups]
dev = ["mytool==1.0"]

[tool.burnish.env.dev.dependencies]
mytool = { version = "1.0", path = "../mytool" }
"#,
        );
        let dev = def.dependency_group("dev");
        assert!(
            dev.contains(&"mytool @ file:///ws/mytool".to_string()),
            "got {dev:?}"
        );
    }

    #[test]
    fn lexical_join_collapses_parent_components() {
        assert_eq!(
            lexical_join(Path::new("/ws/app"), Path::new("../lib/./x")),
            PathBuf::from("/ws/lib/x")
        );
        assert_eq!(
            lexical_join(Path::new("/ws/app"), Path::new("/abs")),
            PathBuf::from("/abs")
        );
    }
}
