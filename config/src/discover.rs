//! Workspace scanning for project definition files.

use std::path::{Path, PathBuf};

use burnish_types::{CONFIG_DUMP_DIR_NAME, PROJECT_DEF_FILENAME};

use crate::error::ConfigError;
use crate::schema::ProjectDefinition;

const TESTDATA_DIR_NAME: &str = "__testdata__";

/// A project found during a workspace walk, parsed but not yet resolved.
#[derive(Debug, Clone)]
pub struct DiscoveredProject {
    pub definition: ProjectDefinition,
    /// Whether the project opts into the tool (see
    /// [`ProjectDefinition::is_enabled`]).
    pub enabled: bool,
}

impl DiscoveredProject {
    #[must_use]
    pub fn root(&self) -> &Path {
        self.definition.root()
    }
}

/// Walk a workspace directory collecting every `pyproject.toml`, skipping
/// `__testdata__` and config-dump subtrees. Unparseable definitions are
/// logged and skipped. Results are sorted by path so discovery order is
/// stable across runs.
#[must_use]
pub fn discover_projects(workspace_dir: &Path) -> Vec<DiscoveredProject> {
    let walker = ignore::WalkBuilder::new(workspace_dir)
        .hidden(false)
        .git_ignore(true)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            name != TESTDATA_DIR_NAME && name != CONFIG_DUMP_DIR_NAME
        })
        .build();

    let mut def_paths: Vec<PathBuf> = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("workspace walk error: {e}");
                continue;
            }
        };
        if entry.file_type().is_some_and(|ft| ft.is_file())
            && entry.file_name().to_string_lossy() == PROJECT_DEF_FILENAME
        {
            def_paths.push(entry.into_path());
        }
    }
    def_paths.sort();

    let mut projects = Vec::with_capacity(def_paths.len());
    for def_path in def_paths {
        match ProjectDefinition::read(&def_path) {
            Ok(definition) => {
                let enabled = definition.is_enabled();
                tracing::debug!(
                    project = definition.name(),
                    path = %def_path.display(),
                    enabled,
                    "discovered project"
                );
                projects.push(DiscoveredProject {
                    definition,
                    enabled,
                });
            }
            Err(e) => tracing::warn!("skipping unparseable project definition: {e}"),
        }
    }
    projects
}

/// Parse the single project rooted at `project_dir`.
pub fn load_project(project_dir: &Path) -> Result<ProjectDefinition, ConfigError> {
    let def_path = project_dir.join(PROJECT_DEF_FILENAME);
    if !def_path.is_file() {
        return Err(ConfigError::NoProjectDefinition {
            dir: project_dir.to_path_buf(),
        });
    }
    ProjectDefinition::read(&def_path)
}
