//! Workspace state: registered projects and client-owned documents.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use burnish_config::{ProjectDefinition, ResolvedProject, discover_projects};
use burnish_types::ProjectStatus;

/// A registered project and what the workspace knows about it.
#[derive(Debug, Clone)]
pub struct Project {
    pub definition: ProjectDefinition,
    pub status: ProjectStatus,
    /// Filled in once the resolution pipeline has run for this project.
    pub resolved: Option<ResolvedProject>,
}

impl Project {
    #[must_use]
    pub fn root(&self) -> &Path {
        self.definition.root()
    }
}

/// A document the client has open; the workspace holds the authoritative
/// buffer runners read through `documents/get`.
#[derive(Debug, Clone)]
pub struct OpenedDocument {
    pub text: String,
    pub version: u64,
}

#[derive(Default)]
pub struct WorkspaceContext {
    projects: RwLock<BTreeMap<PathBuf, Project>>,
    documents: RwLock<BTreeMap<PathBuf, OpenedDocument>>,
}

impl WorkspaceContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan a workspace directory, registering every project found.
    /// Rescanning refreshes definitions but keeps resolved state for
    /// projects whose definition file is unchanged on disk.
    pub fn add_workspace_dir(&self, dir: &Path) {
        let discovered = discover_projects(dir);
        let mut projects = self.projects.write().expect("project map poisoned");
        for found in discovered {
            let root = found.definition.root().to_path_buf();
            let status = if found.enabled {
                ProjectStatus::ConfigValid
            } else {
                ProjectStatus::NoBurnish
            };
            let resolved = projects
                .get(&root)
                .filter(|existing| {
                    existing.definition.document() == found.definition.document()
                })
                .and_then(|existing| existing.resolved.clone());
            projects.insert(
                root,
                Project {
                    definition: found.definition,
                    status,
                    resolved,
                },
            );
        }
        tracing::info!(dir = %dir.display(), projects = projects.len(), "workspace scanned");
    }

    /// Register a single project directly (single-project CLI runs).
    pub fn add_project(&self, definition: ProjectDefinition) {
        let status = if definition.is_enabled() {
            ProjectStatus::ConfigValid
        } else {
            ProjectStatus::NoBurnish
        };
        let root = definition.root().to_path_buf();
        self.projects.write().expect("project map poisoned").insert(
            root,
            Project {
                definition,
                status,
                resolved: None,
            },
        );
    }

    #[must_use]
    pub fn project(&self, root: &Path) -> Option<Project> {
        self.projects
            .read()
            .expect("project map poisoned")
            .get(root)
            .cloned()
    }

    #[must_use]
    pub fn project_roots(&self) -> Vec<PathBuf> {
        self.projects
            .read()
            .expect("project map poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Enabled projects whose directory contains `path`, deepest first, so
    /// nested projects shadow their ancestors.
    #[must_use]
    pub fn projects_containing(&self, path: &Path) -> Vec<Project> {
        let projects = self.projects.read().expect("project map poisoned");
        let mut containing: Vec<Project> = projects
            .values()
            .filter(|p| p.status != ProjectStatus::NoBurnish && path.starts_with(p.root()))
            .cloned()
            .collect();
        containing.sort_by_key(|p| std::cmp::Reverse(p.root().components().count()));
        containing
    }

    pub fn set_status(&self, root: &Path, status: ProjectStatus) {
        if let Some(project) = self
            .projects
            .write()
            .expect("project map poisoned")
            .get_mut(root)
        {
            tracing::debug!(project = %root.display(), ?status, "project status");
            project.status = status;
        }
    }

    pub fn set_resolved(&self, root: &Path, resolved: ResolvedProject) {
        if let Some(project) = self
            .projects
            .write()
            .expect("project map poisoned")
            .get_mut(root)
        {
            project.resolved = Some(resolved);
        }
    }

    // Document lifecycle.

    pub fn open_document(&self, path: PathBuf, text: String, version: u64) {
        self.documents
            .write()
            .expect("document map poisoned")
            .insert(path, OpenedDocument { text, version });
    }

    pub fn update_document(&self, path: &Path, text: String, version: u64) {
        if let Some(doc) = self
            .documents
            .write()
            .expect("document map poisoned")
            .get_mut(path)
        {
            doc.text = text;
            doc.version = version;
        }
    }

    pub fn close_document(&self, path: &Path) {
        self.documents
            .write()
            .expect("document map poisoned")
            .remove(path);
    }

    #[must_use]
    pub fn document(&self, path: &Path) -> Option<OpenedDocument> {
        self.documents
            .read()
            .expect("document map poisoned")
            .get(path)
            .cloned()
    }

    /// Open documents under a project directory, for didOpen replay.
    #[must_use]
    pub fn documents_under(&self, root: &Path) -> Vec<PathBuf> {
        self.documents
            .read()
            .expect("document map poisoned")
            .keys()
            .filter(|path| path.starts_with(root))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENABLED: &str =
        "[project]\nname = \"p\"\n\n[dependency-groups]\ndev_workspace = [\"burnish>=0.1\"]\n";

    fn definition(root: &str) -> ProjectDefinition {
        ProjectDefinition::parse(&Path::new(root).join("pyproject.toml"), ENABLED).unwrap()
    }

    #[test]
    fn deepest_project_wins_for_contained_files() {
        let ctx = WorkspaceContext::new();
        ctx.add_project(definition("/ws"));
        ctx.add_project(definition("/ws/libs/inner"));

        let containing = ctx.projects_containing(Path::new("/ws/libs/inner/src/a.py"));
        assert_eq!(containing.len(), 2);
        assert_eq!(containing[0].root(), Path::new("/ws/libs/inner"));
        assert_eq!(containing[1].root(), Path::new("/ws"));

        let outer_only = ctx.projects_containing(Path::new("/ws/other/b.py"));
        assert_eq!(outer_only.len(), 1);
    }

    #[test]
    fn disabled_projects_are_not_candidates() {
        let ctx = WorkspaceContext::new();
        let plain =
            ProjectDefinition::parse(Path::new("/ws/pyproject.toml"), "[project]\nname = \"x\"\n")
                .unwrap();
        ctx.add_project(plain);
        assert!(ctx.projects_containing(Path::new("/ws/a.py")).is_empty());
        assert_eq!(
            ctx.project(Path::new("/ws")).unwrap().status,
            ProjectStatus::NoBurnish
        );
    }

    #[test]
    fn document_lifecycle() {
        let ctx = WorkspaceContext::new();
        ctx.open_document(PathBuf::from("/ws/a.py"), "x = 1\n".to_string(), 1);
        ctx.update_document(Path::new("/ws/a.py"), "x = 2\n".to_string(), 2);

        let doc = ctx.document(Path::new("/ws/a.py")).unwrap();
        assert_eq!(doc.text, "x = 2\n");
        assert_eq!(doc.version, 2);

        assert_eq!(
            ctx.documents_under(Path::new("/ws")),
            vec![PathBuf::from("/ws/a.py")]
        );
        assert!(ctx.documents_under(Path::new("/other")).is_empty());

        ctx.close_document(Path::new("/ws/a.py"));
        assert!(ctx.document(Path::new("/ws/a.py")).is_none());
    }

    #[test]
    fn scan_registers_discovered_projects() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), ENABLED).unwrap();
        let ctx = WorkspaceContext::new();
        ctx.add_workspace_dir(dir.path());
        let roots = ctx.project_roots();
        assert_eq!(roots.len(), 1);
        assert_eq!(
            ctx.project(&roots[0]).unwrap().status,
            ProjectStatus::ConfigValid
        );
    }
}
