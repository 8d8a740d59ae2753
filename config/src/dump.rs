//! Resolved-configuration dump.
//!
//! `dump_config` writes the fully-resolved project definition to
//! `<project>/burnish_config_dump/pyproject.toml` so users can inspect what
//! presets and normalisation actually produced. Sibling files of the
//! original definition are linked into the dump directory, which keeps
//! relative references (readmes, lock files) working from inside it.

use std::path::{Path, PathBuf};

use burnish_types::{CONFIG_DUMP_DIR_NAME, PROJECT_DEF_FILENAME};

use crate::error::ConfigError;
use crate::schema::ProjectDefinition;

/// Write the dump; returns the path of the dumped definition file.
pub fn dump_config(definition: &ProjectDefinition) -> Result<PathBuf, ConfigError> {
    let dump_dir = definition.root().join(CONFIG_DUMP_DIR_NAME);
    std::fs::create_dir_all(&dump_dir).map_err(|source| ConfigError::DumpWrite {
        path: dump_dir.clone(),
        source,
    })?;

    let rendered =
        toml::to_string_pretty(definition.document()).map_err(|e| ConfigError::Parse {
            path: definition.def_path().to_path_buf(),
            message: format!("resolved document is not serialisable: {e}"),
        })?;
    // Round-trip through toml_edit so the dump gets stable key ordering and
    // formatting independent of how the source document was laid out.
    let document: toml_edit::DocumentMut =
        rendered.parse().map_err(|e: toml_edit::TomlError| ConfigError::Parse {
            path: definition.def_path().to_path_buf(),
            message: e.to_string(),
        })?;

    let dump_path = dump_dir.join(PROJECT_DEF_FILENAME);
    std::fs::write(&dump_path, document.to_string()).map_err(|source| {
        ConfigError::DumpWrite {
            path: dump_path.clone(),
            source,
        }
    })?;

    link_siblings(definition.root(), &dump_dir)?;
    tracing::info!(path = %dump_path.display(), "wrote resolved config dump");
    Ok(dump_path)
}

/// Link every regular file next to the definition into the dump dir. Stale
/// links from earlier dumps are replaced.
fn link_siblings(project_root: &Path, dump_dir: &Path) -> Result<(), ConfigError> {
    let entries = std::fs::read_dir(project_root).map_err(|source| ConfigError::Io {
        path: project_root.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::Io {
            path: project_root.to_path_buf(),
            source,
        })?;
        let file_type = entry.file_type().map_err(|source| ConfigError::Io {
            path: entry.path(),
            source,
        })?;
        if !file_type.is_file() || entry.file_name().to_string_lossy() == PROJECT_DEF_FILENAME {
            continue;
        }
        let target = dump_dir.join(entry.file_name());
        if target.exists() || target.is_symlink() {
            std::fs::remove_file(&target).map_err(|source| ConfigError::DumpWrite {
                path: target.clone(),
                source,
            })?;
        }
        make_link(&entry.path(), &target).map_err(|source| ConfigError::DumpWrite {
            path: target,
            source,
        })?;
    }
    Ok(())
}

#[cfg(unix)]
fn make_link(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(not(unix))]
fn make_link(original: &Path, link: &Path) -> std::io::Result<()> {
    std::fs::copy(original, link).map(|_| ())
}
