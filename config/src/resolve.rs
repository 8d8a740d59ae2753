//! Preset chain resolution.
//!
//! Presets live inside installed packages; locating one needs the
//! `dev_workspace` runner's `packages/resolvePath` call, which the caller
//! supplies behind [`PackagePathResolver`]. Resolution is a worklist over
//! preset sources with a processed-set, so cyclic preset graphs terminate
//! at their fix-point.

use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::ConfigError;
use crate::merge::merge_tables;
use crate::schema::{PresetEntry, ProjectDefinition};

const PRESET_FILENAME: &str = "preset.toml";

/// Maps a package source string to the package's installed directory.
#[async_trait]
pub trait PackagePathResolver: Send + Sync {
    async fn resolve_package_path(&self, package: &str) -> Result<PathBuf, ConfigError>;
}

/// Fold every declared preset (and its transitive presets) into the
/// project document. The project's own values always win; the
/// `tool.burnish.presets` key is consumed.
pub async fn resolve_presets(
    definition: &mut ProjectDefinition,
    resolver: &dyn PackagePathResolver,
) -> Result<(), ConfigError> {
    let mut worklist: VecDeque<String> = declared_presets(definition.document())
        .into_iter()
        .map(|entry| entry.source)
        .collect();
    let mut processed: BTreeSet<String> = BTreeSet::new();
    let mut accumulated = definition.document().clone();

    while let Some(source) = worklist.pop_front() {
        if !processed.insert(source.clone()) {
            continue;
        }
        let package_dir = resolver.resolve_package_path(&source).await?;
        let preset_path = package_dir.join(PRESET_FILENAME);
        if !preset_path.is_file() {
            return Err(ConfigError::PresetFileMissing {
                source_name: source,
                path: preset_path,
            });
        }
        let raw =
            std::fs::read_to_string(&preset_path).map_err(|source_err| ConfigError::Io {
                path: preset_path.clone(),
                source: source_err,
            })?;
        let mut preset_doc: toml::Table =
            toml::from_str(&raw).map_err(|e| ConfigError::Parse {
                path: preset_path.clone(),
                message: e.to_string(),
            })?;
        // Relative dependency paths mean "relative to the declaring file";
        // pin them to the preset's package before the merge loses that.
        crate::normalize::absolutize_dependency_paths(&mut preset_doc, &package_dir);
        tracing::debug!(preset = %source, path = %preset_path.display(), "merging preset");
        for nested in declared_presets(&preset_doc) {
            if !processed.contains(&nested.source) {
                worklist.push_back(nested.source);
            }
        }
        accumulated = merge_tables(&accumulated, &preset_doc);
    }

    strip_presets_key(&mut accumulated);
    definition.replace_document(accumulated);
    Ok(())
}

fn declared_presets(document: &toml::Table) -> Vec<PresetEntry> {
    document
        .get("tool")
        .and_then(|tool| tool.get("burnish"))
        .and_then(|burnish| burnish.get("presets"))
        .and_then(|presets| presets.clone().try_into().ok())
        .unwrap_or_default()
}

fn strip_presets_key(document: &mut toml::Table) {
    if let Some(burnish) = document
        .get_mut("tool")
        .and_then(|tool| tool.get_mut("burnish"))
        .and_then(toml::Value::as_table_mut)
    {
        burnish.remove("presets");
    }
}
