//! Built-in file classifier.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;

use burnish_types::{CONFIG_DUMP_DIR_NAME, ClassifyResult, ENVS_DIR_NAME, RunPayload, RunResult};

use super::{ActionHandler, HandlerError, HandlerServices, RunContext};

/// Groups project files by language, judged by file extension. Extra or
/// overriding extension mappings come from handler config.
pub struct ByExtension {
    services: HandlerServices,
    languages: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct ByExtensionConfig {
    #[serde(default)]
    languages: BTreeMap<String, String>,
}

fn default_languages() -> BTreeMap<String, String> {
    [
        ("py", "python"),
        ("pyi", "python"),
        ("rs", "rust"),
        ("toml", "toml"),
        ("md", "markdown"),
        ("js", "javascript"),
        ("ts", "typescript"),
        ("json", "json"),
        ("yaml", "yaml"),
        ("yml", "yaml"),
    ]
    .into_iter()
    .map(|(ext, lang)| (ext.to_string(), lang.to_string()))
    .collect()
}

impl ByExtension {
    #[must_use]
    pub fn new(config: &serde_json::Value, services: HandlerServices) -> Self {
        let mut languages = default_languages();
        if let Ok(config) = serde_json::from_value::<ByExtensionConfig>(config.clone()) {
            languages.extend(config.languages);
        }
        Self {
            services,
            languages,
        }
    }
}

#[async_trait]
impl ActionHandler for ByExtension {
    async fn run(&self, _payload: &RunPayload, ctx: &RunContext) -> Result<(), HandlerError> {
        let walker = ignore::WalkBuilder::new(&self.services.project.working_dir)
            .hidden(false)
            .git_ignore(true)
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                name != ENVS_DIR_NAME && name != CONFIG_DUMP_DIR_NAME && name != "__testdata__"
            })
            .build();

        let mut by_language: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in walker {
            if ctx.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            let path = entry.path();
            let Some(language) = path
                .extension()
                .and_then(|ext| ext.to_str())
                .and_then(|ext| self.languages.get(ext))
            else {
                continue;
            };
            by_language
                .entry(language.clone())
                .or_default()
                .push(path.to_string_lossy().into_owned());
        }

        for files in by_language.values_mut() {
            files.sort();
        }
        ctx.emit_partial(RunResult::Classify(ClassifyResult {
            files_by_language: by_language,
        }));
        Ok(())
    }
}
