//! Built-in lint handlers.
//!
//! Both handlers memoise per file through the file-scoped cache, so
//! re-linting an unchanged file costs one version probe.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use burnish_types::{
    LintMessage, LintMessageSeverity, LintResult, Position, Range, RunPayload, RunResult, path_key,
};

use super::{ActionHandler, HandlerError, HandlerServices, RunContext};

/// Flags whitespace before the line ending.
pub struct TrailingWhitespace {
    services: HandlerServices,
    severity: LintMessageSeverity,
}

#[derive(Deserialize)]
struct TrailingWhitespaceConfig {
    #[serde(default = "default_severity")]
    severity: u8,
}

fn default_severity() -> u8 {
    2
}

impl TrailingWhitespace {
    #[must_use]
    pub fn new(config: &serde_json::Value, services: HandlerServices) -> Self {
        let severity = serde_json::from_value::<TrailingWhitespaceConfig>(config.clone())
            .ok()
            .and_then(|c| LintMessageSeverity::from_lsp(u64::from(c.severity)))
            .unwrap_or(LintMessageSeverity::Warning);
        Self { services, severity }
    }

    fn lint_line(&self, line_no: u32, line: &str) -> Option<LintMessage> {
        let trimmed_len = line.trim_end().chars().count() as u32;
        let full_len = line.chars().count() as u32;
        if trimmed_len == full_len {
            return None;
        }
        Some(LintMessage {
            range: Range::new(
                Position::new(line_no, trimmed_len + 1),
                Position::new(line_no, full_len + 1),
            ),
            message: "trailing whitespace".to_string(),
            code: Some("trailing-whitespace".to_string()),
            severity: self.severity,
            source: "burnish".to_string(),
        })
    }
}

#[async_trait]
impl ActionHandler for TrailingWhitespace {
    async fn run(&self, payload: &RunPayload, ctx: &RunContext) -> Result<(), HandlerError> {
        lint_files(&self.services, payload, ctx, "lint/trailing_whitespace", |text| {
            text.lines()
                .enumerate()
                .filter_map(|(i, line)| self.lint_line(i as u32 + 1, line))
                .collect()
        })
        .await
    }
}

/// Flags tab characters; indentation tabs can be allowed via config.
pub struct Tabs {
    services: HandlerServices,
    allow_leading: bool,
}

#[derive(Deserialize)]
struct TabsConfig {
    #[serde(default)]
    allow_leading: bool,
}

impl Tabs {
    #[must_use]
    pub fn new(config: &serde_json::Value, services: HandlerServices) -> Self {
        let allow_leading = serde_json::from_value::<TabsConfig>(config.clone())
            .map(|c| c.allow_leading)
            .unwrap_or(false);
        Self {
            services,
            allow_leading,
        }
    }

    fn lint_line(&self, line_no: u32, line: &str) -> Vec<LintMessage> {
        let leading_end = line.chars().take_while(|c| c.is_whitespace()).count();
        line.chars()
            .enumerate()
            .filter(|(i, c)| *c == '\t' && !(self.allow_leading && *i < leading_end))
            .map(|(i, _)| {
                let col = i as u32 + 1;
                LintMessage {
                    range: Range::new(
                        Position::new(line_no, col),
                        Position::new(line_no, col + 1),
                    ),
                    message: "tab character".to_string(),
                    code: Some("tabs".to_string()),
                    severity: LintMessageSeverity::Warning,
                    source: "burnish".to_string(),
                }
            })
            .collect()
    }
}

#[async_trait]
impl ActionHandler for Tabs {
    async fn run(&self, payload: &RunPayload, ctx: &RunContext) -> Result<(), HandlerError> {
        lint_files(&self.services, payload, ctx, "lint/tabs", |text| {
            text.lines()
                .enumerate()
                .flat_map(|(i, line)| self.lint_line(i as u32 + 1, line))
                .collect()
        })
        .await
    }
}

/// Drive a line-based lint over every payload file, one partial per file,
/// consulting the cache first.
async fn lint_files(
    services: &HandlerServices,
    payload: &RunPayload,
    ctx: &RunContext,
    cache_key: &str,
    lint: impl Fn(&str) -> Vec<LintMessage>,
) -> Result<(), HandlerError> {
    for path in payload.file_paths() {
        if ctx.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }
        let messages = match cached_messages(services, path, cache_key).await {
            Some(messages) => messages,
            None => {
                let doc = services
                    .files
                    .get_document(path)
                    .await
                    .map_err(|e| HandlerError::failed(e.to_string()))?;
                let messages = lint(&doc.text);
                if let Ok(value) = serde_json::to_value(&messages) {
                    if let Err(e) = services
                        .cache
                        .save_file_cache(path, &doc.version, cache_key, value)
                        .await
                    {
                        tracing::debug!("lint cache store skipped: {e}");
                    }
                }
                messages
            }
        };
        let mut partial = LintResult::default();
        partial.messages.insert(path_key(path), messages);
        ctx.emit_partial(RunResult::Lint(partial));
    }
    Ok(())
}

async fn cached_messages(
    services: &HandlerServices,
    path: &Path,
    cache_key: &str,
) -> Option<Vec<LintMessage>> {
    let value = services.cache.get_file_cache(path, cache_key).await?;
    serde_json::from_value(value).ok()
}
