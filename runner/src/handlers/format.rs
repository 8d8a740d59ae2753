//! Built-in format handlers.

use std::path::Path;

use async_trait::async_trait;

use burnish_types::{FormatFileResult, FormatResult, RunPayload, RunResult, path_key};

use super::{ActionHandler, HandlerError, HandlerServices, RunContext};

/// Strips trailing whitespace from every line.
pub struct TrimWhitespace {
    services: HandlerServices,
}

impl TrimWhitespace {
    #[must_use]
    pub fn new(services: HandlerServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl ActionHandler for TrimWhitespace {
    async fn run(&self, payload: &RunPayload, ctx: &RunContext) -> Result<(), HandlerError> {
        format_files(&self.services, payload, ctx, trim_trailing_whitespace).await
    }
}

/// Ensures the file ends with exactly one newline.
pub struct FinalNewline {
    services: HandlerServices,
}

impl FinalNewline {
    #[must_use]
    pub fn new(services: HandlerServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl ActionHandler for FinalNewline {
    async fn run(&self, payload: &RunPayload, ctx: &RunContext) -> Result<(), HandlerError> {
        format_files(&self.services, payload, ctx, final_newline).await
    }
}

/// Drive a pure text transform over every payload file, one partial per
/// file. Chained format handlers see each other's output through the run
/// aggregate.
async fn format_files(
    services: &HandlerServices,
    payload: &RunPayload,
    ctx: &RunContext,
    transform: fn(&str) -> String,
) -> Result<(), HandlerError> {
    for path in payload.file_paths() {
        if ctx.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }
        let text = current_text(services, ctx, path).await?;
        let formatted = transform(&text);
        let changed = formatted != text;
        let mut partial = FormatResult::default();
        partial.result_by_file_path.insert(
            path_key(path),
            FormatFileResult {
                changed,
                code: formatted,
            },
        );
        ctx.emit_partial(RunResult::Format(partial));
    }
    Ok(())
}

async fn current_text(
    services: &HandlerServices,
    ctx: &RunContext,
    path: &Path,
) -> Result<String, HandlerError> {
    if let Some(prior) = ctx.prior_format(path) {
        return Ok(prior.code);
    }
    services
        .files
        .get_document(path)
        .await
        .map(|doc| doc.text)
        .map_err(|e| HandlerError::failed(e.to_string()))
}

fn trim_trailing_whitespace(text: &str) -> String {
    let had_final_newline = text.ends_with('\n');
    let mut result: String = text
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    if had_final_newline {
        result.push('\n');
    }
    result
}

fn final_newline(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let trimmed = text.trim_end_matches('\n');
    format!("{trimmed}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::{context_for, services_in};
    use burnish_types::ActionSource;

    fn format_payload(paths: Vec<std::path::PathBuf>) -> RunPayload {
        RunPayload::Format {
            file_paths: paths,
            save: false,
        }
    }

    #[test]
    fn trim_removes_trailing_spaces_only() {
        assert_eq!(
            trim_trailing_whitespace("x = 1  \n  indented\t\n"),
            "x = 1\n  indented\n"
        );
        assert_eq!(trim_trailing_whitespace("no newline  "), "no newline");
    }

    #[test]
    fn final_newline_normalises_endings() {
        assert_eq!(final_newline("a"), "a\n");
        assert_eq!(final_newline("a\n\n\n"), "a\n");
        assert_eq!(final_newline("a\n"), "a\n");
        assert_eq!(final_newline(""), "");
    }

    #[tokio::test]
    async fn handler_reports_unchanged_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clean.py");
        tokio::fs::write(&path, "x = 1\n").await.unwrap();
        let services = services_in(dir.path());
        let (ctx, aggregate) = context_for(RunResult::empty_for(ActionSource::Format));

        TrimWhitespace::new(services)
            .run(&format_payload(vec![path.clone()]), &ctx)
            .await
            .unwrap();

        let aggregate = aggregate.lock().unwrap();
        let RunResult::Format(result) = &*aggregate else {
            panic!("expected format aggregate");
        };
        let file = &result.result_by_file_path[&path_key(&path)];
        assert!(!file.changed);
        assert_eq!(file.code, "x = 1\n");
    }

    #[tokio::test]
    async fn chained_handlers_compose_through_the_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messy.py");
        tokio::fs::write(&path, "x = 1  \n\n\n").await.unwrap();
        let services = services_in(dir.path());
        let (ctx, aggregate) = context_for(RunResult::empty_for(ActionSource::Format));
        let payload = format_payload(vec![path.clone()]);

        TrimWhitespace::new(services.clone())
            .run(&payload, &ctx)
            .await
            .unwrap();
        FinalNewline::new(services).run(&payload, &ctx).await.unwrap();

        let aggregate = aggregate.lock().unwrap();
        let RunResult::Format(result) = &*aggregate else {
            panic!("expected format aggregate");
        };
        let file = &result.result_by_file_path[&path_key(&path)];
        assert!(file.changed);
        assert_eq!(file.code, "x = 1\n");
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_work() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.py");
        tokio::fs::write(&path, "x  \n").await.unwrap();
        let services = services_in(dir.path());
        let aggregate = std::sync::Arc::new(std::sync::Mutex::new(RunResult::empty_for(
            ActionSource::Format,
        )));
        let token = burnish_rpc::CancelToken::new();
        token.cancel();
        let ctx = RunContext::new(token, aggregate, None);

        let err = TrimWhitespace::new(services)
            .run(&format_payload(vec![path]), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Cancelled));
    }
}
