//! Run requests, responses, payloads, and result reducers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::action::ActionSource;
use crate::lint::LintMessage;

/// Outcome of an `actions/run` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Cancelled mid-run; the response carries the partial aggregate.
    Stopped,
    Error,
}

/// Request payload of the `actions/run` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunActionRequest {
    pub action_name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Options accepted as the third `actions/run` argument.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunActionOptions {
    /// Token partial results are published under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_result_token: Option<String>,
}

/// Response of the `actions/run` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunActionResponse {
    pub status: RunStatus,
    /// The aggregate result, JSON-serialised (path keys coerced to strings).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Format of `result`. Currently always "json".
    pub format: String,
    pub return_code: i32,
}

impl RunActionResponse {
    #[must_use]
    pub fn success(result: &RunResult) -> Self {
        Self {
            status: RunStatus::Success,
            result: Some(result.to_json_string()),
            format: "json".to_string(),
            return_code: result.return_code(),
        }
    }

    #[must_use]
    pub fn stopped(partial: &RunResult) -> Self {
        Self {
            status: RunStatus::Stopped,
            result: Some(partial.to_json_string()),
            format: "json".to_string(),
            return_code: 1,
        }
    }
}

/// A partial result streamed on `$/progress` before the final response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialResult {
    pub token: String,
    pub value: serde_json::Value,
}

/// Typed payload of a run, designated by the action source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunPayload {
    Format {
        file_paths: Vec<PathBuf>,
        /// Whether changed code is written back through the file manager.
        save: bool,
    },
    Lint {
        file_paths: Vec<PathBuf>,
    },
    /// Document-scoped queries whose results are plain JSON arrays
    /// (inlay hints, code actions).
    DocumentQuery {
        file_paths: Vec<PathBuf>,
    },
    ListFilesByLang,
    PrepareEnvs {
        envs: Vec<String>,
    },
    DumpConfig,
}

#[derive(Debug, Deserialize)]
struct FilePathsParams {
    #[serde(default)]
    file_paths: Vec<PathBuf>,
    #[serde(default)]
    save: bool,
}

#[derive(Debug, Deserialize)]
struct EnvsParams {
    #[serde(default)]
    envs: Vec<String>,
}

impl RunPayload {
    /// Materialise the payload for `source` from raw request params.
    ///
    /// The empty payload is acceptable for `list_files_by_lang` and
    /// `dump_config`; file-scoped actions tolerate an empty file list.
    pub fn from_params(
        source: ActionSource,
        params: &serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        match source {
            ActionSource::Format => {
                let p: FilePathsParams = serde_json::from_value(params.clone())?;
                Ok(Self::Format {
                    file_paths: p.file_paths,
                    save: p.save,
                })
            }
            ActionSource::Lint | ActionSource::LintMany => {
                let p: FilePathsParams = serde_json::from_value(params.clone())?;
                Ok(Self::Lint {
                    file_paths: p.file_paths,
                })
            }
            ActionSource::InlayHints | ActionSource::CodeActions => {
                let p: FilePathsParams = serde_json::from_value(params.clone())?;
                Ok(Self::DocumentQuery {
                    file_paths: p.file_paths,
                })
            }
            ActionSource::ListFilesByLang => Ok(Self::ListFilesByLang),
            ActionSource::PrepareEnvs => {
                let p: EnvsParams = serde_json::from_value(params.clone())?;
                Ok(Self::PrepareEnvs { envs: p.envs })
            }
            ActionSource::DumpConfig => Ok(Self::DumpConfig),
        }
    }

    /// Files this payload targets, if file-scoped.
    #[must_use]
    pub fn file_paths(&self) -> &[PathBuf] {
        match self {
            Self::Format { file_paths, .. }
            | Self::Lint { file_paths }
            | Self::DocumentQuery { file_paths } => file_paths,
            _ => &[],
        }
    }
}

/// Per-file outcome of a format handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatFileResult {
    pub changed: bool,
    pub code: String,
}

/// Aggregate format result: last changed code wins per file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatResult {
    pub result_by_file_path: BTreeMap<String, FormatFileResult>,
}

impl FormatResult {
    pub fn update(&mut self, other: FormatResult) {
        for (path, new) in other.result_by_file_path {
            match self.result_by_file_path.get_mut(&path) {
                Some(existing) => {
                    if new.changed {
                        existing.code = new.code;
                        existing.changed = true;
                    }
                }
                None => {
                    self.result_by_file_path.insert(path, new);
                }
            }
        }
    }

    #[must_use]
    pub fn any_changed(&self) -> bool {
        self.result_by_file_path.values().any(|r| r.changed)
    }
}

/// Aggregate lint result: per-file message-list union.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintResult {
    pub messages: BTreeMap<String, Vec<LintMessage>>,
}

impl LintResult {
    pub fn update(&mut self, other: LintResult) {
        for (path, mut messages) in other.messages {
            self.messages.entry(path).or_default().append(&mut messages);
        }
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.values().map(Vec::len).sum()
    }
}

/// Aggregate classifier result: per-language file-list union.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifyResult {
    pub files_by_language: BTreeMap<String, Vec<String>>,
}

impl ClassifyResult {
    pub fn update(&mut self, other: ClassifyResult) {
        for (lang, files) in other.files_by_language {
            let entry = self.files_by_language.entry(lang).or_default();
            for file in files {
                if !entry.contains(&file) {
                    entry.push(file);
                }
            }
        }
    }
}

/// The running aggregate of an action run, reduced with action-defined
/// semantics as each handler completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunResult {
    Format(FormatResult),
    Lint(LintResult),
    Classify(ClassifyResult),
    /// Actions without a structured reducer (prepare_envs, dump_config):
    /// the last handler's value wins.
    Plain(serde_json::Value),
}

impl RunResult {
    /// Empty aggregate for the given source.
    #[must_use]
    pub fn empty_for(source: ActionSource) -> Self {
        match source {
            ActionSource::Format => Self::Format(FormatResult::default()),
            ActionSource::Lint | ActionSource::LintMany => Self::Lint(LintResult::default()),
            ActionSource::ListFilesByLang => Self::Classify(ClassifyResult::default()),
            ActionSource::InlayHints | ActionSource::CodeActions => {
                Self::Plain(serde_json::Value::Array(Vec::new()))
            }
            ActionSource::PrepareEnvs | ActionSource::DumpConfig => {
                Self::Plain(serde_json::Value::Null)
            }
        }
    }

    /// Fold a new handler result into the aggregate.
    ///
    /// Mismatched variants replace the aggregate; a handler that returns a
    /// different shape than the action's declared source is a handler bug
    /// surfaced by the replacing value.
    pub fn update(&mut self, new: RunResult) {
        match (self, new) {
            (Self::Format(agg), Self::Format(new)) => agg.update(new),
            (Self::Lint(agg), Self::Lint(new)) => agg.update(new),
            (Self::Classify(agg), Self::Classify(new)) => agg.update(new),
            // Plain arrays (inlay hints, code actions) concatenate.
            (
                Self::Plain(serde_json::Value::Array(agg)),
                Self::Plain(serde_json::Value::Array(mut new)),
            ) => agg.append(&mut new),
            (this, new) => *this = new,
        }
    }

    /// JSON-serialise the aggregate; path keys are already strings.
    #[must_use]
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_string())
    }

    /// Exit contribution: lint messages with Error severity and failed
    /// plain results yield non-zero.
    #[must_use]
    pub fn return_code(&self) -> i32 {
        match self {
            Self::Lint(lint) => {
                let has_errors = lint
                    .messages
                    .values()
                    .flatten()
                    .any(|m| m.severity == crate::lint::LintMessageSeverity::Error);
                i32::from(has_errors)
            }
            _ => 0,
        }
    }
}

/// Coerce a path to the string key used in result maps.
#[must_use]
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lint::{LintMessageSeverity, Position, Range};

    fn format_result(path: &str, changed: bool, code: &str) -> FormatResult {
        let mut result = FormatResult::default();
        result.result_by_file_path.insert(
            path.to_string(),
            FormatFileResult {
                changed,
                code: code.to_string(),
            },
        );
        result
    }

    fn lint_message(text: &str, severity: LintMessageSeverity) -> LintMessage {
        LintMessage {
            range: Range::new(Position::new(1, 1), Position::new(1, 2)),
            message: text.to_string(),
            code: None,
            severity,
            source: "test".to_string(),
        }
    }

    #[test]
    fn format_reducer_last_changed_wins() {
        let mut agg = format_result("a.py", true, "first");
        agg.update(format_result("a.py", true, "second"));
        assert_eq!(agg.result_by_file_path["a.py"].code, "second");

        // An unchanged result never overwrites changed code.
        agg.update(format_result("a.py", false, "untouched"));
        assert_eq!(agg.result_by_file_path["a.py"].code, "second");
        assert!(agg.result_by_file_path["a.py"].changed);
    }

    #[test]
    fn format_reducer_keeps_unseen_files() {
        let mut agg = format_result("a.py", false, "a");
        agg.update(format_result("b.py", true, "b"));
        assert_eq!(agg.result_by_file_path.len(), 2);
        assert!(agg.any_changed());
    }

    #[test]
    fn lint_reducer_unions_per_file() {
        let mut agg = LintResult::default();
        let mut first = LintResult::default();
        first.messages.insert(
            "a.py".to_string(),
            vec![lint_message("one", LintMessageSeverity::Warning)],
        );
        let mut second = LintResult::default();
        second.messages.insert(
            "a.py".to_string(),
            vec![lint_message("two", LintMessageSeverity::Error)],
        );
        agg.update(first);
        agg.update(second);
        assert_eq!(agg.messages["a.py"].len(), 2);
        assert_eq!(agg.message_count(), 2);
    }

    #[test]
    fn classify_reducer_deduplicates_files() {
        let mut agg = ClassifyResult::default();
        let mut first = ClassifyResult::default();
        first
            .files_by_language
            .insert("python".to_string(), vec!["a.py".to_string()]);
        let mut second = ClassifyResult::default();
        second.files_by_language.insert(
            "python".to_string(),
            vec!["a.py".to_string(), "b.py".to_string()],
        );
        agg.update(first);
        agg.update(second);
        assert_eq!(agg.files_by_language["python"], vec!["a.py", "b.py"]);
    }

    #[test]
    fn plain_array_reducer_concatenates() {
        let mut agg = RunResult::empty_for(ActionSource::InlayHints);
        agg.update(RunResult::Plain(serde_json::json!([{"label": "int"}])));
        agg.update(RunResult::Plain(serde_json::json!([{"label": "str"}])));
        assert_eq!(
            agg,
            RunResult::Plain(serde_json::json!([{"label": "int"}, {"label": "str"}]))
        );
    }

    #[test]
    fn document_query_payload_is_file_scoped() {
        let params = serde_json::json!({"file_paths": ["/ws/a.py"]});
        let payload = RunPayload::from_params(ActionSource::CodeActions, &params).unwrap();
        assert_eq!(payload.file_paths(), [PathBuf::from("/ws/a.py")]);
    }

    #[test]
    fn run_result_return_code_reflects_lint_errors() {
        let mut lint = LintResult::default();
        lint.messages.insert(
            "a.py".to_string(),
            vec![lint_message("bad", LintMessageSeverity::Error)],
        );
        assert_eq!(RunResult::Lint(lint).return_code(), 1);

        let mut warnings_only = LintResult::default();
        warnings_only.messages.insert(
            "a.py".to_string(),
            vec![lint_message("meh", LintMessageSeverity::Warning)],
        );
        assert_eq!(RunResult::Lint(warnings_only).return_code(), 0);
    }

    #[test]
    fn payload_from_params_format() {
        let params = serde_json::json!({"file_paths": ["/ws/a.py"], "save": true});
        let payload = RunPayload::from_params(ActionSource::Format, &params).unwrap();
        assert_eq!(
            payload,
            RunPayload::Format {
                file_paths: vec![PathBuf::from("/ws/a.py")],
                save: true,
            }
        );
    }

    #[test]
    fn payload_from_params_empty_is_ok_for_classifier() {
        let payload =
            RunPayload::from_params(ActionSource::ListFilesByLang, &serde_json::json!({}))
                .unwrap();
        assert_eq!(payload, RunPayload::ListFilesByLang);
        assert!(payload.file_paths().is_empty());
    }

    #[test]
    fn response_serialises_result_as_json_string() {
        let result = RunResult::Format(format_result("a.py", true, "x = 1\n"));
        let response = RunActionResponse::success(&result);
        assert_eq!(response.status, RunStatus::Success);
        assert_eq!(response.format, "json");
        assert_eq!(response.return_code, 0);
        let parsed: serde_json::Value =
            serde_json::from_str(response.result.as_deref().unwrap()).unwrap();
        assert_eq!(parsed["result_by_file_path"]["a.py"]["changed"], true);
    }

    #[test]
    fn path_key_coerces_to_string() {
        assert_eq!(path_key(Path::new("/ws/a.py")), "/ws/a.py");
    }
}
