//! Wire method and command names shared by the supervisor and the runners.

pub const INITIALIZE: &str = "initialize";
pub const INITIALIZED: &str = "initialized";
pub const SHUTDOWN: &str = "shutdown";
pub const EXIT: &str = "exit";

pub const CANCEL_REQUEST: &str = "$/cancelRequest";
pub const PROGRESS: &str = "$/progress";

pub const EXECUTE_COMMAND: &str = "workspace/executeCommand";
pub const DID_OPEN: &str = "textDocument/didOpen";
pub const DID_CLOSE: &str = "textDocument/didClose";
pub const FORMATTING: &str = "textDocument/formatting";
pub const DOCUMENT_DIAGNOSTIC: &str = "textDocument/diagnostic";
pub const WORKSPACE_DIAGNOSTIC: &str = "workspace/diagnostic";
pub const INLAY_HINT: &str = "textDocument/inlayHint";
pub const CODE_ACTION: &str = "textDocument/codeAction";
pub const SHOW_MESSAGE: &str = "window/showMessage";

// Reverse RPC: runner -> supervisor.
pub const DOCUMENTS_GET: &str = "documents/get";
pub const GET_RAW_CONFIG: &str = "projects/getRawConfig";
pub const APPLY_EDIT: &str = "workspace/applyEdit";

/// `workspace/executeCommand` command names.
pub mod commands {
    pub const ACTIONS_RUN: &str = "actions/run";
    pub const ACTIONS_RELOAD: &str = "actions/reload";
    pub const RESOLVE_PACKAGE_PATH: &str = "packages/resolvePath";
    pub const UPDATE_CONFIG: &str = "runner/updateConfig";
}
