//! Burnish CLI - entry point for action runs and the IDE server.
//!
//! `burnish run <action> [paths…]` routes a run to the project owning the
//! current directory (or `--project-dir`), `burnish serve` exposes the LSP
//! surface over stdio, and `prepare-envs` / `dump-config` / `list-actions`
//! are thin wrappers over the corresponding built-in actions. Stdout is the
//! command's result; logs always go to a file.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use burnish_rpc::CancelToken;
use burnish_types::{RunActionResponse, RunResult, RunStatus};
use burnish_workspace::WorkspaceManager;

#[derive(Parser)]
#[command(name = "burnish", version, about = "Workspace code-quality orchestrator")]
struct Cli {
    /// Project or workspace directory (defaults to the current directory).
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Log at debug level.
    #[arg(long, global = true)]
    debug: bool,

    /// Log at trace level (implies --debug).
    #[arg(long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one or more actions in the project owning the target paths.
    Run {
        /// Action names as declared in `[tool.burnish.action]`.
        #[arg(required = true)]
        actions: Vec<String>,
        /// Files the actions operate on (repeatable).
        #[arg(long = "path", value_name = "PATH")]
        paths: Vec<PathBuf>,
        /// Write formatted code back to disk.
        #[arg(long)]
        save: bool,
        /// Run in every registered project declaring the action.
        #[arg(long)]
        all: bool,
        /// With --all, run projects concurrently.
        #[arg(long)]
        concurrently: bool,
    },
    /// Install runner environments for a project.
    PrepareEnvs {
        /// Environments to prepare; empty prepares all declared ones.
        envs: Vec<String>,
    },
    /// Resolve a project's configuration and dump it to disk.
    DumpConfig,
    /// List the actions a project declares.
    ListActions,
    /// Serve the IDE surface (LSP) over stdio or a TCP socket.
    Serve {
        /// Serve over stdio (the default).
        #[arg(long, conflicts_with_all = ["host", "port"])]
        stdio: bool,
        /// Bind a TCP listener on this host instead of stdio.
        #[arg(long, requires = "port")]
        host: Option<String>,
        /// Port for the TCP listener.
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_tracing(debug: bool, trace: bool) {
    let default_level = if trace {
        "trace"
    } else if debug {
        "debug"
    } else {
        "info"
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::try_new("warn").expect("warn filter is valid"));

    let (log_file, init_warnings) = open_burnish_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Stdout carries command results (and the LSP stream under `serve`), so
    // when no log file can be opened, log nowhere rather than there.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_burnish_log_file() -> (Option<(PathBuf, std::fs::File)>, Vec<String>) {
    let candidates = burnish_log_file_candidates();
    let mut warnings = Vec::new();

    for candidate in candidates {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn burnish_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.burnish/logs/burnish.log
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".burnish").join("logs").join("burnish.log"));
    }

    // Fallback: ./.burnish/logs/burnish.log (useful in constrained environments)
    candidates.push(PathBuf::from(".burnish").join("logs").join("burnish.log"));

    candidates
}

/// Render a run response for the terminal: lint messages as
/// `file:line:col` lines, format results as changed-file lines, everything
/// else as pretty JSON.
fn render_response(response: &RunActionResponse) -> String {
    let mut out = String::new();
    if response.status == RunStatus::Stopped {
        out.push_str("run was stopped; results are partial\n");
    }
    let Some(raw) = response.result.as_deref() else {
        return out;
    };
    match serde_json::from_str::<RunResult>(raw) {
        Ok(RunResult::Lint(lint)) => {
            for (path, messages) in &lint.messages {
                for message in messages {
                    out.push_str(&format!("{path}:{}\n", message.display_line()));
                }
            }
            let count = lint.message_count();
            out.push_str(&format!("{count} message(s)\n"));
        }
        Ok(RunResult::Format(format)) => {
            let changed: Vec<&String> = format
                .result_by_file_path
                .iter()
                .filter(|(_, r)| r.changed)
                .map(|(path, _)| path)
                .collect();
            for path in &changed {
                out.push_str(&format!("reformatted {path}\n"));
            }
            out.push_str(&format!(
                "{} file(s) changed, {} unchanged\n",
                changed.len(),
                format.result_by_file_path.len() - changed.len(),
            ));
        }
        Ok(RunResult::Classify(classify)) => {
            for (language, files) in &classify.files_by_language {
                out.push_str(&format!("{language}: {} file(s)\n", files.len()));
            }
        }
        Ok(RunResult::Plain(value)) => {
            let pretty = serde_json::to_string_pretty(&value).unwrap_or_else(|_| raw.to_string());
            out.push_str(&pretty);
            out.push('\n');
        }
        Err(_) => {
            out.push_str(raw);
            out.push('\n');
        }
    }
    out
}

/// A cancel token that fires on Ctrl-C, so interrupted runs still report
/// their partial results.
fn cancel_on_ctrl_c() -> CancelToken {
    let token = CancelToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling run");
            signal_token.cancel();
        }
    });
    token
}

fn absolute(dir: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("current directory is unreadable")?,
    };
    if dir.is_absolute() {
        Ok(dir)
    } else {
        Ok(std::env::current_dir()
            .context("current directory is unreadable")?
            .join(dir))
    }
}

async fn run_command(cli: Cli) -> Result<i32> {
    let project_dir = absolute(cli.project_dir)?;
    let manager = WorkspaceManager::new();

    match cli.command {
        Command::Run {
            actions,
            paths,
            save,
            all,
            concurrently,
        } => {
            manager.add_workspace_dir(&project_dir);
            let paths: Vec<PathBuf> = paths
                .into_iter()
                .map(|p| if p.is_absolute() { p } else { project_dir.join(p) })
                .collect();
            let cancel = cancel_on_ctrl_c();
            let label_runs = actions.len() > 1;

            let mut code = 0;
            for action in &actions {
                if label_runs {
                    println!("== {action} ==");
                }
                let params = serde_json::json!({ "file_paths": paths, "save": save });
                if all {
                    let results = manager
                        .run_action_everywhere(action, params, concurrently, &cancel)
                        .await;
                    for (root, result) in results {
                        match result {
                            Ok(response) => {
                                print!("{}:\n{}", root.display(), render_response(&response));
                                code = code.max(response.return_code);
                            }
                            Err(e) => {
                                eprintln!("{}: {e}", root.display());
                                code = code.max(1);
                            }
                        }
                    }
                } else {
                    let trigger = paths.first().map_or(project_dir.as_path(), PathBuf::as_path);
                    let response = manager.run_action(trigger, action, params, &cancel).await?;
                    print!("{}", render_response(&response));
                    code = code.max(response.return_code);
                }
                if cancel.is_cancelled() {
                    break;
                }
            }
            manager.shutdown().await;
            Ok(code)
        }
        Command::PrepareEnvs { envs } => {
            manager.add_workspace_dir(&project_dir);
            let response = manager.prepare_envs(&project_dir, &envs).await?;
            print!("{}", render_response(&response));
            manager.shutdown().await;
            Ok(response.return_code)
        }
        Command::DumpConfig => {
            manager.add_workspace_dir(&project_dir);
            let response = manager.dump_config(&project_dir).await?;
            print!("{}", render_response(&response));
            manager.shutdown().await;
            Ok(response.return_code)
        }
        Command::ListActions => {
            // Pure config read; no runners involved.
            let resolved = burnish_config::resolve_project_at(&project_dir, None).await?;
            for action in &resolved.actions {
                println!("{}  ({})", action.name, action.source);
                for handler in &action.handlers {
                    println!("    {} [{}]", handler.name, handler.env);
                }
            }
            Ok(0)
        }
        Command::Serve { stdio: _, host, port } => {
            manager.add_workspace_dir(&project_dir);
            let code = match (host, port) {
                (host, Some(port)) => {
                    let host = host.unwrap_or_else(|| "127.0.0.1".to_string());
                    manager.serve_ide_tcp(&host, port).await?
                }
                _ => manager.serve_ide().await?,
            };
            Ok(code)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.trace);
    let code = run_command(cli).await?;
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use burnish_types::{
        FormatFileResult, FormatResult, LintMessage, LintMessageSeverity, LintResult, Position,
        Range,
    };

    fn response_for(result: RunResult, status: RunStatus) -> RunActionResponse {
        RunActionResponse {
            status,
            result: Some(result.to_json_string()),
            format: "json".to_string(),
            return_code: 0,
        }
    }

    #[test]
    fn renders_lint_messages_with_location() {
        let mut lint = LintResult::default();
        lint.messages.insert(
            "/ws/a.py".to_string(),
            vec![LintMessage {
                range: Range::new(Position::new(3, 7), Position::new(3, 12)),
                message: "trailing whitespace".to_string(),
                code: Some("W291".to_string()),
                severity: LintMessageSeverity::Warning,
                source: "burnish".to_string(),
            }],
        );
        let rendered = render_response(&response_for(RunResult::Lint(lint), RunStatus::Success));
        assert!(rendered.contains("/ws/a.py:3:7: warning: [burnish] W291 trailing whitespace"));
        assert!(rendered.contains("1 message(s)"));
    }

    #[test]
    fn renders_format_summary() {
        let mut format = FormatResult::default();
        format.result_by_file_path.insert(
            "/ws/a.py".to_string(),
            FormatFileResult {
                changed: true,
                code: "x = 1\n".to_string(),
            },
        );
        format.result_by_file_path.insert(
            "/ws/b.py".to_string(),
            FormatFileResult {
                changed: false,
                code: "y = 2\n".to_string(),
            },
        );
        let rendered =
            render_response(&response_for(RunResult::Format(format), RunStatus::Success));
        assert!(rendered.contains("reformatted /ws/a.py"));
        assert!(rendered.contains("1 file(s) changed, 1 unchanged"));
        assert!(!rendered.contains("reformatted /ws/b.py"));
    }

    #[test]
    fn stopped_runs_are_flagged() {
        let rendered = render_response(&response_for(
            RunResult::Plain(serde_json::json!({"prepared_envs": ["runtime"]})),
            RunStatus::Stopped,
        ));
        assert!(rendered.starts_with("run was stopped"));
        assert!(rendered.contains("prepared_envs"));
    }

    #[test]
    fn cli_parses_run_with_flags() {
        let cli = Cli::parse_from([
            "burnish",
            "run",
            "format",
            "lint",
            "--path",
            "src/a.py",
            "--save",
            "--project-dir",
            "/ws/app",
        ]);
        assert_eq!(cli.project_dir.as_deref(), Some(Path::new("/ws/app")));
        match cli.command {
            Command::Run {
                actions,
                paths,
                save,
                all,
                concurrently,
            } => {
                assert_eq!(actions, vec!["format".to_string(), "lint".to_string()]);
                assert_eq!(paths, vec![PathBuf::from("src/a.py")]);
                assert!(save);
                assert!(!all);
                assert!(!concurrently);
            }
            _ => panic!("expected run subcommand"),
        }
    }

    #[test]
    fn parse_serve_tcp() {
        let cli = Cli::parse_from(["burnish", "serve", "--host", "127.0.0.1", "--port", "9051"]);
        match cli.command {
            Command::Serve { stdio, host, port } => {
                assert!(!stdio);
                assert_eq!(host.as_deref(), Some("127.0.0.1"));
                assert_eq!(port, Some(9051));
            }
            _ => panic!("expected serve subcommand"),
        }
    }
}
