//! Extension runner entry point.
//!
//! Spawned by the supervisor as
//! `burnish-runner start --project-path <dir> --env-name <env>`. Stdout is
//! reserved for the port announcement; logs go to a file inside the env.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use burnish_runner::{ServeOptions, serve};
use burnish_types::ENVS_DIR_NAME;

#[derive(Parser)]
#[command(name = "burnish-runner", version, about = "Burnish extension runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve one supervisor connection for a (project, env) pair.
    Start {
        #[arg(long)]
        project_path: PathBuf,
        #[arg(long)]
        env_name: String,
        /// Log at debug level.
        #[arg(long)]
        debug: bool,
    },
}

fn init_tracing(project_path: &Path, env_name: &str, debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::try_new("warn").expect("warn filter is valid"));

    let (log_file, init_warnings) = open_runner_log_file(project_path, env_name);

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

    // Stdout carries the port announcement the supervisor scans for, so
    // when no log file can be opened, log nowhere rather than there.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_runner_log_file(
    project_path: &Path,
    env_name: &str,
) -> (Option<(PathBuf, std::fs::File)>, Vec<String>) {
    let candidates = vec![
        project_path
            .join(ENVS_DIR_NAME)
            .join(env_name)
            .join("logs")
            .join("runner.log"),
        std::env::temp_dir().join("burnish-runner.log"),
    ];
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Start {
            project_path,
            env_name,
            debug,
        } => {
            init_tracing(&project_path, &env_name, debug);
            let code = serve(ServeOptions {
                project_path,
                env_name,
            })
            .await?;
            std::process::exit(code);
        }
    }
}
