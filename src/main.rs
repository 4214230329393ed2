#![forbid(unsafe_code)]

//! docchat: document and audio chat client.
//!
//! CLI entry point: parses arguments, dispatches subcommands, renders output.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, anyhow};
use clap::{CommandFactory, Parser};
use colored::Colorize;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

use docchat::api::{AuthGate, HttpApi, MediaApi, UploadFile};
use docchat::chat::ChatSession;
use docchat::config::Config;
use docchat::error::ClientError;
use docchat::model::{MediaKind, ProcessingStatus};
use docchat::session::SessionManager;
use docchat::upload::{PollSettings, UploadState, UploadTracker};

/// Upload PDFs and audio, track their processing, and chat about them.
#[derive(Parser, Debug)]
#[command(name = "docchat", version, about, long_about = None)]
struct Cli {
    /// Show detailed progress.
    #[arg(long, global = true)]
    verbose: bool,

    /// Show everything including per-request details.
    #[arg(long, global = true)]
    trace: bool,

    /// Output as JSON for machine consumption.
    #[arg(long, global = true)]
    json: bool,

    /// Path to config.toml (default: <config dir>/docchat/config.toml).
    #[arg(long, global = true, env = "DOCCHAT_CONFIG")]
    config: Option<PathBuf>,

    /// Base URL of the service.
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Identity token; uploads and chat are refused without one.
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Inspect or reset the session identifier.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Upload a file and wait until the server has processed it.
    Upload {
        /// PDF or audio file.
        path: PathBuf,

        /// Media kind (pdf, audio). Guessed from the extension when omitted.
        #[arg(long)]
        kind: Option<MediaKind>,
    },

    /// Show processing status of files uploaded in this session.
    Status {
        /// Only this media kind.
        #[arg(long)]
        kind: Option<MediaKind>,
    },

    /// Ask about your files. Without a message, starts an interactive chat.
    Chat {
        /// Message to send.
        message: Option<String>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: clap_complete::Shell,
    },
}

#[derive(clap::Subcommand, Debug, Clone, Copy)]
enum SessionAction {
    /// Print the current identifier (creating one if needed).
    Show,
    /// Replace the identifier with a new one.
    Refresh,
    /// Remove the identifier from all storage.
    Clear,
    /// Exit non-zero unless a usable identifier is available.
    Validate,
}

/// Initialize the tracing subscriber based on CLI flags.
///
/// Priority: `--trace` > `--verbose` > `RUST_LOG` env var > default (warn).
fn init_tracing(cli: &Cli) {
    let filter = if cli.trace {
        EnvFilter::new("docchat=trace")
    } else if cli.verbose {
        EnvFilter::new("docchat=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(url) = &cli.api_url {
        config.api_url = url.clone();
    }
    if let Some(token) = &cli.token {
        config.token = Some(token.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    let json = cli.json;

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err, json);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    if let Command::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "docchat", &mut std::io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(&cli)?;
    match cli.command {
        Command::Session { action } => Ok(cmd_session(&config, action, cli.json)),
        Command::Upload { ref path, kind } => cmd_upload(&config, path, kind, cli.json).await,
        Command::Status { kind } => cmd_status(&config, kind, cli.json).await,
        Command::Chat { ref message } => cmd_chat(&config, message.as_deref(), cli.json).await,
        Command::Completions { .. } => unreachable!("handled above"),
    }
}

fn report_error(err: &anyhow::Error, json: bool) {
    let error_type = err
        .downcast_ref::<ClientError>()
        .map(ClientError::error_type)
        .unwrap_or("internal");
    if json {
        let body = serde_json::json!({
            "ok": false,
            "error_type": error_type,
            "message": format!("{err:#}"),
        });
        println!("{body}");
    } else {
        eprintln!("{} {err:#}", "error:".red().bold());
    }
}

fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

// ---------------------------------------------------------------------------
// session
// ---------------------------------------------------------------------------

fn cmd_session(config: &Config, action: SessionAction, json: bool) -> ExitCode {
    let mut manager = SessionManager::from_config(config);
    match action {
        SessionAction::Show => {
            let info = manager.info();
            if json {
                print_json(&serde_json::json!({ "ok": true, "session": info }));
            } else {
                let created = chrono::DateTime::from_timestamp_millis(info.created_at)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_default();
                let expires = chrono::DateTime::from_timestamp_millis(info.expires_at)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_default();
                println!("{}", info.session_id.bold());
                println!("  stored in: {}", info.tier);
                println!("  created:   {created}");
                println!("  expires:   {expires}");
            }
            ExitCode::SUCCESS
        }
        SessionAction::Refresh => {
            let id = manager.refresh();
            if json {
                print_json(&serde_json::json!({ "ok": true, "session_id": id }));
            } else {
                println!("{} {}", "New session:".green(), id.bold());
            }
            ExitCode::SUCCESS
        }
        SessionAction::Clear => {
            manager.clear();
            if json {
                print_json(&serde_json::json!({ "ok": true }));
            } else {
                println!("Session identifier cleared.");
            }
            ExitCode::SUCCESS
        }
        SessionAction::Validate => {
            let valid = manager.validate();
            if json {
                print_json(&serde_json::json!({ "ok": valid, "valid": valid }));
            } else if valid {
                println!("{}", "Session identifier is valid.".green());
            } else {
                println!("{}", "No usable session identifier.".red());
            }
            if valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

// ---------------------------------------------------------------------------
// upload
// ---------------------------------------------------------------------------

async fn cmd_upload(
    config: &Config,
    path: &Path,
    kind: Option<MediaKind>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    config.require("upload files")?;
    let kind = match kind.or_else(|| MediaKind::detect(path)) {
        Some(kind) => kind,
        None => {
            return Err(anyhow!(
                "cannot tell whether {} is a PDF or audio file; pass --kind",
                path.display()
            ));
        }
    };

    let file = UploadFile::read(path, kind).await?;
    let api = HttpApi::from_config(config)?;
    let session_id = SessionManager::from_config(config).get_or_create();
    let mut tracker = UploadTracker::new(
        &api,
        file,
        session_id,
        PollSettings::for_kind(config, kind),
    );

    let mut updates = tracker.subscribe();
    let progress = (!json).then(|| {
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let state = updates.borrow_and_update().clone();
                match state {
                    UploadState::Uploading => eprintln!("{}", "Uploading...".cyan()),
                    UploadState::Processing => eprintln!("{}", "Processing...".cyan()),
                    _ => {}
                }
            }
        })
    });

    let outcome = tracker.run(config).await?;
    let filename = tracker.file().filename.clone();
    drop(tracker);
    if let Some(handle) = progress {
        let _ = handle.await;
    }

    let ok = outcome == UploadState::Ready;
    if json {
        print_json(&serde_json::json!({
            "ok": ok,
            "kind": kind,
            "path": path,
            "filename": filename,
            "outcome": outcome,
        }));
    } else {
        match &outcome {
            UploadState::Ready => println!(
                "{} {filename} is ready. Ask about it with `docchat chat`.",
                "✓".green(),
            ),
            UploadState::Failed { message, .. } => {
                eprintln!("{} {message}", "✗".red());
                eprintln!("Run the same command again to retry.");
            }
            other => eprintln!("upload ended in unexpected state: {}", other.label()),
        }
    }
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

async fn cmd_status(
    config: &Config,
    kind: Option<MediaKind>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    config.require("view upload status")?;
    let api = HttpApi::from_config(config)?;
    let session_id = SessionManager::from_config(config).get_or_create();
    let kinds: Vec<MediaKind> = match kind {
        Some(k) => vec![k],
        None => MediaKind::ALL.to_vec(),
    };

    let mut all = Vec::new();
    for kind in kinds {
        let records = api.fetch_status(kind, &session_id).await?;
        all.extend(records.into_iter().map(|r| (kind, r)));
    }

    if json {
        let files: Vec<_> = all
            .iter()
            .map(|(kind, record)| serde_json::json!({ "kind": kind, "file": record }))
            .collect();
        print_json(&serde_json::json!({ "ok": true, "session_id": session_id, "files": files }));
        return Ok(ExitCode::SUCCESS);
    }

    if all.is_empty() {
        println!("No files uploaded in this session.");
        return Ok(ExitCode::SUCCESS);
    }
    for (kind, record) in &all {
        let status = match record.status {
            ProcessingStatus::Ready => "ready".green(),
            ProcessingStatus::Processing => "processing".yellow(),
            ProcessingStatus::Failed => "failed".red(),
            ProcessingStatus::Unknown => "unknown".dimmed(),
        };
        let detail = record
            .error
            .as_deref()
            .map(|e| format!("  ({e})"))
            .unwrap_or_default();
        println!("{:<6} {:<11} {}{detail}", kind.slug(), status, record.filename);
    }
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// chat
// ---------------------------------------------------------------------------

async fn cmd_chat(
    config: &Config,
    message: Option<&str>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    config.require("chat")?;
    let api = HttpApi::from_config(config)?;
    let mut manager = SessionManager::from_config(config);
    let mut chat = ChatSession::new(&api);

    if let Some(message) = message {
        let reply = chat.send(config, &manager.get_or_create(), message).await?;
        if json {
            print_json(&serde_json::json!({ "ok": true, "transcript": chat.transcript() }));
        } else {
            println!("{reply}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    eprintln!(
        "{}",
        format!(
            "Ask about your files on {}. /clear resets the transcript, Ctrl-D quits.",
            api.base_url()
        )
        .dimmed()
    );
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        match line.trim() {
            "" => continue,
            "/clear" => {
                chat.clear();
                eprintln!("{}", "Transcript cleared.".dimmed());
                continue;
            }
            _ => {}
        }
        match chat.send(config, &manager.get_or_create(), &line).await {
            Ok(reply) => println!("{} {reply}", "assistant:".blue().bold()),
            Err(e) => eprintln!("{} {e}", "error:".red().bold()),
        }
    }
    if json {
        print_json(&serde_json::json!({ "ok": true, "transcript": chat.transcript() }));
    }
    Ok(ExitCode::SUCCESS)
}
