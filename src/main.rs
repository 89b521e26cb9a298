use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use taskd::client::{read_auth_token, ClientError, ClientOptions, TaskClient};
use taskd::config::{OnMissing, TaskdConfig};
use taskd::mask::FieldMask;
use taskd::service::UpdateTaskRequest;
use taskd::{auth, rpc, store::MemStore, AppContext};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "taskd",
    about = "taskd — minimal task-tracking daemon (WebSocket JSON-RPC)",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// JSON-RPC WebSocket server port
    #[arg(long, env = "TASKD_PORT")]
    port: Option<u16>,

    /// Data directory for the auth token and config.toml
    #[arg(long, env = "TASKD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TASKD_LOG")]
    log: Option<String>,

    /// Bind address for the WebSocket server (default: 127.0.0.1)
    #[arg(long, env = "TASKD_BIND")]
    bind_address: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "TASKD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,

    /// Auth token for client subcommands (default: read {data_dir}/auth_token)
    #[arg(long, env = "TASKD_TOKEN", global = true)]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon server (default when no subcommand given).
    ///
    /// Examples:
    ///   taskd serve
    ///   taskd
    Serve {
        /// Unknown-id policy for streaming update/delete: skip | error
        #[arg(long, env = "TASKD_ON_MISSING")]
        on_missing: Option<OnMissing>,
    },
    /// Add a task.
    ///
    /// Examples:
    ///   taskd add --description "buy milk"
    ///   taskd add --description "pay bills" --due 2026-09-01T12:00:00Z
    Add {
        #[arg(long, short = 'd')]
        description: String,
        /// Due date, RFC 3339 (e.g. 2026-09-01T12:00:00Z)
        #[arg(long)]
        due: Option<String>,
    },
    /// List tasks, streamed from the daemon.
    ///
    /// Examples:
    ///   taskd list
    ///   taskd list --fields id,description
    List {
        /// Comma-separated field-mask: only these task fields are returned
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
    },
    /// Update a task (all fields overwritten wholesale).
    ///
    /// Examples:
    ///   taskd update 2 --description "pay bills" --due 2026-08-29T12:00:00Z --done
    Update {
        id: u64,
        #[arg(long, short = 'd')]
        description: String,
        /// Due date, RFC 3339; omit to clear
        #[arg(long)]
        due: Option<String>,
        #[arg(long)]
        done: bool,
    },
    /// Delete one or more tasks (streamed; one ack per id).
    ///
    /// Examples:
    ///   taskd delete 1
    ///   taskd delete 1 2 3
    Delete {
        #[arg(required = true)]
        ids: Vec<u64>,
    },
    /// Show the daemon auth token.
    Token {
        #[command(subcommand)]
        cmd: TokenCmd,
    },
    /// Query the daemon health endpoint.
    ///
    /// Examples:
    ///   taskd status
    ///   taskd status --json
    Status {
        /// Print the raw JSON health document
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TokenCmd {
    /// Print the auth token to stdout.
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();

    // ── Logging setup ────────────────────────────────────────────────────────
    // Init once — must happen before any tracing calls.
    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let log_format =
        std::env::var("TASKD_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref(), &log_format);

    match args.command.take() {
        Some(Command::Add { description, due }) => {
            let due_date = due.as_deref().map(parse_due).transpose()?;
            let mut client = make_client(&args).await;
            match client.add_task(&description, due_date).await {
                Ok(id) => println!("added task {id}"),
                Err(e) => fail(e),
            }
        }
        Some(Command::List { fields }) => {
            let mask = FieldMask::new(fields);
            let mut client = make_client(&args).await;
            match client.list_tasks(&mask, &CancellationToken::new()).await {
                Ok(rows) => {
                    for row in rows {
                        let due = row
                            .task
                            .due_date
                            .map(|d| d.to_rfc3339())
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "{}\t{}\tdue: {}\tdone: {}\toverdue: {}",
                            row.task.id, row.task.description, due, row.task.done, row.overdue
                        );
                    }
                }
                Err(e) => fail(e),
            }
        }
        Some(Command::Update {
            id,
            description,
            due,
            done,
        }) => {
            let due_date = due.as_deref().map(parse_due).transpose()?;
            let mut client = make_client(&args).await;
            let update = UpdateTaskRequest {
                id,
                description,
                due_date,
                done,
            };
            match client
                .update_tasks(vec![update], &CancellationToken::new())
                .await
            {
                Ok(()) => println!("updated task {id}"),
                Err(e) => fail(e),
            }
        }
        Some(Command::Delete { ids }) => {
            let mut client = make_client(&args).await;
            match client.delete_tasks(ids, &CancellationToken::new()).await {
                Ok(acks) => println!("deleted {acks} task(s)"),
                Err(e) => fail(e),
            }
        }
        Some(Command::Token { cmd }) => {
            let config =
                TaskdConfig::new(None, args.data_dir, Some("error".to_string()), None, None);
            match cmd {
                TokenCmd::Show => run_token_show(&config)?,
            }
        }
        Some(Command::Status { json }) => {
            let config =
                TaskdConfig::new(None, args.data_dir, Some("error".to_string()), None, None);
            let exit_code = run_status(&config, json).await;
            std::process::exit(exit_code);
        }
        Some(Command::Serve { on_missing }) => {
            run_server(args.port, args.data_dir, args.log, args.bind_address, on_missing)
                .await?;
        }
        None => {
            run_server(args.port, args.data_dir, args.log, args.bind_address, None).await?;
        }
    }

    Ok(())
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// `log_format` may be `"pretty"` (default, human-readable compact format) or
/// `"json"` (structured JSON for log aggregators).
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("taskd.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            // Fall back to stdout-only — don't panic on a bad log path.
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            if use_json {
                tracing_subscriber::fmt().json().with_env_filter(log_level).init();
            } else {
                tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            }
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if use_json {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().json())
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().compact())
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }

        Some(guard)
    } else if use_json {
        tracing_subscriber::fmt().json().with_env_filter(log_level).init();
        None
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}

// ── Demo client plumbing ──────────────────────────────────────────────────────

fn parse_due(s: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&chrono::Utc))
        .with_context(|| format!("invalid due date '{s}' (expected RFC 3339)"))
}

/// Build a client for a CLI subcommand, or exit with a hint.
async fn make_client(args: &Args) -> TaskClient {
    let config = TaskdConfig::new(
        args.port,
        args.data_dir.clone(),
        Some("error".to_string()),
        None,
        None,
    );

    let token = match args.token.clone() {
        Some(t) => t,
        None => match read_auth_token(&config.data_dir) {
            Ok(t) => t,
            Err(e) => {
                eprintln!("error: {e:#}");
                std::process::exit(1);
            }
        },
    };

    let opts = ClientOptions {
        token,
        ..ClientOptions::default()
    };
    let addr = format!("127.0.0.1:{}", config.port);
    match TaskClient::connect(&addr, opts).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: cannot reach daemon at {addr}: {e}");
            eprintln!("       Start it with: taskd serve");
            std::process::exit(1);
        }
    }
}

/// Fail-fast demo-client policy: print the code and message, exit non-zero.
/// InvalidArgument and Internal get their code called out for diagnostics;
/// every other failure is fatal with the plain error.
fn fail(e: ClientError) -> ! {
    match e.code() {
        Some(code) if code == rpc::wire::INVALID_ARGUMENT => {
            eprintln!("error: InvalidArgument ({code}): {e}")
        }
        Some(code) if code == rpc::wire::INTERNAL_ERROR => {
            eprintln!("error: Internal ({code}): {e}")
        }
        _ => eprintln!("error: {e}"),
    }
    std::process::exit(1);
}

fn run_token_show(config: &TaskdConfig) -> Result<()> {
    let token_path = config.data_dir.join("auth_token");
    match std::fs::read_to_string(&token_path) {
        Ok(token) => {
            println!("{}", token.trim());
            Ok(())
        }
        Err(_) => {
            eprintln!("error: auth token not found at {}", token_path.display());
            eprintln!("       Is the daemon running? Start it with: taskd serve");
            std::process::exit(1);
        }
    }
}

// ── taskd status ──────────────────────────────────────────────────────────────

/// Query `GET /health` on the daemon port. No WebSocket or token needed.
async fn run_status(config: &TaskdConfig, json: bool) -> i32 {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let addr = format!("127.0.0.1:{}", config.port);
    let body = async {
        let mut stream = tokio::time::timeout(
            std::time::Duration::from_secs(3),
            TcpStream::connect(&addr),
        )
        .await
        .ok()?
        .ok()?;
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .ok()?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.ok()?;
        let response = String::from_utf8_lossy(&buf).to_string();
        let body_start = response.find("\r\n\r\n").map(|i| i + 4)?;
        serde_json::from_str::<serde_json::Value>(&response[body_start..]).ok()
    }
    .await;

    match body {
        Some(health) => {
            if json {
                println!("{}", serde_json::to_string(&health).unwrap_or_default());
            } else {
                let version = health["version"].as_str().unwrap_or("?");
                let tasks = health["tasks"].as_u64().unwrap_or(0);
                let uptime = format_uptime(health["uptime"].as_u64().unwrap_or(0));
                println!("taskd {version} — Running ({tasks} tasks, uptime {uptime})");
            }
            0
        }
        None => {
            if json {
                println!(r#"{{"status":"not_running"}}"#);
            } else {
                println!("taskd: not running");
            }
            1
        }
    }
}

/// Format uptime seconds as "2h 14m" or "45m 3s".
fn format_uptime(secs: u64) -> String {
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{h}h {m}m")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

// ── taskd serve ───────────────────────────────────────────────────────────────

async fn run_server(
    port: Option<u16>,
    data_dir: Option<std::path::PathBuf>,
    log: Option<String>,
    bind_address: Option<String>,
    on_missing: Option<OnMissing>,
) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "taskd starting");

    let config = Arc::new(TaskdConfig::new(port, data_dir, log, bind_address, on_missing));
    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("failed to create data directory {}", config.data_dir.display())
    })?;
    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        on_missing = ?config.on_missing,
        "config loaded"
    );

    let auth_token = match &config.auth_token {
        Some(token) => token.clone(),
        None => auth::get_or_create_token(&config.data_dir)
            .context("failed to provision auth token")?,
    };

    let ctx = Arc::new(AppContext {
        config: config.clone(),
        store: Arc::new(MemStore::new()),
        started_at: std::time::Instant::now(),
        auth_token,
    });

    rpc::run(ctx).await
}
