mod daemon;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use librarian_config::LibrarianConfig;
use librarian_runtime::{ClientOptions, LibrarianClient, NotificationListener, Response};

#[derive(Debug, Parser)]
#[command(
    name = "librarian",
    version,
    about = "Background research and ingestion service for a foreground agent"
)]
struct Cli {
    /// Configuration file.  A missing file means built-in defaults.
    #[arg(long, global = true, default_value = "config/librarian.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the Librarian until interrupted or asked to shut down.
    Serve,
    /// Write the default configuration to the --config path.
    InitConfig {
        #[arg(long)]
        force: bool,
    },
    Status,
    /// Send a prompt straight to the outbound provider.
    Query {
        prompt: String,
        /// Assert the prompt has already been sanitized.
        #[arg(long)]
        sanitized: bool,
    },
    /// Research a topic; the summary arrives later as a `note` notification.
    Research { topic: String },
    /// Find sources for a topic; the list arrives later as a `sources` notification.
    Sources { topic: String },
    /// Ingest files under the configured allowed roots.
    Ingest {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Ingest the contents of a text file, chunked if it is too large for one frame.
    IngestText {
        file: PathBuf,
        #[arg(long, default_value = "")]
        topic: String,
        /// Defaults to the file path.
        #[arg(long)]
        source: Option<String>,
    },
    /// Abandon a pending chunked upload.
    Cancel { request_id: String },
    /// List ingested documents grouped by file type.
    Catalog,
    Shutdown,
    /// Print pushed notifications as JSON lines.
    Listen {
        /// Overrides the configured callback address.
        #[arg(long)]
        address: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = LibrarianConfig::load_from(&cli.config)
        .with_context(|| format!("load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Serve => daemon::run_serve(config, Path::new(daemon::RUNTIME_DIR)).await,
        Commands::InitConfig { force } => init_config(&cli.config, force),
        Commands::Listen { address } => {
            let _guard = init_tracing(&config, None)?;
            listen(&config, address).await
        }
        command => {
            let _guard = init_tracing(&config, None)?;
            run_request(&config, command).await
        }
    }
}

/// Stderr always; a daily-rolling file as well when `log_dir` is given.
/// `RUST_LOG` wins over the configured level.
pub(crate) fn init_tracing(
    config: &LibrarianConfig,
    log_dir: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.telemetry.log_level))?;
    let stderr = fmt::layer().with_writer(std::io::stderr);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr)
            .try_init()?;
        return Ok(None);
    };

    let appender = tracing_appender::rolling::daily(dir, "librarian.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()?;
    Ok(Some(guard))
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        );
    }
    LibrarianConfig::default().save_to(path)?;
    println!("wrote default configuration to {}", path.display());
    Ok(())
}

async fn run_request(config: &LibrarianConfig, command: Commands) -> Result<()> {
    let options = ClientOptions::from_config(config);
    let address = options.address.clone();
    let mut client = LibrarianClient::new(options);

    let outcome = match command {
        Commands::Status => client.status().await,
        Commands::Query { prompt, sanitized } => client.cloud_query(&prompt, sanitized).await,
        Commands::Research { topic } => client.research(&topic).await,
        Commands::Sources { topic } => client.sources(&topic).await,
        Commands::Ingest { paths } => client.ingest_paths(paths).await,
        Commands::IngestText {
            file,
            topic,
            source,
        } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("read {}", file.display()))?;
            let source = source.unwrap_or_else(|| file.display().to_string());
            client.ingest_text(&text, &topic, &source).await
        }
        Commands::Cancel { request_id } => client.cancel(&request_id).await,
        Commands::Catalog => client.card_catalog().await,
        Commands::Shutdown => client.shutdown().await,
        Commands::Serve | Commands::InitConfig { .. } | Commands::Listen { .. } => {
            bail!("not a request command")
        }
    };
    client.close();

    let response = match outcome {
        Ok(response) => response,
        Err(err) if err.is_network() => bail!("librarian is not reachable at {address}: {err}"),
        Err(err) => return Err(err.into()),
    };
    if response.is_success() && response.result.get("running").is_some() {
        print_status(&response.result);
        return Ok(());
    }
    report(&response)
}

fn report(response: &Response) -> Result<()> {
    if !response.is_success() {
        bail!("{}: {}", response.outcome(), response.message);
    }
    if !response.message.is_empty() {
        println!("{}", response.message);
    }
    if !response.result.is_null() {
        println!("{}", serde_json::to_string_pretty(&response.result)?);
    }
    Ok(())
}

fn field(result: &Value, key: &str) -> String {
    match result.get(key) {
        None | Some(Value::Null) => "(never)".to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn print_status(result: &Value) {
    println!("librarian status: running");
    if let Ok(Some(pid)) = daemon::read_pid(&daemon::RuntimePaths::under(daemon::RUNTIME_DIR).pid_file)
    {
        println!("- pid: {pid}");
    }
    println!("- started_at       : {}", field(result, "started_at"));
    println!("- uptime_secs      : {}", field(result, "uptime_secs"));
    println!("- requests_handled : {}", field(result, "requests_handled"));
    println!("- last_request_at  : {}", field(result, "last_request_at"));
    println!("- last_heartbeat_at: {}", field(result, "last_heartbeat_at"));
    println!("- pending_uploads  : {}", field(result, "pending_uploads"));
    println!("- local_only       : {}", field(result, "local_only"));
    println!("- allow_outbound   : {}", field(result, "allow_outbound"));
    if let Some(policy) = result.get("policy") {
        println!("── outbound policy ───────────────────────────────────");
        println!("  failure_count : {}", field(policy, "failure_count"));
        println!("  backoff_until : {}", field(policy, "backoff_until"));
        println!("  breaker_until : {}", field(policy, "breaker_until"));
    }
}

async fn listen(config: &LibrarianConfig, address: Option<String>) -> Result<()> {
    let address = match address {
        Some(address) => address,
        None if config.callback.enabled() => config.callback.address(),
        None => bail!(
            "callback.port is 0; set it (or LIBRARIAN_CALLBACK_PORT) so the Librarian knows where to push"
        ),
    };
    let listener = NotificationListener::bind(&address, config.limits.max_message_bytes).await?;
    eprintln!("listening for notifications on {}", listener.local_addr()?);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(listener.run(tx));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = rx.recv() => match received {
                Some(notification) => println!("{}", serde_json::to_string(&notification)?),
                None => break,
            }
        }
    }
    drop(rx);
    task.await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use librarian_runtime::ErrorCode;
    use serde_json::json;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_query_with_global_config() {
        let cli = Cli::try_parse_from([
            "librarian",
            "query",
            "what is pinning",
            "--sanitized",
            "--config",
            "alt.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
        assert!(matches!(
            cli.command,
            Commands::Query { ref prompt, sanitized: true } if prompt == "what is pinning"
        ));
    }

    #[test]
    fn catalog_takes_no_arguments() {
        let cli = Cli::try_parse_from(["librarian", "catalog"]).unwrap();
        assert!(matches!(cli.command, Commands::Catalog));
        assert!(Cli::try_parse_from(["librarian", "catalog", "extra"]).is_err());
    }

    #[test]
    fn ingest_requires_a_path() {
        assert!(Cli::try_parse_from(["librarian", "ingest"]).is_err());
    }

    #[test]
    fn report_turns_error_envelope_into_error() {
        let rejected = Response::error(
            Some("r".into()),
            ErrorCode::BreakerOpen,
            "breaker open until later",
        );
        let err = report(&rejected).unwrap_err();
        assert!(err.to_string().starts_with("breaker_open"));

        let accepted = Response::success(Some("r".into()), "ok", json!({"count": 2}));
        assert!(report(&accepted).is_ok());
    }

    #[test]
    fn status_fields_render_nulls_as_never() {
        let result = json!({"last_request_at": null, "uptime_secs": 5, "started_at": "t"});
        assert_eq!(field(&result, "last_request_at"), "(never)");
        assert_eq!(field(&result, "uptime_secs"), "5");
        assert_eq!(field(&result, "started_at"), "t");
    }

    #[test]
    fn init_config_refuses_to_clobber() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config").join("librarian.toml");
        init_config(&path, false).unwrap();
        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();
        let loaded = LibrarianConfig::load_from(&path).unwrap();
        assert_eq!(loaded.server.port, LibrarianConfig::default().server.port);
    }
}
