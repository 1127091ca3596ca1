use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tcloud::cache::TtlCache;
use tcloud::config::Config;
use tcloud::gcp::client::GcpClient;
use tcloud::gcp::http::{format_api_error, is_cancellation};
use tcloud::gcp::projects;
use tcloud::service::{register_resource_services, ResourceKind, ServiceRegistry};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Terminal dashboard for GCP
#[derive(Parser, Debug)]
#[command(name = "tcloud", version = tcloud::VERSION, about, long_about = None)]
struct Args {
    /// GCP project to use
    #[arg(short, long)]
    project: Option<String>,

    /// GCP zone to use ("all" for every zone)
    #[arg(short, long)]
    zone: Option<String>,

    /// Resource to list (see --list-resources)
    #[arg(short, long)]
    resource: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "json")]
    output: OutputFormat,

    /// Re-fetch every N seconds until Ctrl-C
    #[arg(short, long)]
    watch: Option<u64>,

    /// Print the resource kinds and exit
    #[arg(long)]
    list_resources: bool,

    /// Print accessible projects and exit
    #[arg(long)]
    list_projects: bool,

    /// Log level for debugging
    #[arg(long, value_enum, default_value = "off")]
    log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Yaml,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn setup_logging(level: LogLevel) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let tracing_level = level.to_tracing_level()?;

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Logging disabled: cannot open {:?}: {}", log_path, e);
            return None;
        }
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_max_level(tracing_level)
        .with_writer(non_blocking.with_max_level(tracing_level))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("tcloud started with log level: {:?}", level);
    tracing::info!("Log file: {:?}", log_path);

    Some(guard)
}

fn get_log_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("tcloud").join("tcloud.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".tcloud").join("tcloud.log");
    }
    PathBuf::from("tcloud.log")
}

fn render(items: &[Value], format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Json => serde_json::to_string_pretty(items)?,
        OutputFormat::Yaml => serde_yaml::to_string(items)?,
    })
}

/// Fetch one resource list through the registry and print it
async fn show(
    registry: &ServiceRegistry,
    kind: ResourceKind,
    format: OutputFormat,
    cancel: &CancellationToken,
) -> Result<()> {
    let handle = registry.get_or_initialize(kind.key(), cancel).await?;
    let service = handle.into_result()?;

    let items = service.fetch(cancel).await?;
    tracing::info!("{}: {} items", kind.display_name(), items.len());
    println!("{}", render(&items, format)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_guard = setup_logging(args.log_level);

    if args.list_resources {
        for kind in ResourceKind::ALL {
            println!("{:<20} {}", kind.key(), kind.display_name());
        }
        return Ok(());
    }

    let mut config = Config::load();
    let project = args
        .project
        .clone()
        .unwrap_or_else(|| config.effective_project());
    let zone = args.zone.clone().unwrap_or_else(|| config.effective_zone());

    if project.is_empty() {
        anyhow::bail!("No GCP project configured. Set GOOGLE_CLOUD_PROJECT or use --project flag");
    }

    let resource_key = args
        .resource
        .clone()
        .or_else(|| config.last_resource.clone())
        .unwrap_or_else(|| ResourceKind::ComputeInstances.key().to_string());
    let kind = ResourceKind::from_key(&resource_key)
        .with_context(|| format!("Unknown resource: {} (see --list-resources)", resource_key))?;

    tracing::info!("Using project: {}, zone: {}", project, zone);

    let client = GcpClient::connect(&config.api, &project, &zone).await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, cancelling in-flight requests");
                cancel.cancel();
            }
        });
    }

    if args.list_projects {
        match projects::list_project_ids(&client, &cancel).await {
            Ok(ids) => ids.iter().for_each(|id| println!("{}", id)),
            Err(e) if e.is_cancelled() => {}
            Err(e) => return Err(e).context("Failed to list projects"),
        }
        return Ok(());
    }

    let registry = ServiceRegistry::new(Arc::new(TtlCache::new()), &project);
    register_resource_services(&registry, &client, config.api.cache_ttl()).await;

    if let Err(e) = config.remember(&project, &zone, kind.key()) {
        tracing::warn!("Failed to save config: {}", e);
    }

    let mut failed = false;
    loop {
        match show(&registry, kind, args.output, &cancel).await {
            Ok(()) => {}
            // Ctrl-C is not an error
            Err(e) if is_cancellation(&e) => break,
            Err(e) => {
                tracing::error!("{:#}", e);
                eprintln!("Error: {}", format_api_error(&e));
                failed = true;
            }
        }

        let Some(secs) = args.watch else {
            break;
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(secs.max(1))) => {}
        }
        failed = false;
    }

    drop(log_guard);
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
