use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use billy_adapters::HttpAdapterFactory;
use billy_core::{from_unix_seconds, SourceKind};
use billy_storage::{CatalogStore, HttpFetcher, MemoryCatalog, PgCatalog};
use billy_sync::{
    describe_metrics, import_sources, load_seed_file, IngestConfig, Merger, Scheduler,
    SourceRegistry,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "billy")]
#[command(about = "Track ingestion: polls sources and keeps a deduplicated catalog")]
struct Cli {
    /// Use an in-memory catalog seeded from the sources file instead of Postgres.
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll due sources every interval until Ctrl-C.
    Run {
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Run a single cycle and print its summary.
    Once {
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Apply database migrations.
    Migrate,
    /// Register one source. Registering an existing source is a no-op.
    AddSource {
        #[arg(long)]
        kind: SourceKind,
        locator: String,
    },
    /// Register every source listed in a YAML or JSON file.
    ImportSources { file: Option<PathBuf> },
    /// List registered sources with their watermarks.
    Sources,
    /// Track counts per link protocol.
    Stats,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

struct App {
    config: IngestConfig,
    store: Arc<dyn CatalogStore>,
    http: Arc<HttpFetcher>,
    factory: HttpAdapterFactory,
}

impl App {
    async fn open(config: IngestConfig, memory: bool) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let factory = HttpAdapterFactory::new(http.clone(), config.adapter_settings());
        let store: Arc<dyn CatalogStore> = if memory {
            Arc::new(MemoryCatalog::new())
        } else {
            Arc::new(
                PgCatalog::connect(&config.database_url)
                    .await
                    .context("connecting to catalog database")?,
            )
        };
        let app = Self {
            config,
            store,
            http,
            factory,
        };
        if memory {
            app.seed_memory_catalog().await?;
        }
        Ok(app)
    }

    /// A fresh in-memory catalog has no sources; pull them from the seed file when present.
    async fn seed_memory_catalog(&self) -> Result<()> {
        let path = &self.config.sources_file;
        if !path.exists() {
            warn!(path = %path.display(), "no sources file; in-memory catalog starts empty");
            return Ok(());
        }
        let seeds = load_seed_file(path).await?;
        let mut registry = SourceRegistry::new();
        import_sources(&mut registry, self.store.as_ref(), &self.factory, &seeds).await?;
        Ok(())
    }

    async fn scheduler(&self, workers: Option<usize>, interval_secs: Option<u64>) -> Result<Scheduler> {
        let mut config = self.config.scheduler_config();
        if let Some(workers) = workers {
            config.workers = workers.max(1);
        }
        if let Some(secs) = interval_secs {
            config.check_interval = std::time::Duration::from_secs(secs);
        }
        let registry = SourceRegistry::load(self.store.as_ref(), &self.factory)
            .await
            .context("loading sources")?;
        let merger = Merger::new(self.store.clone(), self.config.notifier(self.http.clone()));
        Ok(Scheduler::new(registry, self.store.clone(), merger, config))
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        trigger.cancel();
    });
    cancel
}

fn format_watermark(ts: i64) -> String {
    if ts <= 0 {
        return "never".to_string();
    }
    from_unix_seconds(ts)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    describe_metrics();
    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Once { workers: None }) {
        Commands::Migrate => {
            let catalog = PgCatalog::connect(&config.database_url)
                .await
                .context("connecting to catalog database")?;
            catalog.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Run {
            workers,
            interval_secs,
        } => {
            let app = App::open(config, cli.memory).await?;
            let mut scheduler = app.scheduler(workers, interval_secs).await?;
            scheduler.run(shutdown_on_ctrl_c()).await;
        }
        Commands::Once { workers } => {
            let app = App::open(config, cli.memory).await?;
            let mut scheduler = app.scheduler(workers, None).await?;
            let summary = scheduler.run_cycle(&shutdown_on_ctrl_c()).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::AddSource { kind, locator } => {
            let app = App::open(config, cli.memory).await?;
            let source = app
                .store
                .register_source(kind, locator.trim())
                .await
                .context("registering source")?;
            println!("{} {}", source.id, source.label());
        }
        Commands::ImportSources { file } => {
            let path = file.unwrap_or_else(|| config.sources_file.clone());
            let app = App::open(config, cli.memory).await?;
            let seeds = load_seed_file(&path).await?;
            let mut registry = SourceRegistry::load(app.store.as_ref(), &app.factory).await?;
            let ids = import_sources(&mut registry, app.store.as_ref(), &app.factory, &seeds).await?;
            println!("{} sources listed, {} registered in total", ids.len(), registry.len());
        }
        Commands::Sources => {
            let app = App::open(config, cli.memory).await?;
            let mut sources = app.store.get_sources().await?;
            sources.sort_by(|a, b| a.kind.as_str().cmp(b.kind.as_str()).then(a.locator.cmp(&b.locator)));
            for source in sources {
                println!(
                    "{}  {:<8}  {:<25}  {}",
                    source.id,
                    source.kind.as_str(),
                    format_watermark(source.watermark),
                    source.locator
                );
            }
        }
        Commands::Stats => {
            let app = App::open(config, cli.memory).await?;
            let counts = app.store.track_counts_by_protocol().await?;
            let total: u64 = counts.values().sum();
            for (protocol, count) in &counts {
                println!("{protocol:<12} {count}");
            }
            println!("{:<12} {total}", "total");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_add_source() {
        let cli = Cli::try_parse_from(["billy", "add-source", "--kind", "playlist", "PLxyz"]).unwrap();
        match cli.command {
            Some(Commands::AddSource { kind, locator }) => {
                assert_eq!(kind, SourceKind::Playlist);
                assert_eq!(locator, "PLxyz");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn memory_flag_is_global() {
        let cli = Cli::try_parse_from(["billy", "run", "--memory", "--workers", "2"]).unwrap();
        assert!(cli.memory);
        assert!(matches!(
            cli.command,
            Some(Commands::Run {
                workers: Some(2),
                interval_secs: None
            })
        ));
    }

    #[test]
    fn unknown_kind_is_a_usage_error() {
        assert!(Cli::try_parse_from(["billy", "add-source", "--kind", "podcast", "x"]).is_err());
    }

    #[test]
    fn watermark_zero_reads_as_never() {
        assert_eq!(format_watermark(0), "never");
        assert!(format_watermark(1_704_196_800).starts_with("2024-01-02T12:00:00"));
    }
}
