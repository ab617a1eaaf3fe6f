//! Core application

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::api::{ApiServer, OtlpGrpcServer};
use crate::core::banner::{self, BannerPipeline};
use crate::core::cli::{self, CliConfig, Commands, LogFormat, QueueCommands};
use crate::core::config::{AppConfig, PipelineConfig};
use crate::core::constants::{APP_NAME_LOWER, ENV_LOG};
use crate::core::shutdown::ShutdownService;
use crate::core::storage::{AppStorage, DataSubdir};
use crate::data::DurableQueue;
use crate::domain::{HealthMonitor, IngressReceiver, PipelineRegistry, PipelineRouter, SysinfoProbe};
use crate::utils::file::dir_size;
use crate::utils::time::millis_to_iso;

pub struct CoreApp {
    pub shutdown: ShutdownService,
    pub config: AppConfig,
    pub storage: AppStorage,
    pub monitor: Arc<HealthMonitor>,
    pub pipelines: Arc<PipelineRegistry>,
    pub receiver: Arc<IngressReceiver>,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        let (cli_config, command) = cli::parse();
        Self::init_logging(cli_config.log_format.unwrap_or_default());

        tracing::trace!(command = ?command, "Parsed command");

        match command {
            Some(Commands::Queue { command }) => {
                return Self::handle_queue_command(&cli_config, command).await;
            }
            Some(Commands::Start) | None => {}
        }

        let app = Self::init(&cli_config).await?;
        app.start_server().await
    }

    async fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;
        let storage = AppStorage::init(&config).await?;
        let shutdown = ShutdownService::new();

        let monitor = Arc::new(HealthMonitor::new(
            &config.health,
            Box::new(SysinfoProbe::new()),
        ));
        let pipelines = Arc::new(PipelineRegistry::open(
            &config.pipelines,
            &storage.subdir(DataSubdir::Queue),
            &storage.subdir(DataSubdir::DeadLetter),
            &monitor,
        )?);

        let debug_path = config.debug.then(|| storage.subdir(DataSubdir::Debug));
        let receiver = Arc::new(IngressReceiver::new(
            PipelineRouter::new(&config.routing, &config.pipelines),
            Arc::clone(&pipelines),
            Arc::clone(&monitor),
            &config.ingress,
            debug_path,
            shutdown.subscribe(),
        ));

        Ok(Self {
            shutdown,
            config,
            storage,
            monitor,
            pipelines,
            receiver,
        })
    }

    async fn handle_queue_command(cli: &CliConfig, cmd: QueueCommands) -> Result<()> {
        let config = AppConfig::load(cli)?;
        let storage = AppStorage::init(&config).await?;
        match cmd {
            QueueCommands::Inspect { pipeline } => {
                let pipelines = select_pipelines(&config, pipeline.as_deref())?;
                Self::inspect_queues(&storage, &pipelines)
            }
            QueueCommands::Purge { pipeline, yes } => {
                let pipelines = select_pipelines(&config, pipeline.as_deref())?;
                Self::purge_queues(&storage, &pipelines, yes)
            }
        }
    }

    fn inspect_queues(storage: &AppStorage, pipelines: &[&PipelineConfig]) -> Result<()> {
        for pipeline in pipelines {
            let dir = storage.queue_dir(&pipeline.name);
            let entries = DurableQueue::inspect(&pipeline.name, &dir)
                .with_context(|| format!("Failed to read queue: {}", dir.display()))?;
            let disk_bytes = dir_size(&dir)
                .with_context(|| format!("Failed to stat queue: {}", dir.display()))?;
            let payload_bytes: u64 = entries.iter().map(|e| e.size()).sum();

            println!("{}", pipeline.name);
            println!("  endpoint:    {}", pipeline.exporter.endpoint);
            println!("  pending:     {} entries, {} bytes", entries.len(), payload_bytes);
            println!("  on disk:     {} bytes", disk_bytes);
            if let Some(head) = entries.first() {
                println!("  oldest:      {}", millis_to_iso(head.enqueued_at_ms));
                println!(
                    "  head:        batch {} ({}), {} retries",
                    head.batch_seq, head.kind, head.retry_count
                );
            }
            if let Some(max) = entries.iter().map(|e| e.retry_count).max()
                && max > 0
            {
                let retrying = entries.iter().filter(|e| e.retry_count > 0).count();
                println!("  retrying:    {} entries, max {} retries", retrying, max);
            }
        }
        Ok(())
    }

    fn purge_queues(
        storage: &AppStorage,
        pipelines: &[&PipelineConfig],
        skip_confirm: bool,
    ) -> Result<()> {
        let dirs: Vec<_> = pipelines
            .iter()
            .map(|p| storage.queue_dir(&p.name))
            .filter(|dir| dir.exists())
            .collect();

        if dirs.is_empty() {
            println!("Nothing to purge.");
            return Ok(());
        }

        println!("This will permanently delete queued, undelivered telemetry in:");
        for dir in &dirs {
            println!("  {}", dir.display());
        }
        println!();
        println!(
            "Make sure the collector is not running. \
             Purging while it runs will corrupt its queues."
        );

        if !skip_confirm {
            print!("\nContinue? [y/N] ");
            std::io::Write::flush(&mut std::io::stdout())?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;

            if !matches!(input.trim().to_lowercase().as_str(), "y" | "yes") {
                println!("Aborted.");
                return Ok(());
            }
        }

        for dir in dirs {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to delete queue: {}", dir.display()))?;
            println!("Purged: {}", dir.display());
        }
        Ok(())
    }

    fn init_logging(format: LogFormat) {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        match format {
            LogFormat::Compact => tracing_subscriber::fmt()
                .with_target(false)
                .with_thread_ids(false)
                .with_level(true)
                .with_ansi(true)
                .compact()
                .with_env_filter(filter)
                .init(),
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_current_span(false)
                .with_env_filter(filter)
                .init(),
        }
    }

    async fn start_server(self) -> Result<()> {
        // Install signal handlers FIRST (before any blocking calls)
        self.shutdown.install_signal_handlers();

        self.start_background_tasks().await;

        if self.config.grpc.enabled {
            let grpc_server = OtlpGrpcServer::new(
                &self.config.server.host,
                self.config.grpc.port,
                Arc::clone(&self.receiver),
                &self.config.ingress,
            )?;
            let shutdown_rx = self.shutdown.subscribe();
            let handle = tokio::spawn(async move {
                if let Err(e) = grpc_server.start(shutdown_rx).await {
                    tracing::error!(error = %e, "OTLP gRPC server error");
                }
            });
            self.shutdown.register(handle).await;
        }

        let server = ApiServer::new(
            &self.config.server.host,
            self.config.server.port,
            Arc::clone(&self.receiver),
            &self.config.ingress,
        )?;

        self.monitor.set_ready(true);
        self.print_banner();

        let result = server.start(&self.shutdown).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "OTLP HTTP server error");
        }

        self.monitor.set_ready(false);
        self.shutdown.shutdown().await;
        result
    }

    async fn start_background_tasks(&self) {
        self.monitor.evaluate();
        self.shutdown
            .register(self.monitor.start(
                Duration::from_millis(self.config.health.check_interval_ms),
                self.shutdown.subscribe(),
            ))
            .await;

        for handle in self.pipelines.start(&self.shutdown.subscribe()) {
            self.shutdown.register(handle).await;
        }

        tracing::debug!(pipelines = self.pipelines.len(), "Background tasks started");
    }

    fn print_banner(&self) {
        let pipelines: Vec<BannerPipeline<'_>> = self
            .pipelines
            .iter()
            .map(|p| BannerPipeline {
                name: p.name(),
                endpoint: &p.config().exporter.endpoint,
                pending: p.queue().len(),
            })
            .collect();

        banner::print_banner(
            &self.config.server.host,
            self.config.server.port,
            self.config.grpc.enabled.then_some(self.config.grpc.port),
            &self.storage.data_dir().display().to_string(),
            &pipelines,
        );
    }
}

/// Configured pipelines, or only the named one
fn select_pipelines<'a>(
    config: &'a AppConfig,
    name: Option<&str>,
) -> Result<Vec<&'a PipelineConfig>> {
    match name {
        Some(name) => match config.pipeline(name) {
            Some(pipeline) => Ok(vec![pipeline]),
            None => anyhow::bail!("Unknown pipeline: {}", name),
        },
        None => Ok(config.pipelines.iter().collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{GrpcConfig, ServerConfig, default_pipelines};
    use crate::data::queue::QueueError;
    use crate::domain::SignalKind;

    fn config() -> AppConfig {
        let (pipelines, routing) = default_pipelines("http://127.0.0.1:14318");
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 4318,
            },
            grpc: GrpcConfig {
                enabled: false,
                port: 4317,
            },
            ingress: Default::default(),
            health: Default::default(),
            routing,
            pipelines,
            data_dir: None,
            debug: false,
        }
    }

    #[test]
    fn test_select_pipelines() {
        let config = config();
        assert_eq!(select_pipelines(&config, None).unwrap().len(), 3);
        let logs = select_pipelines(&config, Some("logs")).unwrap();
        assert_eq!(logs[0].name, "logs");
        assert!(select_pipelines(&config, Some("nope")).is_err());
    }

    #[test]
    fn test_purge_removes_only_selected_queue() -> Result<(), QueueError> {
        let dir = tempfile::tempdir().unwrap();
        let storage = AppStorage::init_for_test(dir.path().to_path_buf());
        let config = config();

        for pipeline in &config.pipelines {
            let queue = DurableQueue::open(
                &pipeline.name,
                &storage.queue_dir(&pipeline.name),
                pipeline.queue.clone(),
            )?;
            queue.enqueue(1, SignalKind::Logs, bytes::Bytes::from_static(b"x"), 1)?;
        }

        let logs = select_pipelines(&config, Some("logs")).unwrap();
        CoreApp::purge_queues(&storage, &logs, true).unwrap();

        assert!(!storage.queue_dir("logs").exists());
        assert_eq!(
            DurableQueue::inspect("traces", &storage.queue_dir("traces"))?.len(),
            1
        );
        Ok(())
    }
}
