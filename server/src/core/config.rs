use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::{AttrValue, SignalKind};
use crate::utils::file::expand_path;

use super::cli::CliConfig;
use super::constants::{
    APP_DOT_FOLDER, CONFIG_FILE_NAME, DEFAULT_BATCH_TIMEOUT_MS, DEFAULT_DECODE_TIMEOUT_MS,
    DEFAULT_EXPORT_TIMEOUT_MS, DEFAULT_EXPORTER_ENDPOINT, DEFAULT_GRPC_PORT,
    DEFAULT_HEALTH_CHECK_INTERVAL_MS, DEFAULT_HOST, DEFAULT_HYSTERESIS_PERCENT, DEFAULT_MAX_RETRIES,
    DEFAULT_MEMORY_HARD_PERCENT, DEFAULT_MEMORY_SOFT_PERCENT, DEFAULT_MIN_LOG_SEVERITY,
    DEFAULT_PORT, DEFAULT_QUEUE_COMPACT_AFTER, DEFAULT_QUEUE_HARD_PERCENT,
    DEFAULT_QUEUE_MAX_BYTES, DEFAULT_QUEUE_MAX_ENTRIES, DEFAULT_RETRY_INITIAL_MS,
    DEFAULT_RETRY_JITTER, DEFAULT_RETRY_MAX_MS, DEFAULT_RETRY_MULTIPLIER, DEFAULT_SEND_BATCH_SIZE,
    DEFAULT_TENANT_HEADER, OTLP_BODY_LIMIT,
};

// =============================================================================
// Pipeline Enums
// =============================================================================

/// When queue log appends are flushed to stable storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FsyncPolicy {
    /// fsync after every append (survives power loss)
    #[default]
    Always,
    /// Leave flushing to the OS (survives process crashes only)
    Never,
}

/// What happens to entries the exporter gives up on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterPolicy {
    /// Log and discard
    Drop,
    /// Append to `deadletter/<pipeline>.jsonl`
    #[default]
    File,
}

/// Export transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportProtocol {
    #[default]
    Http,
    Grpc,
}

impl fmt::Display for ExportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportProtocol::Http => write!(f, "http"),
            ExportProtocol::Grpc => write!(f, "grpc"),
        }
    }
}

/// Transport security for the exporter connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportSecurity {
    Insecure,
    Tls,
    TlsSkipVerify,
}

/// Attribute processor action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeActionKind {
    /// Set only if absent
    Insert,
    /// Set only if present
    Update,
    /// Always set
    Upsert,
    Delete,
    /// Fail the batch if absent
    Require,
}

impl AttributeActionKind {
    fn needs_value(self) -> bool {
        matches!(
            self,
            AttributeActionKind::Insert | AttributeActionKind::Update | AttributeActionKind::Upsert
        )
    }
}

// =============================================================================
// Pipeline Config (JSON and runtime)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AttributeAction {
    pub key: String,
    pub action: AttributeActionKind,
    #[serde(default)]
    pub value: Option<AttrValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AttributesConfig {
    #[serde(default)]
    pub actions: Vec<AttributeAction>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ShedderConfig {
    /// Signal kinds in the order they are shed
    pub priority: Vec<SignalKind>,
    /// How many kinds from the front of `priority` are shed under pressure
    pub shed_kinds: usize,
    /// Log records below this severity number are shed
    pub min_log_severity: i32,
}

impl Default for ShedderConfig {
    fn default() -> Self {
        Self {
            priority: vec![SignalKind::Logs, SignalKind::Metrics, SignalKind::Traces],
            shed_kinds: 1,
            min_log_severity: DEFAULT_MIN_LOG_SEVERITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    pub send_batch_size: usize,
    pub timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            send_batch_size: DEFAULT_SEND_BATCH_SIZE,
            timeout_ms: DEFAULT_BATCH_TIMEOUT_MS,
        }
    }
}

/// One processor stage
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorConfig {
    Attributes(AttributesConfig),
    MemoryShedder(ShedderConfig),
    Batch(BatchConfig),
}

impl ProcessorConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            ProcessorConfig::Attributes(_) => "attributes",
            ProcessorConfig::MemoryShedder(_) => "memory_shedder",
            ProcessorConfig::Batch(_) => "batch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_entries: usize,
    pub max_bytes: u64,
    pub fsync: FsyncPolicy,
    /// Dead log records tolerated before compaction
    pub compact_after: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_QUEUE_MAX_ENTRIES,
            max_bytes: DEFAULT_QUEUE_MAX_BYTES,
            fsync: FsyncPolicy::default(),
            compact_after: DEFAULT_QUEUE_COMPACT_AFTER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExporterConfig {
    #[serde(default)]
    pub protocol: ExportProtocol,
    pub endpoint: String,
    #[serde(default = "default_export_timeout_ms")]
    pub timeout_ms: u64,
    /// Derived from the endpoint scheme when absent
    #[serde(default)]
    pub security: Option<TransportSecurity>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_export_timeout_ms() -> u64 {
    DEFAULT_EXPORT_TIMEOUT_MS
}

impl ExporterConfig {
    pub fn http(endpoint: &str) -> Self {
        Self {
            protocol: ExportProtocol::Http,
            endpoint: endpoint.to_string(),
            timeout_ms: DEFAULT_EXPORT_TIMEOUT_MS,
            security: None,
            headers: BTreeMap::new(),
        }
    }

    /// Effective transport security
    pub fn security(&self) -> TransportSecurity {
        self.security.unwrap_or_else(|| {
            if self.endpoint.starts_with("https://") {
                TransportSecurity::Tls
            } else {
                TransportSecurity::Insecure
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    /// Random extra delay as a fraction of the computed delay, in [0, 1]
    pub jitter: f64,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_ms: DEFAULT_RETRY_INITIAL_MS,
            max_ms: DEFAULT_RETRY_MAX_MS,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            jitter: DEFAULT_RETRY_JITTER,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub policy: DeadLetterPolicy,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub name: String,
    pub signals: Vec<SignalKind>,
    #[serde(default)]
    pub processors: Vec<ProcessorConfig>,
    #[serde(default)]
    pub queue: QueueConfig,
    pub exporter: ExporterConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
}

/// Routes batches to the first rule whose conditions all hold
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RoutingRule {
    pub pipeline: String,
    #[serde(default)]
    pub signal: Option<SignalKind>,
    /// Resource attribute equality conditions
    #[serde(default, rename = "match")]
    pub match_attrs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
    #[serde(default)]
    pub fallback: Option<String>,
}

/// One pipeline per signal kind, each routed by signal to `endpoint`
pub fn default_pipelines(endpoint: &str) -> (Vec<PipelineConfig>, RoutingConfig) {
    let pipelines: Vec<PipelineConfig> = [SignalKind::Traces, SignalKind::Metrics, SignalKind::Logs]
        .into_iter()
        .map(|kind| PipelineConfig {
            name: kind.as_str().to_string(),
            signals: vec![kind],
            processors: vec![
                ProcessorConfig::MemoryShedder(ShedderConfig::default()),
                ProcessorConfig::Batch(BatchConfig::default()),
            ],
            queue: QueueConfig::default(),
            exporter: ExporterConfig::http(endpoint),
            retry: RetryConfig::default(),
            dead_letter: DeadLetterConfig::default(),
        })
        .collect();

    let rules = pipelines
        .iter()
        .map(|p| RoutingRule {
            pipeline: p.name.clone(),
            signal: p.signals.first().copied(),
            match_attrs: BTreeMap::new(),
        })
        .collect();

    (
        pipelines,
        RoutingConfig {
            rules,
            fallback: None,
        },
    )
}

// =============================================================================
// File Config Structs (JSON deserialization)
// =============================================================================

/// Server configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// gRPC receiver configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct GrpcFileConfig {
    pub enabled: Option<bool>,
    pub port: Option<u16>,
}

/// Ingress configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct IngressFileConfig {
    pub decode_timeout_ms: Option<u64>,
    pub max_body_bytes: Option<usize>,
    pub tenant_header: Option<String>,
}

/// Health monitor configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct HealthFileConfig {
    pub memory_limit_mb: Option<u64>,
    pub memory_soft_percent: Option<f64>,
    pub memory_hard_percent: Option<f64>,
    pub hysteresis_percent: Option<f64>,
    pub queue_hard_percent: Option<f64>,
    pub check_interval_ms: Option<u64>,
}

/// File-based configuration (JSON)
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub server: Option<ServerFileConfig>,
    pub grpc: Option<GrpcFileConfig>,
    pub ingress: Option<IngressFileConfig>,
    pub health: Option<HealthFileConfig>,
    pub routing: Option<RoutingConfig>,
    pub pipelines: Option<Vec<PipelineConfig>>,
    pub data_dir: Option<String>,
    pub debug: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

impl FileConfig {
    /// Load configuration from a JSON file
    fn load_from_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Loading config file");
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        tracing::trace!(config = ?config, "Parsed config file");
        Ok(config)
    }

    /// Warn about unknown fields in the config
    fn warn_unknown_fields(&self) {
        if let serde_json::Value::Object(map) = &self.extra
            && !map.is_empty()
        {
            let keys_str: String = map
                .keys()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(
                fields = %keys_str,
                "Unknown fields in config file (possible typos)"
            );
        }
    }

    /// Merge another FileConfig into this one (other takes precedence).
    /// `routing` and `pipelines` are replaced as a whole.
    fn merge(&mut self, other: FileConfig) {
        if let Some(server) = other.server {
            let current = self.server.get_or_insert_with(ServerFileConfig::default);
            if server.host.is_some() {
                tracing::trace!(host = ?server.host, "Merging server.host");
                current.host = server.host;
            }
            if server.port.is_some() {
                tracing::trace!(port = ?server.port, "Merging server.port");
                current.port = server.port;
            }
        }

        if let Some(grpc) = other.grpc {
            let current = self.grpc.get_or_insert_with(GrpcFileConfig::default);
            if grpc.enabled.is_some() {
                tracing::trace!(enabled = ?grpc.enabled, "Merging grpc.enabled");
                current.enabled = grpc.enabled;
            }
            if grpc.port.is_some() {
                tracing::trace!(port = ?grpc.port, "Merging grpc.port");
                current.port = grpc.port;
            }
        }

        if let Some(ingress) = other.ingress {
            let current = self.ingress.get_or_insert_with(IngressFileConfig::default);
            if ingress.decode_timeout_ms.is_some() {
                tracing::trace!(decode_timeout_ms = ?ingress.decode_timeout_ms, "Merging ingress.decode_timeout_ms");
                current.decode_timeout_ms = ingress.decode_timeout_ms;
            }
            if ingress.max_body_bytes.is_some() {
                tracing::trace!(max_body_bytes = ?ingress.max_body_bytes, "Merging ingress.max_body_bytes");
                current.max_body_bytes = ingress.max_body_bytes;
            }
            if ingress.tenant_header.is_some() {
                tracing::trace!(tenant_header = ?ingress.tenant_header, "Merging ingress.tenant_header");
                current.tenant_header = ingress.tenant_header;
            }
        }

        if let Some(health) = other.health {
            let current = self.health.get_or_insert_with(HealthFileConfig::default);
            if health.memory_limit_mb.is_some() {
                tracing::trace!(memory_limit_mb = ?health.memory_limit_mb, "Merging health.memory_limit_mb");
                current.memory_limit_mb = health.memory_limit_mb;
            }
            if health.memory_soft_percent.is_some() {
                tracing::trace!(memory_soft_percent = ?health.memory_soft_percent, "Merging health.memory_soft_percent");
                current.memory_soft_percent = health.memory_soft_percent;
            }
            if health.memory_hard_percent.is_some() {
                tracing::trace!(memory_hard_percent = ?health.memory_hard_percent, "Merging health.memory_hard_percent");
                current.memory_hard_percent = health.memory_hard_percent;
            }
            if health.hysteresis_percent.is_some() {
                tracing::trace!(hysteresis_percent = ?health.hysteresis_percent, "Merging health.hysteresis_percent");
                current.hysteresis_percent = health.hysteresis_percent;
            }
            if health.queue_hard_percent.is_some() {
                tracing::trace!(queue_hard_percent = ?health.queue_hard_percent, "Merging health.queue_hard_percent");
                current.queue_hard_percent = health.queue_hard_percent;
            }
            if health.check_interval_ms.is_some() {
                tracing::trace!(check_interval_ms = ?health.check_interval_ms, "Merging health.check_interval_ms");
                current.check_interval_ms = health.check_interval_ms;
            }
        }

        if other.routing.is_some() {
            tracing::trace!("Replacing routing");
            self.routing = other.routing;
        }

        if other.pipelines.is_some() {
            tracing::trace!(
                count = other.pipelines.as_ref().map(Vec::len),
                "Replacing pipelines"
            );
            self.pipelines = other.pipelines;
        }

        if other.data_dir.is_some() {
            tracing::trace!(data_dir = ?other.data_dir, "Merging data_dir");
            self.data_dir = other.data_dir;
        }

        if other.debug.is_some() {
            tracing::trace!(debug = ?other.debug, "Merging debug");
            self.debug = other.debug;
        }
    }
}

// =============================================================================
// Runtime Config Structs (final merged configuration)
// =============================================================================

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// OTLP gRPC receiver configuration
#[derive(Debug, Clone)]
pub struct GrpcConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Ingress configuration
#[derive(Debug, Clone)]
pub struct IngressConfig {
    pub decode_timeout_ms: u64,
    pub max_body_bytes: usize,
    pub tenant_header: String,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            decode_timeout_ms: DEFAULT_DECODE_TIMEOUT_MS,
            max_body_bytes: OTLP_BODY_LIMIT,
            tenant_header: DEFAULT_TENANT_HEADER.to_string(),
        }
    }
}

/// Health monitor configuration (percentages are 0-100)
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// 0 means total system memory
    pub memory_limit_mb: u64,
    pub memory_soft_percent: f64,
    pub memory_hard_percent: f64,
    pub hysteresis_percent: f64,
    pub queue_hard_percent: f64,
    pub check_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 0,
            memory_soft_percent: DEFAULT_MEMORY_SOFT_PERCENT,
            memory_hard_percent: DEFAULT_MEMORY_HARD_PERCENT,
            hysteresis_percent: DEFAULT_HYSTERESIS_PERCENT,
            queue_hard_percent: DEFAULT_QUEUE_HARD_PERCENT,
            check_interval_ms: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
        }
    }
}

/// Final merged application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub grpc: GrpcConfig,
    pub ingress: IngressConfig,
    pub health: HealthConfig,
    pub routing: RoutingConfig,
    pub pipelines: Vec<PipelineConfig>,
    pub data_dir: Option<PathBuf>,
    pub debug: bool,
}

impl AppConfig {
    /// Load configuration from all sources
    ///
    /// Priority (lowest to highest):
    /// 1. Defaults
    /// 2. Profile directory config (~/.spool/spool.json)
    /// 3. Local directory config OR CLI-specified config path
    /// 4. CLI arguments (which include env var fallbacks via clap)
    pub fn load(cli: &CliConfig) -> Result<Self> {
        tracing::debug!("Loading application configuration");
        tracing::trace!(cli = ?cli, "CLI config");

        let mut file_config = FileConfig::default();
        let mut found_configs: Vec<String> = Vec::new();

        if let Some(profile_path) = get_profile_config_path()
            && profile_path.exists()
        {
            let profile_config = FileConfig::load_from_file(&profile_path)?;
            profile_config.warn_unknown_fields();
            file_config.merge(profile_config);
            found_configs.push(profile_path.display().to_string());
        }

        let overlay_path = if let Some(ref path) = cli.config {
            let expanded = expand_path(&path.to_string_lossy());
            if !expanded.exists() {
                anyhow::bail!("Config file not found: {}", expanded.display());
            }
            Some(expanded)
        } else {
            let local = PathBuf::from(CONFIG_FILE_NAME);
            if local.exists() { Some(local) } else { None }
        };

        if let Some(path) = overlay_path {
            let overlay_config = FileConfig::load_from_file(&path)?;
            overlay_config.warn_unknown_fields();
            file_config.merge(overlay_config);
            found_configs.push(path.display().to_string());
        }

        tracing::debug!(configs = ?found_configs, "Config files loaded");

        Self::resolve(file_config, cli)
    }

    /// Layer defaults, merged file config and CLI/env overrides, then validate
    fn resolve(file_config: FileConfig, cli: &CliConfig) -> Result<Self> {
        let file_server = file_config.server.unwrap_or_default();
        let file_grpc = file_config.grpc.unwrap_or_default();
        let file_ingress = file_config.ingress.unwrap_or_default();
        let file_health = file_config.health.unwrap_or_default();

        let host = cli
            .host
            .clone()
            .or(file_server.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = cli.port.or(file_server.port).unwrap_or(DEFAULT_PORT);

        let grpc = GrpcConfig {
            enabled: cli.grpc.or(file_grpc.enabled).unwrap_or(true),
            port: cli
                .grpc_port
                .or(file_grpc.port)
                .unwrap_or(DEFAULT_GRPC_PORT),
        };

        let ingress_defaults = IngressConfig::default();
        let ingress = IngressConfig {
            decode_timeout_ms: file_ingress
                .decode_timeout_ms
                .unwrap_or(ingress_defaults.decode_timeout_ms),
            max_body_bytes: file_ingress
                .max_body_bytes
                .unwrap_or(ingress_defaults.max_body_bytes),
            tenant_header: file_ingress
                .tenant_header
                .map(|h| h.to_ascii_lowercase())
                .unwrap_or(ingress_defaults.tenant_header),
        };

        let health_defaults = HealthConfig::default();
        let health = HealthConfig {
            memory_limit_mb: file_health
                .memory_limit_mb
                .unwrap_or(health_defaults.memory_limit_mb),
            memory_soft_percent: file_health
                .memory_soft_percent
                .unwrap_or(health_defaults.memory_soft_percent),
            memory_hard_percent: file_health
                .memory_hard_percent
                .unwrap_or(health_defaults.memory_hard_percent),
            hysteresis_percent: file_health
                .hysteresis_percent
                .unwrap_or(health_defaults.hysteresis_percent),
            queue_hard_percent: file_health
                .queue_hard_percent
                .unwrap_or(health_defaults.queue_hard_percent),
            check_interval_ms: file_health
                .check_interval_ms
                .unwrap_or(health_defaults.check_interval_ms),
        };

        // Without configured pipelines, route each signal to the default endpoint
        let custom_pipelines = file_config.pipelines.is_some();
        let (pipelines, routing) = match file_config.pipelines {
            Some(pipelines) => (pipelines, file_config.routing.unwrap_or_default()),
            None => {
                let endpoint = cli
                    .exporter_endpoint
                    .as_deref()
                    .unwrap_or(DEFAULT_EXPORTER_ENDPOINT);
                let (pipelines, default_routing) = default_pipelines(endpoint);
                (pipelines, file_config.routing.unwrap_or(default_routing))
            }
        };
        if cli.exporter_endpoint.is_some() && custom_pipelines {
            tracing::warn!("--exporter-endpoint only applies to the default pipelines, ignoring");
        }

        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| file_config.data_dir.as_deref().map(expand_path));

        // debug: CLI/env flag takes precedence, then file config, default false
        let debug = cli.debug || file_config.debug.unwrap_or(false);

        let config = Self {
            server: ServerConfig { host, port },
            grpc,
            ingress,
            health,
            routing,
            pipelines,
            data_dir,
            debug,
        };

        tracing::debug!(
            host = %config.server.host,
            port = config.server.port,
            grpc_enabled = config.grpc.enabled,
            grpc_port = config.grpc.port,
            pipelines = config.pipelines.len(),
            routing_rules = config.routing.rules.len(),
            debug = config.debug,
            "Configuration loaded"
        );

        config.validate()?;
        Ok(config)
    }

    /// Look up a pipeline by name
    pub fn pipeline(&self, name: &str) -> Option<&PipelineConfig> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    /// Validate the configuration for consistency and correctness
    fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            anyhow::bail!("Configuration error: server.host must not be empty");
        }
        if self.server.port == 0 {
            anyhow::bail!("Configuration error: server.port must be greater than 0");
        }
        if self.grpc.enabled && self.grpc.port == 0 {
            anyhow::bail!("Configuration error: grpc.port must be greater than 0");
        }
        if self.grpc.enabled && self.server.port == self.grpc.port {
            anyhow::bail!(
                "Configuration error: server.port ({}) and grpc.port ({}) cannot be the same",
                self.server.port,
                self.grpc.port
            );
        }

        if self.ingress.decode_timeout_ms == 0 {
            anyhow::bail!("Configuration error: ingress.decode_timeout_ms must be greater than 0");
        }
        if self.ingress.max_body_bytes == 0 {
            anyhow::bail!("Configuration error: ingress.max_body_bytes must be greater than 0");
        }
        if self.ingress.tenant_header.is_empty() {
            anyhow::bail!("Configuration error: ingress.tenant_header must not be empty");
        }

        self.validate_health()?;

        if self.pipelines.is_empty() {
            anyhow::bail!("Configuration error: at least one pipeline is required");
        }
        let mut names = HashSet::new();
        for pipeline in &self.pipelines {
            if !names.insert(pipeline.name.as_str()) {
                anyhow::bail!(
                    "Configuration error: duplicate pipeline name '{}'",
                    pipeline.name
                );
            }
            self.validate_pipeline(pipeline)?;
        }

        self.validate_routing()?;

        if is_all_interfaces(&self.server.host) {
            tracing::warn!(
                host = %self.server.host,
                "OTLP ingress is bound to all network interfaces without authentication"
            );
        }

        Ok(())
    }

    fn validate_health(&self) -> Result<()> {
        let h = &self.health;
        let in_range = |v: f64| v > 0.0 && v <= 100.0;
        if !in_range(h.memory_soft_percent) || !in_range(h.memory_hard_percent) {
            anyhow::bail!(
                "Configuration error: health.memory_soft_percent and health.memory_hard_percent must be in (0, 100]"
            );
        }
        if h.memory_soft_percent >= h.memory_hard_percent {
            anyhow::bail!(
                "Configuration error: health.memory_soft_percent ({}) must be below health.memory_hard_percent ({})",
                h.memory_soft_percent,
                h.memory_hard_percent
            );
        }
        if !in_range(h.queue_hard_percent) {
            anyhow::bail!("Configuration error: health.queue_hard_percent must be in (0, 100]");
        }
        if h.hysteresis_percent < 0.0 || h.hysteresis_percent >= h.memory_soft_percent {
            anyhow::bail!(
                "Configuration error: health.hysteresis_percent must be >= 0 and below health.memory_soft_percent"
            );
        }
        if h.check_interval_ms == 0 {
            anyhow::bail!("Configuration error: health.check_interval_ms must be greater than 0");
        }
        Ok(())
    }

    fn validate_pipeline(&self, p: &PipelineConfig) -> Result<()> {
        let name = &p.name;
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            anyhow::bail!(
                "Configuration error: pipeline name '{}' may only contain letters, digits, '-' and '_'",
                name
            );
        }
        if p.signals.is_empty() {
            anyhow::bail!("Configuration error: pipeline '{}' accepts no signals", name);
        }

        for (i, processor) in p.processors.iter().enumerate() {
            match processor {
                ProcessorConfig::Batch(batch) => {
                    if i + 1 != p.processors.len() {
                        anyhow::bail!(
                            "Configuration error: pipeline '{}': the batch processor must be the last stage",
                            name
                        );
                    }
                    if batch.send_batch_size == 0 || batch.timeout_ms == 0 {
                        anyhow::bail!(
                            "Configuration error: pipeline '{}': batch send_batch_size and timeout_ms must be greater than 0",
                            name
                        );
                    }
                }
                ProcessorConfig::Attributes(attrs) => {
                    for action in &attrs.actions {
                        if action.key.is_empty() {
                            anyhow::bail!(
                                "Configuration error: pipeline '{}': attribute action with empty key",
                                name
                            );
                        }
                        if action.action.needs_value() && action.value.is_none() {
                            anyhow::bail!(
                                "Configuration error: pipeline '{}': attribute action {:?} on '{}' needs a value",
                                name,
                                action.action,
                                action.key
                            );
                        }
                    }
                }
                ProcessorConfig::MemoryShedder(shedder) => {
                    if shedder.shed_kinds > shedder.priority.len() {
                        anyhow::bail!(
                            "Configuration error: pipeline '{}': memory_shedder.shed_kinds ({}) exceeds priority length ({})",
                            name,
                            shedder.shed_kinds,
                            shedder.priority.len()
                        );
                    }
                }
            }
        }

        let q = &p.queue;
        if q.max_entries == 0 || q.max_bytes == 0 || q.compact_after == 0 {
            anyhow::bail!(
                "Configuration error: pipeline '{}': queue max_entries, max_bytes and compact_after must be greater than 0",
                name
            );
        }

        self.validate_exporter(name, &p.exporter)?;

        let r = &p.retry;
        if r.initial_ms == 0 || r.max_ms < r.initial_ms {
            anyhow::bail!(
                "Configuration error: pipeline '{}': retry.initial_ms must be > 0 and <= retry.max_ms",
                name
            );
        }
        if !(0.0..=1.0).contains(&r.jitter) {
            anyhow::bail!(
                "Configuration error: pipeline '{}': retry.jitter must be in [0, 1]",
                name
            );
        }
        // Keeps consecutive delays non-decreasing whatever the jitter draws
        if r.multiplier < 1.0 + r.jitter {
            anyhow::bail!(
                "Configuration error: pipeline '{}': retry.multiplier ({}) must be at least 1 + retry.jitter ({})",
                name,
                r.multiplier,
                1.0 + r.jitter
            );
        }

        Ok(())
    }

    fn validate_exporter(&self, pipeline: &str, exporter: &ExporterConfig) -> Result<()> {
        let url = reqwest::Url::parse(&exporter.endpoint).with_context(|| {
            format!(
                "Configuration error: pipeline '{}': invalid exporter endpoint '{}'",
                pipeline, exporter.endpoint
            )
        })?;
        let https = match url.scheme() {
            "http" => false,
            "https" => true,
            scheme => anyhow::bail!(
                "Configuration error: pipeline '{}': unsupported exporter scheme '{}'",
                pipeline,
                scheme
            ),
        };
        if exporter.timeout_ms == 0 {
            anyhow::bail!(
                "Configuration error: pipeline '{}': exporter.timeout_ms must be greater than 0",
                pipeline
            );
        }

        match (exporter.security(), https) {
            (TransportSecurity::Insecure, true) => anyhow::bail!(
                "Configuration error: pipeline '{}': security 'insecure' requires an http:// endpoint",
                pipeline
            ),
            (TransportSecurity::Tls | TransportSecurity::TlsSkipVerify, false) => anyhow::bail!(
                "Configuration error: pipeline '{}': TLS requires an https:// endpoint",
                pipeline
            ),
            (TransportSecurity::TlsSkipVerify, true)
                if exporter.protocol == ExportProtocol::Grpc =>
            {
                anyhow::bail!(
                    "Configuration error: pipeline '{}': tls_skip_verify is only supported by the http exporter",
                    pipeline
                )
            }
            (TransportSecurity::TlsSkipVerify, true) => {
                tracing::warn!(
                    pipeline,
                    "Exporter certificate verification is disabled (tls_skip_verify)"
                );
            }
            _ => {}
        }

        for key in exporter.headers.keys() {
            if axum::http::HeaderName::from_bytes(key.as_bytes()).is_err() {
                anyhow::bail!(
                    "Configuration error: pipeline '{}': invalid exporter header name '{}'",
                    pipeline,
                    key
                );
            }
        }

        // Exporting to ourselves would loop every batch forever
        let own_port = url.port_or_known_default() == Some(self.server.port)
            || (self.grpc.enabled && url.port_or_known_default() == Some(self.grpc.port));
        if own_port && url.host_str().is_some_and(is_local_host) {
            tracing::warn!(
                pipeline,
                endpoint = %exporter.endpoint,
                "Exporter endpoint points at this collector's own listener"
            );
        }

        Ok(())
    }

    fn validate_routing(&self) -> Result<()> {
        for rule in &self.routing.rules {
            let Some(pipeline) = self.pipeline(&rule.pipeline) else {
                anyhow::bail!(
                    "Configuration error: routing rule references unknown pipeline '{}'",
                    rule.pipeline
                );
            };
            if let Some(signal) = rule.signal
                && !pipeline.signals.contains(&signal)
            {
                tracing::warn!(
                    pipeline = %rule.pipeline,
                    signal = %signal,
                    "Routing rule can never match: pipeline does not accept this signal"
                );
            }
        }
        if let Some(fallback) = &self.routing.fallback
            && self.pipeline(fallback).is_none()
        {
            anyhow::bail!(
                "Configuration error: routing.fallback references unknown pipeline '{}'",
                fallback
            );
        }
        if self.routing.rules.is_empty() && self.routing.fallback.is_none() {
            anyhow::bail!(
                "Configuration error: routing needs at least one rule or a fallback pipeline"
            );
        }
        Ok(())
    }
}

/// Get the profile config path (~/.spool/spool.json)
fn get_profile_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(APP_DOT_FOLDER).join(CONFIG_FILE_NAME))
}

/// Check if host binds to all network interfaces
pub(crate) fn is_all_interfaces(host: &str) -> bool {
    matches!(host, "0.0.0.0" | "::" | "[::]")
}

fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]" | "0.0.0.0")
}
