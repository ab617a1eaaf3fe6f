// =============================================================================
// Application Identity
// =============================================================================

/// Application name in title case (for display and platform directories)
pub const APP_NAME: &str = "Spool";

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME_LOWER: &str = "spool";

/// Unix-style dotfile folder name
pub const APP_DOT_FOLDER: &str = ".spool";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name
pub const CONFIG_FILE_NAME: &str = "spool.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "SPOOL_CONFIG";

// =============================================================================
// Environment Variables - Debug & Logging
// =============================================================================

/// Environment variable for debug mode (captures accepted submissions)
pub const ENV_DEBUG: &str = "SPOOL_DEBUG";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "SPOOL_LOG";

/// Environment variable for log output format (compact or json)
pub const ENV_LOG_FORMAT: &str = "SPOOL_LOG_FORMAT";

// =============================================================================
// Environment Variables - Server
// =============================================================================

/// Environment variable for server host
pub const ENV_HOST: &str = "SPOOL_HOST";

/// Environment variable for OTLP/HTTP and operational API port
pub const ENV_PORT: &str = "SPOOL_PORT";

/// Environment variable for OTLP gRPC enabled
pub const ENV_GRPC_ENABLED: &str = "SPOOL_GRPC_ENABLED";

/// Environment variable for OTLP gRPC port
pub const ENV_GRPC_PORT: &str = "SPOOL_GRPC_PORT";

/// Environment variable for the default pipelines' exporter endpoint
pub const ENV_EXPORTER_ENDPOINT: &str = "SPOOL_EXPORTER_ENDPOINT";

// =============================================================================
// Server Defaults
// =============================================================================

/// Default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default OTLP/HTTP port (standard OTLP HTTP port)
pub const DEFAULT_PORT: u16 = 4318;

/// Default OTLP gRPC port (standard OTLP gRPC port)
pub const DEFAULT_GRPC_PORT: u16 = 4317;

// =============================================================================
// Environment Variables - Storage
// =============================================================================

/// Environment variable to override data directory
pub const ENV_DATA_DIR: &str = "SPOOL_DATA_DIR";

// =============================================================================
// Ingress
// =============================================================================

/// Body limit for OTLP endpoints (64 MB)
pub const OTLP_BODY_LIMIT: usize = 64 * 1024 * 1024;

/// Body limit for the operational API (1 MB)
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// Default time budget for decoding one submission
pub const DEFAULT_DECODE_TIMEOUT_MS: u64 = 5_000;

/// Default header carrying the tenant identifier
pub const DEFAULT_TENANT_HEADER: &str = "x-spool-tenant";

/// Resource attribute the tenant identifier is written to
pub const TENANT_ATTR: &str = "tenant.id";

/// Retry-After header value for backpressure (in seconds)
pub const BACKPRESSURE_RETRY_AFTER_SECS: u64 = 1;

// =============================================================================
// Pipelines
// =============================================================================

/// Default downstream OTLP/HTTP endpoint for generated pipelines
pub const DEFAULT_EXPORTER_ENDPOINT: &str = "http://127.0.0.1:14318";

/// Default per-attempt export timeout
pub const DEFAULT_EXPORT_TIMEOUT_MS: u64 = 10_000;

/// Default batch size in records
pub const DEFAULT_SEND_BATCH_SIZE: usize = 8192;

/// Default batch window
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 1_000;

/// Upper bound on how often pending batches are checked for expiry
pub const BATCH_FLUSH_TICK_MS: u64 = 100;

/// Default minimum log severity kept while shedding (SEVERITY_NUMBER_WARN)
pub const DEFAULT_MIN_LOG_SEVERITY: i32 = 13;

// =============================================================================
// Queue
// =============================================================================

/// Default maximum queued entries per pipeline
pub const DEFAULT_QUEUE_MAX_ENTRIES: usize = 10_000;

/// Default maximum queued payload bytes per pipeline (256 MB)
pub const DEFAULT_QUEUE_MAX_BYTES: u64 = 256 * 1024 * 1024;

/// Dead log records tolerated before the queue compacts
pub const DEFAULT_QUEUE_COMPACT_AFTER: usize = 1024;

/// Append-only log of queued entries
pub const QUEUE_ENTRIES_FILE: &str = "entries.log";

/// Append-only log of retry/remove records
pub const QUEUE_INDEX_FILE: &str = "index.log";

// =============================================================================
// Retry
// =============================================================================

pub const DEFAULT_RETRY_INITIAL_MS: u64 = 500;
pub const DEFAULT_RETRY_MAX_MS: u64 = 30_000;
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_RETRY_JITTER: f64 = 0.2;
pub const DEFAULT_MAX_RETRIES: u32 = 10;

// =============================================================================
// Health
// =============================================================================

pub const DEFAULT_MEMORY_SOFT_PERCENT: f64 = 80.0;
pub const DEFAULT_MEMORY_HARD_PERCENT: f64 = 90.0;
pub const DEFAULT_HYSTERESIS_PERCENT: f64 = 5.0;
pub const DEFAULT_QUEUE_HARD_PERCENT: f64 = 95.0;

/// Default interval between health evaluations
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 1_000;

// =============================================================================
// Shutdown
// =============================================================================

/// Graceful shutdown timeout in seconds
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 30;
