//! Configuration module for sandpool
//!
//! Supports configuration via:
//! - YAML/TOML/JSON config files
//! - Environment variables (with SANDPOOL_ prefix, `__` between nested keys)

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for the JSON log file; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Container runtime connection
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Warm pool settings
    #[serde(default)]
    pub pools: PoolConfig,

    /// Resource and security profile applied to every container
    #[serde(default)]
    pub container: ContainerLimits,

    /// Image resolution and pulling
    #[serde(default)]
    pub images: ImageConfig,

    /// Attachment limits
    #[serde(default)]
    pub uploads: UploadLimits,

    /// ZIP archive handling
    #[serde(default)]
    pub archives: ArchiveLimits,
}

/// Container runtime connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Unix sockets tried, in order, after the local defaults fail
    #[serde(default = "default_socket_paths")]
    pub socket_paths: Vec<String>,

    /// Request timeout for the runtime API
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Grace period given to `stop` before the forced removal
    #[serde(default = "default_stop_grace")]
    pub stop_grace_seconds: u64,
}

/// Warm pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Size of the default pool
    #[serde(default = "default_pool_size")]
    pub default_pool_size: usize,

    /// Image served by the default pool
    #[serde(default = "default_image")]
    pub default_image: String,

    /// Known-good image used when a pool's image cannot be pulled
    #[serde(default = "default_image")]
    pub fallback_image: String,

    /// How long an execution waits for a free container
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_seconds: u64,

    /// Period of the replenishment task
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_ms: u64,

    /// Extra pools, image -> size
    #[serde(default)]
    pub custom_pools: HashMap<String, usize>,

    /// Extra pools as `image1:size1,image2:size2`
    #[serde(default)]
    pub custom_pools_spec: Option<String>,
}

/// Resource and security profile for sandbox containers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerLimits {
    /// Memory ceiling, docker style (`256m`, `1g`, `512k`, plain bytes)
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,

    /// CPU share in cores (can be fractional)
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,

    /// Entrypoint shell kept alive in every container
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Mount point of the per-execution workspace inside the container
    #[serde(default = "default_workspace_mount")]
    pub workspace_mount: String,

    /// Scratch tmpfs path
    #[serde(default = "default_tmpfs_path")]
    pub tmpfs_path: String,

    /// Scratch tmpfs mount options
    #[serde(default = "default_tmpfs_options")]
    pub tmpfs_options: String,

    /// Capabilities added back after dropping ALL
    #[serde(default = "default_cap_add")]
    pub cap_add: Vec<String>,

    /// Host directory under which workspaces are created (system temp when unset)
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
}

/// Image resolution and pull policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Registry prepended to image names that do not already carry it
    #[serde(default)]
    pub registry: String,

    /// Per-attempt pull timeout
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_seconds: u64,

    /// Number of pull attempts
    #[serde(default = "default_pull_retries")]
    pub pull_retries: u32,

    /// Base backoff, doubled after every failed attempt
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

/// Limits for attached files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadLimits {
    /// Maximum size of a single file, in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Maximum staged bytes per session
    #[serde(default = "default_max_total_size")]
    pub max_total_size: u64,

    /// Accepted extensions (lowercase, without dot)
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Root directory for session staging (`<tmp>/sandpool_sessions` when unset)
    #[serde(default)]
    pub sessions_dir: Option<PathBuf>,

    /// Sessions older than this are swept
    #[serde(default = "default_session_max_age")]
    pub session_max_age_seconds: u64,

    /// Period of the session sweeper
    #[serde(default = "default_session_sweep_interval")]
    pub session_sweep_interval_seconds: u64,
}

/// ZIP archive limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveLimits {
    /// Extract `.zip` attachments instead of rejecting them
    #[serde(default)]
    pub enabled: bool,

    /// Maximum entries per archive
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Maximum total uncompressed bytes per archive
    #[serde(default = "default_max_extracted_size")]
    pub max_extracted_size: u64,

    /// Maximum uncompressed/compressed ratio
    #[serde(default = "default_max_compression_ratio")]
    pub max_compression_ratio: f64,

    /// Wall-clock budget for extracting one archive
    #[serde(default = "default_extraction_timeout")]
    pub extraction_timeout_seconds: u64,

    /// Maximum archives found inside an archive
    #[serde(default = "default_max_nested_archives")]
    pub max_nested_archives: usize,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_socket_paths() -> Vec<String> {
    let mut paths = vec!["/var/run/docker.sock".to_string()];
    if let Ok(home) = std::env::var("HOME") {
        paths.push(format!("{}/.docker/run/docker.sock", home));
    }
    paths
}

fn default_connect_timeout() -> u64 {
    120
}

fn default_stop_grace() -> u64 {
    5
}

fn default_pool_size() -> usize {
    5
}

fn default_image() -> String {
    "alpine:latest".to_string()
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_maintenance_interval() -> u64 {
    5000
}

fn default_memory_limit() -> String {
    "256m".to_string()
}

fn default_cpu_limit() -> f64 {
    0.5
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_workspace_mount() -> String {
    "/workspace".to_string()
}

fn default_tmpfs_path() -> String {
    "/tmp".to_string()
}

fn default_tmpfs_options() -> String {
    "size=100M".to_string()
}

fn default_cap_add() -> Vec<String> {
    vec!["CHOWN".to_string(), "SETUID".to_string(), "SETGID".to_string()]
}

fn default_pull_timeout() -> u64 {
    300
}

fn default_pull_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    1000
}

fn default_max_file_size() -> u64 {
    10 * MIB
}

fn default_max_total_size() -> u64 {
    50 * MIB
}

fn default_allowed_extensions() -> Vec<String> {
    [
        "txt", "py", "js", "html", "css", "json", "xml", "csv", "md", "yml", "yaml", "sh", "bat",
        "sql", "log", "conf", "cfg", "ini", "properties", "dockerfile", "java", "cpp", "c", "h",
        "hpp", "go", "rs", "php", "rb", "pl", "r", "scala",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_session_max_age() -> u64 {
    24 * 3600
}

fn default_session_sweep_interval() -> u64 {
    300
}

fn default_max_entries() -> usize {
    1000
}

fn default_max_extracted_size() -> u64 {
    100 * MIB
}

fn default_max_compression_ratio() -> f64 {
    100.0
}

fn default_extraction_timeout() -> u64 {
    30
}

fn default_max_nested_archives() -> usize {
    3
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket_paths: default_socket_paths(),
            connect_timeout_seconds: default_connect_timeout(),
            stop_grace_seconds: default_stop_grace(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_pool_size: default_pool_size(),
            default_image: default_image(),
            fallback_image: default_image(),
            acquire_timeout_seconds: default_acquire_timeout(),
            maintenance_interval_ms: default_maintenance_interval(),
            custom_pools: HashMap::new(),
            custom_pools_spec: None,
        }
    }
}

impl Default for ContainerLimits {
    fn default() -> Self {
        Self {
            memory_limit: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
            shell: default_shell(),
            workspace_mount: default_workspace_mount(),
            tmpfs_path: default_tmpfs_path(),
            tmpfs_options: default_tmpfs_options(),
            cap_add: default_cap_add(),
            workspace_root: None,
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            registry: String::new(),
            pull_timeout_seconds: default_pull_timeout(),
            pull_retries: default_pull_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            max_total_size: default_max_total_size(),
            allowed_extensions: default_allowed_extensions(),
            sessions_dir: None,
            session_max_age_seconds: default_session_max_age(),
            session_sweep_interval_seconds: default_session_sweep_interval(),
        }
    }
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            enabled: false,
            max_entries: default_max_entries(),
            max_extracted_size: default_max_extracted_size(),
            max_compression_ratio: default_max_compression_ratio(),
            extraction_timeout_seconds: default_extraction_timeout(),
            max_nested_archives: default_max_nested_archives(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_dir: None,
            runtime: RuntimeConfig::default(),
            pools: PoolConfig::default(),
            container: ContainerLimits::default(),
            images: ImageConfig::default(),
            uploads: UploadLimits::default(),
            archives: ArchiveLimits::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // Load from config file if present
            .add_source(config::File::with_name("config/sandpool").required(false))
            .add_source(config::File::with_name("/etc/sandpool/config").required(false))
            // Override with environment variables (SANDPOOL_ prefix)
            .add_source(
                config::Environment::with_prefix("SANDPOOL")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("runtime.socket_paths")
                    .with_list_parse_key("container.cap_add")
                    .with_list_parse_key("uploads.allowed_extensions")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Port cannot be 0");
        }

        if self.pools.default_pool_size == 0 {
            anyhow::bail!("Default pool size must be at least 1");
        }

        if self.pools.acquire_timeout_seconds == 0 {
            anyhow::bail!("Acquire timeout cannot be 0");
        }

        if self.pools.maintenance_interval_ms == 0 {
            anyhow::bail!("Maintenance interval cannot be 0");
        }

        let memory = parse_memory_limit(&self.container.memory_limit)
            .with_context(|| format!("Invalid memory limit {:?}", self.container.memory_limit))?;
        if memory < 4 * MIB as i64 {
            anyhow::bail!("Minimum memory limit is 4MB");
        }

        if !(self.container.cpu_limit > 0.0) {
            anyhow::bail!("CPU limit must be positive");
        }

        if self.images.pull_retries == 0 {
            anyhow::bail!("Image pull retries must be at least 1");
        }

        if self.uploads.max_total_size < self.uploads.max_file_size {
            anyhow::bail!("Total upload limit cannot be below the per-file limit");
        }

        if !(self.archives.max_compression_ratio > 0.0) {
            anyhow::bail!("Compression ratio cap must be positive");
        }

        self.custom_pools()?;

        Ok(())
    }

    /// All extra pools, merging the map form and the `image:size` list form
    pub fn custom_pools(&self) -> Result<HashMap<String, usize>> {
        let mut pools = self.pools.custom_pools.clone();
        if let Some(spec) = &self.pools.custom_pools_spec {
            pools.extend(parse_custom_pools(spec)?);
        }
        Ok(pools)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.pools.acquire_timeout_seconds)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.pools.maintenance_interval_ms)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.uploads
            .sessions_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("sandpool_sessions"))
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.uploads.session_max_age_seconds)
    }
}

impl ArchiveLimits {
    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_seconds)
    }
}

/// Parse `image1:size1,image2:size2`.
///
/// The size follows the last colon so tagged images (`python:3.12:2`) work.
pub fn parse_custom_pools(spec: &str) -> Result<HashMap<String, usize>> {
    let mut pools = HashMap::new();
    for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (image, size) = item
            .rsplit_once(':')
            .with_context(|| format!("Custom pool {:?} is missing a size", item))?;
        let size: usize = size
            .trim()
            .parse()
            .with_context(|| format!("Custom pool {:?} has an invalid size", item))?;
        pools.insert(image.trim().to_string(), size);
    }
    Ok(pools)
}

/// Parse a docker-style memory string (`256m`, `1g`, `512k`, `1048576`) to bytes
pub fn parse_memory_limit(s: &str) -> Result<i64> {
    let s = s.trim().to_ascii_lowercase();
    let s = s.strip_suffix('b').unwrap_or(&s);
    let (digits, multiplier) = if let Some(num) = s.strip_suffix('g') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('k') {
        (num, 1024)
    } else {
        (s, 1)
    };

    let value: f64 = digits
        .trim()
        .parse()
        .with_context(|| format!("Not a number: {:?}", digits))?;
    if value <= 0.0 {
        anyhow::bail!("Memory limit must be positive");
    }
    Ok((value * multiplier as f64) as i64)
}
