use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"bo"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"sanmartin"`.
    pub organization: &'static str,
    /// Application name, e.g. `"recordatorio"`.
    pub application: &'static str,
}

/// Application configuration persisted to `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// KV root. Falls back to the platform data dir when unset.
    #[serde(default)]
    pub data_dir: Option<String>,
    /// Base URL of the messaging gateway (`/status`, `/enviar-mensaje`).
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// Control plane listen address.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// Optional HTTPS listen address; needs `tls_cert` and `tls_key`.
    #[serde(default)]
    pub https_addr: Option<String>,
    /// PEM certificate for the HTTPS listener.
    #[serde(default)]
    pub tls_cert: Option<String>,
    /// PEM private key for the HTTPS listener.
    #[serde(default)]
    pub tls_key: Option<String>,
    /// Period of the coarse threshold check, in seconds.
    #[serde(default = "default_coarse_check_secs")]
    pub coarse_check_secs: u64,
    /// Period of the countdown refresh, in milliseconds.
    #[serde(default = "default_countdown_tick_ms")]
    pub countdown_tick_ms: u64,
    /// Pause between two recipients of the same batch, in milliseconds.
    #[serde(default = "default_send_pause_ms")]
    pub send_pause_ms: u64,
    /// Country calling code prepended to local phone numbers.
    #[serde(default = "default_country_prefix")]
    pub country_prefix: String,
    /// Reconnect policy knobs.
    #[serde(default)]
    pub reconnect: ReconnectCfg,
    /// Gateway process settings.
    #[serde(default)]
    pub gateway: GatewayCfg,
}

/// `[reconnect]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectCfg {
    /// Linear backoff step (ms); attempt `n` waits `base_ms * n`.
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    /// Upper bound for a single backoff delay (ms).
    #[serde(default = "default_ceiling_ms")]
    pub ceiling_ms: u64,
    /// Consecutive transient failures before a forced re-pairing.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before reconnecting after a session wipe (ms).
    #[serde(default = "default_repair_delay_ms")]
    pub repair_delay_ms: u64,
    /// Delay before reconnecting after a manual reset (ms).
    #[serde(default = "default_reset_delay_ms")]
    pub reset_delay_ms: u64,
}

/// `[gateway]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayCfg {
    /// WebSocket URL of the Baileys bridge.
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    /// Listen address of the gateway HTTP surface.
    #[serde(default = "default_gateway_addr")]
    pub http_addr: String,
    /// Pairing credentials folder shared with the bridge.
    #[serde(default = "default_session_dir")]
    pub session_dir: String,
    /// Scratch folders removed by `/limpiar` and the periodic cleanup.
    #[serde(default = "default_temp_dirs")]
    pub temp_dirs: Vec<String>,
    /// Period of the automatic cleanup, in seconds.
    #[serde(default = "default_cleanup_every_secs")]
    pub cleanup_every_secs: u64,
    /// Session folder size above which an idle session is wiped.
    #[serde(default = "default_session_size_limit")]
    pub session_size_limit_bytes: u64,
    /// How long a send waits for the bridge to confirm it, in seconds.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

fn default_log_level() -> String { "info".to_string() }
fn default_gateway_url() -> String { "http://localhost:3000".to_string() }
fn default_http_addr() -> String { "127.0.0.1:8085".to_string() }
fn default_coarse_check_secs() -> u64 { 60 }
fn default_countdown_tick_ms() -> u64 { 1_000 }
fn default_send_pause_ms() -> u64 { 1_000 }
fn default_country_prefix() -> String { "591".to_string() }
fn default_base_ms() -> u64 { 3_000 }
fn default_ceiling_ms() -> u64 { 10_000 }
fn default_max_retries() -> u32 { 3 }
fn default_repair_delay_ms() -> u64 { 2_000 }
fn default_reset_delay_ms() -> u64 { 1_000 }
fn default_bridge_url() -> String { "ws://localhost:3001".to_string() }
fn default_gateway_addr() -> String { "127.0.0.1:3000".to_string() }
fn default_session_dir() -> String { "auth_info_baileys".to_string() }
fn default_temp_dirs() -> Vec<String> {
    vec!["temp".to_string(), ".wwebjs_cache".to_string(), ".wwebjs_auth".to_string()]
}
fn default_cleanup_every_secs() -> u64 { 6 * 60 * 60 }
fn default_session_size_limit() -> u64 { 50 * 1024 * 1024 }
fn default_send_timeout_secs() -> u64 { 30 }

impl Default for ReconnectCfg {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            ceiling_ms: default_ceiling_ms(),
            max_retries: default_max_retries(),
            repair_delay_ms: default_repair_delay_ms(),
            reset_delay_ms: default_reset_delay_ms(),
        }
    }
}

impl Default for GatewayCfg {
    fn default() -> Self {
        Self {
            bridge_url: default_bridge_url(),
            http_addr: default_gateway_addr(),
            session_dir: default_session_dir(),
            temp_dirs: default_temp_dirs(),
            cleanup_every_secs: default_cleanup_every_secs(),
            session_size_limit_bytes: default_session_size_limit(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: None,
            gateway_url: default_gateway_url(),
            http_addr: default_http_addr(),
            https_addr: None,
            tls_cert: None,
            tls_key: None,
            coarse_check_secs: default_coarse_check_secs(),
            countdown_tick_ms: default_countdown_tick_ms(),
            send_pause_ms: default_send_pause_ms(),
            country_prefix: default_country_prefix(),
            reconnect: ReconnectCfg::default(),
            gateway: GatewayCfg::default(),
        }
    }
}

impl Config {
    /// Coarse threshold-check period.
    pub fn coarse_period(&self) -> Duration { Duration::from_secs(self.coarse_check_secs.max(1)) }
    /// Countdown refresh period.
    pub fn countdown_period(&self) -> Duration { Duration::from_millis(self.countdown_tick_ms.max(1)) }
    /// Pause between recipients of one batch.
    pub fn send_pause(&self) -> Duration { Duration::from_millis(self.send_pause_ms) }
}

fn project_dirs(app: &AppId) -> Result<ProjectDirs> {
    ProjectDirs::from(app.qualifier, app.organization, app.application)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))
}

/// Return the configuration directory for this app, creating it if needed.
pub fn config_dir(app: &AppId) -> Result<PathBuf> {
    let dir = project_dirs(app)?.config_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create config dir {}", dir.display()))?;
    Ok(dir)
}

/// Resolve the KV root: explicit override, then `cfg.data_dir`, then the
/// platform data dir.
pub fn data_dir(app: &AppId, cfg: &Config, over: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = over {
        return Ok(p.to_path_buf());
    }
    if let Some(d) = cfg.data_dir.as_deref() {
        return Ok(PathBuf::from(d));
    }
    Ok(project_dirs(app)?.data_dir().join("kv"))
}

/// Load `config.toml` from the app config dir or create a default one.
pub fn load_or_init(app: &AppId) -> Result<Config> {
    let path = config_dir(app)?.join("config.toml");
    load_or_init_at(&path)
}

/// Load the config at `path`, writing defaults there when it is missing.
pub fn load_or_init_at(path: &Path) -> Result<Config> {
    if path.exists() {
        let txt = fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&txt)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    } else {
        let cfg = Config::default();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        save_config(path, &cfg)?;
        Ok(cfg)
    }
}

fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
