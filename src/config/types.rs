//! Configuration struct definitions, one per TOML section.

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// `[server]` identity.
    pub server: ServerConfig,
    /// `[listen]` client listeners.
    #[serde(default)]
    pub listen: ListenConfig,
    /// `[tls]` certificate material for TLS listeners and links.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// `[websocket]` transport.
    #[serde(default)]
    pub websocket: Option<WebSocketConfig>,
    /// `[caps]` capability enable bits.
    #[serde(default)]
    pub caps: CapsConfig,
    /// `[multiline]` batch limits.
    #[serde(default)]
    pub multiline: MultilineConfig,
    /// `[history]` chathistory storage and federation.
    #[serde(default)]
    pub history: HistoryConfig,
    /// `[metadata]` cache and services bridge tuning.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// `[presence]` aggregation.
    #[serde(default)]
    pub presence: PresenceConfig,
    /// `[redact]` authorization windows.
    #[serde(default)]
    pub redact: RedactConfig,
    /// `[sasl]` services peer selection.
    #[serde(default)]
    pub sasl: SaslConfig,
    /// `[s2s]` server-link tuning.
    #[serde(default)]
    pub s2s: S2sConfig,
    /// `[[links]]` configured peers.
    #[serde(default)]
    pub links: Vec<LinkBlock>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// JSON lines.
    Json,
}

/// `[server]` - this server's identity.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// DNS-style server name.
    pub name: String,
    /// Two-symbol server numeric.
    pub numeric: String,
    /// Free-form description.
    #[serde(default = "default_description")]
    pub description: String,
    /// Network name advertised in ISUPPORT.
    #[serde(default = "default_network")]
    pub network: String,
    /// Log format.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Maximum nick length.
    #[serde(default = "default_nicklen")]
    pub nicklen: usize,
    /// Maximum channel-name length.
    #[serde(default = "default_channellen")]
    pub channellen: usize,
}

fn default_description() -> String {
    "Kestrel IRC server".to_owned()
}

fn default_network() -> String {
    "Kestrel".to_owned()
}

fn default_nicklen() -> usize {
    30
}

fn default_channellen() -> usize {
    64
}

/// `[listen]` - client listeners.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Plaintext client addresses.
    #[serde(default = "default_client_listen")]
    pub client: Vec<String>,
    /// TLS client addresses (requires `[tls]`).
    #[serde(default)]
    pub client_tls: Vec<String>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            client: default_client_listen(),
            client_tls: Vec::new(),
        }
    }
}

fn default_client_listen() -> Vec<String> {
    vec!["127.0.0.1:6667".to_owned()]
}

/// `[tls]` - certificate material.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain path.
    pub cert: String,
    /// PEM private key path.
    pub key: String,
}

/// `[websocket]` - WebSocket transport.
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Listen address.
    pub listen: String,
    /// Allowed `Origin` values; empty allows any origin.
    #[serde(default)]
    pub origins: Vec<String>,
}

/// `[caps]` - capability enable bits.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapsConfig {
    /// Capability names removed from LS listings and REQ.
    #[serde(default)]
    pub disabled: Vec<String>,
}

/// `[multiline]` - draft/multiline limits.
#[derive(Debug, Clone, Deserialize)]
pub struct MultilineConfig {
    /// Maximum accumulated bytes per batch.
    #[serde(default = "default_multiline_bytes")]
    pub max_bytes: usize,
    /// Maximum lines per batch.
    #[serde(default = "default_multiline_lines")]
    pub max_lines: usize,
    /// Concurrent inbound batches tolerated per server link.
    #[serde(default = "default_multiline_batches")]
    pub max_batches_per_link: usize,
    /// Lines shown to recipients without the capability.
    #[serde(default = "default_preview_lines")]
    pub preview_lines: usize,
}

impl Default for MultilineConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_multiline_bytes(),
            max_lines: default_multiline_lines(),
            max_batches_per_link: default_multiline_batches(),
            preview_lines: default_preview_lines(),
        }
    }
}

fn default_multiline_bytes() -> usize {
    4096
}

fn default_multiline_lines() -> usize {
    24
}

fn default_multiline_batches() -> usize {
    16
}

fn default_preview_lines() -> usize {
    3
}

/// Consent policy for chathistory over private messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PmConsent {
    /// Store and serve all private messages.
    Global,
    /// Either party opted in.
    Single,
    /// Both parties opted in.
    #[default]
    Multi,
}

/// `[history]` - chathistory store and federation.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// Backend: `redb`, `memory`, or `none`.
    #[serde(default = "default_history_store")]
    pub store: String,
    /// Path for the redb backend.
    #[serde(default = "default_history_path")]
    pub path: String,
    /// Maximum messages per CHATHISTORY request.
    #[serde(default = "default_history_max")]
    pub max: usize,
    /// Retention in days.
    #[serde(default = "default_history_retention")]
    pub retention_days: u32,
    /// Query peers when the local store comes up short.
    #[serde(default = "default_true")]
    pub federation: bool,
    /// Federated-request deadline in seconds.
    #[serde(default = "default_history_timeout")]
    pub timeout_secs: u64,
    /// Private-message consent mode.
    #[serde(default)]
    pub pm_consent: PmConsent,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            store: default_history_store(),
            path: default_history_path(),
            max: default_history_max(),
            retention_days: default_history_retention(),
            federation: true,
            timeout_secs: default_history_timeout(),
            pm_consent: PmConsent::default(),
        }
    }
}

fn default_history_store() -> String {
    "redb".to_owned()
}

fn default_history_path() -> String {
    "kestrel-kv.redb".to_owned()
}

fn default_history_max() -> usize {
    100
}

fn default_history_retention() -> u32 {
    14
}

fn default_history_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

/// `[metadata]` - metadata cache and write queue.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    /// Cache TTL in seconds.
    #[serde(default = "default_meta_ttl")]
    pub cache_ttl_secs: u64,
    /// Services-query deadline in seconds.
    #[serde(default = "default_meta_timeout")]
    pub services_timeout_secs: u64,
    /// Bounded write queue while services are down (oldest-drop).
    #[serde(default = "default_meta_queue")]
    pub queue_size: usize,
    /// Send channel metadata during burst.
    #[serde(default = "default_true")]
    pub burst: bool,
    /// Compress values at or above this many bytes.
    #[serde(default = "default_compress_threshold")]
    pub compress_threshold: usize,
    /// zstd level for compression.
    #[serde(default = "default_compress_level")]
    pub compress_level: i32,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_meta_ttl(),
            services_timeout_secs: default_meta_timeout(),
            queue_size: default_meta_queue(),
            burst: true,
            compress_threshold: default_compress_threshold(),
            compress_level: default_compress_level(),
        }
    }
}

fn default_meta_ttl() -> u64 {
    300
}

fn default_meta_timeout() -> u64 {
    5
}

fn default_meta_queue() -> usize {
    128
}

fn default_compress_threshold() -> usize {
    1024
}

fn default_compress_level() -> i32 {
    3
}

/// `[presence]` - account presence aggregation.
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// Aggregate presence across an account's connections.
    #[serde(default)]
    pub aggregation: bool,
    /// Substitute message when every connection is away-star.
    #[serde(default = "default_away_star_msg")]
    pub away_star_msg: String,
    /// Minimum seconds between AWAY broadcasts per account.
    #[serde(default = "default_away_throttle")]
    pub away_throttle_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            aggregation: false,
            away_star_msg: default_away_star_msg(),
            away_throttle_secs: default_away_throttle(),
        }
    }
}

fn default_away_star_msg() -> String {
    "Away".to_owned()
}

fn default_away_throttle() -> u64 {
    10
}

/// `[redact]` - message-redaction authorization.
#[derive(Debug, Clone, Deserialize)]
pub struct RedactConfig {
    /// Seconds a user may redact their own message; 0 disables.
    #[serde(default = "default_redact_window")]
    pub window_secs: u64,
    /// Operator window in seconds; 0 means unbounded.
    #[serde(default)]
    pub oper_window_secs: u64,
}

impl Default for RedactConfig {
    fn default() -> Self {
        Self {
            window_secs: default_redact_window(),
            oper_window_secs: 0,
        }
    }
}

fn default_redact_window() -> u64 {
    300
}

/// `[sasl]` - services peer selection.
#[derive(Debug, Clone, Deserialize)]
pub struct SaslConfig {
    /// Services server name, or `*` for the nearest server that
    /// announces itself as services.
    #[serde(default = "default_sasl_server")]
    pub server: String,
}

impl Default for SaslConfig {
    fn default() -> Self {
        Self {
            server: default_sasl_server(),
        }
    }
}

fn default_sasl_server() -> String {
    "*".to_owned()
}

/// `[s2s]` - server-link transport tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct S2sConfig {
    /// Inbound S2S listen address, when accepting links.
    #[serde(default)]
    pub listen: Option<String>,
    /// Ping interval in seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Inactivity timeout in seconds.
    #[serde(default = "default_s2s_timeout")]
    pub timeout_secs: u64,
    /// Emit message tags to peers.
    #[serde(default = "default_true")]
    pub send_tags: bool,
}

impl Default for S2sConfig {
    fn default() -> Self {
        Self {
            listen: None,
            ping_interval_secs: default_ping_interval(),
            timeout_secs: default_s2s_timeout(),
            send_tags: true,
        }
    }
}

fn default_ping_interval() -> u64 {
    60
}

fn default_s2s_timeout() -> u64 {
    180
}

/// `[[links]]` - one configured peer.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkBlock {
    /// Peer server name.
    pub name: String,
    /// `host:port` to connect to (outbound) or match (inbound).
    pub address: String,
    /// Link password.
    pub password: String,
    /// Connect at startup and on loss.
    #[serde(default)]
    pub autoconnect: bool,
    /// Wrap the link in TLS.
    #[serde(default)]
    pub tls: bool,
}
