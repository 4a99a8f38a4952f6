//! Configuration loading and management.
//!
//! - [`types`]: config struct definitions, one per TOML section
//! - [`validation`]: a collect-all-errors validation pass run at startup

mod types;
mod validation;

pub use types::{
    CapsConfig, Config, HistoryConfig, LinkBlock, ListenConfig, LogFormat, MetadataConfig,
    MultilineConfig, PmConsent, PresenceConfig, RedactConfig, S2sConfig, SaslConfig, ServerConfig,
    TlsConfig, WebSocketConfig,
};
pub use validation::validate;

impl Config {
    /// Load and parse the TOML configuration at `path`.
    pub fn load(path: &str) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {path}: {e}"))?;
        let config: Config =
            toml::from_str(&raw).map_err(|e| anyhow::anyhow!("cannot parse {path}: {e}"))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            name = "hub.kestrel.example"
            numeric = "AB"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.name, "hub.kestrel.example");
        assert_eq!(config.server.numeric, "AB");
        assert_eq!(config.multiline.max_bytes, 4096);
        assert_eq!(config.multiline.max_lines, 24);
        assert_eq!(config.redact.window_secs, 300);
        assert_eq!(config.history.pm_consent, PmConsent::Multi);
        assert!(config.links.is_empty());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn link_blocks_parse() {
        let config: Config = toml::from_str(
            r#"
            [server]
            name = "hub.kestrel.example"
            numeric = "AB"

            [[links]]
            name = "services.kestrel.example"
            address = "10.0.0.2:4400"
            password = "hunter2"
            autoconnect = true
            "#,
        )
        .unwrap();
        assert_eq!(config.links.len(), 1);
        assert!(config.links[0].autoconnect);
        assert!(!config.links[0].tls);
    }

    #[test]
    fn validation_rejects_bad_numeric() {
        let config: Config = toml::from_str(
            r#"
            [server]
            name = "hub.kestrel.example"
            numeric = "toolong"
            "#,
        )
        .unwrap();
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("numeric")));
    }
}
