//! Startup configuration validation.
//!
//! Collects every problem instead of bailing on the first, so an
//! operator fixes one rehash cycle's worth of mistakes at once.

use kestrel_p10::numeric::is_numeric_str;
use kestrel_p10::Capability;

use super::Config;

/// Validate the configuration; returns all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.server.name.is_empty() || !config.server.name.contains('.') {
        errors.push(format!(
            "server.name {:?} must be a dotted server name",
            config.server.name
        ));
    }
    if config.server.numeric.len() != 2 || !is_numeric_str(&config.server.numeric) {
        errors.push(format!(
            "server.numeric {:?} must be exactly two numeric-alphabet symbols",
            config.server.numeric
        ));
    }

    for name in &config.caps.disabled {
        if Capability::from_name(name).is_none() {
            errors.push(format!("caps.disabled contains unknown capability {name:?}"));
        }
    }

    if config.multiline.max_bytes == 0 || config.multiline.max_lines == 0 {
        errors.push("multiline limits must be non-zero".to_owned());
    }

    match config.history.store.as_str() {
        "redb" | "memory" | "none" => {}
        other => errors.push(format!(
            "history.store {other:?} is not one of redb, memory, none"
        )),
    }

    if !config.listen.client_tls.is_empty() && config.tls.is_none() {
        errors.push("listen.client_tls requires a [tls] section".to_owned());
    }

    for link in &config.links {
        if link.name.is_empty() || link.password.is_empty() {
            errors.push(format!("link {:?} needs a name and password", link.name));
        }
        if link.tls && config.tls.is_none() {
            errors.push(format!("link {:?} requests tls without a [tls] section", link.name));
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        toml::from_str(
            r#"
            [server]
            name = "hub.kestrel.example"
            numeric = "AB"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn accepts_minimal() {
        assert!(validate(&base()).is_ok());
    }

    #[test]
    fn collects_multiple_errors() {
        let mut config = base();
        config.server.numeric = "!!".to_owned();
        config.history.store = "postgres".to_owned();
        config.caps.disabled = vec!["no-such-cap".to_owned()];
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn tls_listener_requires_tls_section() {
        let mut config = base();
        config.listen.client_tls = vec!["0.0.0.0:6697".to_owned()];
        let errors = validate(&config).unwrap_err();
        assert!(errors[0].contains("client_tls"));
    }
}
