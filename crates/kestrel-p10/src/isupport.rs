//! RPL_ISUPPORT (005) token assembly.

/// Builds the ISUPPORT token list advertised at registration.
///
/// Tokens are emitted in insertion order, at most 13 per 005 line per
/// the usual client expectations.
#[derive(Debug, Default, Clone)]
pub struct Isupport {
    tokens: Vec<(String, Option<String>)>,
}

/// Maximum tokens per 005 line.
const TOKENS_PER_LINE: usize = 13;

impl Isupport {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value-less token (`EXCEPTS`).
    pub fn flag(&mut self, name: impl Into<String>) -> &mut Self {
        self.tokens.push((name.into(), None));
        self
    }

    /// Add a `NAME=value` token. Re-adding a name replaces its value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.tokens.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = Some(value);
        } else {
            self.tokens.push((name, Some(value)));
        }
        self
    }

    /// Remove a token by name.
    pub fn unset(&mut self, name: &str) -> &mut Self {
        self.tokens.retain(|(n, _)| n != name);
        self
    }

    /// Render the parameter lists for the 005 replies, one entry per
    /// line, without the leading nick or the trailing explanation.
    pub fn lines(&self) -> Vec<String> {
        self.tokens
            .chunks(TOKENS_PER_LINE)
            .map(|chunk| {
                chunk
                    .iter()
                    .map(|(name, value)| match value {
                        Some(v) => format!("{name}={v}"),
                        None => name.clone(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_tokens_in_order() {
        let mut isupport = Isupport::new();
        isupport
            .set("NETWORK", "Kestrel")
            .set("NICKLEN", "30")
            .flag("EXCEPTS");
        let lines = isupport.lines();
        assert_eq!(lines, vec!["NETWORK=Kestrel NICKLEN=30 EXCEPTS"]);
    }

    #[test]
    fn replaces_existing_value() {
        let mut isupport = Isupport::new();
        isupport.set("VAPID", "old");
        isupport.set("VAPID", "new");
        assert_eq!(isupport.lines(), vec!["VAPID=new"]);
    }

    #[test]
    fn splits_long_lists() {
        let mut isupport = Isupport::new();
        for i in 0..20 {
            isupport.set(format!("T{i}"), "1");
        }
        let lines = isupport.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].split(' ').count() <= 13);
    }
}
