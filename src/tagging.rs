//! The tag engine: which tags reach which recipients.
//!
//! Client-bound messages carry candidate tags; rendering filters them
//! by the recipient's negotiated capabilities. The server-to-server
//! direction is an explicit allowlist - `time`, `msgid`, `batch` and
//! client-only tags travel; `account` rides `AC` and `label` never
//! leaves the client that sent it.

use chrono::{TimeZone, Utc};

use kestrel_p10::tags::serialize_tags;
use kestrel_p10::{CapSet, Capability, Tag};

/// Current time in the `@time` wire format (ISO 8601 UTC, ms).
pub fn server_time_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Format a millisecond timestamp for `@time`.
pub fn format_server_time(ts_ms: i64) -> String {
    match Utc.timestamp_millis_opt(ts_ms).single() {
        Some(t) => t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        None => server_time_now(),
    }
}

/// Is this tag deliverable to a client with `caps`?
pub fn client_tag_allowed(tag: &Tag, caps: CapSet) -> bool {
    if tag.is_client_only() {
        return caps.contains(Capability::MessageTags);
    }
    match tag.key.as_str() {
        "time" => caps.contains(Capability::ServerTime),
        "msgid" => caps.contains(Capability::MessageTags),
        "batch" => caps.contains(Capability::Batch),
        "account" => caps.contains(Capability::AccountTag),
        "label" => caps.contains(Capability::LabeledResponse),
        "draft/multiline-concat" => caps.contains(Capability::Multiline),
        _ => false,
    }
}

/// Filter tags for the server-to-server direction.
pub fn s2s_tags(tags: &[Tag]) -> Vec<Tag> {
    tags.iter()
        .filter(|t| {
            t.is_client_only() || matches!(t.key.as_str(), "time" | "msgid" | "batch")
        })
        .cloned()
        .collect()
}

/// A client-bound message with candidate tags.
#[derive(Debug, Clone)]
pub struct ClientMsg {
    /// Candidate tags; filtered per recipient at render time.
    pub tags: Vec<Tag>,
    /// Source prefix (`nick!ident@host` or a server name).
    pub source: Option<String>,
    /// Command or numeric.
    pub command: String,
    /// Middle parameters.
    pub params: Vec<String>,
    /// Trailing parameter.
    pub trailing: Option<String>,
}

impl ClientMsg {
    /// Message from a named source.
    pub fn new(source: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            tags: Vec::new(),
            source: Some(source.into()),
            command: command.into(),
            params: Vec::new(),
            trailing: None,
        }
    }

    /// Append a middle parameter.
    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Set the trailing parameter.
    pub fn with_trailing(mut self, trailing: impl Into<String>) -> Self {
        self.trailing = Some(trailing.into());
        self
    }

    /// Append a candidate tag.
    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    /// Render for a recipient with `caps`.
    pub fn render(&self, caps: CapSet) -> String {
        let mut out = String::new();
        let tags: Vec<Tag> = self
            .tags
            .iter()
            .filter(|t| client_tag_allowed(t, caps))
            .cloned()
            .collect();
        if !tags.is_empty() {
            out.push('@');
            out.push_str(&serialize_tags(&tags));
            out.push(' ');
        }
        if let Some(source) = &self.source {
            out.push(':');
            out.push_str(source);
            out.push(' ');
        }
        out.push_str(&self.command);
        for param in &self.params {
            out.push(' ');
            out.push_str(param);
        }
        if let Some(trailing) = &self.trailing {
            out.push_str(" :");
            out.push_str(trailing);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(list: &[Capability]) -> CapSet {
        list.iter().copied().collect()
    }

    #[test]
    fn render_filters_by_caps() {
        let msg = ClientMsg::new("alice!a@h", "PRIVMSG")
            .with_param("#room")
            .with_trailing("hi")
            .with_tag(Tag::new("time", "2026-01-01T00:00:00.000Z"))
            .with_tag(Tag::new("msgid", "AB-1-2"));

        let bare = msg.render(CapSet::empty());
        assert_eq!(bare, ":alice!a@h PRIVMSG #room :hi");

        let timed = msg.render(caps(&[Capability::ServerTime]));
        assert!(timed.starts_with("@time="));
        assert!(!timed.contains("msgid"));

        let full = msg.render(caps(&[Capability::ServerTime, Capability::MessageTags]));
        assert!(full.contains("msgid=AB-1-2"));
    }

    #[test]
    fn client_only_tags_need_message_tags() {
        let tag = Tag::new("+typing", "active");
        assert!(!client_tag_allowed(&tag, CapSet::empty()));
        assert!(client_tag_allowed(&tag, caps(&[Capability::MessageTags])));
    }

    #[test]
    fn s2s_allowlist_blocks_account_and_label() {
        let tags = vec![
            Tag::new("time", "t"),
            Tag::new("msgid", "m"),
            Tag::new("account", "alice"),
            Tag::new("label", "abc"),
            Tag::new("batch", "b1"),
            Tag::new("+typing", "active"),
        ];
        let out = s2s_tags(&tags);
        let keys: Vec<&str> = out.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, vec!["time", "msgid", "batch", "+typing"]);
    }

    #[test]
    fn server_time_format_shape() {
        let t = format_server_time(1_700_000_000_000);
        assert!(t.ends_with('Z'));
        assert_eq!(t.len(), "2023-11-14T22:13:20.000Z".len());
    }
}
