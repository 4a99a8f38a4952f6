//! IRCv3 message-tag escaping and the [`Tag`] type.

use std::fmt::Write as _;

/// One message tag: a key (client-only tags keep their `+` prefix) and an
/// optional value, stored unescaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Tag key, including the `+` prefix for client-only tags.
    pub key: String,
    /// Unescaped value; `None` when the tag carries no `=`.
    pub value: Option<String>,
}

impl Tag {
    /// Construct a tag with a value.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Construct a value-less tag.
    pub fn flag(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    /// True for client-only (`+`-prefixed) tags.
    pub fn is_client_only(&self) -> bool {
        self.key.starts_with('+')
    }
}

/// Escape a tag value for the wire.
pub fn escape_tag_value(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
}

/// Unescape a tag value from the wire.
///
/// Unknown escapes decode to the literal character; a lone trailing
/// backslash is dropped.
pub fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut iter = value.chars();
    while let Some(c) = iter.next() {
        let r = if c == '\\' {
            match iter.next() {
                Some(':') => ';',
                Some('s') => ' ',
                Some('\\') => '\\',
                Some('r') => '\r',
                Some('n') => '\n',
                Some(c) => c,
                None => break,
            }
        } else {
            c
        };
        out.push(r);
    }
    out
}

/// Parse the tag section (without the leading `@`) into tags.
pub fn parse_tags(section: &str) -> Vec<Tag> {
    section
        .split(';')
        .filter(|s| !s.is_empty())
        .map(|item| {
            let mut iter = item.splitn(2, '=');
            let key = iter.next().unwrap_or("").to_owned();
            let value = iter.next().map(unescape_tag_value);
            Tag { key, value }
        })
        .collect()
}

/// Serialize tags into a section string (without the leading `@`).
pub fn serialize_tags(tags: &[Tag]) -> String {
    let mut out = String::new();
    for (i, tag) in tags.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        let _ = write!(out, "{}", tag.key);
        if let Some(value) = &tag.value {
            out.push('=');
            escape_tag_value(&mut out, value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_known_sequences() {
        assert_eq!(unescape_tag_value("a\\:b"), "a;b");
        assert_eq!(unescape_tag_value("hello\\sworld"), "hello world");
        assert_eq!(unescape_tag_value("path\\\\file"), "path\\file");
        assert_eq!(unescape_tag_value("a\\rb\\nc"), "a\rb\nc");
    }

    #[test]
    fn unescape_unknown_is_literal() {
        assert_eq!(unescape_tag_value("a\\xb"), "axb");
    }

    #[test]
    fn unescape_drops_trailing_backslash() {
        assert_eq!(unescape_tag_value("test\\"), "test");
    }

    #[test]
    fn escape_roundtrip() {
        for original in ["simple", "with space", "a;b", "a\\b", "cr\rlf\n", "; \\ \r \n"] {
            let mut escaped = String::new();
            escape_tag_value(&mut escaped, original);
            assert_eq!(unescape_tag_value(&escaped), original);
        }
    }

    #[test]
    fn parse_section() {
        let tags = parse_tags("time=2026-01-01T00:00:00.000Z;+typing=active;flag");
        assert_eq!(tags.len(), 3);
        assert_eq!(tags[0].key, "time");
        assert_eq!(tags[0].value.as_deref(), Some("2026-01-01T00:00:00.000Z"));
        assert!(tags[1].is_client_only());
        assert_eq!(tags[2].value, None);
    }

    #[test]
    fn serialize_section_escapes_values() {
        let tags = vec![Tag::new("k", "a b;c"), Tag::flag("+f")];
        assert_eq!(serialize_tags(&tags), "k=a\\sb\\:c;+f");
    }

    #[test]
    fn empty_items_skipped() {
        let tags = parse_tags("a=1;;b=2");
        assert_eq!(tags.len(), 2);
    }
}
