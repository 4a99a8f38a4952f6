//! The wire framer: one line in, one [`Frame`] out.
//!
//! A frame is UTF-8 text of the shape
//!
//! ```text
//! [ '@' tags ' ' ] [ origin ' ' ] token [ ' ' param ]* [ ' :' trailing ]
//! ```
//!
//! The tag section (including the `@`) is limited to 8191 bytes and the
//! body to 512 bytes including CRLF. Any violation is a [`FrameError`]
//! and the owning link is closed; the stream is never resynchronized.

use crate::error::FrameError;
use crate::numeric::is_numeric_str;
use crate::tags::{parse_tags, serialize_tags, Tag};

/// Maximum tag-section length in bytes, `@` included.
pub const MAX_TAG_SECTION: usize = 8191;

/// Maximum body length in bytes, CRLF included.
pub const MAX_BODY: usize = 512;

/// Whether the first body word may be a numeric origin.
///
/// Server links carry numeric origins; client connections never do, and
/// a handful of client commands (`TOPIC`, `ERROR`) would otherwise be
/// indistinguishable from 5-symbol numerics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginMode {
    /// Server-to-server link: detect a leading numeric origin.
    Server,
    /// Client connection: the first word is always the command token.
    Client,
}

/// A parsed wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message tags, unescaped. Empty when the line carried none.
    pub tags: Vec<Tag>,
    /// Numeric origin (2 or 5 symbols), when present.
    pub origin: Option<String>,
    /// The command token, as received.
    pub token: String,
    /// Middle parameters.
    pub params: Vec<String>,
    /// The trailing parameter, spaces preserved. May be empty.
    pub trailing: Option<String>,
}

impl Frame {
    /// Start a frame with the given token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            tags: Vec::new(),
            origin: None,
            token: token.into(),
            params: Vec::new(),
            trailing: None,
        }
    }

    /// Set the origin numeric.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
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

    /// Append a tag.
    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    /// Look up a tag value by key.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .and_then(|t| t.value.as_deref())
    }

    /// Parameter by index.
    pub fn param(&self, i: usize) -> Option<&str> {
        self.params.get(i).map(String::as_str)
    }

    /// Parse one line (no CRLF) into a frame.
    pub fn parse(line: &str, mode: OriginMode) -> Result<Self, FrameError> {
        let (tags, body) = split_tags(line)?;

        if body.len() + 2 > MAX_BODY {
            return Err(FrameError::BodyTooLong {
                len: body.len() + 2,
                limit: MAX_BODY,
            });
        }

        let mut rest = body;
        let first = next_word(&mut rest).ok_or(FrameError::MissingToken)?;

        let (origin, token) = match mode {
            OriginMode::Server if looks_like_origin(first) => {
                // A numeric origin must be followed by a token; `ERROR
                // :reason` and a bare `EB` fall through to the token path.
                skip_spaces(&mut rest);
                if rest.is_empty() || rest.starts_with(':') {
                    (None, first.to_owned())
                } else {
                    match next_word(&mut rest) {
                        Some(word) => (Some(first.to_owned()), word.to_owned()),
                        None => (None, first.to_owned()),
                    }
                }
            }
            _ => (None, first.to_owned()),
        };

        let mut params = Vec::new();
        let mut trailing = None;
        loop {
            skip_spaces(&mut rest);
            if rest.is_empty() {
                break;
            }
            if let Some(t) = rest.strip_prefix(':') {
                trailing = Some(t.to_owned());
                break;
            }
            match next_word(&mut rest) {
                Some(word) => params.push(word.to_owned()),
                None => break,
            }
        }

        Ok(Self {
            tags,
            origin,
            token,
            params,
            trailing,
        })
    }

    /// Serialize back to a wire line (no CRLF).
    ///
    /// Middle parameters must be space-free, non-empty, and not start
    /// with `:`; only the trailing slot can carry those.
    pub fn serialize(&self) -> Result<String, FrameError> {
        let mut out = String::new();
        if !self.tags.is_empty() {
            out.push('@');
            out.push_str(&serialize_tags(&self.tags));
            out.push(' ');
        }
        if let Some(origin) = &self.origin {
            out.push_str(origin);
            out.push(' ');
        }
        out.push_str(&self.token);
        for param in &self.params {
            if param.is_empty() || param.starts_with(':') || param.contains(' ') {
                return Err(FrameError::UnserializableParam(param.clone()));
            }
            out.push(' ');
            out.push_str(param);
        }
        if let Some(trailing) = &self.trailing {
            out.push_str(" :");
            out.push_str(trailing);
        }
        Ok(out)
    }
}

/// Strip and parse an optional tag section; returns (tags, body).
fn split_tags(line: &str) -> Result<(Vec<Tag>, &str), FrameError> {
    let Some(after_at) = line.strip_prefix('@') else {
        return Ok((Vec::new(), line));
    };
    let space = after_at
        .find(' ')
        .ok_or(FrameError::UnterminatedTags)?;
    let section_len = space + 1; // '@' plus the section
    if section_len > MAX_TAG_SECTION {
        return Err(FrameError::TagSectionTooLong {
            len: section_len,
            limit: MAX_TAG_SECTION,
        });
    }
    let tags = parse_tags(&after_at[..space]);
    let mut body = &after_at[space..];
    skip_spaces(&mut body);
    Ok((tags, body))
}

/// True when the word could be a 2- or 5-symbol numeric origin.
fn looks_like_origin(word: &str) -> bool {
    (word.len() == 2 || word.len() == 5) && is_numeric_str(word)
}

fn skip_spaces(rest: &mut &str) {
    while let Some(r) = rest.strip_prefix(' ') {
        *rest = r;
    }
}

fn next_word<'a>(rest: &mut &'a str) -> Option<&'a str> {
    skip_spaces(rest);
    if rest.is_empty() {
        return None;
    }
    match rest.find(' ') {
        Some(i) => {
            let word = &rest[..i];
            *rest = &rest[i..];
            Some(word)
        }
        None => {
            let word = *rest;
            *rest = "";
            Some(word)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_nick_introduction() {
        let f = Frame::parse(
            "AB N alice 1 1200000000 u host +ir alice B]AAAB ABAAB :Alice",
            OriginMode::Server,
        )
        .unwrap();
        assert_eq!(f.origin.as_deref(), Some("AB"));
        assert_eq!(f.token, "N");
        assert_eq!(f.params.len(), 8);
        assert_eq!(f.trailing.as_deref(), Some("Alice"));
    }

    #[test]
    fn parse_token_only_is_not_origin() {
        // A bare `EB` is the end-of-burst token even though the word is
        // numeric-shaped.
        let f = Frame::parse("EB", OriginMode::Server).unwrap();
        assert_eq!(f.origin, None);
        assert_eq!(f.token, "EB");
    }

    #[test]
    fn parse_origin_then_short_token() {
        let f = Frame::parse("AB EB", OriginMode::Server).unwrap();
        assert_eq!(f.origin.as_deref(), Some("AB"));
        assert_eq!(f.token, "EB");
    }

    #[test]
    fn parse_error_line_is_not_origin() {
        // ERROR is 5 alphabet symbols but is followed only by a trailing.
        let f = Frame::parse("ERROR :closing link", OriginMode::Server).unwrap();
        assert_eq!(f.origin, None);
        assert_eq!(f.token, "ERROR");
        assert_eq!(f.trailing.as_deref(), Some("closing link"));
    }

    #[test]
    fn client_mode_never_detects_origin() {
        let f = Frame::parse("TOPIC #room :new topic", OriginMode::Client).unwrap();
        assert_eq!(f.origin, None);
        assert_eq!(f.token, "TOPIC");
        assert_eq!(f.params, vec!["#room"]);
    }

    #[test]
    fn trailing_preserves_spaces_and_may_be_empty() {
        let f = Frame::parse("ABAAB ML -ABAAB12 #room :", OriginMode::Server).unwrap();
        assert_eq!(f.trailing.as_deref(), Some(""));

        let f = Frame::parse("P #room :hello  world ", OriginMode::Server).unwrap();
        assert_eq!(f.trailing.as_deref(), Some("hello  world "));
    }

    #[test]
    fn tags_parse_and_strip() {
        let f = Frame::parse(
            "@time=2026-01-01T00:00:00.000Z;+typing=active ABAAB TM #room",
            OriginMode::Server,
        )
        .unwrap();
        assert_eq!(f.tags.len(), 2);
        assert_eq!(f.tag_value("time"), Some("2026-01-01T00:00:00.000Z"));
        assert_eq!(f.origin.as_deref(), Some("ABAAB"));
        assert_eq!(f.token, "TM");
    }

    #[test]
    fn oversize_body_rejected() {
        let line = format!("P #room :{}", "x".repeat(600));
        let err = Frame::parse(&line, OriginMode::Server).unwrap_err();
        assert!(matches!(err, FrameError::BodyTooLong { .. }));
    }

    #[test]
    fn oversize_tags_rejected() {
        let line = format!("@k={} P #room :hi", "v".repeat(MAX_TAG_SECTION));
        let err = Frame::parse(&line, OriginMode::Server).unwrap_err();
        assert!(matches!(err, FrameError::TagSectionTooLong { .. }));
    }

    #[test]
    fn unterminated_tags_rejected() {
        let err = Frame::parse("@time=now", OriginMode::Server).unwrap_err();
        assert_eq!(err, FrameError::UnterminatedTags);
    }

    #[test]
    fn empty_line_has_no_token() {
        assert_eq!(
            Frame::parse("", OriginMode::Server).unwrap_err(),
            FrameError::MissingToken
        );
        assert_eq!(
            Frame::parse("@t=1 ", OriginMode::Server).unwrap_err(),
            FrameError::MissingToken
        );
    }

    #[test]
    fn serialize_roundtrip() {
        let frames = [
            Frame::new("N")
                .with_origin("AB")
                .with_param("alice")
                .with_param("1")
                .with_trailing("Alice Example"),
            Frame::new("EB").with_origin("AB"),
            Frame::new("TM")
                .with_origin("ABAAB")
                .with_param("#room")
                .with_tag(Tag::new("+typing", "active")),
            Frame::new("ML")
                .with_origin("ABAAB")
                .with_param("-ABAAB12")
                .with_param("#room")
                .with_trailing(""),
        ];
        for frame in frames {
            let line = frame.serialize().unwrap();
            let parsed = Frame::parse(&line, OriginMode::Server).unwrap();
            assert_eq!(parsed, frame, "line was {line:?}");
        }
    }

    #[test]
    fn serialize_rejects_inline_spaces() {
        let f = Frame::new("P").with_param("two words");
        assert!(matches!(
            f.serialize().unwrap_err(),
            FrameError::UnserializableParam(_)
        ));
    }
}
