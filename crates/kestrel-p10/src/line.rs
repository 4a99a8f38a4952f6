//! Tokio codec for the wire: CRLF-terminated lines with the tag-section
//! and body limits enforced at the byte level, before parsing.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;
use crate::frame::{MAX_BODY, MAX_TAG_SECTION};

/// Maximum bytes a single line may occupy on the wire: the tag section,
/// the space after it, and the body (whose own limit includes CRLF).
const MAX_LINE: usize = MAX_TAG_SECTION + 1 + MAX_BODY;

/// Byte-level line codec.
///
/// Decoding yields complete lines without their terminator, tolerating
/// lone `\n`. Oversize input is rejected before any parsing happens;
/// the connection owning this codec must then be closed.
#[derive(Debug, Default)]
pub struct LineCodec {
    scanned: usize,
}

impl LineCodec {
    /// Fresh codec.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        let newline = src[self.scanned..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| p + self.scanned);

        let Some(newline) = newline else {
            if src.len() > MAX_LINE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    FrameError::BodyTooLong {
                        len: src.len(),
                        limit: MAX_LINE,
                    }
                    .to_string(),
                ));
            }
            self.scanned = src.len();
            return Ok(None);
        };

        self.scanned = 0;
        let mut line = src.split_to(newline + 1);
        line.truncate(newline);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }

        let text = std::str::from_utf8(&line).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                FrameError::InvalidUtf8.to_string(),
            )
        })?;
        line_within_limits(text)?;
        Ok(Some(text.to_owned()))
    }
}

impl Encoder<String> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        line_within_limits(&item)?;
        dst.reserve(item.len() + 2);
        dst.put_slice(item.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Check the tag-section and body limits on a terminator-free line.
fn line_within_limits(line: &str) -> Result<(), std::io::Error> {
    let reject = |err: FrameError| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
    };

    let body = if line.starts_with('@') {
        match line.find(' ') {
            Some(space) => {
                if space + 1 > MAX_TAG_SECTION {
                    return Err(reject(FrameError::TagSectionTooLong {
                        len: space + 1,
                        limit: MAX_TAG_SECTION,
                    }));
                }
                &line[space + 1..]
            }
            // Unterminated tag section; the frame parser reports it.
            None => return Ok(()),
        }
    } else {
        line
    };

    if body.len() + 2 > MAX_BODY {
        return Err(reject(FrameError::BodyTooLong {
            len: body.len() + 2,
            limit: MAX_BODY,
        }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut LineCodec, bytes: &[u8]) -> Vec<String> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Ok(Some(line)) = codec.decode(&mut buf) {
            out.push(line);
        }
        out
    }

    #[test]
    fn decodes_crlf_and_lone_lf() {
        let mut codec = LineCodec::new();
        let lines = decode_all(&mut codec, b"first\r\nsecond\nthird\r\n");
        assert_eq!(lines, vec!["first", "second", "third"]);
    }

    #[test]
    fn partial_line_waits() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"incompl"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"ete\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("incomplete"));
    }

    #[test]
    fn oversize_body_is_an_error() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"P #room :");
        buf.extend_from_slice(&vec![b'x'; 600]);
        buf.extend_from_slice(b"\r\n");
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn tagged_line_gets_extra_room() {
        let mut codec = LineCodec::new();
        let tag_value = "v".repeat(1000);
        let line = format!("@k={tag_value} P #room :hi\r\n");
        let mut buf = BytesMut::from(line.as_bytes());
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn invalid_utf8_is_an_error() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"P #room :\xff\xfe\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn encode_appends_crlf() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("EB".to_owned(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"EB\r\n");
    }

    #[test]
    fn encode_rejects_oversize() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        let line = format!("P #room :{}", "x".repeat(600));
        assert!(codec.encode(line, &mut buf).is_err());
    }
}
