//! Error types for the wire layer.

use thiserror::Error;

/// Errors raised while framing or parsing a wire line.
///
/// Every variant is fatal for the link that produced it: the daemon
/// closes the connection rather than attempting stream recovery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The tag section exceeded the 8191-byte limit.
    #[error("tag section exceeds {limit} bytes ({len})")]
    TagSectionTooLong {
        /// Observed length in bytes.
        len: usize,
        /// The enforced limit.
        limit: usize,
    },

    /// The message body exceeded the 512-byte limit (CRLF included).
    #[error("message body exceeds {limit} bytes ({len})")]
    BodyTooLong {
        /// Observed length in bytes.
        len: usize,
        /// The enforced limit.
        limit: usize,
    },

    /// The line was not valid UTF-8.
    #[error("malformed UTF-8 in frame")]
    InvalidUtf8,

    /// A tag section was present but contained no terminating space.
    #[error("tag section is not terminated")]
    UnterminatedTags,

    /// The frame carried no command token.
    #[error("frame has no command token")]
    MissingToken,

    /// A parameter that must be serialized inline contained a space or
    /// leading colon and no trailing slot was free.
    #[error("parameter {0:?} cannot be serialized inline")]
    UnserializableParam(String),
}

/// Errors raised while decoding numerics or numeric-encoded IPs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NumericError {
    /// A character outside the 64-symbol alphabet.
    #[error("invalid numeric character {0:?}")]
    InvalidChar(char),

    /// The numeric had the wrong number of symbols.
    #[error("numeric has invalid length {0}")]
    InvalidLength(usize),

    /// A decoded value fell outside its domain.
    #[error("numeric value out of range")]
    OutOfRange,

    /// An IP encoding that decodes to neither IPv4 nor IPv6.
    #[error("invalid encoded IP address {0:?}")]
    InvalidIp(String),
}
