//! # kestrel-p10
//!
//! The wire layer of the Kestrel IRC daemon: the P10 server-to-server
//! protocol (token-based, numeric-addressed) together with the IRCv3
//! message-tag framing that both client and server links share.
//!
//! The crate is pure: no I/O, no global state beyond compile-time tables.
//! Everything here round-trips - `parse(serialize(f)) == f` for any
//! well-formed frame within the wire limits.
//!
//! ## Layout
//!
//! - [`frame`]: line framer and the [`Frame`] message model
//! - [`tags`]: IRCv3 tag escaping and the [`Tag`] type
//! - [`numeric`]: the base-64 numeric space for servers, users and IPs
//! - [`token`]: the token catalogue as a tagged sum
//! - [`caps`]: capability registry and per-client capability sets
//! - [`msgid`]: message-id generation and wire reference classification
//! - [`reply`]: standard replies (`FAIL`/`WARN`/`NOTE`) and numeric replies
//! - [`mode`]: channel/user mode sets and the mode-delta parser
//! - [`isupport`]: RPL_ISUPPORT token assembly

#![warn(missing_docs)]

pub mod caps;
pub mod error;
pub mod frame;
pub mod isupport;
#[cfg(feature = "tokio")]
pub mod line;
pub mod mode;
pub mod msgid;
pub mod numeric;
pub mod reply;
pub mod tags;
pub mod token;

pub use caps::{CapSet, Capability};
pub use error::{FrameError, NumericError};
pub use frame::{Frame, OriginMode};
#[cfg(feature = "tokio")]
pub use line::LineCodec;
pub use msgid::{MsgIdGenerator, MsgRef};
pub use numeric::{ServerNumeric, UserNumeric};
pub use tags::Tag;
pub use token::Token;

/// Casefold a nickname or channel name for comparison.
///
/// IRC's traditional `rfc1459` casemapping additionally folds
/// `[]\~` to `{}|^`; the numeric alphabet reuses `[` and `]`, so the
/// network-wide uniqueness checks all go through this single helper.
pub fn casefold(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'A'..='Z' => c.to_ascii_lowercase(),
            '[' => '{',
            ']' => '}',
            '\\' => '|',
            '~' => '^',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn casefold_rfc1459() {
        assert_eq!(casefold("Nick[a]\\b~"), "nick{a}|b^");
        assert_eq!(casefold("#Room"), "#room");
    }

    #[test]
    fn casefold_is_idempotent() {
        let once = casefold("Some[Nick]");
        assert_eq!(casefold(&once), once);
    }
}
