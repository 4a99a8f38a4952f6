//! The token catalogue.
//!
//! Every wire command is a 1- or 2-character token. The catalogue is a
//! closed sum: tokens outside it are ignored on server links (with a log
//! line on the daemon side) for forward compatibility.

/// A recognized wire token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    /// `G` - ping.
    Ping,
    /// `Z` - pong.
    Pong,
    /// `N` - nick introduction or nick change.
    Nick,
    /// `Q` - quit.
    Quit,
    /// `K` - kick (also carries inbound kills during collision handling).
    Kick,
    /// `J` - join.
    Join,
    /// `L` - part.
    Part,
    /// `M` - mode change.
    Mode,
    /// `B` - channel burst.
    Burst,
    /// `EB` - end of burst.
    EndOfBurst,
    /// `EA` - end-of-burst acknowledgement.
    EobAck,
    /// `SQ` - squit.
    Squit,
    /// `S` - server introduction.
    Server,
    /// `P` - privmsg.
    Privmsg,
    /// `O` - notice.
    Notice,
    /// `AC` - account set/unset.
    Account,
    /// `FA` - fakehost.
    Fakehost,
    /// `I` - invite.
    Invite,
    /// `A` - away.
    Away,
    /// `SE` - setname.
    Setname,
    /// `TM` - tagmsg.
    Tagmsg,
    /// `BT` - server-to-server batch marker (netjoin/netsplit).
    Batch,
    /// `CH` - chathistory federation.
    Chathistory,
    /// `RD` - redact.
    Redact,
    /// `RG` - account registration request.
    Register,
    /// `VF` - account verification request.
    Verify,
    /// `RR` - registration reply from services.
    RegReply,
    /// `MR` - read marker.
    MarkRead,
    /// `RN` - channel rename.
    Rename,
    /// `MD` - metadata set/clear.
    Metadata,
    /// `MDQ` - metadata query.
    MetadataQuery,
    /// `WP` - webpush.
    Webpush,
    /// `ML` - multiline fan-out.
    Multiline,
    /// `SA` - SASL relay.
    Sasl,
}

impl Token {
    /// The wire spelling.
    pub fn as_wire(self) -> &'static str {
        match self {
            Token::Ping => "G",
            Token::Pong => "Z",
            Token::Nick => "N",
            Token::Quit => "Q",
            Token::Kick => "K",
            Token::Join => "J",
            Token::Part => "L",
            Token::Mode => "M",
            Token::Burst => "B",
            Token::EndOfBurst => "EB",
            Token::EobAck => "EA",
            Token::Squit => "SQ",
            Token::Server => "S",
            Token::Privmsg => "P",
            Token::Notice => "O",
            Token::Account => "AC",
            Token::Fakehost => "FA",
            Token::Invite => "I",
            Token::Away => "A",
            Token::Setname => "SE",
            Token::Tagmsg => "TM",
            Token::Batch => "BT",
            Token::Chathistory => "CH",
            Token::Redact => "RD",
            Token::Register => "RG",
            Token::Verify => "VF",
            Token::RegReply => "RR",
            Token::MarkRead => "MR",
            Token::Rename => "RN",
            Token::Metadata => "MD",
            Token::MetadataQuery => "MDQ",
            Token::Webpush => "WP",
            Token::Multiline => "ML",
            Token::Sasl => "SA",
        }
    }

    /// Parse a wire token; `None` for anything outside the catalogue.
    pub fn from_wire(s: &str) -> Option<Self> {
        Some(match s {
            "G" => Token::Ping,
            "Z" => Token::Pong,
            "N" => Token::Nick,
            "Q" => Token::Quit,
            "K" => Token::Kick,
            "J" => Token::Join,
            "L" => Token::Part,
            "M" => Token::Mode,
            "B" => Token::Burst,
            "EB" => Token::EndOfBurst,
            "EA" => Token::EobAck,
            "SQ" => Token::Squit,
            "S" => Token::Server,
            "P" => Token::Privmsg,
            "O" => Token::Notice,
            "AC" => Token::Account,
            "FA" => Token::Fakehost,
            "I" => Token::Invite,
            "A" => Token::Away,
            "SE" => Token::Setname,
            "TM" => Token::Tagmsg,
            "BT" => Token::Batch,
            "CH" => Token::Chathistory,
            "RD" => Token::Redact,
            "RG" => Token::Register,
            "VF" => Token::Verify,
            "RR" => Token::RegReply,
            "MR" => Token::MarkRead,
            "RN" => Token::Rename,
            "MD" => Token::Metadata,
            "MDQ" => Token::MetadataQuery,
            "WP" => Token::Webpush,
            "ML" => Token::Multiline,
            "SA" => Token::Sasl,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[Token] = &[
        Token::Ping,
        Token::Pong,
        Token::Nick,
        Token::Quit,
        Token::Kick,
        Token::Join,
        Token::Part,
        Token::Mode,
        Token::Burst,
        Token::EndOfBurst,
        Token::EobAck,
        Token::Squit,
        Token::Server,
        Token::Privmsg,
        Token::Notice,
        Token::Account,
        Token::Fakehost,
        Token::Invite,
        Token::Away,
        Token::Setname,
        Token::Tagmsg,
        Token::Batch,
        Token::Chathistory,
        Token::Redact,
        Token::Register,
        Token::Verify,
        Token::RegReply,
        Token::MarkRead,
        Token::Rename,
        Token::Metadata,
        Token::MetadataQuery,
        Token::Webpush,
        Token::Multiline,
        Token::Sasl,
    ];

    #[test]
    fn wire_roundtrip() {
        for &t in ALL {
            assert_eq!(Token::from_wire(t.as_wire()), Some(t));
        }
    }

    #[test]
    fn unknown_tokens_are_none() {
        assert_eq!(Token::from_wire("XX"), None);
        assert_eq!(Token::from_wire("PRIVMSG"), None);
        assert_eq!(Token::from_wire(""), None);
    }

    #[test]
    fn catalogue_is_collision_free() {
        let mut seen = std::collections::HashSet::new();
        for &t in ALL {
            assert!(seen.insert(t.as_wire()), "duplicate wire token {}", t.as_wire());
        }
    }
}
