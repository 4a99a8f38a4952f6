//! Standard replies (`FAIL`/`WARN`/`NOTE`) and the numeric replies the
//! client surface uses.

use std::fmt;

/// Severity of a standard reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySeverity {
    /// `FAIL` - the command did not happen.
    Fail,
    /// `WARN` - the command happened with caveats.
    Warn,
    /// `NOTE` - informational.
    Note,
}

impl ReplySeverity {
    /// The wire verb.
    pub fn verb(self) -> &'static str {
        match self {
            ReplySeverity::Fail => "FAIL",
            ReplySeverity::Warn => "WARN",
            ReplySeverity::Note => "NOTE",
        }
    }
}

/// A structured standard reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardReply {
    /// Severity verb.
    pub severity: ReplySeverity,
    /// The command being replied to (`*` when none applies).
    pub command: String,
    /// Machine-readable code.
    pub code: &'static str,
    /// Context parameters between code and description.
    pub context: Vec<String>,
    /// Human-readable description.
    pub description: String,
}

impl StandardReply {
    /// Build a `FAIL`.
    pub fn fail(command: &str, code: &'static str, description: impl Into<String>) -> Self {
        Self {
            severity: ReplySeverity::Fail,
            command: command.to_owned(),
            code,
            context: Vec::new(),
            description: description.into(),
        }
    }

    /// Build a `WARN`.
    pub fn warn(command: &str, code: &'static str, description: impl Into<String>) -> Self {
        Self {
            severity: ReplySeverity::Warn,
            command: command.to_owned(),
            code,
            context: Vec::new(),
            description: description.into(),
        }
    }

    /// Build a `NOTE`.
    pub fn note(command: &str, code: &'static str, description: impl Into<String>) -> Self {
        Self {
            severity: ReplySeverity::Note,
            command: command.to_owned(),
            code,
            context: Vec::new(),
            description: description.into(),
        }
    }

    /// Append a context parameter.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context.push(context.into());
        self
    }
}

impl fmt::Display for StandardReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.severity.verb(), self.command, self.code)?;
        for c in &self.context {
            write!(f, " {c}")?;
        }
        write!(f, " :{}", self.description)
    }
}

/// Machine-readable standard-reply codes.
pub mod codes {
    #![allow(missing_docs)]

    pub const NEED_MORE_PARAMS: &str = "NEED_MORE_PARAMS";
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
    pub const INVALID_TARGET: &str = "INVALID_TARGET";
    pub const TEMPORARILY_UNAVAILABLE: &str = "TEMPORARILY_UNAVAILABLE";
    pub const ACCOUNT_EXISTS: &str = "ACCOUNT_EXISTS";
    pub const BAD_ACCOUNT_NAME: &str = "BAD_ACCOUNT_NAME";
    pub const ACCOUNT_NAME_MUST_BE_NICK: &str = "ACCOUNT_NAME_MUST_BE_NICK";
    pub const NEED_NICK: &str = "NEED_NICK";
    pub const ALREADY_AUTHENTICATED: &str = "ALREADY_AUTHENTICATED";
    pub const WEAK_PASSWORD: &str = "WEAK_PASSWORD";
    pub const INVALID_EMAIL: &str = "INVALID_EMAIL";
    pub const INVALID_CODE: &str = "INVALID_CODE";
    pub const MULTILINE_MAX_BYTES: &str = "MULTILINE_MAX_BYTES";
    pub const MULTILINE_MAX_LINES: &str = "MULTILINE_MAX_LINES";
    pub const MULTILINE_INVALID_TARGET: &str = "MULTILINE_INVALID_TARGET";
    pub const MULTILINE_INVALID: &str = "MULTILINE_INVALID";
    pub const BATCH_ALREADY_OPEN: &str = "BATCH_ALREADY_OPEN";
    pub const INVALID_BATCH_ID: &str = "INVALID_BATCH_ID";
    pub const BATCH_ID_MISMATCH: &str = "BATCH_ID_MISMATCH";
    pub const UNSUPPORTED_TYPE: &str = "UNSUPPORTED_TYPE";
    pub const REDACT_FORBIDDEN: &str = "REDACT_FORBIDDEN";
    pub const REDACT_WINDOW_EXPIRED: &str = "REDACT_WINDOW_EXPIRED";
    pub const UNKNOWN_MSGID: &str = "UNKNOWN_MSGID";
    pub const CHANNEL_NAME_IN_USE: &str = "CHANNEL_NAME_IN_USE";
    pub const CANNOT_RENAME: &str = "CANNOT_RENAME";
    pub const CHANNEL_RENAMED: &str = "CHANNEL_RENAMED";
    pub const MESSAGE_ERROR: &str = "MESSAGE_ERROR";
    pub const INVALID_MSGREFTYPE: &str = "INVALID_MSGREFTYPE";
    pub const KEY_NOT_SET: &str = "KEY_NOT_SET";
    pub const KEY_NO_PERMISSION: &str = "KEY_NO_PERMISSION";
    pub const INVALID_ENDPOINT: &str = "INVALID_ENDPOINT";
}

/// Numeric replies used by the client surface.
pub mod numerics {
    #![allow(missing_docs)]

    pub const RPL_WELCOME: u16 = 1;
    pub const RPL_YOURHOST: u16 = 2;
    pub const RPL_CREATED: u16 = 3;
    pub const RPL_MYINFO: u16 = 4;
    pub const RPL_ISUPPORT: u16 = 5;
    pub const RPL_UMODEIS: u16 = 221;
    pub const RPL_AWAY: u16 = 301;
    pub const RPL_UNAWAY: u16 = 305;
    pub const RPL_NOWAWAY: u16 = 306;
    pub const RPL_CHANNELMODEIS: u16 = 324;
    pub const RPL_NOTOPIC: u16 = 331;
    pub const RPL_TOPIC: u16 = 332;
    pub const RPL_INVITING: u16 = 341;
    pub const RPL_NAMREPLY: u16 = 353;
    pub const RPL_ENDOFNAMES: u16 = 366;
    pub const RPL_BANLIST: u16 = 367;
    pub const RPL_ENDOFBANLIST: u16 = 368;

    pub const ERR_NOSUCHNICK: u16 = 401;
    pub const ERR_NOSUCHCHANNEL: u16 = 403;
    pub const ERR_CANNOTSENDTOCHAN: u16 = 404;
    pub const ERR_UNKNOWNCOMMAND: u16 = 421;
    pub const ERR_ERRONEUSNICKNAME: u16 = 432;
    pub const ERR_NICKNAMEINUSE: u16 = 433;
    pub const ERR_USERNOTINCHANNEL: u16 = 441;
    pub const ERR_NOTONCHANNEL: u16 = 442;
    pub const ERR_NOTREGISTERED: u16 = 451;
    pub const ERR_NEEDMOREPARAMS: u16 = 461;
    pub const ERR_ALREADYREGISTERED: u16 = 462;
    pub const ERR_CHANNELISFULL: u16 = 471;
    pub const ERR_INVITEONLYCHAN: u16 = 473;
    pub const ERR_BANNEDFROMCHAN: u16 = 474;
    pub const ERR_BADCHANNELKEY: u16 = 475;
    pub const ERR_CHANOPRIVSNEEDED: u16 = 482;

    pub const RPL_LOGGEDIN: u16 = 900;
    pub const RPL_LOGGEDOUT: u16 = 901;
    pub const RPL_SASLSUCCESS: u16 = 903;
    pub const ERR_SASLFAIL: u16 = 904;
    pub const ERR_SASLTOOLONG: u16 = 905;
    pub const ERR_SASLABORTED: u16 = 906;
    pub const ERR_SASLALREADY: u16 = 907;
    pub const RPL_SASLMECHS: u16 = 908;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_serializes_with_context() {
        let reply = StandardReply::fail("METADATA", codes::TEMPORARILY_UNAVAILABLE, "try later")
            .with_context("offlineAcct")
            .with_context("avatar");
        assert_eq!(
            reply.to_string(),
            "FAIL METADATA TEMPORARILY_UNAVAILABLE offlineAcct avatar :try later"
        );
    }

    #[test]
    fn note_without_context() {
        let reply = StandardReply::note("RENAME", codes::CHANNEL_RENAMED, "renamed");
        assert_eq!(reply.to_string(), "NOTE RENAME CHANNEL_RENAMED :renamed");
    }
}
