//! User records.

use std::collections::HashSet;

use kestrel_p10::mode::IntroModes;
use kestrel_p10::UserNumeric;

use super::ConnId;

/// Away state of a single connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AwayState {
    /// Not away.
    #[default]
    Present,
    /// Away with a message.
    Away(String),
    /// The literal `*` form: away without a disclosed reason.
    AwayStar,
}

impl AwayState {
    /// True for either away form.
    pub fn is_away(&self) -> bool {
        !matches!(self, AwayState::Present)
    }
}

/// Maximum realname length in bytes.
pub const REALNAME_MAX: usize = 50;

/// One user, local or remote.
#[derive(Debug, Clone)]
pub struct User {
    /// Five-symbol numeric.
    pub numeric: UserNumeric,
    /// Current nickname.
    pub nick: String,
    /// Ident/username.
    pub ident: String,
    /// Real hostname.
    pub host: String,
    /// Realname, at most [`REALNAME_MAX`] bytes.
    pub realname: String,
    /// Nick timestamp (collision arbitration).
    pub nick_ts: i64,
    /// Connect timestamp.
    pub connect_ts: i64,
    /// IP in its wire encoding.
    pub ip: String,
    /// User modes including the parameterized carriers.
    pub modes: IntroModes,
    /// Channels this user is on, casefolded.
    pub channels: HashSet<String>,
    /// Away state of this connection.
    pub away: AwayState,
    /// Local connection, when the user is ours.
    pub conn: Option<ConnId>,
}

impl User {
    /// True when this user is attached to a local connection.
    pub fn is_local(&self) -> bool {
        self.conn.is_some()
    }

    /// The account name when logged in (`+r`).
    pub fn account(&self) -> Option<&str> {
        self.modes.account.as_deref()
    }

    /// The host shown to other users: fakehost, then vhost, then
    /// cloaked host, then the real host.
    pub fn visible_host(&self) -> &str {
        self.modes
            .fakehost
            .as_deref()
            .or(self.modes.vhost.as_deref())
            .or(self.modes.cloaked_host.as_deref())
            .unwrap_or(&self.host)
    }

    /// `nick!ident@visible-host` source form.
    pub fn hostmask(&self) -> String {
        format!("{}!{}@{}", self.nick, self.ident, self.visible_host())
    }

    /// `ident@host` as compared during nick collisions.
    pub fn userhost(&self) -> String {
        format!("{}@{}", self.ident, self.host)
    }

    /// Truncate a proposed realname to the storage limit, on a char
    /// boundary.
    pub fn clamp_realname(realname: &str) -> String {
        if realname.len() <= REALNAME_MAX {
            return realname.to_owned();
        }
        let mut end = REALNAME_MAX;
        while end > 0 && !realname.is_char_boundary(end) {
            end -= 1;
        }
        realname[..end].to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> User {
        User {
            numeric: "ABAAB".parse().unwrap(),
            nick: "alice".into(),
            ident: "alice".into(),
            host: "host.example".into(),
            realname: "Alice".into(),
            nick_ts: 100,
            connect_ts: 100,
            ip: "B]AAAB".into(),
            modes: IntroModes::default(),
            channels: HashSet::new(),
            away: AwayState::Present,
            conn: None,
        }
    }

    #[test]
    fn visible_host_precedence() {
        let mut user = sample();
        assert_eq!(user.visible_host(), "host.example");
        user.modes.cloaked_host = Some("cloak.example".into());
        assert_eq!(user.visible_host(), "cloak.example");
        user.modes.vhost = Some("v.example".into());
        assert_eq!(user.visible_host(), "v.example");
        user.modes.fakehost = Some("fake.example".into());
        assert_eq!(user.visible_host(), "fake.example");
    }

    #[test]
    fn realname_clamped_on_char_boundary() {
        let long = "é".repeat(40); // 80 bytes
        let clamped = User::clamp_realname(&long);
        assert!(clamped.len() <= REALNAME_MAX);
        assert!(long.starts_with(&clamped));
    }

    #[test]
    fn away_state() {
        assert!(!AwayState::Present.is_away());
        assert!(AwayState::Away("gone".into()).is_away());
        assert!(AwayState::AwayStar.is_away());
    }
}
