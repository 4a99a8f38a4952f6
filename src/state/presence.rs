//! Account presence aggregation.
//!
//! When enabled, an account with several local connections presents one
//! effective away state to the network: present if any connection is
//! present; otherwise away with the oldest connection's message;
//! otherwise (all away-star) hidden behind a substitute message.
//! Broadcasts fire on effective-value transitions only.

use std::collections::HashMap;

use super::{AwayState, User};

/// The effective presence of an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectivePresence {
    /// At least one connection is present.
    Present,
    /// Away with the oldest away-with-message connection's text.
    Away(String),
    /// Every connection is away-star.
    Hidden,
}

impl EffectivePresence {
    /// The `$presence` virtual metadata value.
    pub fn as_metadata(&self) -> &str {
        match self {
            EffectivePresence::Present => "present",
            EffectivePresence::Away(_) => "away",
            EffectivePresence::Hidden => "hidden",
        }
    }
}

/// Tracks effective presence and transition timestamps per account.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    current: HashMap<String, EffectivePresence>,
    last_present: HashMap<String, i64>,
    last_broadcast: HashMap<String, i64>,
}

impl PresenceTracker {
    /// Fresh tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the effective presence over an account's connections.
    pub fn compute<'a>(
        connections: impl Iterator<Item = &'a User>,
        away_star_msg: &str,
    ) -> Option<EffectivePresence> {
        let mut any = false;
        let mut oldest_away: Option<(&User, &str)> = None;
        let mut all_star = true;
        for user in connections {
            any = true;
            match &user.away {
                AwayState::Present => return Some(EffectivePresence::Present),
                AwayState::Away(msg) => {
                    all_star = false;
                    let older = oldest_away
                        .map(|(u, _)| user.connect_ts < u.connect_ts)
                        .unwrap_or(true);
                    if older {
                        oldest_away = Some((user, msg));
                    }
                }
                AwayState::AwayStar => {}
            }
        }
        if !any {
            return None;
        }
        if all_star {
            return Some(EffectivePresence::Hidden);
        }
        Some(EffectivePresence::Away(
            oldest_away
                .map(|(_, m)| m.to_owned())
                .unwrap_or_else(|| away_star_msg.to_owned()),
        ))
    }

    /// Record a freshly-computed value; returns it when it differs
    /// from the stored effective value (i.e. a broadcast is due).
    pub fn transition(
        &mut self,
        account: &str,
        next: EffectivePresence,
        now: i64,
    ) -> Option<EffectivePresence> {
        let previous = self.current.get(account);
        if previous == Some(&next) {
            return None;
        }
        if matches!(previous, Some(EffectivePresence::Present))
            && !matches!(next, EffectivePresence::Present)
        {
            self.last_present.insert(account.to_owned(), now);
        }
        self.current.insert(account.to_owned(), next.clone());
        Some(next)
    }

    /// Throttle check: true when a broadcast may fire now.
    pub fn may_broadcast(&mut self, account: &str, now: i64, throttle: i64) -> bool {
        let ok = self
            .last_broadcast
            .get(account)
            .map(|&t| now - t >= throttle)
            .unwrap_or(true);
        if ok {
            self.last_broadcast.insert(account.to_owned(), now);
        }
        ok
    }

    /// The `$last_present` virtual metadata value.
    pub fn last_present(&self, account: &str) -> Option<i64> {
        self.last_present.get(account).copied()
    }

    /// Drop tracking for an account with no remaining connections.
    pub fn forget(&mut self, account: &str) {
        self.current.remove(account);
        self.last_broadcast.remove(account);
    }

    /// Current effective value, if tracked.
    pub fn current(&self, account: &str) -> Option<&EffectivePresence> {
        self.current.get(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_p10::mode::IntroModes;
    use std::collections::HashSet;

    fn conn(connect_ts: i64, away: AwayState) -> User {
        User {
            numeric: "ABAAB".parse().unwrap(),
            nick: "n".into(),
            ident: "n".into(),
            host: "h".into(),
            realname: "r".into(),
            nick_ts: 0,
            connect_ts,
            ip: String::new(),
            modes: IntroModes::default(),
            channels: HashSet::new(),
            away,
            conn: Some(1),
        }
    }

    #[test]
    fn any_present_wins() {
        let users = [
            conn(10, AwayState::Away("gone".into())),
            conn(20, AwayState::Present),
        ];
        assert_eq!(
            PresenceTracker::compute(users.iter(), "Away"),
            Some(EffectivePresence::Present)
        );
    }

    #[test]
    fn oldest_connection_message_wins() {
        let users = [
            conn(20, AwayState::Away("newer".into())),
            conn(10, AwayState::Away("older".into())),
            conn(30, AwayState::AwayStar),
        ];
        assert_eq!(
            PresenceTracker::compute(users.iter(), "Away"),
            Some(EffectivePresence::Away("older".into()))
        );
    }

    #[test]
    fn all_star_hides() {
        let users = [conn(10, AwayState::AwayStar)];
        assert_eq!(
            PresenceTracker::compute(users.iter(), "Away"),
            Some(EffectivePresence::Hidden)
        );
    }

    #[test]
    fn transition_fires_once_per_change() {
        let mut tracker = PresenceTracker::new();
        assert!(tracker
            .transition("acct", EffectivePresence::Present, 100)
            .is_some());
        assert!(tracker
            .transition("acct", EffectivePresence::Present, 101)
            .is_none());
        assert!(tracker
            .transition("acct", EffectivePresence::Away("x".into()), 102)
            .is_some());
        assert_eq!(tracker.last_present("acct"), Some(102));
    }

    #[test]
    fn throttle_suppresses_rapid_broadcasts() {
        let mut tracker = PresenceTracker::new();
        assert!(tracker.may_broadcast("acct", 100, 10));
        assert!(!tracker.may_broadcast("acct", 105, 10));
        assert!(tracker.may_broadcast("acct", 111, 10));
    }
}
