//! Channel records.

use std::collections::{HashMap, HashSet};

use kestrel_p10::mode::{ChannelModes, MemberModes};
use kestrel_p10::UserNumeric;

/// A set topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    /// Topic text.
    pub text: String,
    /// Who set it, as a hostmask or server name.
    pub set_by: String,
    /// When it was set.
    pub ts: i64,
}

/// One channel.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Display-case name (`#room`).
    pub name: String,
    /// Creation/mode timestamp used for merges.
    pub ts: i64,
    /// Flag modes, key and limit.
    pub modes: ChannelModes,
    /// Current topic.
    pub topic: Option<Topic>,
    /// Ban masks.
    pub bans: Vec<String>,
    /// Members and their status.
    pub members: HashMap<UserNumeric, MemberModes>,
    /// Outstanding invites, consumed on join.
    pub invites: HashSet<UserNumeric>,
}

impl Channel {
    /// A channel created now by its first member.
    pub fn new(name: String, ts: i64) -> Self {
        Self {
            name,
            ts,
            modes: ChannelModes::default(),
            topic: None,
            bans: Vec::new(),
            members: HashMap::new(),
            invites: HashSet::new(),
        }
    }

    /// Status of a member, if present.
    pub fn member(&self, numeric: UserNumeric) -> Option<MemberModes> {
        self.members.get(&numeric).copied()
    }

    /// True when the member holds ops.
    pub fn is_op(&self, numeric: UserNumeric) -> bool {
        self.member(numeric).is_some_and(|m| m.op)
    }

    /// True when the member holds ops or halfops.
    pub fn can_moderate(&self, numeric: UserNumeric) -> bool {
        self.member(numeric).is_some_and(|m| m.op || m.halfop)
    }

    /// Add a ban mask, deduplicating.
    pub fn add_ban(&mut self, mask: String) {
        if !self.bans.contains(&mask) {
            self.bans.push(mask);
        }
    }

    /// Strip every member's status and all bans; the older-TS side of a
    /// merge wins wholesale.
    pub fn clear_status(&mut self) {
        for modes in self.members.values_mut() {
            *modes = MemberModes::default();
        }
        self.bans.clear();
        self.modes = ChannelModes::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_dedup() {
        let mut chan = Channel::new("#room".into(), 100);
        chan.add_ban("*!*@spam.example".into());
        chan.add_ban("*!*@spam.example".into());
        assert_eq!(chan.bans.len(), 1);
    }

    #[test]
    fn clear_status_strips_everything() {
        let mut chan = Channel::new("#room".into(), 100);
        let u: UserNumeric = "ABAAB".parse().unwrap();
        chan.members.insert(
            u,
            MemberModes {
                op: true,
                ..Default::default()
            },
        );
        chan.modes.moderated = true;
        chan.add_ban("*!*@x".into());
        chan.clear_status();
        assert!(chan.member(u).unwrap().is_empty());
        assert!(chan.bans.is_empty());
        assert!(chan.modes.is_empty());
    }
}
