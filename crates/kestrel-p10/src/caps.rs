//! IRCv3 capability registry and per-client capability sets.

use std::fmt;

/// A recognized client capability.
///
/// The set is fixed at compile time; unknown names in a `CAP REQ` NAK
/// the whole request. Individual capabilities can still be disabled by
/// configuration, which removes them from `LS` listings and makes them
/// un-REQ-able.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Capability {
    /// `multi-prefix`
    MultiPrefix = 0,
    /// `userhost-in-names`
    UserhostInNames,
    /// `extended-join`
    ExtendedJoin,
    /// `away-notify`
    AwayNotify,
    /// `account-notify`
    AccountNotify,
    /// `account-tag`
    AccountTag,
    /// `invite-notify`
    InviteNotify,
    /// `chghost`
    Chghost,
    /// `server-time`
    ServerTime,
    /// `echo-message`
    EchoMessage,
    /// `cap-notify`
    CapNotify,
    /// `batch`
    Batch,
    /// `labeled-response`
    LabeledResponse,
    /// `setname`
    Setname,
    /// `message-tags`
    MessageTags,
    /// `standard-replies`
    StandardReplies,
    /// `sasl` - value is the dynamic mechanism list
    Sasl,
    /// `draft/no-implicit-names`
    NoImplicitNames,
    /// `draft/extended-isupport`
    ExtendedIsupport,
    /// `draft/pre-away`
    PreAway,
    /// `draft/multiline` - value advertises `max-bytes`/`max-lines`
    Multiline,
    /// `draft/chathistory` - optional `pm=<mode>` value
    Chathistory,
    /// `draft/event-playback`
    EventPlayback,
    /// `draft/message-redaction`
    MessageRedaction,
    /// `draft/account-registration` - optional feature-list value
    AccountRegistration,
    /// `draft/read-marker`
    ReadMarker,
    /// `draft/channel-rename`
    ChannelRename,
    /// `draft/metadata-2`
    Metadata2,
    /// `draft/webpush`
    Webpush,
}

/// Every recognized capability, in registry order.
pub const ALL_CAPABILITIES: &[Capability] = &[
    Capability::MultiPrefix,
    Capability::UserhostInNames,
    Capability::ExtendedJoin,
    Capability::AwayNotify,
    Capability::AccountNotify,
    Capability::AccountTag,
    Capability::InviteNotify,
    Capability::Chghost,
    Capability::ServerTime,
    Capability::EchoMessage,
    Capability::CapNotify,
    Capability::Batch,
    Capability::LabeledResponse,
    Capability::Setname,
    Capability::MessageTags,
    Capability::StandardReplies,
    Capability::Sasl,
    Capability::NoImplicitNames,
    Capability::ExtendedIsupport,
    Capability::PreAway,
    Capability::Multiline,
    Capability::Chathistory,
    Capability::EventPlayback,
    Capability::MessageRedaction,
    Capability::AccountRegistration,
    Capability::ReadMarker,
    Capability::ChannelRename,
    Capability::Metadata2,
    Capability::Webpush,
];

impl Capability {
    /// The wire name of the capability.
    pub fn name(self) -> &'static str {
        match self {
            Capability::MultiPrefix => "multi-prefix",
            Capability::UserhostInNames => "userhost-in-names",
            Capability::ExtendedJoin => "extended-join",
            Capability::AwayNotify => "away-notify",
            Capability::AccountNotify => "account-notify",
            Capability::AccountTag => "account-tag",
            Capability::InviteNotify => "invite-notify",
            Capability::Chghost => "chghost",
            Capability::ServerTime => "server-time",
            Capability::EchoMessage => "echo-message",
            Capability::CapNotify => "cap-notify",
            Capability::Batch => "batch",
            Capability::LabeledResponse => "labeled-response",
            Capability::Setname => "setname",
            Capability::MessageTags => "message-tags",
            Capability::StandardReplies => "standard-replies",
            Capability::Sasl => "sasl",
            Capability::NoImplicitNames => "draft/no-implicit-names",
            Capability::ExtendedIsupport => "draft/extended-isupport",
            Capability::PreAway => "draft/pre-away",
            Capability::Multiline => "draft/multiline",
            Capability::Chathistory => "draft/chathistory",
            Capability::EventPlayback => "draft/event-playback",
            Capability::MessageRedaction => "draft/message-redaction",
            Capability::AccountRegistration => "draft/account-registration",
            Capability::ReadMarker => "draft/read-marker",
            Capability::ChannelRename => "draft/channel-rename",
            Capability::Metadata2 => "draft/metadata-2",
            Capability::Webpush => "draft/webpush",
        }
    }

    /// Look up a capability by its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_CAPABILITIES.iter().copied().find(|c| c.name() == name)
    }

    #[inline]
    fn bit(self) -> u32 {
        1 << (self as u8)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A compact per-client capability set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapSet(u32);

impl CapSet {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// True when `cap` is enabled.
    pub fn contains(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    /// Enable `cap`.
    pub fn insert(&mut self, cap: Capability) {
        self.0 |= cap.bit();
    }

    /// Disable `cap`.
    pub fn remove(&mut self, cap: Capability) {
        self.0 &= !cap.bit();
    }

    /// True when no capability is enabled.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate the enabled capabilities in registry order.
    pub fn iter(self) -> impl Iterator<Item = Capability> {
        ALL_CAPABILITIES
            .iter()
            .copied()
            .filter(move |c| self.contains(*c))
    }
}

impl FromIterator<Capability> for CapSet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        let mut set = Self::empty();
        for cap in iter {
            set.insert(cap);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_roundtrip() {
        for &cap in ALL_CAPABILITIES {
            assert_eq!(Capability::from_name(cap.name()), Some(cap));
        }
    }

    #[test]
    fn unknown_names_rejected() {
        assert_eq!(Capability::from_name("tls"), None);
        assert_eq!(Capability::from_name("draft/unknown"), None);
    }

    #[test]
    fn registry_has_no_duplicate_bits() {
        let mut set = CapSet::empty();
        for &cap in ALL_CAPABILITIES {
            assert!(!set.contains(cap));
            set.insert(cap);
        }
        assert_eq!(set.iter().count(), ALL_CAPABILITIES.len());
    }

    #[test]
    fn insert_remove() {
        let mut set = CapSet::empty();
        set.insert(Capability::Batch);
        set.insert(Capability::ServerTime);
        assert!(set.contains(Capability::Batch));
        set.remove(Capability::Batch);
        assert!(!set.contains(Capability::Batch));
        assert!(set.contains(Capability::ServerTime));
    }

    #[test]
    fn collect_from_iter() {
        let set: CapSet = [Capability::Sasl, Capability::Multiline].into_iter().collect();
        assert!(set.contains(Capability::Sasl));
        assert!(set.contains(Capability::Multiline));
        assert_eq!(set.iter().count(), 2);
    }
}
