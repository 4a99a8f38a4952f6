//! Channel and user mode handling.
//!
//! Covers the channel flag/key/limit set with its burst serialization,
//! membership prefixes, the user-mode carriers that ride `N`
//! introductions, and a mode-delta parser with arity enforcement.

use std::fmt;

use thiserror::Error;

/// Errors from mode-delta parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModeError {
    /// A mode letter outside the recognized set.
    #[error("unknown mode character {0:?}")]
    UnknownMode(char),

    /// A mode that requires a parameter did not get one.
    #[error("mode {0:?} requires a parameter")]
    MissingArg(char),
}

/// Channel flag modes plus key and limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelModes {
    /// `+n` - no external messages.
    pub no_external: bool,
    /// `+t` - topic settable by ops only.
    pub topic_lock: bool,
    /// `+p` - private.
    pub private: bool,
    /// `+s` - secret.
    pub secret: bool,
    /// `+m` - moderated.
    pub moderated: bool,
    /// `+i` - invite only.
    pub invite_only: bool,
    /// `+k <key>`.
    pub key: Option<String>,
    /// `+l <limit>`.
    pub limit: Option<u32>,
}

impl ChannelModes {
    /// Parse a burst mode string (`+ntk`) consuming key/limit parameters
    /// from `params` in the order the letters appear.
    pub fn parse_burst<'a, I>(modestr: &str, params: &mut I) -> Result<Self, ModeError>
    where
        I: Iterator<Item = &'a str>,
    {
        let mut modes = Self::default();
        for c in modestr.chars() {
            match c {
                '+' => {}
                'n' => modes.no_external = true,
                't' => modes.topic_lock = true,
                'p' => modes.private = true,
                's' => modes.secret = true,
                'm' => modes.moderated = true,
                'i' => modes.invite_only = true,
                'k' => {
                    let key = params.next().ok_or(ModeError::MissingArg('k'))?;
                    modes.key = Some(key.to_owned());
                }
                'l' => {
                    let raw = params.next().ok_or(ModeError::MissingArg('l'))?;
                    modes.limit = raw.parse().ok();
                }
                'r' => {} // registered marker, services-owned, accepted and dropped
                c => return Err(ModeError::UnknownMode(c)),
            }
        }
        Ok(modes)
    }

    /// Union with another set; used for equal-TS merges.
    pub fn union(&mut self, other: &Self) {
        self.no_external |= other.no_external;
        self.topic_lock |= other.topic_lock;
        self.private |= other.private;
        self.secret |= other.secret;
        self.moderated |= other.moderated;
        self.invite_only |= other.invite_only;
        if self.key.is_none() {
            self.key.clone_from(&other.key);
        }
        if self.limit.is_none() {
            self.limit = other.limit;
        }
    }

    /// True when no flag, key or limit is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Serialize as `(modestr, params)` for a burst line.
    pub fn to_wire(&self) -> (String, Vec<String>) {
        let mut flags = String::from("+");
        let mut params = Vec::new();
        for (set, c) in [
            (self.no_external, 'n'),
            (self.topic_lock, 't'),
            (self.private, 'p'),
            (self.secret, 's'),
            (self.moderated, 'm'),
            (self.invite_only, 'i'),
        ] {
            if set {
                flags.push(c);
            }
        }
        if let Some(key) = &self.key {
            flags.push('k');
            params.push(key.clone());
        }
        if let Some(limit) = self.limit {
            flags.push('l');
            params.push(limit.to_string());
        }
        (flags, params)
    }
}

impl fmt::Display for ChannelModes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (flags, params) = self.to_wire();
        f.write_str(&flags)?;
        for p in params {
            write!(f, " {p}")?;
        }
        Ok(())
    }
}

/// Per-member channel status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberModes {
    /// `@` / `+o`.
    pub op: bool,
    /// `%` / `+h`.
    pub halfop: bool,
    /// `+` / `+v`.
    pub voice: bool,
}

impl MemberModes {
    /// Parse a burst member suffix (the part after `:`, e.g. `ov`).
    pub fn parse_suffix(s: &str) -> Self {
        let mut m = Self::default();
        for c in s.chars() {
            match c {
                'o' => m.op = true,
                'h' => m.halfop = true,
                'v' => m.voice = true,
                _ => {}
            }
        }
        m
    }

    /// Burst suffix form (`ov`), empty when no status.
    pub fn to_suffix(self) -> String {
        let mut s = String::new();
        if self.op {
            s.push('o');
        }
        if self.halfop {
            s.push('h');
        }
        if self.voice {
            s.push('v');
        }
        s
    }

    /// Highest-precedence NAMES prefix character, if any.
    pub fn prefix_char(self) -> Option<char> {
        if self.op {
            Some('@')
        } else if self.halfop {
            Some('%')
        } else if self.voice {
            Some('+')
        } else {
            None
        }
    }

    /// All prefix characters in precedence order (for `multi-prefix`).
    pub fn all_prefix_chars(self) -> String {
        let mut s = String::new();
        if self.op {
            s.push('@');
        }
        if self.halfop {
            s.push('%');
        }
        if self.voice {
            s.push('+');
        }
        s
    }

    /// True when the member holds no status.
    pub fn is_empty(self) -> bool {
        !self.op && !self.halfop && !self.voice
    }

    /// Union for equal-TS merges.
    pub fn union(&mut self, other: Self) {
        self.op |= other.op;
        self.halfop |= other.halfop;
        self.voice |= other.voice;
    }
}

/// Boolean user modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserFlags {
    /// `+i` - invisible.
    pub invisible: bool,
    /// `+w` - wallops.
    pub wallops: bool,
    /// `+o` - network operator.
    pub oper: bool,
    /// `+d` - deaf.
    pub deaf: bool,
    /// `+x` - host hiding requested.
    pub hidden_host: bool,
}

/// The parsed mode section of an `N` introduction.
///
/// The parameterized carriers are consumed in fixed order - account
/// (`r`), vhost (`h`), fakehost (`f`), cloaked host (`C`), cloaked IP
/// (`c`) - regardless of the order the letters appear in the flag
/// string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntroModes {
    /// Boolean flags.
    pub flags: UserFlags,
    /// Account name (`+r`).
    pub account: Option<String>,
    /// Virtual host (`+h`).
    pub vhost: Option<String>,
    /// Fakehost (`+f`).
    pub fakehost: Option<String>,
    /// Cloaked host (`+C`).
    pub cloaked_host: Option<String>,
    /// Cloaked IP (`+c`).
    pub cloaked_ip: Option<String>,
}

impl IntroModes {
    /// Parse `modestr` (with leading `+`) and take carrier parameters
    /// from `params`.
    pub fn parse<'a, I>(modestr: &str, params: &mut I) -> Result<Self, ModeError>
    where
        I: Iterator<Item = &'a str>,
    {
        let mut intro = Self::default();
        let mut has = [false; 5]; // r h f C c, in consumption order
        for c in modestr.chars() {
            match c {
                '+' => {}
                'i' => intro.flags.invisible = true,
                'w' => intro.flags.wallops = true,
                'o' => intro.flags.oper = true,
                'd' => intro.flags.deaf = true,
                'x' => intro.flags.hidden_host = true,
                'r' => has[0] = true,
                'h' => has[1] = true,
                'f' => has[2] = true,
                'C' => has[3] = true,
                'c' => has[4] = true,
                // Unknown boolean flags from newer peers are tolerated.
                _ => {}
            }
        }
        let mut take = |c: char| -> Result<String, ModeError> {
            params.next().map(str::to_owned).ok_or(ModeError::MissingArg(c))
        };
        if has[0] {
            intro.account = Some(take('r')?);
        }
        if has[1] {
            intro.vhost = Some(take('h')?);
        }
        if has[2] {
            intro.fakehost = Some(take('f')?);
        }
        if has[3] {
            intro.cloaked_host = Some(take('C')?);
        }
        if has[4] {
            intro.cloaked_ip = Some(take('c')?);
        }
        Ok(intro)
    }

    /// Serialize back to `(modestr, carrier-params)` in canonical order.
    pub fn to_wire(&self) -> (String, Vec<String>) {
        let mut flags = String::from("+");
        let mut params = Vec::new();
        for (set, c) in [
            (self.flags.invisible, 'i'),
            (self.flags.wallops, 'w'),
            (self.flags.oper, 'o'),
            (self.flags.deaf, 'd'),
            (self.flags.hidden_host, 'x'),
        ] {
            if set {
                flags.push(c);
            }
        }
        for (value, c) in [
            (&self.account, 'r'),
            (&self.vhost, 'h'),
            (&self.fakehost, 'f'),
            (&self.cloaked_host, 'C'),
            (&self.cloaked_ip, 'c'),
        ] {
            if let Some(v) = value {
                flags.push(c);
                params.push(v.clone());
            }
        }
        (flags, params)
    }
}

/// One change within a mode delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChange {
    /// `+` or `-`.
    pub adding: bool,
    /// The mode letter.
    pub mode: char,
    /// Parameter, when the mode takes one.
    pub arg: Option<String>,
}

/// Parse a channel mode delta (`+ov-k alice bob oldkey`) enforcing arity.
pub fn parse_channel_delta(modestr: &str, args: &[String]) -> Result<Vec<ModeChange>, ModeError> {
    let mut changes = Vec::new();
    let mut adding = true;
    let mut args = args.iter();
    for c in modestr.chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            'n' | 't' | 'p' | 's' | 'm' | 'i' => changes.push(ModeChange {
                adding,
                mode: c,
                arg: None,
            }),
            'o' | 'h' | 'v' | 'b' => {
                let arg = args.next().ok_or(ModeError::MissingArg(c))?;
                changes.push(ModeChange {
                    adding,
                    mode: c,
                    arg: Some(arg.clone()),
                });
            }
            'k' => {
                // Key requires a parameter when set; tolerated bare on unset.
                let arg = if adding {
                    Some(args.next().ok_or(ModeError::MissingArg('k'))?.clone())
                } else {
                    args.next().cloned()
                };
                changes.push(ModeChange {
                    adding,
                    mode: 'k',
                    arg,
                });
            }
            'l' => {
                let arg = if adding {
                    Some(args.next().ok_or(ModeError::MissingArg('l'))?.clone())
                } else {
                    None
                };
                changes.push(ModeChange {
                    adding,
                    mode: 'l',
                    arg,
                });
            }
            c => return Err(ModeError::UnknownMode(c)),
        }
    }
    Ok(changes)
}

/// Serialize mode changes back to `(modestr, args)` with collapsed signs.
pub fn format_changes(changes: &[ModeChange]) -> (String, Vec<String>) {
    let mut modestr = String::new();
    let mut args = Vec::new();
    let mut sign: Option<bool> = None;
    for change in changes {
        if sign != Some(change.adding) {
            modestr.push(if change.adding { '+' } else { '-' });
            sign = Some(change.adding);
        }
        modestr.push(change.mode);
        if let Some(arg) = &change.arg {
            args.push(arg.clone());
        }
    }
    (modestr, args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_modes_consume_params_in_letter_order() {
        let mut params = ["sekrit", "20"].into_iter();
        let modes = ChannelModes::parse_burst("+ntkl", &mut params).unwrap();
        assert!(modes.no_external && modes.topic_lock);
        assert_eq!(modes.key.as_deref(), Some("sekrit"));
        assert_eq!(modes.limit, Some(20));
    }

    #[test]
    fn burst_modes_wire_roundtrip() {
        let mut params = ["key"].into_iter();
        let modes = ChannelModes::parse_burst("+mik", &mut params).unwrap();
        let (flags, args) = modes.to_wire();
        let mut reparse = args.iter().map(String::as_str);
        assert_eq!(
            ChannelModes::parse_burst(&flags, &mut reparse).unwrap(),
            modes
        );
    }

    #[test]
    fn union_keeps_first_key() {
        let mut a = ChannelModes {
            key: Some("left".into()),
            ..Default::default()
        };
        let b = ChannelModes {
            key: Some("right".into()),
            moderated: true,
            ..Default::default()
        };
        a.union(&b);
        assert_eq!(a.key.as_deref(), Some("left"));
        assert!(a.moderated);
    }

    #[test]
    fn member_suffix_roundtrip() {
        let m = MemberModes::parse_suffix("ov");
        assert!(m.op && m.voice && !m.halfop);
        assert_eq!(m.to_suffix(), "ov");
        assert_eq!(m.prefix_char(), Some('@'));
        assert_eq!(m.all_prefix_chars(), "@+");
    }

    #[test]
    fn intro_modes_fixed_param_order() {
        // Flags deliberately scrambled: c before r before h. Parameters
        // are still consumed as account, vhost, cloaked-ip.
        let mut params = ["acct", "v.host", "CIP"].into_iter();
        let intro = IntroModes::parse("+icrh", &mut params).unwrap();
        assert!(intro.flags.invisible);
        assert_eq!(intro.account.as_deref(), Some("acct"));
        assert_eq!(intro.vhost.as_deref(), Some("v.host"));
        assert_eq!(intro.cloaked_ip.as_deref(), Some("CIP"));
        assert_eq!(intro.fakehost, None);
    }

    #[test]
    fn intro_modes_missing_param_is_error() {
        let mut params = std::iter::empty();
        assert_eq!(
            IntroModes::parse("+r", &mut params).unwrap_err(),
            ModeError::MissingArg('r')
        );
    }

    #[test]
    fn intro_wire_roundtrip() {
        let intro = IntroModes {
            flags: UserFlags {
                invisible: true,
                oper: true,
                ..Default::default()
            },
            account: Some("alice".into()),
            fakehost: Some("fake.host".into()),
            ..Default::default()
        };
        let (flags, params) = intro.to_wire();
        let mut iter = params.iter().map(String::as_str);
        assert_eq!(IntroModes::parse(&flags, &mut iter).unwrap(), intro);
    }

    #[test]
    fn delta_parse_and_format() {
        let args = vec!["alice".to_owned(), "bob".to_owned()];
        let changes = parse_channel_delta("+o-v", &args).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes[0].adding);
        assert_eq!(changes[1].arg.as_deref(), Some("bob"));

        let (modestr, out_args) = format_changes(&changes);
        assert_eq!(modestr, "+o-v");
        assert_eq!(out_args, args);
    }

    #[test]
    fn delta_arity_enforced() {
        assert_eq!(
            parse_channel_delta("+o", &[]).unwrap_err(),
            ModeError::MissingArg('o')
        );
        assert_eq!(
            parse_channel_delta("+k", &[]).unwrap_err(),
            ModeError::MissingArg('k')
        );
        // -l takes no parameter
        assert!(parse_channel_delta("-l", &[]).is_ok());
    }

    #[test]
    fn delta_rejects_unknown() {
        assert_eq!(
            parse_channel_delta("+Q", &[]).unwrap_err(),
            ModeError::UnknownMode('Q')
        );
    }
}
