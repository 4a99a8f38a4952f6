//! The canonical in-memory network state.
//!
//! One [`Network`] instance is owned by the engine task; nothing else
//! mutates it. Remote state is an eventually-consistent replica kept
//! coherent by the burst engine and the timestamp merge rules.

mod channel;
mod pending;
mod presence;
mod server;
mod user;

pub use channel::{Channel, Topic};
pub use pending::{PendingKind, PendingRequest, PendingTable};
pub use presence::{EffectivePresence, PresenceTracker};
pub use server::{BurstState, Server};
pub use user::{AwayState, User, REALNAME_MAX};

use std::collections::HashMap;

use kestrel_p10::{casefold, ServerNumeric, UserNumeric};

/// Identifies one local client connection.
pub type ConnId = u64;

/// Identifies one server link.
pub type LinkId = u64;

/// Canonical tables: servers by numeric, users by numeric and nick,
/// channels by name.
pub struct Network {
    /// Our own numeric.
    pub me: ServerNumeric,
    /// Every known server, ourselves included.
    pub servers: HashMap<ServerNumeric, Server>,
    /// Every known user.
    pub users: HashMap<UserNumeric, User>,
    /// Casefolded nick to numeric.
    pub nicks: HashMap<String, UserNumeric>,
    /// Casefolded channel name to channel.
    pub channels: HashMap<String, Channel>,
}

impl Network {
    /// Fresh state containing only ourselves.
    pub fn new(me: ServerNumeric, name: String, description: String, start_ts: i64) -> Self {
        let mut own = Server::new(me, name, description);
        own.start_ts = start_ts;
        own.burst = BurstState::Done;
        let mut servers = HashMap::new();
        servers.insert(me, own);
        Self {
            me,
            servers,
            users: HashMap::new(),
            nicks: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    /// Look up a user by nickname.
    pub fn user_by_nick(&self, nick: &str) -> Option<&User> {
        self.nicks
            .get(&casefold(nick))
            .and_then(|n| self.users.get(n))
    }

    /// Look up a user's numeric by nickname.
    pub fn numeric_by_nick(&self, nick: &str) -> Option<UserNumeric> {
        self.nicks.get(&casefold(nick)).copied()
    }

    /// Insert a user, maintaining the nick index.
    ///
    /// The caller has already resolved any nick collision.
    pub fn insert_user(&mut self, user: User) {
        self.nicks.insert(casefold(&user.nick), user.numeric);
        self.users.insert(user.numeric, user);
    }

    /// Remove a user and their memberships; returns the record and the
    /// casefolded names of channels that became empty.
    pub fn remove_user(&mut self, numeric: UserNumeric) -> Option<(User, Vec<String>)> {
        let user = self.users.remove(&numeric)?;
        if self.nicks.get(&casefold(&user.nick)) == Some(&numeric) {
            self.nicks.remove(&casefold(&user.nick));
        }
        let mut emptied = Vec::new();
        for name in &user.channels {
            if let Some(channel) = self.channels.get_mut(name) {
                channel.members.remove(&numeric);
                if channel.members.is_empty() {
                    emptied.push(name.clone());
                }
            }
        }
        for name in &emptied {
            self.channels.remove(name);
        }
        Some((user, emptied))
    }

    /// Apply a nick change, keeping the index coherent. A case-only
    /// change keeps the existing timestamp.
    pub fn rename_user(&mut self, numeric: UserNumeric, new_nick: &str, ts: i64) {
        let Some(user) = self.users.get_mut(&numeric) else {
            return;
        };
        let old_folded = casefold(&user.nick);
        let new_folded = casefold(new_nick);
        if old_folded != new_folded {
            user.nick_ts = ts;
            self.nicks.remove(&old_folded);
            self.nicks.insert(new_folded, numeric);
        }
        user.nick = new_nick.to_owned();
    }

    /// Get or create a channel; a created channel starts at `ts`.
    pub fn channel_entry(&mut self, name: &str, ts: i64) -> &mut Channel {
        self.channels
            .entry(casefold(name))
            .or_insert_with(|| Channel::new(name.to_owned(), ts))
    }

    /// The whole subtree rooted at `root`, root included, in BFS order.
    pub fn subtree(&self, root: ServerNumeric) -> Vec<ServerNumeric> {
        let mut order = vec![root];
        let mut i = 0;
        while i < order.len() {
            if let Some(server) = self.servers.get(&order[i]) {
                for &down in &server.downlinks {
                    order.push(down);
                }
            }
            i += 1;
        }
        order
    }

    /// Users homed on any of `servers`.
    pub fn users_on(&self, servers: &[ServerNumeric]) -> Vec<UserNumeric> {
        self.users
            .keys()
            .filter(|n| servers.contains(&n.server))
            .copied()
            .collect()
    }

    /// Local members of a channel with their connections, for fanout.
    pub fn local_members(&self, folded_channel: &str) -> Vec<(UserNumeric, ConnId)> {
        let Some(channel) = self.channels.get(folded_channel) else {
            return Vec::new();
        };
        channel
            .members
            .keys()
            .filter_map(|n| {
                self.users
                    .get(n)
                    .and_then(|u| u.conn.map(|conn| (*n, conn)))
            })
            .collect()
    }

    /// Local connections sharing at least one channel with `numeric`,
    /// excluding the user's own connection.
    pub fn common_channel_conns(&self, numeric: UserNumeric) -> Vec<(UserNumeric, ConnId)> {
        let Some(user) = self.users.get(&numeric) else {
            return Vec::new();
        };
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for name in &user.channels {
            for (member, conn) in self.local_members(name) {
                if member != numeric && seen.insert(member) {
                    out.push((member, conn));
                }
            }
        }
        out
    }

    /// Local connections belonging to `account`.
    pub fn account_conns(&self, account: &str) -> Vec<(UserNumeric, ConnId)> {
        self.users
            .values()
            .filter(|u| u.account() == Some(account))
            .filter_map(|u| u.conn.map(|c| (u.numeric, c)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_p10::mode::IntroModes;

    fn network() -> Network {
        Network::new(
            "AB".parse().unwrap(),
            "hub.kestrel.example".into(),
            "test".into(),
            1_700_000_000,
        )
    }

    fn user(numeric: &str, nick: &str) -> User {
        User {
            numeric: numeric.parse().unwrap(),
            nick: nick.into(),
            ident: nick.into(),
            host: "host.example".into(),
            realname: nick.into(),
            nick_ts: 100,
            connect_ts: 100,
            ip: "B]AAAB".into(),
            modes: IntroModes::default(),
            channels: Default::default(),
            away: AwayState::Present,
            conn: None,
        }
    }

    #[test]
    fn nick_index_tracks_users() {
        let mut net = network();
        net.insert_user(user("ABAAB", "Alice"));
        assert_eq!(
            net.numeric_by_nick("alice"),
            Some("ABAAB".parse().unwrap())
        );
        net.rename_user("ABAAB".parse().unwrap(), "Alicia", 200);
        assert!(net.user_by_nick("alice").is_none());
        assert_eq!(net.user_by_nick("ALICIA").unwrap().nick, "Alicia");
    }

    #[test]
    fn case_only_rename_preserves_ts() {
        let mut net = network();
        net.insert_user(user("ABAAB", "alice"));
        net.rename_user("ABAAB".parse().unwrap(), "ALICE", 999);
        let u = net.user_by_nick("alice").unwrap();
        assert_eq!(u.nick, "ALICE");
        assert_eq!(u.nick_ts, 100);
    }

    #[test]
    fn remove_user_drops_empty_channels() {
        let mut net = network();
        let mut u = user("ABAAB", "alice");
        u.channels.insert("#room".into());
        net.insert_user(u);
        net.channel_entry("#room", 100)
            .members
            .insert("ABAAB".parse().unwrap(), Default::default());

        let (_, emptied) = net.remove_user("ABAAB".parse().unwrap()).unwrap();
        assert_eq!(emptied, vec!["#room".to_owned()]);
        assert!(net.channels.is_empty());
    }

    #[test]
    fn subtree_walks_downlinks() {
        let mut net = network();
        let cd: ServerNumeric = "CD".parse().unwrap();
        let ef: ServerNumeric = "EF".parse().unwrap();
        let mut s_cd = Server::new(cd, "cd.example".into(), String::new());
        s_cd.uplink = Some(net.me);
        s_cd.downlinks.insert(ef);
        let mut s_ef = Server::new(ef, "ef.example".into(), String::new());
        s_ef.uplink = Some(cd);
        net.servers.insert(cd, s_cd);
        net.servers.insert(ef, s_ef);

        let order = net.subtree(cd);
        assert_eq!(order, vec![cd, ef]);
    }
}
