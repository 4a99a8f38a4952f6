//! The event engine.
//!
//! One task owns all canonical state. Connection tasks parse nothing:
//! they frame bytes into lines and forward them here; every handler
//! runs to completion on this task, and anything that must wait for a
//! remote answer parks a pending request instead of blocking.

mod dispatch;
#[cfg(test)]
mod tests;

pub use dispatch::on_link_frame;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use kestrel_p10::msgid::MsgIdGenerator;
use kestrel_p10::numeric::NumericAllocator;
use kestrel_p10::reply::StandardReply;
use kestrel_p10::{
    caps::ALL_CAPABILITIES, CapSet, Capability, Frame, ServerNumeric, Tag, UserNumeric,
};

use crate::client::ClientSession;
use crate::config::{Config, LinkBlock};
use crate::handlers;
use crate::handlers::multiline::MultilineAssembly;
use crate::services::metadata::MetadataCache;
use crate::services::webpush::Subscription;
use crate::services::ServicesBridge;
use crate::state::{ConnId, LinkId, Network, PendingTable, PresenceTracker};
use crate::store::Kv;
use crate::tagging::ClientMsg;

/// Handshake progress of a server link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// Waiting for `PASS`.
    AwaitPass,
    /// `PASS` accepted; waiting for `SERVER`.
    AwaitServer,
    /// Peer admitted; normal token traffic.
    Linked,
}

/// One attached server link.
pub struct Link {
    /// Link id.
    pub id: LinkId,
    /// Outbound line writer.
    pub tx: mpsc::Sender<String>,
    /// Handshake progress.
    pub phase: LinkPhase,
    /// The directly-attached peer, once admitted.
    pub server: Option<ServerNumeric>,
    /// Peer name, once known.
    pub name: String,
    /// `PASS` verified against a configured link block.
    pub pass_ok: bool,
    /// The link block when we initiated the connection.
    pub outbound: Option<LinkBlock>,
    /// Emit message tags to this peer.
    pub send_tags: bool,
    /// Last inbound activity (unix seconds).
    pub last_activity: i64,
    /// Last ping sent (unix seconds).
    pub last_ping_sent: i64,
}

/// Everything that can wake the engine.
pub enum Event {
    /// A client connection was accepted.
    ClientConnected {
        /// New connection id.
        conn: ConnId,
        /// Writer handle.
        tx: mpsc::Sender<String>,
        /// Resolved host.
        host: String,
        /// Wire-encoded IP.
        ip: String,
        /// TLS or secure WebSocket transport.
        secure: bool,
    },
    /// One complete line from a client.
    ClientLine {
        /// Connection id.
        conn: ConnId,
        /// The line, terminator stripped.
        line: String,
    },
    /// A client connection went away.
    ClientClosed {
        /// Connection id.
        conn: ConnId,
        /// Why.
        reason: String,
    },
    /// A server link was established (either direction).
    LinkOpened {
        /// New link id.
        link: LinkId,
        /// Writer handle.
        tx: mpsc::Sender<String>,
        /// Set when we initiated the connection.
        outbound: Option<LinkBlock>,
    },
    /// One complete line from a server link.
    LinkLine {
        /// Link id.
        link: LinkId,
        /// The line, terminator stripped.
        line: String,
    },
    /// A server link went away.
    LinkClosed {
        /// Link id.
        link: LinkId,
        /// Why.
        reason: String,
    },
    /// One-second housekeeping tick.
    Tick,
    /// A webpush endpoint finished validating.
    WebPushValidated {
        /// Registering connection.
        conn: ConnId,
        /// The subscription being registered.
        subscription: Subscription,
        /// Validation outcome.
        result: Result<(), String>,
    },
    /// A webpush POST finished.
    WebPushDelivered {
        /// Target account.
        account: String,
        /// Endpoint that was posted to.
        endpoint: String,
        /// HTTP status, or transport error.
        result: Result<u16, String>,
    },
}

/// The engine.
pub struct Engine {
    /// Configuration, fixed for the process lifetime.
    pub config: Config,
    /// Canonical network state.
    pub net: Network,
    /// Local client sessions by connection.
    pub clients: HashMap<ConnId, ClientSession>,
    /// Server links.
    pub links: HashMap<LinkId, Link>,
    /// Parked federated requests.
    pub pending: PendingTable,
    /// Services bridge state.
    pub services: ServicesBridge,
    /// Metadata TTL cache.
    pub metadata: MetadataCache,
    /// Persistent KV store.
    pub kv: Arc<dyn Kv>,
    /// Message-id generator.
    pub msgids: MsgIdGenerator,
    /// Local user numeric allocator.
    pub numerics: NumericAllocator,
    /// Presence aggregation.
    pub presence: PresenceTracker,
    /// Capabilities enabled by configuration.
    pub enabled_caps: CapSet,
    /// In-flight inbound multiline batches per link.
    pub ml_inbound: HashMap<(LinkId, String), MultilineAssembly>,
    /// Handle for offload tasks to post events back.
    pub events: mpsc::Sender<Event>,
    /// Process start time.
    pub start_ts: i64,
    batch_counter: u64,
    tick_counter: u64,
}

impl Engine {
    /// Build the engine from validated configuration.
    pub fn new(config: Config, kv: Arc<dyn Kv>, events: mpsc::Sender<Event>) -> anyhow::Result<Self> {
        let me: ServerNumeric = config
            .server
            .numeric
            .parse()
            .map_err(|e| anyhow::anyhow!("bad server numeric: {e}"))?;
        let start_ts = chrono::Utc::now().timestamp();
        let net = Network::new(
            me,
            config.server.name.clone(),
            config.server.description.clone(),
            start_ts,
        );

        let mut enabled = CapSet::empty();
        for &cap in ALL_CAPABILITIES {
            if !config.caps.disabled.iter().any(|d| d == cap.name()) {
                enabled.insert(cap);
            }
        }

        Ok(Self {
            pending: PendingTable::new(&config.server.numeric),
            services: ServicesBridge::new(config.sasl.server.clone(), config.metadata.queue_size),
            metadata: MetadataCache::new(config.metadata.cache_ttl_secs as i64),
            msgids: MsgIdGenerator::new(&config.server.numeric, start_ts),
            numerics: NumericAllocator::new(me),
            presence: PresenceTracker::new(),
            enabled_caps: enabled,
            ml_inbound: HashMap::new(),
            clients: HashMap::new(),
            links: HashMap::new(),
            net,
            kv,
            events,
            start_ts,
            config,
            batch_counter: 0,
            tick_counter: 0,
        })
    }

    /// Drive the engine until every event source closes.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        info!(server = %self.config.server.name, numeric = %self.config.server.numeric, "engine running");
        while let Some(event) = rx.recv().await {
            self.handle_event(event);
        }
        info!("engine stopped");
    }

    /// Process one event to completion.
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::ClientConnected {
                conn,
                tx,
                host,
                ip,
                secure,
            } => {
                debug!(conn, host = %host, "client connected");
                self.clients.insert(
                    conn,
                    ClientSession::new(conn, tx, host, ip, secure, self.now()),
                );
            }
            Event::ClientLine { conn, line } => {
                if let Some(session) = self.clients.get_mut(&conn) {
                    session.last_activity = chrono::Utc::now().timestamp();
                }
                crate::client::commands::handle_line(self, conn, &line);
            }
            Event::ClientClosed { conn, reason } => {
                self.teardown_client(conn, &reason);
            }
            Event::LinkOpened { link, tx, outbound } => {
                let now = self.now();
                let send_tags = self.config.s2s.send_tags;
                let is_outbound = outbound.is_some();
                self.links.insert(
                    link,
                    Link {
                        id: link,
                        tx,
                        phase: LinkPhase::AwaitPass,
                        server: None,
                        name: String::new(),
                        pass_ok: false,
                        outbound,
                        send_tags,
                        last_activity: now,
                        last_ping_sent: now,
                    },
                );
                if is_outbound {
                    handlers::server::start_outbound_handshake(self, link);
                }
            }
            Event::LinkLine { link, line } => {
                if let Some(l) = self.links.get_mut(&link) {
                    l.last_activity = chrono::Utc::now().timestamp();
                }
                dispatch::on_link_line(self, link, &line);
            }
            Event::LinkClosed { link, reason } => {
                self.teardown_link(link, &reason);
            }
            Event::Tick => self.tick(),
            Event::WebPushValidated {
                conn,
                subscription,
                result,
            } => handlers::webpush::on_validated(self, conn, subscription, result),
            Event::WebPushDelivered {
                account,
                endpoint,
                result,
            } => handlers::webpush::on_delivered(self, &account, &endpoint, result),
        }
    }

    // ------------------------------------------------------------------
    // Time and ids
    // ------------------------------------------------------------------

    /// Current unix time in seconds.
    pub fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Current unix time in milliseconds.
    pub fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Our numeric as a wire string.
    pub fn me_str(&self) -> String {
        self.net.me.to_string()
    }

    /// Our server name.
    pub fn server_name(&self) -> &str {
        &self.config.server.name
    }

    /// Allocate a batch id unique for this process.
    pub fn next_batch_id(&mut self) -> String {
        self.batch_counter += 1;
        format!("{}", base36(self.batch_counter))
    }

    // ------------------------------------------------------------------
    // Client output
    // ------------------------------------------------------------------

    /// Capabilities a connection has enabled.
    pub fn caps_of(&self, conn: ConnId) -> CapSet {
        self.clients
            .get(&conn)
            .map(|s| s.caps)
            .unwrap_or_else(CapSet::empty)
    }

    /// Queue one raw line to a client. A full write buffer kills the
    /// connection.
    pub fn send_line(&mut self, conn: ConnId, line: String) {
        let Some(session) = self.clients.get_mut(&conn) else {
            return;
        };
        session.wrote = true;
        if session.tx.try_send(line).is_err() {
            warn!(conn, "client write buffer overflow");
            self.teardown_client(conn, "Write buffer overflow");
        }
    }

    /// Render a message for a recipient's capability set and queue it.
    pub fn send_msg(&mut self, conn: ConnId, msg: &ClientMsg) {
        let caps = self.caps_of(conn);
        self.send_line(conn, msg.render(caps));
    }

    /// Like [`send_msg`](Self::send_msg), attaching the origin's active
    /// label. Used for direct responses to a labeled command.
    pub fn send_labeled(&mut self, conn: ConnId, msg: &ClientMsg) {
        let label = self
            .clients
            .get(&conn)
            .and_then(|s| s.active_label.clone());
        match label {
            Some(label) => {
                let mut labeled = msg.clone();
                labeled.tags.push(Tag::new("label", label));
                self.send_msg(conn, &labeled);
            }
            None => self.send_msg(conn, msg),
        }
    }

    /// Send a numeric reply with our server as source.
    pub fn send_numeric(&mut self, conn: ConnId, numeric: u16, params: &[&str], trailing: &str) {
        let nick = self
            .clients
            .get(&conn)
            .map(|s| {
                s.user
                    .and_then(|u| self.net.users.get(&u))
                    .map(|u| u.nick.clone())
                    .unwrap_or_else(|| s.reply_nick().to_owned())
            })
            .unwrap_or_else(|| "*".to_owned());
        let mut msg = ClientMsg::new(self.server_name(), format!("{numeric:03}")).with_param(nick);
        for p in params {
            msg = msg.with_param(*p);
        }
        msg = msg.with_trailing(trailing);
        self.send_labeled(conn, &msg);
    }

    /// Send a standard reply with our server as source.
    pub fn send_reply(&mut self, conn: ConnId, reply: &StandardReply) {
        let mut msg = ClientMsg::new(self.server_name(), reply.severity.verb())
            .with_param(reply.command.clone())
            .with_param(reply.code);
        for c in &reply.context {
            msg = msg.with_param(c.clone());
        }
        msg = msg.with_trailing(reply.description.clone());
        self.send_labeled(conn, &msg);
    }

    /// Fan a message out to the local members of a channel.
    pub fn fanout_channel(
        &mut self,
        folded: &str,
        msg: &ClientMsg,
        exclude: Option<ConnId>,
        require: Option<Capability>,
    ) {
        for (_, conn) in self.net.local_members(folded) {
            if Some(conn) == exclude {
                continue;
            }
            if let Some(cap) = require {
                if !self.caps_of(conn).contains(cap) {
                    continue;
                }
            }
            self.send_msg(conn, msg);
        }
    }

    /// Fan a message out to local users sharing a channel with
    /// `numeric`, at most once each.
    pub fn fanout_common(
        &mut self,
        numeric: UserNumeric,
        msg: &ClientMsg,
        require: Option<Capability>,
    ) {
        for (_, conn) in self.net.common_channel_conns(numeric) {
            if let Some(cap) = require {
                if !self.caps_of(conn).contains(cap) {
                    continue;
                }
            }
            self.send_msg(conn, msg);
        }
    }

    // ------------------------------------------------------------------
    // Link output
    // ------------------------------------------------------------------

    /// Serialize a frame for one link, honoring its tag setting.
    pub fn send_link_frame(&mut self, link: LinkId, frame: &Frame) {
        let Some(l) = self.links.get(&link) else {
            return;
        };
        let mut out = frame.clone();
        if !l.send_tags {
            out.tags.clear();
        }
        match out.serialize() {
            Ok(line) => {
                if l.tx.try_send(line).is_err() {
                    warn!(link, "link write buffer overflow");
                    self.teardown_link(link, "Write buffer overflow");
                }
            }
            Err(e) => warn!(link, error = %e, "unserializable frame dropped"),
        }
    }

    /// Send to every linked peer except one.
    pub fn broadcast_frame(&mut self, frame: &Frame, except: Option<LinkId>) {
        let targets: Vec<LinkId> = self
            .links
            .values()
            .filter(|l| l.phase == LinkPhase::Linked && Some(l.id) != except)
            .map(|l| l.id)
            .collect();
        for link in targets {
            self.send_link_frame(link, frame);
        }
    }

    /// Route a frame toward a specific server.
    pub fn send_to_server(&mut self, server: ServerNumeric, frame: &Frame) {
        let via = self.net.servers.get(&server).and_then(|s| s.via);
        match via {
            Some(link) => self.send_link_frame(link, frame),
            None => debug!(server = %server, "no route to server"),
        }
    }

    /// Route a frame to the services peer; false when unavailable.
    pub fn send_to_services(&mut self, frame: Frame) -> bool {
        match self.services.peer {
            Some(peer) => {
                self.send_to_server(peer, &frame);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Remove a client session, quitting its user if registered.
    pub fn teardown_client(&mut self, conn: ConnId, reason: &str) {
        let Some(session) = self.clients.remove(&conn) else {
            return;
        };
        debug!(conn, reason = %reason, "client teardown");
        if let Some(numeric) = session.user {
            self.quit_user(numeric, reason, true, None);
        }
    }

    /// Remove a user from the network: fan out QUIT locally, optionally
    /// propagate, update presence.
    pub fn quit_user(
        &mut self,
        numeric: UserNumeric,
        reason: &str,
        propagate: bool,
        batch: Option<&str>,
    ) {
        let Some(user) = self.net.users.get(&numeric) else {
            return;
        };
        let hostmask = user.hostmask();
        let account = user.account().map(str::to_owned);

        let mut msg = ClientMsg::new(hostmask, "QUIT").with_trailing(reason.to_owned());
        msg.tags.push(Tag::new("time", crate::tagging::server_time_now()));
        if let Some(batch) = batch {
            msg.tags.push(Tag::new("batch", batch.to_owned()));
        }
        self.fanout_common(numeric, &msg, None);

        self.net.remove_user(numeric);

        if propagate {
            let frame = Frame::new("Q")
                .with_origin(numeric.to_string())
                .with_trailing(reason.to_owned());
            self.broadcast_frame(&frame, None);
        }

        if let Some(account) = account {
            handlers::user::refresh_presence(self, &account);
        }
    }

    /// Close a link deliberately: emit `ERROR`, then tear down.
    pub fn close_link(&mut self, link: LinkId, reason: &str) {
        if let Some(l) = self.links.get(&link) {
            let line = format!("ERROR :{reason}");
            let _ = l.tx.try_send(line);
        }
        self.teardown_link(link, reason);
    }

    /// Remove a link and synthesize the squit cascade for whatever was
    /// behind it.
    pub fn teardown_link(&mut self, link: LinkId, reason: &str) {
        let Some(l) = self.links.remove(&link) else {
            return;
        };
        info!(link, peer = %l.name, reason = %reason, "link closed");
        if let Some(server) = l.server {
            handlers::server::squit_cascade(self, server, reason, Some(link));
        }
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    fn tick(&mut self) {
        self.tick_counter += 1;
        let now = self.now();

        // Link liveness.
        let ping_interval = self.config.s2s.ping_interval_secs as i64;
        let timeout = self.config.s2s.timeout_secs as i64;
        let mut to_ping = Vec::new();
        let mut to_kill = Vec::new();
        for l in self.links.values() {
            if l.phase != LinkPhase::Linked {
                if now - l.last_activity > 30 {
                    to_kill.push((l.id, "Handshake timeout"));
                }
                continue;
            }
            if now - l.last_activity > timeout {
                to_kill.push((l.id, "Ping timeout"));
            } else if now - l.last_ping_sent >= ping_interval {
                to_ping.push(l.id);
            }
        }
        for (link, why) in to_kill {
            self.close_link(link, why);
        }
        for link in to_ping {
            let me = self.me_str();
            let frame = Frame::new("G").with_origin(me.clone()).with_param(me);
            self.send_link_frame(link, &frame);
            if let Some(l) = self.links.get_mut(&link) {
                l.last_ping_sent = now;
            }
        }

        // Pending-request deadlines.
        handlers::expire_pending(self, now);

        // Client batch expiry.
        crate::client::commands::expire_batches(self, now);

        // Metadata cache sweep, once a minute.
        if self.tick_counter % 60 == 0 {
            let swept = self.metadata.sweep(now);
            if swept > 0 {
                debug!(swept, "metadata cache sweep");
            }
        }

        // KV maintenance, every five minutes.
        if self.tick_counter % 300 == 0 {
            match self.kv.maintenance() {
                Ok(removed) if removed > 0 => info!(removed, "kv maintenance"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "kv maintenance failed"),
            }
        }
    }
}

/// Lowercase base36 rendering for batch ids.
fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_owned();
    }
    let mut buf = Vec::with_capacity(8);
    while value > 0 {
        buf.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}
