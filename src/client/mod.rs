//! Local client sessions.
//!
//! A session tracks one connection from accept to quit: the
//! registration pipeline (`CAP`/`NICK`/`USER`, optionally SASL), the
//! negotiated capability set, open client batches, and the handle for
//! writing lines back.

pub mod batch;
pub mod cap;
pub mod commands;

pub use batch::{BatchLine, ClientBatch};

use std::collections::HashMap;

use tokio::sync::mpsc;

use kestrel_p10::{CapSet, UserNumeric};

use crate::services::sasl::SaslSession;
use crate::state::{AwayState, ConnId};

/// Where a connection is in the registration pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegState {
    /// Nothing received yet.
    #[default]
    Initial,
    /// `CAP LS`/`REQ` seen; registration deferred until `CAP END`.
    CapNegotiating,
    /// Fully registered.
    Registered,
}

/// One local client connection.
pub struct ClientSession {
    /// Connection id.
    pub conn: ConnId,
    /// Outbound line writer.
    pub tx: mpsc::Sender<String>,
    /// Registration progress.
    pub state: RegState,
    /// Negotiated CAP version (301 unless `CAP LS 302`).
    pub cap_version: u32,
    /// Enabled capabilities.
    pub caps: CapSet,
    /// Pending nickname (pre-registration) - authoritative nick lives
    /// on the user record after registration.
    pub nick: Option<String>,
    /// Ident from `USER`.
    pub ident: Option<String>,
    /// Realname from `USER`.
    pub realname: Option<String>,
    /// The user this session registered as.
    pub user: Option<UserNumeric>,
    /// SASL exchange state.
    pub sasl: SaslSession,
    /// Account learned via SASL before registration.
    pub account: Option<String>,
    /// Open client batches by id.
    pub batches: HashMap<String, ClientBatch>,
    /// `AWAY` issued pre-registration behind `draft/pre-away`.
    pub pre_away: Option<AwayState>,
    /// Label of the command currently being processed.
    pub active_label: Option<String>,
    /// Something was written while the current labeled command ran;
    /// when nothing was, the command closes with a labeled `ACK`.
    pub wrote: bool,
    /// Resolved host shown in hostmasks.
    pub host: String,
    /// Peer IP in wire encoding.
    pub ip: String,
    /// Connection is TLS or WebSocket-over-TLS.
    pub secure: bool,
    /// Last inbound activity (unix seconds).
    pub last_activity: i64,
}

impl ClientSession {
    /// Fresh session for an accepted connection.
    pub fn new(
        conn: ConnId,
        tx: mpsc::Sender<String>,
        host: String,
        ip: String,
        secure: bool,
        now: i64,
    ) -> Self {
        Self {
            conn,
            tx,
            state: RegState::default(),
            cap_version: 301,
            caps: CapSet::empty(),
            nick: None,
            ident: None,
            realname: None,
            user: None,
            sasl: SaslSession::default(),
            account: None,
            batches: HashMap::new(),
            pre_away: None,
            active_label: None,
            wrote: false,
            host,
            ip,
            secure,
            last_activity: now,
        }
    }

    /// True once `NICK` and `USER` are both in and CAP negotiation is
    /// not holding registration open.
    pub fn ready_to_register(&self) -> bool {
        self.state != RegState::Registered
            && self.state != RegState::CapNegotiating
            && self.nick.is_some()
            && self.ident.is_some()
    }

    /// The nick to use in replies before registration completes.
    pub fn reply_nick(&self) -> &str {
        self.nick.as_deref().unwrap_or("*")
    }
}
