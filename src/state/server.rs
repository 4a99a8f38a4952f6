//! Server tree nodes.

use std::collections::HashSet;

use kestrel_p10::ServerNumeric;

use super::LinkId;

/// Burst progress for a directly- or indirectly-linked server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BurstState {
    /// Link admitted, burst not yet begun.
    #[default]
    PreBurst,
    /// Burst in progress (its `EB` not yet seen).
    Bursting,
    /// `EB` received and acknowledged.
    Done,
}

/// One server in the spanning tree.
#[derive(Debug, Clone)]
pub struct Server {
    /// Two-symbol numeric.
    pub numeric: ServerNumeric,
    /// DNS-style name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// When the link to this server was established.
    pub link_ts: i64,
    /// The server's own start timestamp.
    pub start_ts: i64,
    /// Hops from us.
    pub hops: u32,
    /// One hop closer along the tree; `None` only for ourselves.
    pub uplink: Option<ServerNumeric>,
    /// Directly-linked downstream servers.
    pub downlinks: HashSet<ServerNumeric>,
    /// Burst progress.
    pub burst: BurstState,
    /// Set while a netjoin is being batch-coordinated.
    pub junction: bool,
    /// Active netjoin/netsplit batch id owned by this server.
    pub batch_id: Option<String>,
    /// The direct link that reaches this server; `None` for ourselves.
    pub via: Option<LinkId>,
    /// This peer announced itself as a services daemon.
    pub is_services: bool,
}

impl Server {
    /// A freshly-admitted server.
    pub fn new(numeric: ServerNumeric, name: String, description: String) -> Self {
        Self {
            numeric,
            name,
            description,
            link_ts: 0,
            start_ts: 0,
            hops: 0,
            uplink: None,
            downlinks: HashSet::new(),
            burst: BurstState::PreBurst,
            junction: false,
            batch_id: None,
            via: None,
            is_services: false,
        }
    }
}
