//! Pending federated requests.
//!
//! Anything that awaits a remote answer - metadata queries, chathistory
//! federation, registration, read-marker gets - parks an entry here and
//! returns. A later inbound frame resumes it; the deadline sweep
//! synthesizes a terminal error to the origin and frees the id.

use std::collections::HashMap;

use crate::state::ConnId;

/// What a pending request is waiting for.
#[derive(Debug, Clone)]
pub enum PendingKind {
    /// Metadata query toward services.
    Metadata {
        /// Queried target.
        target: String,
        /// Queried key, `*` for all.
        key: String,
    },
    /// Federated chathistory query.
    History {
        /// Queried target.
        target: String,
        /// Requested row limit.
        limit: usize,
        /// Rows collected so far (serialized stored messages).
        collected: Vec<crate::history::StoredMessage>,
        /// Peers that have not answered with `E` yet.
        outstanding: usize,
    },
    /// Account registration toward services.
    Register {
        /// Account being registered.
        account: String,
    },
    /// Account verification toward services.
    Verify {
        /// Account being verified.
        account: String,
    },
    /// Read-marker get toward services.
    MarkRead {
        /// Queried target.
        target: String,
    },
    /// SASL exchange with services.
    Sasl,
}

impl PendingKind {
    /// The client command this request answers, for FAIL context.
    pub fn command(&self) -> &'static str {
        match self {
            PendingKind::Metadata { .. } => "METADATA",
            PendingKind::History { .. } => "CHATHISTORY",
            PendingKind::Register { .. } => "REGISTER",
            PendingKind::Verify { .. } => "VERIFY",
            PendingKind::MarkRead { .. } => "MARKREAD",
            PendingKind::Sasl => "AUTHENTICATE",
        }
    }
}

/// One parked request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Wire request id, unique on this server.
    pub id: String,
    /// Originating client connection.
    pub conn: ConnId,
    /// What it waits for.
    pub kind: PendingKind,
    /// Creation time (unix seconds).
    pub created: i64,
    /// Absolute deadline (unix seconds).
    pub deadline: i64,
}

/// The pending-request table.
pub struct PendingTable {
    prefix: String,
    counter: u64,
    entries: HashMap<String, PendingRequest>,
}

impl PendingTable {
    /// Table for a server; ids carry its numeric as a prefix so they
    /// are network-unique.
    pub fn new(server_numeric: &str) -> Self {
        Self {
            prefix: server_numeric.to_owned(),
            counter: 0,
            entries: HashMap::new(),
        }
    }

    /// Park a request; returns the wire id.
    pub fn create(&mut self, conn: ConnId, kind: PendingKind, now: i64, timeout: i64) -> String {
        self.counter += 1;
        let id = format!("{}{}", self.prefix, self.counter);
        self.entries.insert(
            id.clone(),
            PendingRequest {
                id: id.clone(),
                conn,
                kind,
                created: now,
                deadline: now + timeout,
            },
        );
        id
    }

    /// Resume and remove a request. Late answers for already-expired
    /// ids return `None` and are dropped by the caller.
    pub fn take(&mut self, id: &str) -> Option<PendingRequest> {
        self.entries.remove(id)
    }

    /// Mutable access while a request stays parked (history collection).
    pub fn get_mut(&mut self, id: &str) -> Option<&mut PendingRequest> {
        self.entries.get_mut(id)
    }

    /// Remove and return the first request matching a predicate.
    /// Metadata and registration answers carry no request id on the
    /// wire; they correlate by content instead.
    pub fn take_match(
        &mut self,
        pred: impl Fn(&PendingRequest) -> bool,
    ) -> Option<PendingRequest> {
        let id = self
            .entries
            .values()
            .find(|r| pred(r))
            .map(|r| r.id.clone())?;
        self.entries.remove(&id)
    }

    /// Remove and return everything past its deadline.
    pub fn expire(&mut self, now: i64) -> Vec<PendingRequest> {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|r| r.deadline <= now)
            .map(|r| r.id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    /// Number of parked requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_prefixed() {
        let mut table = PendingTable::new("AB");
        let a = table.create(1, PendingKind::Register { account: "x".into() }, 100, 5);
        let b = table.create(1, PendingKind::Register { account: "y".into() }, 100, 5);
        assert_ne!(a, b);
        assert!(a.starts_with("AB"));
    }

    #[test]
    fn take_resumes_once() {
        let mut table = PendingTable::new("AB");
        let id = table.create(7, PendingKind::MarkRead { target: "#r".into() }, 100, 5);
        assert!(table.take(&id).is_some());
        assert!(table.take(&id).is_none());
    }

    #[test]
    fn expiry_frees_entries() {
        let mut table = PendingTable::new("AB");
        table.create(1, PendingKind::Verify { account: "a".into() }, 100, 5);
        let id2 = table.create(2, PendingKind::Verify { account: "b".into() }, 100, 50);
        let expired = table.expire(110);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].conn, 1);
        assert!(table.take(&id2).is_some());
    }
}
