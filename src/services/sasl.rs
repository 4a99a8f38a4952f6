//! Per-connection SASL exchange state.
//!
//! The core never verifies credentials: it relays `AUTHENTICATE`
//! payloads to the services peer over `SA` and maps the terminal
//! subcommands back to the 900-series numerics. Payloads travel
//! base64-chunked exactly as the client sent them.

/// Where the exchange stands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SaslPhase {
    /// No exchange in progress.
    #[default]
    Idle,
    /// Mechanism sent to services; waiting for the first challenge.
    Started {
        /// Requested mechanism.
        mechanism: String,
    },
    /// Challenge relayed to the client; collecting its response chunks.
    Collecting,
    /// Exchange finished (success or failure); a fresh `AUTHENTICATE`
    /// may re-authenticate.
    Done,
}

/// Client `AUTHENTICATE` payload chunk size.
pub const CHUNK: usize = 400;

/// One connection's SASL state.
#[derive(Debug, Default)]
pub struct SaslSession {
    /// Exchange phase.
    pub phase: SaslPhase,
    /// Session id used on the `SA` wire.
    pub reqid: Option<String>,
    /// Partial client payload, accumulated across 400-byte chunks.
    pub buffer: String,
}

impl SaslSession {
    /// Start a fresh exchange; permitted from `Idle` and from `Done`
    /// (re-authentication).
    pub fn begin(&mut self, mechanism: &str, reqid: String) -> bool {
        match self.phase {
            SaslPhase::Idle | SaslPhase::Done => {
                self.phase = SaslPhase::Started {
                    mechanism: mechanism.to_owned(),
                };
                self.reqid = Some(reqid);
                self.buffer.clear();
                true
            }
            _ => false,
        }
    }

    /// Feed one client chunk. Returns the complete payload once the
    /// final chunk arrives (`+` is the empty payload, a short chunk
    /// terminates, a full 400-byte chunk continues).
    pub fn push_chunk(&mut self, chunk: &str) -> Option<String> {
        if chunk == "+" {
            return Some(std::mem::take(&mut self.buffer));
        }
        self.buffer.push_str(chunk);
        if chunk.len() < CHUNK {
            Some(std::mem::take(&mut self.buffer))
        } else {
            None
        }
    }

    /// Terminal transition.
    pub fn finish(&mut self) {
        self.phase = SaslPhase::Done;
        self.reqid = None;
        self.buffer.clear();
    }

    /// Abort without completing.
    pub fn abort(&mut self) {
        self.finish();
    }

    /// An exchange is in flight.
    pub fn in_flight(&self) -> bool {
        matches!(self.phase, SaslPhase::Started { .. } | SaslPhase::Collecting)
    }
}

/// Split a services challenge into client-bound `AUTHENTICATE` chunks.
pub fn chunk_payload(payload: &str) -> Vec<String> {
    if payload.is_empty() {
        return vec!["+".to_owned()];
    }
    let mut chunks: Vec<String> = payload
        .as_bytes()
        .chunks(CHUNK)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect();
    // A payload landing exactly on the boundary needs the explicit
    // empty terminator.
    if payload.len() % CHUNK == 0 {
        chunks.push("+".to_owned());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_only_from_idle_or_done() {
        let mut session = SaslSession::default();
        assert!(session.begin("PLAIN", "AB1".into()));
        assert!(!session.begin("PLAIN", "AB2".into()));
        session.finish();
        assert!(session.begin("EXTERNAL", "AB3".into()));
    }

    #[test]
    fn short_chunk_completes() {
        let mut session = SaslSession::default();
        assert_eq!(session.push_chunk("YWJj"), Some("YWJj".to_owned()));
    }

    #[test]
    fn full_chunks_accumulate() {
        let mut session = SaslSession::default();
        let full = "a".repeat(CHUNK);
        assert_eq!(session.push_chunk(&full), None);
        assert_eq!(session.push_chunk("+"), Some(full));
    }

    #[test]
    fn plus_is_empty_payload() {
        let mut session = SaslSession::default();
        assert_eq!(session.push_chunk("+"), Some(String::new()));
    }

    #[test]
    fn chunking_boundary_gets_terminator() {
        let exact = "b".repeat(CHUNK);
        let chunks = chunk_payload(&exact);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], "+");

        assert_eq!(chunk_payload(""), vec!["+".to_owned()]);
        assert_eq!(chunk_payload("abc"), vec!["abc".to_owned()]);
    }
}
