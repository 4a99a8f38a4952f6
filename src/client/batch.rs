//! Client batch state.
//!
//! The open-batch table lives on each session; enforcement of ids,
//! caps and multiline semantics happens in the command layer, which
//! owns the standard replies.

use kestrel_p10::Tag;

/// One accumulated line inside a batch.
#[derive(Debug, Clone)]
pub struct BatchLine {
    /// Message text.
    pub text: String,
    /// Concatenate with the previous line (no newline) on reassembly.
    pub concat: bool,
    /// Client-only tags carried on the line.
    pub client_tags: Vec<Tag>,
}

/// An open client batch.
#[derive(Debug, Clone)]
pub struct ClientBatch {
    /// Client-scoped id.
    pub id: String,
    /// Batch type (`draft/multiline` is the only client-openable one).
    pub batch_type: String,
    /// Declared target.
    pub target: String,
    /// Accumulated lines.
    pub lines: Vec<BatchLine>,
    /// Total accumulated message bytes.
    pub bytes: usize,
    /// `PRIVMSG` or `NOTICE`, fixed by the first line.
    pub command: Option<String>,
    /// Label from the opening `BATCH`, echoed on completion.
    pub label: Option<String>,
    /// Client-only tags from the opening `BATCH`.
    pub open_tags: Vec<Tag>,
    /// Open time, for expiry (unix seconds).
    pub opened_at: i64,
}

impl ClientBatch {
    /// A freshly-opened batch.
    pub fn new(id: String, batch_type: String, target: String, now: i64) -> Self {
        Self {
            id,
            batch_type,
            target,
            lines: Vec::new(),
            bytes: 0,
            command: None,
            label: None,
            open_tags: Vec::new(),
            opened_at: now,
        }
    }

    /// Reassemble per multiline semantics: newline separators except
    /// where a line carries the concat flag.
    pub fn reassemble(&self) -> String {
        let mut out = String::new();
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 && !line.concat {
                out.push('\n');
            }
            out.push_str(&line.text);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembly_honors_concat() {
        let mut batch = ClientBatch::new("x".into(), "draft/multiline".into(), "#room".into(), 0);
        for (text, concat) in [("first", false), ("second", false), (" continued", true)] {
            batch.lines.push(BatchLine {
                text: text.to_owned(),
                concat,
                client_tags: Vec::new(),
            });
        }
        assert_eq!(batch.reassemble(), "first\nsecond continued");
    }

    #[test]
    fn empty_batch_reassembles_empty() {
        let batch = ClientBatch::new("x".into(), "draft/multiline".into(), "#room".into(), 0);
        assert_eq!(batch.reassemble(), "");
    }
}
