//! Unified error handling for kestreld.

use kestrel_p10::reply::{codes, StandardReply};
use thiserror::Error;

/// Errors raised while handling an inbound frame or client command.
///
/// Most variants are dropped with a log line; [`HandlerError::CloseLink`]
/// is the one that implicates link integrity and tears the link down.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("not enough parameters")]
    NeedMoreParams,

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("unknown origin {0}")]
    UnknownOrigin(String),

    #[error("unknown target {0}")]
    UnknownTarget(String),

    #[error("link integrity violation: {0}")]
    CloseLink(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Static code for log labeling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NeedMoreParams => "need_more_params",
            Self::InvalidParams(_) => "invalid_params",
            Self::UnknownOrigin(_) => "unknown_origin",
            Self::UnknownTarget(_) => "unknown_target",
            Self::CloseLink(_) => "close_link",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Map to a standard reply for a client-facing command, when one is
    /// warranted.
    pub fn to_standard_reply(&self, command: &str) -> Option<StandardReply> {
        match self {
            Self::NeedMoreParams => Some(StandardReply::fail(
                command,
                codes::NEED_MORE_PARAMS,
                "Not enough parameters",
            )),
            Self::InvalidParams(detail) => Some(StandardReply::fail(
                command,
                codes::INVALID_PARAMS,
                detail.clone(),
            )),
            Self::UnknownTarget(target) => Some(
                StandardReply::fail(command, codes::INVALID_TARGET, "No such target")
                    .with_context(target.clone()),
            ),
            Self::UnknownOrigin(_) | Self::CloseLink(_) | Self::Internal(_) => None,
        }
    }
}

/// Result type for frame and command handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Errors from the persistent KV store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(HandlerError::NeedMoreParams.error_code(), "need_more_params");
        assert_eq!(
            HandlerError::CloseLink("x".into()).error_code(),
            "close_link"
        );
    }

    #[test]
    fn need_more_params_maps_to_fail() {
        let reply = HandlerError::NeedMoreParams
            .to_standard_reply("CHATHISTORY")
            .unwrap();
        assert_eq!(
            reply.to_string(),
            "FAIL CHATHISTORY NEED_MORE_PARAMS :Not enough parameters"
        );
    }

    #[test]
    fn link_faults_have_no_client_reply() {
        assert!(HandlerError::CloseLink("loop".into())
            .to_standard_reply("X")
            .is_none());
    }
}
