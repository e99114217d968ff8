use thiserror::Error;

/// Error taxonomy of the messaging core.
///
/// Wire-facing rejections (`Validation`, `Signature`, `Replay`) are dropped
/// with an audit event rather than surfaced to the remote end. `Transport`
/// failures are retryable and end up in a queue; `Route` failures never
/// would succeed and are dropped. `Fatal` aborts startup.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("signature rejected: {0}")]
    Signature(String),
    #[error("replay rejected: {0}")]
    Replay(String),
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("no route: {0}")]
    Route(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Audit tags attached to dropped wire input. Fixed vocabulary so operators
/// can alert on them.
pub mod audit {
    pub const INVALID_TYPE: &str = "invalid_type";
    pub const INVALID_ID: &str = "invalid_id";
    pub const INVALID_FROM: &str = "invalid_from";
    pub const INVALID_TO: &str = "invalid_to";
    pub const INVALID_SERVICE: &str = "invalid_service";
    pub const INVALID_EVENT: &str = "invalid_event";
    pub const MESSAGE_REJECTED: &str = "message_rejected";
    pub const SIGNATURE_FAILED: &str = "signature_failed";
    pub const UNKNOWN_RECIPIENT: &str = "unknown_recipient";
    pub const UNKNOWN_HANDLER: &str = "unknown_handler";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_their_class() {
        assert_eq!(
            CoreError::Transport("dial failed".into()).to_string(),
            "transport failed: dial failed"
        );
        assert_eq!(CoreError::Replay("nonce".into()).to_string(), "replay rejected: nonce");
    }
}
