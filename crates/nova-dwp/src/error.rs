use std::io;

use thiserror::Error;

use crate::types::VersionInfo;

/// Reply status codes sent by the debuggee (subset).
pub mod status {
    pub const NONE: u16 = 0;
    pub const INVALID_OBJECT: u16 = 20;
    pub const INVALID_FIELDID: u16 = 25;
    pub const INVALID_FRAMEID: u16 = 30;
    pub const NOT_IMPLEMENTED: u16 = 100;
    pub const NOT_SUSPENDED: u16 = 101;
    pub const INVALID_ARGUMENT: u16 = 102;
    pub const UNLOADED: u16 = 103;
    pub const NO_INVOCATION: u16 = 104;
    pub const ABSENT_INFORMATION: u16 = 105;
    pub const NO_SEQ_POINT_AT_IL_OFFSET: u16 = 106;
    pub const INVOKE_ABORTED: u16 = 107;
    pub const LOADER_ERROR: u16 = 200;
}

#[derive(Debug, Error)]
pub enum DwpError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("timed out")]
    Timeout,
    #[error("handshake failed: peer sent {received:?}")]
    HandshakeFailed { received: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unknown event kind {0}")]
    UnknownEventKind(u8),
    #[error("command failed with error code {error_code}{}", message_suffix(.message))]
    CommandFailed {
        error_code: u16,
        message: Option<String>,
    },
    #[error("object has already been collected")]
    ObjectCollected,
    #[error("invalid stack frame")]
    InvalidStackFrame,
    #[error("thread is not suspended")]
    NotSuspended,
    #[error("command not implemented by the debuggee")]
    NotImplemented,
    #[error("{feature} requires protocol {required}, negotiated {negotiated}")]
    NotSupported {
        feature: &'static str,
        required: VersionInfo,
        negotiated: VersionInfo,
    },
    #[error("invoke was aborted")]
    InvokeAborted,
    #[error("debuggee disconnected")]
    Disconnected,
    #[error("debuggee crashed (hash {hash:#x})")]
    Crashed { dump: String, hash: u64 },
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl DwpError {
    /// Translate a non-zero reply status into the most specific error.
    pub fn from_status(error_code: u16, message: Option<String>) -> Self {
        match error_code {
            status::INVALID_OBJECT => DwpError::ObjectCollected,
            status::INVALID_FRAMEID => DwpError::InvalidStackFrame,
            status::NOT_SUSPENDED => DwpError::NotSuspended,
            status::NOT_IMPLEMENTED => DwpError::NotImplemented,
            status::INVOKE_ABORTED => DwpError::InvokeAborted,
            _ => DwpError::CommandFailed {
                error_code,
                message,
            },
        }
    }

    /// Returns the numeric reply status this error was derived from, if any.
    pub fn error_code(&self) -> Option<u16> {
        match self {
            DwpError::ObjectCollected => Some(status::INVALID_OBJECT),
            DwpError::InvalidStackFrame => Some(status::INVALID_FRAMEID),
            DwpError::NotSuspended => Some(status::NOT_SUSPENDED),
            DwpError::NotImplemented => Some(status::NOT_IMPLEMENTED),
            DwpError::InvokeAborted => Some(status::INVOKE_ABORTED),
            DwpError::CommandFailed { error_code, .. } => Some(*error_code),
            _ => None,
        }
    }

    /// `true` for the two terminal connection failures.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, DwpError::Disconnected | DwpError::Crashed { .. })
    }

    /// Duplicate an error for fan-out to several waiters.
    ///
    /// `io::Error` is not `Clone`; it is rebuilt from its kind and message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            DwpError::Io(err) => DwpError::Io(io::Error::new(err.kind(), err.to_string())),
            DwpError::Timeout => DwpError::Timeout,
            DwpError::HandshakeFailed { received } => DwpError::HandshakeFailed {
                received: received.clone(),
            },
            DwpError::Protocol(msg) => DwpError::Protocol(msg.clone()),
            DwpError::UnknownEventKind(kind) => DwpError::UnknownEventKind(*kind),
            DwpError::CommandFailed {
                error_code,
                message,
            } => DwpError::CommandFailed {
                error_code: *error_code,
                message: message.clone(),
            },
            DwpError::ObjectCollected => DwpError::ObjectCollected,
            DwpError::InvalidStackFrame => DwpError::InvalidStackFrame,
            DwpError::NotSuspended => DwpError::NotSuspended,
            DwpError::NotImplemented => DwpError::NotImplemented,
            DwpError::NotSupported {
                feature,
                required,
                negotiated,
            } => DwpError::NotSupported {
                feature: *feature,
                required: *required,
                negotiated: *negotiated,
            },
            DwpError::InvokeAborted => DwpError::InvokeAborted,
            DwpError::Disconnected => DwpError::Disconnected,
            DwpError::Crashed { dump, hash } => DwpError::Crashed {
                dump: dump.clone(),
                hash: *hash,
            },
            DwpError::InvalidState(msg) => DwpError::InvalidState(*msg),
        }
    }
}

fn message_suffix(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {m}"))
        .unwrap_or_default()
}

pub type Result<T, E = DwpError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_statuses_map_to_specific_errors() {
        assert!(matches!(
            DwpError::from_status(status::INVALID_OBJECT, None),
            DwpError::ObjectCollected
        ));
        assert!(matches!(
            DwpError::from_status(status::INVALID_FRAMEID, None),
            DwpError::InvalidStackFrame
        ));
        assert!(matches!(
            DwpError::from_status(status::NOT_SUSPENDED, None),
            DwpError::NotSuspended
        ));
        assert!(matches!(
            DwpError::from_status(status::NOT_IMPLEMENTED, None),
            DwpError::NotImplemented
        ));
    }

    #[test]
    fn other_statuses_keep_code_and_message() {
        let err = DwpError::from_status(status::INVALID_ARGUMENT, Some("bad index".into()));
        assert_eq!(err.error_code(), Some(status::INVALID_ARGUMENT));
        assert_eq!(
            err.to_string(),
            "command failed with error code 102: bad index"
        );
    }
}
