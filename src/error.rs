//! Session protocol errors.

use std::io;

/// Violations of the envelope sequencing contract.
///
/// Each variant is fatal to the session it names and to nothing else.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// An envelope arrived with a counter other than the next expected one.
    #[error("session {session}: expected counter {expected}, got {got}")]
    CounterMismatch {
        session: String,
        expected: u64,
        got: u64,
    },

    /// An envelope arrived after the peer already sent CLOSE.
    #[error("session {session}: data after close (counter {counter})")]
    DataAfterClose { session: String, counter: u64 },

    /// A CLOSE token was followed by further payload elements.
    #[error("session {session}: close token at position {index} is not last")]
    CloseNotLast { session: String, index: usize },

    /// The local side already closed this pipe.
    #[error("session {session}: pipe is closed")]
    PipeClosed { session: String },

    /// A session id was registered twice in one directory.
    #[error("session {session}: already registered")]
    DuplicateSession { session: String },
}

impl ProtocolError {
    pub fn session(&self) -> &str {
        match self {
            ProtocolError::CounterMismatch { session, .. }
            | ProtocolError::DataAfterClose { session, .. }
            | ProtocolError::CloseNotLast { session, .. }
            | ProtocolError::PipeClosed { session }
            | ProtocolError::DuplicateSession { session } => session,
        }
    }
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self {
        let kind = match err {
            ProtocolError::PipeClosed { .. } => io::ErrorKind::BrokenPipe,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_to_io_error() {
        let err = ProtocolError::CounterMismatch {
            session: "s1".into(),
            expected: 2,
            got: 4,
        };
        assert_eq!(err.session(), "s1");
        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);
        assert!(io_err.to_string().contains("expected counter 2, got 4"));

        let closed: io::Error = ProtocolError::PipeClosed {
            session: "s2".into(),
        }
        .into();
        assert_eq!(closed.kind(), io::ErrorKind::BrokenPipe);
    }
}
