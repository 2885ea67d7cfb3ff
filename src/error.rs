//! Error kinds and quit codes.
//!
//! Every failure the relay can hit is one of a closed set of named kinds.
//! [`RelayError`] is the rich form (message plus source) returned by fallible
//! operations and rendered into SBRP error lines; [`QuitCode`] is the compact
//! form carried on the supervisor's quit channel and used for process exit
//! codes and the `ERROR_MESG` code field on the wire.

use std::io;

use thiserror::Error;

/// Failure kinds for relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The fixed host port could not be bound. Fatal for the process.
    #[error("cannot listen for hosts on port {port}: {source}")]
    CannotListenForHost {
        /// The configured host port.
        port: u16,
        /// Underlying bind error.
        #[source]
        source: io::Error,
    },

    /// Every port in the configured client range is taken. Fatal for the
    /// host session that requested it, not for the process.
    #[error("no free client port in {min}..={max}")]
    CannotListenForClient {
        /// Low end of the configured range.
        min: u16,
        /// High end of the configured range.
        max: u16,
    },

    /// A write to the host socket failed.
    #[error("writing to host failed: {0}")]
    WritingToHost(#[source] io::Error),

    /// A control frame carried the SBRP prefix but could not be acted on.
    #[error("badly formatted SBRP message: {0}")]
    BadlyFormattedSbrpMsg(String),

    /// The host's read loop hit a terminal error.
    #[error("cannot receive data from host: {0}")]
    CannotReceiveDataFromHost(#[source] io::Error),

    /// A client's read loop hit a terminal error.
    #[error("client connection closed: {0}")]
    ClientClosure(#[source] io::Error),
}

impl RelayError {
    /// The quit code matching this error kind.
    pub fn quit_code(&self) -> QuitCode {
        match self {
            RelayError::CannotListenForHost { .. } => QuitCode::CannotListenForHost,
            RelayError::CannotListenForClient { .. } => QuitCode::CannotListenForClient,
            RelayError::WritingToHost(_) => QuitCode::WritingToHost,
            RelayError::BadlyFormattedSbrpMsg(_) => QuitCode::BadlyFormattedSbrpMsg,
            RelayError::CannotReceiveDataFromHost(_) => QuitCode::CannotReceiveDataFromHost,
            RelayError::ClientClosure(_) => QuitCode::ClientClosureError,
        }
    }
}

/// Compact relay outcome codes.
///
/// Sent on the supervisor's quit channel, rendered into `ERROR_MESG` lines,
/// and mapped to the process exit code on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum QuitCode {
    /// Normal operation, including a host-requested `QUIT_RELAY`.
    Ok = 0,
    CannotListenForHost = 1,
    CannotListenForClient = 2,
    WritingToHost = 3,
    BadlyFormattedSbrpMsg = 4,
    CannotReceiveDataFromHost = 5,
    ClientClosureError = 6,
}

impl QuitCode {
    /// Stable name used in `ERROR_MESG` lines on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            QuitCode::Ok => "OK",
            QuitCode::CannotListenForHost => "CANNOT_LISTEN_FOR_HOST",
            QuitCode::CannotListenForClient => "CANNOT_LISTEN_FOR_CLIENT",
            QuitCode::WritingToHost => "WRITING_TO_HOST",
            QuitCode::BadlyFormattedSbrpMsg => "BADLY_FORMATTED_SBRP_MSG",
            QuitCode::CannotReceiveDataFromHost => "CANNOT_RECEIVE_DATA_FROM_HOST",
            QuitCode::ClientClosureError => "CLIENT_CLOSURE_ERROR",
        }
    }

    /// Process exit code for this outcome.
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quit_codes_have_stable_names_and_exit_codes() {
        assert_eq!(QuitCode::Ok.wire_name(), "OK");
        assert_eq!(QuitCode::Ok.exit_code(), 0);
        assert_eq!(
            QuitCode::CannotListenForClient.wire_name(),
            "CANNOT_LISTEN_FOR_CLIENT"
        );
        assert_eq!(QuitCode::ClientClosureError.exit_code(), 6);
    }

    #[test]
    fn errors_map_to_matching_quit_codes() {
        let err = RelayError::CannotListenForClient { min: 8081, max: 8081 };
        assert_eq!(err.quit_code(), QuitCode::CannotListenForClient);
        assert_eq!(err.to_string(), "no free client port in 8081..=8081");

        let err = RelayError::WritingToHost(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert_eq!(err.quit_code(), QuitCode::WritingToHost);

        let err = RelayError::CannotListenForHost {
            port: 8080,
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(err.quit_code(), QuitCode::CannotListenForHost);
        assert!(err.to_string().contains("8080"));
    }
}
