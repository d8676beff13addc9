use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    /// The operation cannot make progress right now. Retry on the next tick.
    Wait,
    /// The operation failed and the subject should be torn down.
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ErrorType {
    /// Datagram too short, unknown control byte or inconsistent flags.
    MalformedPacket,
    /// Sealed box, authenticated box or signature failed to verify.
    AuthFailure,
    /// Sequence number below the window or already seen.
    Replay,
    /// Event not accepted by the current state.
    StateViolation,
    /// The router is at its connection cap.
    RouterBusy,
    /// The peer broke a protocol rule, e.g. a mismatched second OPEN.
    ProtocolViolation,
    /// A retry loop exhausted its total budget.
    Timeout,
    /// Peer speaks an incompatible wire version.
    VersionMismatch,
    /// No unique connection id could be allocated.
    IdExhausted,
    /// Message exceeds the negotiated maximum.
    PayloadTooLarge,
    /// Per-connection stream cap reached.
    StreamLimit,
    Crypto,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetworkError::Wait);
    }

    #[test]
    fn test_io_error_is_fatal() {
        let err: NetworkError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(err, NetworkError::Fatal(ErrorType::Io(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn test_wait_has_not_failed() {
        let result: NetworkResult<()> = Err(NetworkError::Wait);
        assert!(!result.has_failed());

        let result: NetworkResult<()> = Err(NetworkError::Fatal(ErrorType::Crypto));
        assert!(result.has_failed());
    }
}
