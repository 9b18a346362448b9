//! Reply status codes surfaced to callers.
//!
//! Protocol statuses use small stable codes. `HostUnreachable` and
//! `NotConnected` carry the POSIX errno values the transport reports for the
//! same conditions, and any other transport-native code is passed through as
//! [`ReplyStatus::Transport`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Status of a reply, or of a call that never reached the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyStatus {
    Ok,
    BadMessage,
    NoObject,
    NoFunction,
    CommFailure,
    AuthFailure,
    Exception,
    IoError,
    TypeError,
    MemoryError,
    IndexError,
    Timeout,
    /// Server confirmed dead, or the client sockets are already closed.
    HostUnreachable,
    /// Client was not started.
    NotConnected,
    /// Transport-native error code passed through unchanged.
    Transport(i32),
}

impl ReplyStatus {
    pub const EHOSTUNREACH: i32 = 113;
    pub const ENOTCONN: i32 = 107;

    pub fn code(&self) -> i32 {
        match self {
            ReplyStatus::Ok => 0,
            ReplyStatus::BadMessage => 1,
            ReplyStatus::NoObject => 2,
            ReplyStatus::NoFunction => 3,
            ReplyStatus::CommFailure => 4,
            ReplyStatus::AuthFailure => 5,
            ReplyStatus::Exception => 6,
            ReplyStatus::IoError => 7,
            ReplyStatus::TypeError => 8,
            ReplyStatus::MemoryError => 9,
            ReplyStatus::IndexError => 10,
            ReplyStatus::Timeout => 11,
            ReplyStatus::HostUnreachable => Self::EHOSTUNREACH,
            ReplyStatus::NotConnected => Self::ENOTCONN,
            ReplyStatus::Transport(code) => *code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ReplyStatus::Ok,
            1 => ReplyStatus::BadMessage,
            2 => ReplyStatus::NoObject,
            3 => ReplyStatus::NoFunction,
            4 => ReplyStatus::CommFailure,
            5 => ReplyStatus::AuthFailure,
            6 => ReplyStatus::Exception,
            7 => ReplyStatus::IoError,
            8 => ReplyStatus::TypeError,
            9 => ReplyStatus::MemoryError,
            10 => ReplyStatus::IndexError,
            11 => ReplyStatus::Timeout,
            Self::EHOSTUNREACH => ReplyStatus::HostUnreachable,
            Self::ENOTCONN => ReplyStatus::NotConnected,
            other => ReplyStatus::Transport(other),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ReplyStatus::Ok)
    }

    /// Statuses the client synthesizes without hearing from the server.
    /// Such replies carry no auth metadata and skip reply validation.
    pub fn is_local_failure(&self) -> bool {
        matches!(self, ReplyStatus::HostUnreachable | ReplyStatus::NotConnected)
    }
}

impl std::fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyStatus::Ok => write!(f, "OK"),
            ReplyStatus::BadMessage => write!(f, "BAD_MESSAGE"),
            ReplyStatus::NoObject => write!(f, "NO_OBJECT"),
            ReplyStatus::NoFunction => write!(f, "NO_FUNCTION"),
            ReplyStatus::CommFailure => write!(f, "COMM_FAILURE"),
            ReplyStatus::AuthFailure => write!(f, "AUTH_FAILURE"),
            ReplyStatus::Exception => write!(f, "EXCEPTION"),
            ReplyStatus::IoError => write!(f, "IO_ERROR"),
            ReplyStatus::TypeError => write!(f, "TYPE_ERROR"),
            ReplyStatus::MemoryError => write!(f, "MEMORY_ERROR"),
            ReplyStatus::IndexError => write!(f, "INDEX_ERROR"),
            ReplyStatus::Timeout => write!(f, "TIMEOUT"),
            ReplyStatus::HostUnreachable => write!(f, "HOST_UNREACHABLE"),
            ReplyStatus::NotConnected => write!(f, "NOT_CONNECTED"),
            ReplyStatus::Transport(code) => write!(f, "TRANSPORT({})", code),
        }
    }
}

impl Serialize for ReplyStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

impl<'de> Deserialize<'de> for ReplyStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        i32::deserialize(deserializer).map(ReplyStatus::from_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_codes() {
        assert_eq!(ReplyStatus::HostUnreachable.code(), 113);
        assert_eq!(ReplyStatus::from_code(107), ReplyStatus::NotConnected);
    }

    #[test]
    fn test_unknown_code_passes_through() {
        assert_eq!(ReplyStatus::from_code(-42), ReplyStatus::Transport(-42));
        assert_eq!(ReplyStatus::Transport(-42).code(), -42);
    }

    #[test]
    fn test_serializes_as_integer() {
        let json = serde_json::to_string(&ReplyStatus::AuthFailure).unwrap();
        assert_eq!(json, "5");
        let parsed: ReplyStatus = serde_json::from_str("113").unwrap();
        assert_eq!(parsed, ReplyStatus::HostUnreachable);
    }

    #[test]
    fn test_local_failures() {
        assert!(ReplyStatus::HostUnreachable.is_local_failure());
        assert!(!ReplyStatus::AuthFailure.is_local_failure());
    }
}
