//! Error types shared by every layer of the crate.
//!
//! Each variant maps to an OS-style errno through [`Error::errno`], which is
//! what the C ABI hands back to the binding layer as a negative return value.

use thiserror::Error;

/// Errors raised by sessions, devices and the transport underneath them.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid membership operations or session-wide configuration.
    #[error("session error: {message}")]
    Session { message: String, errno: i32 },

    /// Device specific failures: calibration, firmware, control transfers.
    #[error("device error: {message}")]
    Device { message: String, errno: i32 },

    /// The device was unplugged; every pending and future call on it fails.
    #[error("device {serial} detached")]
    Detached { serial: String },

    /// Incoming samples were dropped because nobody consumed them in time.
    #[error("data sample dropped: incoming sample queue overflowed")]
    BufferOverflow,

    /// Outgoing samples could not be queued or were exhausted.
    #[error("data write timeout: {0}")]
    BufferTimeout(String),

    /// Local validation failure, raised before any I/O happens.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn session(message: impl Into<String>, errno: i32) -> Self {
        Error::Session {
            message: message.into(),
            errno,
        }
    }

    pub fn device(message: impl Into<String>, errno: i32) -> Self {
        Error::Device {
            message: message.into(),
            errno,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// Errno-equivalent code used for message formatting and the C ABI.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Session { errno, .. } | Error::Device { errno, .. } => *errno,
            Error::Detached { .. } => libc::ENODEV,
            Error::BufferOverflow | Error::BufferTimeout(_) => libc::EBUSY,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Overflow and timeout are the only errors `ignore_dataflow` suppresses.
    pub fn is_dataflow(&self) -> bool {
        matches!(self, Error::BufferOverflow | Error::BufferTimeout(_))
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_missing_reports_enxio() {
        let err = Error::session("no such device", libc::ENXIO);
        assert_eq!(err.errno(), libc::ENXIO);
        assert_eq!(err.to_string(), "session error: no such device");
    }

    #[test]
    fn test_dataflow_classification() {
        assert!(Error::BufferOverflow.is_dataflow());
        assert!(Error::BufferTimeout("queue full".into()).is_dataflow());
        assert!(!Error::invalid("mode").is_dataflow());
        assert_eq!(Error::BufferOverflow.errno(), libc::EBUSY);
    }

    #[test]
    fn test_detached_message() {
        let err = Error::Detached {
            serial: "203B1234".into(),
        };
        assert!(err.to_string().contains("203B1234"));
        assert_eq!(err.errno(), libc::ENODEV);
    }
}
