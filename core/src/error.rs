//! Error types for the Unity Connection transport layer.
//!
//! # Design
//! Anticipated failures never cross the public boundary as `Err`; they are
//! folded into a failed `CallResult` tagged with a `FailureKind`. The enums
//! below describe those failures while they are still internal, and give the
//! `error_text` its wording.

use std::fmt;
use std::path::PathBuf;

/// Which layer a failed call broke in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No response from the server (DNS, connect, timeout, stream).
    Transport,
    /// The server answered with a non-2xx status.
    Protocol,
    /// The body could not be decoded into the requested shape.
    Parse,
    /// Arguments rejected before any network call.
    Validation,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Transport => "transport",
            FailureKind::Protocol => "protocol",
            FailureKind::Parse => "parse",
            FailureKind::Validation => "validation",
        };
        f.write_str(name)
    }
}

/// The request never produced a response.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http transport error: {0}")]
    Other(String),
}

impl From<ureq::Error> for TransportError {
    fn from(err: ureq::Error) -> Self {
        let text = err.to_string();
        match err {
            ureq::Error::Timeout(_) => TransportError::Timeout(text),
            ureq::Error::HostNotFound => TransportError::HostNotFound(text),
            ureq::Error::ConnectionFailed => TransportError::Connect(text),
            ureq::Error::Io(io) => TransportError::Io(io),
            _ => TransportError::Other(text),
        }
    }
}

/// Caller-supplied arguments rejected before touching the network.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("empty value passed for {0}")]
    Empty(&'static str),

    #[error("local file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("could not read {}: {source}", path.display())]
    FileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("wav file {} is too small ({size} bytes) and is likely corrupt", path.display())]
    FileTooSmall { path: PathBuf, size: usize },
}

/// An environment value that could not be parsed into `ClientConfig`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

/// Failure to establish or drive a CUTI phone session.
#[derive(Debug, thiserror::Error)]
pub enum PhoneError {
    #[error("empty value passed for {0}")]
    Empty(&'static str),

    #[error("call request failed: {0}")]
    CallRequest(String),

    #[error("no call id in response: '{0}'")]
    MissingCallId(String),

    #[error("phone did not connect after {attempts} status checks")]
    NotConnected { attempts: u32 },

    #[error("call {0} is no longer connected")]
    Disconnected(String),

    #[error("call control request failed: {0}")]
    Control(String),
}
