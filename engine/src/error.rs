// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;
use tokio::sync::{mpsc, oneshot};

/// Represents the types of errors this engine can surface, matching the
/// error kinds named in the protocol's error handling design: transport,
/// protocol, timeout, not-found and upload-failure conditions.
#[derive(Clone, Debug)]
pub enum ErrorKind {
    /// Error occurred while performing socket or file I/O.
    IoError,

    /// Packet encode error.
    EncodeError,

    /// Packet decode error.
    DecodeError,

    /// Malformed or unexpected MQTT framing, bad client id, unknown packet
    /// type.
    ProtocolError,

    /// A bounded wait elapsed with no result.
    Timeout,

    /// HTTP path not registered.
    NotFound,

    /// The printer reported a failed file transfer.
    UploadFailed,

    /// `RequestID` did not match any outstanding waiter.
    UnmatchedResponse,

    /// The printer's response carried a non-zero `Ack`.
    CommandRejected,

    /// mpsc/oneshot channel error.
    ChannelError,

    /// JSON (de)serialization error.
    JsonError,
}

#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_owned(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::new(ErrorKind::IoError, &err.to_string())
    }
}

impl From<codec::EncodeError> for Error {
    fn from(err: codec::EncodeError) -> Self {
        Self::new(ErrorKind::EncodeError, &format!("{err:?}"))
    }
}

impl From<codec::DecodeError> for Error {
    fn from(err: codec::DecodeError) -> Self {
        Self::new(ErrorKind::DecodeError, &format!("{err:?}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::JsonError, &err.to_string())
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(err: oneshot::error::RecvError) -> Self {
        Self::new(ErrorKind::ChannelError, &err.to_string())
    }
}

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(err: mpsc::error::SendError<T>) -> Self {
        Self::new(ErrorKind::ChannelError, &err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        Self::new(ErrorKind::Timeout, "operation timed out")
    }
}
