// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the tokenward client and daemon.

use cryptoki_sys::{
    CK_MECHANISM_TYPE, CK_RV, CK_ULONG, CKR_ARGUMENTS_BAD, CKR_BUFFER_TOO_SMALL,
    CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_CRYPTOKI_NOT_INITIALIZED, CKR_DEVICE_ERROR,
    CKR_HOST_MEMORY, CKR_MECHANISM_INVALID, CKR_OK,
};

use crate::calls::ArgKind;

/// Errors any RPC operation may return.
///
/// Each variant maps onto exactly one PKCS#11 return value via [`Error::rv`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The socket to the daemon could not be established or failed mid-call.
    ///
    /// The connection has been closed and the next call reconnects. The call that
    /// failed is not retried since it's unknown whether the daemon acted on it.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The daemon's response did not follow the protocol.
    ///
    /// The response was read in full, so the connection stays usable. This is almost
    /// certainly a bug in the client or the daemon.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A message buffer could not be grown.
    #[error("memory allocation failed")]
    HostMemory,

    /// The caller supplied arguments which cannot be sent to the daemon.
    #[error("bad arguments: {0}")]
    ArgumentsBad(&'static str),

    /// The caller's output buffer is smaller than the result.
    ///
    /// `required` holds the number of elements needed so the caller can retry with a
    /// larger buffer.
    #[error("output buffer too small; {required} elements required")]
    BufferTooSmall { required: CK_ULONG },

    /// The mechanism isn't on the allow-list of mechanisms whose parameters are safe to
    /// transmit.
    #[error("mechanism {0:#x} is not supported over RPC")]
    MechanismInvalid(CK_MECHANISM_TYPE),

    /// Initialize was called twice by the same process.
    #[error("the module is already initialized in this process")]
    AlreadyInitialized,

    /// A call was made before initialize, after finalize, or from a forked child that
    /// has not re-initialized.
    #[error("the module is not initialized in this process")]
    NotInitialized,

    /// The daemon (or the token behind it) reported an error.
    #[error("the daemon returned {0:#x}")]
    Token(CK_RV),
}

impl Error {
    /// The PKCS#11 return value for this error.
    pub fn rv(&self) -> CK_RV {
        match self {
            Error::Transport(_) | Error::Protocol(_) => CKR_DEVICE_ERROR,
            Error::HostMemory => CKR_HOST_MEMORY,
            Error::ArgumentsBad(_) => CKR_ARGUMENTS_BAD,
            Error::BufferTooSmall { .. } => CKR_BUFFER_TOO_SMALL,
            Error::MechanismInvalid(_) => CKR_MECHANISM_INVALID,
            Error::AlreadyInitialized => CKR_CRYPTOKI_ALREADY_INITIALIZED,
            Error::NotInitialized => CKR_CRYPTOKI_NOT_INITIALIZED,
            Error::Token(rv) => *rv,
        }
    }

    /// Convert a daemon-reported return value into a result.
    pub fn check(rv: CK_RV) -> Result<(), Error> {
        if rv == CKR_OK {
            Ok(())
        } else {
            Err(Error::Token(rv))
        }
    }
}

/// Errors that occur on the socket between the client and the daemon.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// Connecting to the daemon's socket failed.
    ///
    /// Usually the daemon isn't running or the socket path is wrong.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Sending process credentials to the daemon failed.
    #[error("failed to send credentials: {0}")]
    Credentials(std::io::Error),

    /// Writing a request failed.
    #[error("failed to send request: {0}")]
    Send(std::io::Error),

    /// Reading a response failed.
    #[error("failed to receive response: {0}")]
    Receive(std::io::Error),

    /// The daemon closed the connection.
    #[error("the daemon closed the connection")]
    Disconnected,

    /// The daemon announced a response larger than the configured limit.
    #[error("response of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: u32, limit: u32 },
}

/// Violations of the RPC protocol.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The response answered a different call than the one sent.
    #[error("response is for call {received}, expected call {expected}")]
    CallMismatch { expected: u32, received: u32 },

    /// The call id isn't in the call catalog.
    #[error("unknown call id {0}")]
    UnknownCall(u32),

    /// The message was truncated or a field held an impossible value.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The daemon answered for a different number of attributes than were requested.
    #[error("expected {expected} attributes but received {received}")]
    AttributeCount { expected: usize, received: usize },

    /// An error response carried a success code.
    #[error("error response carried CKR_OK")]
    BadErrorCode,

    /// Bytes remained after all declared arguments were read.
    #[error("{0} trailing bytes after the last argument")]
    TrailingData(usize),

    /// An argument was written or read out of order relative to the call's declared
    /// signature.
    #[error("call {call_id} expected argument {expected:?} but got {actual:?}")]
    Signature {
        call_id: u32,
        expected: Option<ArgKind>,
        actual: Option<ArgKind>,
    },
}
