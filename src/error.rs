// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Library Error type

use crate::frame::ExceptionCode;

/// A specialized [Result] type for Modbus operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Modbus engine errors.
///
/// Protocol exceptions received from a server are kept separate from
/// library errors and surfaced as the distinguished [`Error::Exception`]
/// variant so that callers can pattern-match on the exception code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The caller violated an API contract (out of range, oversize, stale handle).
    #[error("invalid argument")]
    InvalidArgument,

    /// A malformed frame or PDU was received on the wire.
    #[error("malformed frame or PDU")]
    InvalidRequest,

    /// Frame checksum mismatch (RTU CRC-16 or ASCII LRC).
    #[error("checksum mismatch")]
    Crc,

    /// A response deadline expired, or no data is available yet.
    #[error("timed out")]
    Timeout,

    /// The underlying transport reported a hard failure.
    #[error("transport failure")]
    Transport,

    /// The transaction was aborted by the user.
    #[error("cancelled")]
    Cancelled,

    /// Queue full, pool exhausted or buffer overflow.
    #[error("out of resources")]
    NoResources,

    /// A Modbus exception response was received.
    #[error("Modbus exception: {0}")]
    Exception(ExceptionCode),

    /// Platform-specific fallback, never retried.
    #[error("platform error")]
    Other,
}

impl Error {
    /// Whether a failed transaction with retries left is re-attempted.
    ///
    /// Modbus exceptions are never retryable by default; retrying
    /// [`ExceptionCode::ServerDeviceBusy`] is an explicit per-submit
    /// opt-in handled by the client engine.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Crc | Self::Transport)
    }
}

impl From<ExceptionCode> for Error {
    fn from(code: ExceptionCode) -> Self {
        Self::Exception(code)
    }
}
