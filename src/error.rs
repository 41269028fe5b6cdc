//! Error types for the data logger protocol.
//!
//! `Error` is what every client operation returns. Record-level problems found
//! by the codec are described in more detail by `RecordError`, which converts
//! into `Error::MalformedRecord` so `?` works across the codec boundary.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::bottles::BottleMode;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The transport or client was configured in a way the protocol can't use.
    #[error("configuration error: {0}")]
    Config(String),

    /// CTS was never raised by the peer.
    #[error("RTS/CTS handshake failed: no CTS within {0:?}")]
    HandshakeFailed(Duration),

    #[error("only wrote first {written} bytes of {expected}")]
    PartialSend { written: usize, expected: usize },

    #[error("failed to read any data before timeout")]
    ReceiveTimeout,

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("checksum mismatch: received {received}, calculated {calculated}")]
    ChecksumMismatch { received: u64, calculated: u64 },

    #[error("malformed record: {0}")]
    MalformedRecord(#[from] RecordError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Reasons a bottle, head or readings record can be rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("invalid bottle serial number {0:?}")]
    InvalidSerial(String),

    #[error("invalid head serial number {0:?}")]
    InvalidHeadSerial(String),

    #[error("id must be an integer between 1 and 999, got {0}")]
    InvalidId(u32),

    #[error("interval of {0} minutes cannot be represented on the wire")]
    InvalidInterval(i64),

    #[error("interval {0} is not a whole number of minutes")]
    IntervalPrecision(chrono::Duration),

    #[error("timestamp {0} cannot be represented on the wire")]
    InvalidTimestamp(chrono::NaiveDateTime),

    #[error("volumes must be positive, the bottle volume in whole ml and the sample volume in tenths")]
    InvalidVolume,

    #[error("head {head} does not suit a {mode} bottle")]
    HeadMode { head: String, mode: BottleMode },

    #[error("unknown mode code {0:?}")]
    UnknownMode(String),

    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("cannot parse {field} from {value:?}")]
    Parse { field: &'static str, value: String },

    #[error("record is empty")]
    Empty,

    #[error("header declares {declared} heads but {found} were sent")]
    HeadCount { declared: usize, found: usize },

    #[error("head line {0:?} is not framed by empty fields")]
    HeadLine(String),

    #[error("readings belong to {found}, expected {expected}")]
    SerialMismatch { expected: String, found: String },

    #[error("header declares {declared} readings but {found} were sent")]
    ReadingCount { declared: usize, found: usize },
}

impl RecordError {
    pub(crate) fn parse(field: &'static str, value: &str) -> Self {
        RecordError::Parse {
            field,
            value: value.to_string(),
        }
    }
}
