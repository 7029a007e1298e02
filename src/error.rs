use std::time::Duration;
use thiserror::Error;

/// Why a frame produced no reading.
///
/// None of these are fatal to the connection the frame arrived on; the
/// handler logs them and carries on reading.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Not an APS18AA frame. Other message types pass through the proxy
    /// untouched, so this is not an anomaly.
    #[error("not an APS18AA message")]
    NotRecognized,

    #[error("checksum error - sum: {declared}, len: {actual}")]
    ChecksumMismatch { declared: usize, actual: usize },

    #[error("unable to parse {field} from {value:?}")]
    FieldParseError { field: &'static str, value: String },

    #[error("message too old, age is {age_secs}s")]
    Stale { age_secs: u64 },
}

impl RejectReason {
    pub(crate) fn field(field: &'static str, value: &[u8]) -> Self {
        Self::FieldParseError {
            field,
            value: String::from_utf8_lossy(value).into_owned(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ForwardingError {
    #[error("unable to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed writing to upstream: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed reading from upstream: {0}")]
    Read(#[source] std::io::Error),

    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),
}
