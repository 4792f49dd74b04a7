use thiserror::Error;

/// Failures while turning wire bytes into telemetry. These only ever drop the
/// current cycle; connectivity and previously decoded values are left alone.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame is {actual} bytes, expected {expected}")]
    Length { expected: usize, actual: usize },

    #[error("frame does not begin with the start marker")]
    StartMarker,

    #[error("truncated frame: {0}")]
    Truncated(String),

    #[error("response is not ASCII")]
    NotAscii,

    #[error("response too short ({0} bytes)")]
    ShortResponse(usize),

    #[error("missing field {index} in {query} response")]
    MissingField { query: &'static str, index: usize },

    #[error("field {index} in {query} response is not a number: {raw:?}")]
    BadNumber {
        query: &'static str,
        index: usize,
        raw: String,
    },

    #[error("unrecognised {what} code {code:?}")]
    UnknownCode { what: &'static str, code: String },
}

/// Raised while building a device from its configuration entry. Only the
/// offending device is skipped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceInitialisationError {
    #[error("invalid device key {0:?}: keys must be non-empty and contain no whitespace")]
    InvalidKey(String),

    #[error("missing field: type")]
    MissingType,

    #[error("unknown device type {0:?}")]
    UnknownType(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("field {field} has the wrong type, expected {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
}
