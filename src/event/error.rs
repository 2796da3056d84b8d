//! Envelope error types

use std::fmt;

/// A payload could not be read as an envelope
#[derive(Debug)]
pub enum DecodeError {
    /// Not JSON, or not shaped like an event
    Json(serde_json::Error),
    /// Required attribute absent or empty
    MissingAttribute(&'static str),
    /// Both `data` and `data_base64` present
    ConflictingData,
    /// `data_base64` is not valid base64
    Base64(base64::DecodeError),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Json(e) => write!(f, "malformed event: {}", e),
            DecodeError::MissingAttribute(name) => {
                write!(f, "missing required attribute '{}'", name)
            }
            DecodeError::ConflictingData => {
                write!(f, "event carries both 'data' and 'data_base64'")
            }
            DecodeError::Base64(e) => write!(f, "invalid data_base64: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError::Json(e)
    }
}

impl From<base64::DecodeError> for DecodeError {
    fn from(e: base64::DecodeError) -> Self {
        DecodeError::Base64(e)
    }
}

/// An envelope could not be serialized
#[derive(Debug)]
pub struct EncodeError(serde_json::Error);

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to encode event: {}", self.0)
    }
}

impl std::error::Error for EncodeError {}

impl From<serde_json::Error> for EncodeError {
    fn from(e: serde_json::Error) -> Self {
        EncodeError(e)
    }
}

/// A new envelope could not be built
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationError {
    /// A required attribute was empty
    EmptyAttribute(&'static str),
}

impl fmt::Display for CreationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreationError::EmptyAttribute(name) => {
                write!(f, "cannot create event with empty '{}'", name)
            }
        }
    }
}

impl std::error::Error for CreationError {}
