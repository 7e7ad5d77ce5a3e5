//! Error layering, by source: document / store / endpoint / source lifecycle.

use thiserror::Error;

/// Unified error type crossing crate boundaries.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Document payload could not be parsed.
    #[error("document parse error: {message}")]
    DocumentParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Document parsed but failed semantic validation.
    #[error("document validation error at '{field}': {message}")]
    DocumentValidation { field: String, message: String },

    /// Persistent store read/write failure.
    #[error("document store error for slot '{slot}': {message}")]
    Store { slot: String, message: String },

    /// Endpoint open/bind failure.
    #[error("endpoint error on interface '{interface}': {message}")]
    Endpoint { interface: String, message: String },

    /// The underlying network device disappeared. Fatal for the owning source.
    #[error("device removed: {interface}")]
    DeviceRemoved { interface: String },

    /// Worker lifecycle misuse (double start, stop of a never-started worker).
    #[error("source lifecycle error: {message}")]
    SourceLifecycle { message: String },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error.
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    pub fn document_parse(message: impl Into<String>) -> Self {
        Self::DocumentParse {
            message: message.into(),
            source: None,
        }
    }

    pub fn document_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DocumentValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn store(slot: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            slot: slot.into(),
            message: message.into(),
        }
    }

    pub fn endpoint(interface: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Endpoint {
            interface: interface.into(),
            message: message.into(),
        }
    }
}
