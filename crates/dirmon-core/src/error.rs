//! Error taxonomy for remote calls, mutations and telemetry delivery.

use crate::telemetry::ErrorSource;

/// Errors surfaced by the core.
///
/// Remote failures keep the distinction between "a response arrived"
/// (`Server`, `NotFound`, `Validation` from a 4xx body) and "no response"
/// (`Transport`), and a request that could not even be built (`Request`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Input rejected locally or by the server (400/422).
    Validation(String),
    /// The record id is unknown, locally or on the server.
    NotFound(i64),
    /// No response was received (connection refused, timeout, reset).
    Transport(String),
    /// A response was received with a failure status.
    Server { status: u16, body: String },
    /// The request could not be constructed.
    Request(String),
    /// An error batch could not be delivered. Never shown to the user.
    ReportDelivery(String),
}

impl Error {
    /// Telemetry source a failure of this kind is reported under.
    pub fn source_tag(&self) -> ErrorSource {
        match self {
            Error::Validation(_) | Error::NotFound(_) => ErrorSource::DataLayer,
            Error::Transport(_)
            | Error::Server { .. }
            | Error::Request(_)
            | Error::ReportDelivery(_) => ErrorSource::Transport,
        }
    }

    /// Returns `true` if a response was received from the server.
    pub fn has_response(&self) -> bool {
        matches!(self, Error::Server { .. } | Error::NotFound(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::NotFound(id) => write!(f, "Directory {} not found", id),
            Error::Transport(msg) => write!(f, "Network error: {}", msg),
            Error::Server { status, body } => {
                if body.is_empty() {
                    write!(f, "Server error: HTTP {}", status)
                } else {
                    write!(f, "Server error: HTTP {} - {}", status, body)
                }
            }
            Error::Request(msg) => write!(f, "Request error: {}", msg),
            Error::ReportDelivery(msg) => write!(f, "Error report delivery failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
