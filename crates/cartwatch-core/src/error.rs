//! Error types for cartwatch-core
//!
//! The taxonomy mirrors the failure modes of the pipeline: per-event errors
//! (malformed payloads, routing misses, illegal transitions) are dropped and
//! counted, sink errors are retried or dead-lettered, and only broker loss
//! beyond its retry budget is fatal to the process.

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cartwatch-core
#[derive(Error, Debug)]
pub enum Error {
    /// Event validation errors
    #[error("Event error: {0}")]
    Event(#[from] EventError),

    /// Partition routing errors
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Persistence sink errors
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Broker/transport errors
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Engine lifecycle errors (channel failures, worker panics, etc.)
    #[error("Engine error: {0}")]
    Engine(String),
}

/// Errors raised while validating an inbound event.
///
/// Always non-fatal: the event is dropped and counted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The payload failed schema validation.
    #[error("malformed event: {0}")]
    Malformed(String),

    /// A required field is missing or empty.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// The timestamp could not be parsed as RFC 3339.
    #[error("bad timestamp: {0}")]
    BadTimestamp(String),

    /// Unrecognized event type string.
    #[error("unknown event type: {0}")]
    UnknownType(String),
}

/// Errors raised while routing an event to a worker shard.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The partition key was empty or unusable.
    #[error("empty partition key")]
    EmptyKey,

    /// The router was built with zero workers.
    #[error("no workers configured")]
    NoWorkers,
}

/// Errors from the persistence sink.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Transient failure (store unavailable, busy, timeout). Retried.
    #[error("transient sink failure: {0}")]
    Transient(String),

    /// Permanent failure (constraint violation, schema mismatch). Not retried.
    #[error("permanent sink failure: {0}")]
    Permanent(String),

    /// Retry budget exhausted; the summary was dead-lettered.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// Underlying SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl SinkError {
    /// Whether this error should be retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Sqlite(e) => {
                // Busy/locked are the retryable SQLite failures.
                matches!(
                    e.sqlite_error_code(),
                    Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
                )
            }
            Self::Permanent(_) | Self::RetriesExhausted { .. } => false,
        }
    }
}

/// Errors from the broker transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Connection to the broker was lost.
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),

    /// Connection-loss retry budget exhausted. Fatal to the engine.
    #[error("broker unavailable after {attempts} reconnect attempts")]
    Unavailable { attempts: u32 },

    /// An ack referenced an unknown partition or offset.
    #[error("bad ack: partition {partition}, offset {offset}")]
    BadAck { partition: usize, offset: u64 },
}

/// Errors from configuration loading and validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Failed to parse the TOML document.
    #[error("parse error: {0}")]
    Parse(String),

    /// A field value is out of its valid range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        assert!(SinkError::Transient("down".into()).is_transient());
        assert!(!SinkError::Permanent("bad schema".into()).is_transient());
        assert!(
            !SinkError::RetriesExhausted {
                attempts: 5,
                last: "down".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn error_display_includes_context() {
        let err = Error::Routing(RoutingError::EmptyKey);
        assert!(err.to_string().contains("empty partition key"));
    }

    #[test]
    fn event_error_converts_to_top_level() {
        let err: Error = EventError::MissingField("session_id").into();
        assert!(matches!(err, Error::Event(_)));
    }
}
