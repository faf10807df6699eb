use snafu::Snafu;

use crate::message::MessageStatus;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to encode or decode message content"))]
    Serialization {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Message store unavailable"))]
    StoreUnavailable {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Transport queue unavailable: {message}"))]
    QueueUnavailable {
        message: String,
        #[snafu(source(false))]
        source: Option<sqlx::Error>,
    },

    #[snafu(display("Clock moved backwards: last id at {last}ms, clock now at {now}ms"))]
    ClockRegression { last: u64, now: u64 },

    #[snafu(display("Handler failed: {message}"))]
    HandlerFailure { message: String },

    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Message {id} cannot move from {from} to {to}"))]
    InvalidTransition {
        id: u64,
        from: MessageStatus,
        to: MessageStatus,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            source: Some(e.into()),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization {
            source: Some(eyre::eyre!("{e}")),
        }
    }
}

impl Error {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn message_not_found(id: u64) -> Self {
        Self::NotFound {
            resource: format!("message {id}"),
        }
    }

    pub fn queue_not_found(queue: impl AsRef<str>) -> Self {
        Self::NotFound {
            resource: format!("queue {}", queue.as_ref()),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn queue_unavailable(message: impl Into<String>) -> Self {
        Self::QueueUnavailable {
            message: message.into(),
            source: None,
        }
    }

    pub fn handler_failure(report: &eyre::Report) -> Self {
        Self::HandlerFailure {
            message: format!("{report:#}"),
        }
    }

    /// Infrastructure failures worth retrying the operation for, as opposed
    /// to failures of the message itself.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::QueueUnavailable { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
