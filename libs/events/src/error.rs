use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// A builder was finished without a required field.
    #[error("audit event is missing required field '{0}'")]
    MissingField(&'static str),
}
