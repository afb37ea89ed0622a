/// Agent-wide error type, split along the failure kinds that matter to
/// callers: configuration problems are fatal at startup, data problems are
/// routed through transformer error policies, everything transient is left
/// to the flusher's retries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Data(String),

    #[error(transparent)]
    Buffer(#[from] buffer::Error),

    #[error(transparent)]
    Persist(#[from] persist::Error),

    #[error(transparent)]
    Field(#[from] entry::FieldError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Error {
        Error::Config(message.into())
    }

    pub fn data(message: impl Into<String>) -> Error {
        Error::Data(message.into())
    }

    /// True for errors a transformer's `on_error` policy should absorb
    /// rather than propagate.
    pub fn is_data(&self) -> bool {
        matches!(self, Error::Data(_) | Error::Field(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Data(err.to_string())
    }
}
