use std::io;

pub type Result<T> = std::result::Result<T, IbError>;

#[derive(Debug, thiserror::Error)]
pub enum IbError {
    #[error("no such device: {0}")]
    NoDevice(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{device}:{port} is not active")]
    Unreachable { device: String, port: u8 },

    #[error("{operation} failed: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid address: {0}")]
    InvalidAddr(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("a wait is already in progress for {0}")]
    Busy(String),

    #[error("out of memory: {0}")]
    NoMemory(&'static str),

    #[error("endpoint timeout: {0}")]
    EndpointTimeout(String),
}

impl IbError {
    /// Create an `Io` error for a failed hardware or admin call.
    pub fn io(operation: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create an `InvalidParam` error with just a message.
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }

    /// Create an `Unsupported` error with just a message.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Classify a failed address-handle creation.
    ///
    /// `ETIMEDOUT` from the provider means the remote path could not be
    /// resolved in time; anything else is treated as a bad address.
    pub fn from_ah_create(context: impl Into<String>, err: &io::Error) -> Self {
        let context = context.into();
        if err.raw_os_error() == Some(libc::ETIMEDOUT) || err.kind() == io::ErrorKind::TimedOut {
            Self::EndpointTimeout(format!("{context}: {err}"))
        } else {
            Self::InvalidAddr(format!("{context}: {err}"))
        }
    }
}
