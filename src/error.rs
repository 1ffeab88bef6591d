use crate::{session::DialogId, transaction::key::TransactionKey, transport::SipAddr};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("SIP message error: {0}")]
    SipMessageError(String),

    #[error("Transport layer error: {0} ({1})")]
    TransportLayerError(String, SipAddr),

    #[error("Framing error: {0}")]
    FramingError(String),

    #[error("Transaction error: {0} ({1})")]
    TransactionError(String, TransactionKey),

    #[error("Session error: {0} ({1})")]
    SessionError(String, DialogId),

    #[error("Routing error: {0}")]
    RoutingError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    Error(String),
}

impl Error {
    /// Framing errors that are caused by a peer exceeding the packet limit
    pub fn is_overflow(&self) -> bool {
        matches!(self, Error::FramingError(reason) if reason.starts_with("buffer overflow"))
    }
}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::SipMessageError(e.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::Error(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Error(format!("timeout: {}", e))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Error(e.to_string())
    }
}
