use thiserror::Error;

/// Failure of the line transport. Fatal for the dispatcher that owns it.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,

    #[error("modem: {0}")]
    Modem(String),
}
