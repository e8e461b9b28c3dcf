use bytes::Bytes;
use thiserror::Error;

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Every way a command, a connection, or the codec can fail.
///
/// Per-command failures (`Server`, `CannotStoreFloats`) are local to the
/// call that produced them. Connection-level failures (`NoConnection`,
/// `Closed`, `Decode`, `Io`, `Tls`) are broadcast to every pending waiter
/// by the connection actor before it re-enters the reconnect loop.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("protocol decode error: {0}")]
    Decode(String),

    #[error("cannot store floats: {0}")]
    CannotStoreFloats(String),

    /// A server `-ERR ...`-style reply, carried as raw bytes (no parsing).
    #[error("server error: {}", String::from_utf8_lossy(.0))]
    Server(Bytes),

    /// The circuit breaker is open: the actor is `Disconnected`.
    #[error("no connection")]
    NoConnection,

    /// The socket was lost while this call was in flight.
    #[error("connection closed")]
    Closed,

    /// The caller's own timeout elapsed while waiting for a reply.
    #[error("call timed out")]
    Timeout,

    /// The very first connect attempt failed and reconnect is disabled.
    #[error("connection error: {0}")]
    ConnectionError(String),
}
