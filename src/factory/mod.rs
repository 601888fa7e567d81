//! Connection factory contract
//!
//! The pool never talks to a backing resource directly. Everything it needs
//! from the outside world goes through [`ConnectionFactory`]: opening a raw
//! connection, probing one for liveliness, closing one, and a cheap check
//! for a connection that has already marked itself dead.

use async_trait::async_trait;

/// Produces and services the raw connections a pool manages.
///
/// Implementations carry their own target configuration (address,
/// credentials, and so on); the pool only asks for connections and hands
/// them back for probing or closing.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The raw resource handle this factory produces.
    type Connection: Send + 'static;

    /// Error type for open, probe, and close operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a new connection to the backing resource.
    async fn open(&self) -> Result<Self::Connection, Self::Error>;

    /// Execute a trivial liveliness probe against the connection.
    ///
    /// Only invoked when the owning pool is configured for probe-level
    /// liveliness checking.
    async fn probe(&self, conn: &mut Self::Connection) -> Result<(), Self::Error>;

    /// Close the underlying resource.
    ///
    /// Pools treat this as best-effort and swallow errors; a failed close
    /// never fails the surrounding pool operation.
    async fn close(&self, conn: Self::Connection) -> Result<(), Self::Error>;

    /// Whether the connection has already flagged itself as failed.
    ///
    /// Used as a fast-path pre-check before probing. Must be cheap and must
    /// not block.
    fn has_failed(&self, conn: &Self::Connection) -> bool {
        let _ = conn;
        false
    }
}
