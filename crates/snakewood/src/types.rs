use std::fmt;

/// Ed25519 public key used as a network address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr(pub [u8; 32]);

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({})", self)
    }
}

impl From<[u8; 32]> for Addr {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Addr {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Switch port number of a peer slot. Port 0 is the local router itself.
pub type Port = u8;

/// Errors surfaced by `Router::attach` and `Router::attach_authenticated`.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("no free switch ports")]
    NoFreePorts,
    #[error("mismatched node version")]
    HandshakeVersionMismatch,
    #[error("mismatched node capabilities")]
    HandshakeCapMismatch,
    #[error("peer sent invalid signature")]
    HandshakeSignatureInvalid,
    #[error("connection i/o: {0}")]
    ConnectionIO(#[from] std::io::Error),
}

/// Errors surfaced by the ping APIs.
#[derive(Debug, thiserror::Error)]
pub enum PingError {
    #[error("a ping to this node is already in progress")]
    AlreadyInProgress,
    #[error("ping timed out")]
    Timeout,
}

/// Errors raised while decoding frames or their payloads.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("payload too short")]
    PayloadTooShort,
    #[error("unmarshal failed")]
    Unmarshal,
}

/// Trait for transport connections used by peers.
/// Any async bidirectional byte stream (TCP, TLS, in-memory duplex, etc.).
pub trait Conn: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static {}

// Blanket implementation: anything that satisfies the bounds is a Conn.
impl<T> Conn for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static {}
