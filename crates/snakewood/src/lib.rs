pub mod config;
pub mod types;

pub(crate) mod crypto;
pub(crate) mod wire;
pub(crate) mod tree;
pub(crate) mod snake;
pub(crate) mod peers;
pub mod router;

// Re-export primary public API
pub use crate::config::Config;
pub use crate::router::{DebugSnapshot, Router};
pub use crate::types::{Addr, AttachError, Conn, FrameError, PingError, Port};
pub use crate::wire::Coordinates;
