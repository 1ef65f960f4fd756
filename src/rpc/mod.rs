//! Bidirectional JSON RPC over WebSocket.

mod message;
mod peer;
mod registry;
mod session;

pub use message::{Call, Inbound, Response};
pub use peer::{Peer, Peers};
pub use registry::Registry;
pub use session::serve_connection;
