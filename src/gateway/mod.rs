//! Gateway server implementation

pub mod dispatch;
mod router;
mod server;

pub use dispatch::{Inbound, ProxyReply};
pub use router::{AppState, create_router};
pub use server::Gateway;
