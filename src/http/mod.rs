//! HTTP surface: router, handlers, and the serving process.

pub mod handlers;
pub mod router;
pub mod server;

pub use router::{AppState, create_router};
pub use server::Server;
