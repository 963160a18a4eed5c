//! Host-side transport: accepted WebSocket sessions and the HTTP single-shot
//! path.

mod connection;
pub mod error;
mod http;
mod server;

pub use connection::{ConnectionSession, SessionState};
pub use error::ServerError;
pub use server::{TaskwireServer, TaskwireServerBuilder};
