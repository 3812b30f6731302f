pub mod connection;
pub mod extract;
pub mod login;
pub mod protocol;
pub mod server;

pub use connection::{ConnectionConfig, ConnectionSession};
pub use server::{start, AppState, ServerConfig, ServerError, ServerHandle};
