//! A small, reusable TCP accept-loop server.
//!
//! [`TcpServer`] binds one address, accepts connections until it is closed,
//! and hands every connection to a [`TcpHandler`] on its own task. A panic
//! inside a handler only tears down that one connection.
pub mod conn;
pub mod server;

pub use conn::{Connection, TimedStream};
pub use server::{ServerError, ServerOptions, ServerState, TcpHandler, TcpServer};
