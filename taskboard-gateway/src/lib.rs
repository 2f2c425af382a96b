//! Taskboard gateway library.
//!
//! Exposes the gateway server for use in tests and embedding. The gateway
//! holds the authoritative board, answers fetch and write requests from
//! connected clients, and tells every other client which columns changed.

pub mod config;
pub mod server;
pub mod store;
