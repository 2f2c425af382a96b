//! Kanban task board ordering engine.
//!
//! Tasks live in status columns with dense `0..n` positions. Moves are
//! applied locally at once and persisted in the background through a
//! [`gateway::SyncGateway`]; failures and remote edits are reconciled by
//! refetching the affected columns.

pub mod board;
pub mod config;
pub mod gateway;
