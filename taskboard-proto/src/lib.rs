//! Shared model and wire protocol definitions for Taskboard.

pub mod codec;
pub mod gateway;
pub mod status;
pub mod task;
