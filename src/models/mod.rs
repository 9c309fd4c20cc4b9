//! Domain models for events, sessions and task records.

pub mod event;
pub mod session;
pub mod task;
