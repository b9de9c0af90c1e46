//! Side-effecting pieces: persistence, configuration and adapter boundaries.

pub mod config;
pub mod event_log;
pub mod executor;
pub mod layout;
pub mod observer;
pub mod planner;
pub mod state_store;
