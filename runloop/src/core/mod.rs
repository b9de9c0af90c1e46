//! Deterministic, pure logic shared by the run engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod backoff;
pub mod event;
pub mod fingerprint;
pub mod policy;
pub mod run;
pub mod stuck;
pub mod types;
