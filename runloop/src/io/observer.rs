//! Observation provider boundary.

use anyhow::Result;
use serde_json::Value;

use crate::core::fingerprint::Fingerprint;

/// One snapshot of the target environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub fingerprint: Fingerprint,
    /// Raw payload, handed to the planner untouched.
    pub payload: Value,
}

impl Observation {
    pub fn new(payload: Value) -> Self {
        Self {
            fingerprint: Fingerprint::of(&payload),
            payload,
        }
    }
}

/// Source of environment observations.
///
/// Called once before the first plan of a run and once after every action;
/// the post-action observation of step `s` is the pre-plan observation of
/// step `s + 1`.
pub trait Observer {
    fn observe(&self) -> Result<Observation>;
}
