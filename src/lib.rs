//! uptrail - endpoint monitoring for scheduled runs.
//!
//! Each invocation probes the configured HTTP(S) and TCP targets once,
//! appends the outcomes to a local history database and sends one batched
//! notification about failing targets. A second mode rolls the recorded
//! failures of the last 24 hours up into a digest.

pub mod compose;
pub mod config;
pub mod digest;
pub mod evaluate;
pub mod history;
pub mod models;
pub mod notify;
pub mod probe;
pub mod registry;
pub mod runner;
