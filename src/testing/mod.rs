//! Test harness and end-to-end scheduler scenarios.
//!
//! `TestCluster` assembles cluster state and an operator controller around a
//! recording heartbeat sink, so tests drive the full heartbeat-to-command
//! loop without a serving layer.

pub mod utils;

pub use utils::{RecordingSink, TestCluster};
