//! Two-host benchmark harness over an emulated network.
//!
//! A run places a server and a client behind one switch, shapes both
//! host–switch links with the requested latency, bandwidth and loss, caps
//! each host's CPU, runs one shell command per host concurrently and keeps
//! each command's combined output in a timestamped log file.
//!
//! # Modules
//!
//! - [`config`]: CLI and TOML configuration, validated into a [`RunConfig`]
//! - [`link`]: bandwidth parsing and per-link shaping profiles
//! - [`topology`]: naming, topology descriptors and the two build strategies
//! - [`controller`]: network lifecycle and command execution on hosts
//! - [`selftest`]: ping and iperf3 probes between the hosts
//! - [`run_record`]: log directory and per-run log file names
//! - [`orchestrator`]: the end-to-end run pipeline

pub mod config;
pub mod controller;
pub mod error;
pub mod link;
pub mod orchestrator;
pub mod run_record;
pub mod selftest;
pub mod topology;

pub use config::{Cli, RunConfig};
pub use controller::{CommandOutcome, EmulationController};
pub use error::{NetbenchError, Result};
pub use orchestrator::{run, run_from_cli, RunReport};
