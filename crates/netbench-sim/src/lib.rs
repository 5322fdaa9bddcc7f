//! Network emulation plumbing for benchmark runs.
//!
//! Builds isolated virtual networks out of Linux network namespaces, veth
//! pairs and a bridge acting as the switch, shapes every interface with
//! `tc` (HTB, TBF, netem) and caps host CPU time through cgroup v2.
//!
//! # Modules
//!
//! - [`command`]: privileged command execution (`sudo` unless already root)
//! - [`topology`]: namespace, bridge and veth management (RAII cleanup on drop)
//! - [`shaping`]: `tc` queueing discipline construction and application
//! - [`cgroup`]: cgroup v2 CPU quota limits
//! - [`process`]: long-running processes spawned inside a namespace
//! - [`preflight`]: tool and privilege checks
//! - [`test_util`]: skip checks and unique name generation for tests

pub mod cgroup;
pub mod command;
pub mod preflight;
pub mod process;
pub mod shaping;
pub mod test_util;
pub mod topology;

pub use cgroup::CpuLimit;
pub use preflight::{check_prerequisites, MissingPrerequisite};
pub use process::NamespaceProcess;
pub use shaping::{apply_shaping, Discipline, ShapingConfig};
pub use topology::Namespace;
