//! CPU limits through the cgroup v2 `cpu` controller.
//!
//! Each emulated host gets its own cgroup directly under the unified
//! hierarchy root. Processes join it by writing their pid into
//! `cgroup.procs` (see [`CpuLimit::enter_script`]).

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::command::{run, run_checked, shell_quote, write_file};

/// Mount point of the unified cgroup hierarchy.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// CFS scheduling period.
pub const CPU_PERIOD_US: u64 = 100_000;

/// Smallest quota the kernel accepts in `cpu.max`.
pub const MIN_QUOTA_US: u64 = 1_000;

/// How long teardown waits for killed members to leave the cgroup.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// True if the unified (v2) hierarchy is mounted.
pub fn cgroup_v2_available() -> bool {
    Path::new(CGROUP_ROOT).join("cgroup.controllers").exists()
}

/// Quota for a share of *total* system capacity.
///
/// `share` is a fraction of all `processors` together, so one full core on
/// an 8-way machine is `0.125`. Returns `(quota_us, clamped)`, `clamped`
/// being true when the quota was raised to [`MIN_QUOTA_US`].
pub fn cpu_quota_us(share: f64, processors: usize, period_us: u64) -> (u64, bool) {
    let quota = (share * period_us as f64 * processors.max(1) as f64).round() as u64;
    if quota < MIN_QUOTA_US {
        (MIN_QUOTA_US, true)
    } else {
        (quota, false)
    }
}

/// A cgroup with a `cpu.max` limit, removed on drop.
#[derive(Debug)]
pub struct CpuLimit {
    pub name: String,
    pub quota_us: u64,
    pub period_us: u64,
    path: PathBuf,
}

impl CpuLimit {
    /// Create cgroup `name` limited to `share` of total capacity.
    pub fn new(name: &str, share: f64, processors: usize) -> Result<Self> {
        let (quota_us, clamped) = cpu_quota_us(share, processors, CPU_PERIOD_US);
        if clamped {
            warn!(
                cgroup = name,
                share, "CPU quota below kernel minimum, limiting to {MIN_QUOTA_US}us"
            );
        }

        // Controllers must be delegated to children of the root (best-effort:
        // already enabled on most systemd hosts).
        let subtree = format!("{CGROUP_ROOT}/cgroup.subtree_control");
        if let Err(e) = write_file(&subtree, "+cpu") {
            debug!(error = %e, "could not enable cpu controller on root");
        }

        let path = Path::new(CGROUP_ROOT).join(name);
        if path.exists() {
            bail!("cgroup '{name}' already exists");
        }
        let path_str = path.to_string_lossy().to_string();
        run_checked("mkdir", &[&path_str]).with_context(|| format!("create cgroup '{name}'"))?;

        let limit = Self {
            name: name.to_string(),
            quota_us,
            period_us: CPU_PERIOD_US,
            path,
        };

        write_file(
            &limit.file("cpu.max"),
            &format!("{} {}", limit.quota_us, limit.period_us),
        )
        .with_context(|| format!("set cpu.max on cgroup '{name}'"))?;

        debug!(cgroup = name, quota_us, period_us = CPU_PERIOD_US, "cpu limit created");
        Ok(limit)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self, leaf: &str) -> String {
        self.path.join(leaf).to_string_lossy().to_string()
    }

    /// Pids currently in the cgroup. Unreadable counts as empty.
    pub fn pids(&self) -> Vec<u32> {
        std::fs::read_to_string(self.path.join("cgroup.procs"))
            .map(|s| s.split_whitespace().filter_map(|p| p.parse().ok()).collect())
            .unwrap_or_default()
    }

    /// SIGKILL every member and wait for the cgroup to drain.
    ///
    /// Uses `cgroup.kill` (Linux 5.14+), falling back to signalling the
    /// listed pids on older kernels.
    pub fn kill_all(&self) -> Result<()> {
        if self.pids().is_empty() {
            return Ok(());
        }
        if write_file(&self.file("cgroup.kill"), "1").is_err() {
            let pids: Vec<String> = self.pids().iter().map(u32::to_string).collect();
            let mut args = vec!["-KILL", "--"];
            args.extend(pids.iter().map(String::as_str));
            let _ = run("kill", &args);
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while !self.pids().is_empty() {
            if Instant::now() >= deadline {
                bail!("cgroup '{}' still populated after SIGKILL", self.name);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(())
    }

    /// Shell snippet moving the current shell (`$$`) into this cgroup.
    pub fn enter_script(&self) -> String {
        format!("echo $$ > {}", shell_quote(&self.file("cgroup.procs")))
    }
}

impl Drop for CpuLimit {
    fn drop(&mut self) {
        if let Err(e) = self.kill_all() {
            warn!(cgroup = self.name, error = %e, "failed to empty cgroup");
        }
        debug!(cgroup = self.name, "removing cgroup");
        let path = self.path.to_string_lossy().to_string();
        match run("rmdir", &[&path]) {
            Ok(out) if !out.status.success() => warn!(
                cgroup = self.name,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "failed to remove cgroup"
            ),
            Err(e) => warn!(cgroup = self.name, error = %e, "failed to remove cgroup"),
            Ok(_) => {}
        }
    }
}
