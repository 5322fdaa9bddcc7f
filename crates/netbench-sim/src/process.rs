use std::os::unix::process::CommandExt;
use std::process::{Child, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::debug;

use crate::command::run;
use crate::topology::Namespace;

/// A child process running inside a network namespace.
///
/// The child leads its own process group so signals reach the inner
/// program even through the `sudo ip netns exec` wrapper. Killed on drop
/// if it is still running.
pub struct NamespaceProcess {
    child: Child,
    label: String,
    status: Option<ExitStatus>,
}

impl NamespaceProcess {
    /// Run `script` with `sh -c` inside `ns`. Output is discarded; scripts
    /// redirect what they want to keep.
    pub fn spawn_shell(ns: &Namespace, script: &str) -> Result<Self> {
        let label = format!("sh in ns:{}", ns.name);
        let mut cmd = ns.command("sh", &["-c", script]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .process_group(0);
        Self::spawn_command(cmd, label)
    }

    /// Spawn `binary args...` inside `ns` with all stdio discarded.
    pub fn spawn(ns: &Namespace, binary: &str, args: &[&str]) -> Result<Self> {
        let label = format!("{binary} in ns:{}", ns.name);
        let mut cmd = ns.command(binary, args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        Self::spawn_command(cmd, label)
    }

    fn spawn_command(mut cmd: std::process::Command, label: String) -> Result<Self> {
        let child = cmd.spawn().with_context(|| format!("spawn {label}"))?;
        debug!(%label, pid = child.id(), "spawned namespace process");
        Ok(Self {
            child,
            label,
            status: None,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Block until the process exits.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self
            .child
            .wait()
            .with_context(|| format!("wait for {}", self.label))?;
        self.status = Some(status);
        Ok(status)
    }

    /// Block until the process exits or `timeout` elapses.
    ///
    /// Returns `None` on timeout; the process keeps running.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Exit status if the process has already exited.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if self.status.is_none() {
            self.status = self
                .child
                .try_wait()
                .with_context(|| format!("poll {}", self.label))?;
        }
        Ok(self.status)
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Send SIGTERM to the whole process group, SIGKILL after a grace period.
    pub fn kill(&mut self) {
        if !self.is_alive() {
            return;
        }
        let group = format!("-{}", self.pid());
        let _ = run("kill", &["-TERM", "--", &group]);

        if matches!(self.wait_timeout(Duration::from_secs(2)), Ok(Some(_))) {
            return;
        }

        debug!(label = %self.label, "process ignored SIGTERM, killing");
        let _ = run("kill", &["-KILL", "--", &group]);
        let _ = self.wait();
    }
}

impl Drop for NamespaceProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{check_privileges, unique_ns_name};

    #[test]
    fn test_exit_status_is_reported() {
        if !check_privileges() {
            eprintln!("Skipping: insufficient privileges");
            return;
        }

        let ns = Namespace::new(&unique_ns_name("nbp_a")).expect("create ns");
        let mut proc = NamespaceProcess::spawn_shell(&ns, "exit 3").expect("spawn");
        let status = proc.wait().expect("wait");
        assert_eq!(status.code(), Some(3));
        // Repeated waits return the cached status.
        assert_eq!(proc.wait().expect("wait again").code(), Some(3));
    }

    #[test]
    fn test_wait_timeout_then_kill() {
        if !check_privileges() {
            eprintln!("Skipping: insufficient privileges");
            return;
        }

        let ns = Namespace::new(&unique_ns_name("nbp_b")).expect("create ns");
        let mut proc = NamespaceProcess::spawn_shell(&ns, "sleep 30").expect("spawn");
        let res = proc
            .wait_timeout(Duration::from_millis(200))
            .expect("wait_timeout");
        assert!(res.is_none(), "sleep finished early");
        proc.kill();
        assert!(!proc.is_alive());
    }
}
