//! Emulation controller: owns one running virtual network.
//!
//! [`EmulationController::start`] turns a [`TopologyDescriptor`] into
//! namespaces, a bridge, veth links, `tc` qdiscs and per-host cgroups.
//! Every allocated resource is an RAII handle, so a failure halfway through
//! `start` releases what was already created, and [`stop`] (or drop) tears
//! the whole network down.
//!
//! [`stop`]: EmulationController::stop

use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use netbench_sim::command::shell_quote;
use netbench_sim::{apply_shaping, check_prerequisites, CpuLimit, Namespace, NamespaceProcess};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{NetbenchError, Result};
use crate::link::LinkEnd;
use crate::selftest::{self, ProbeHost, SelfTestReport};
use crate::topology::{processor_count, HostRole, TopologyDescriptor};

/// Tools the controller shells out to.
const REQUIRED_TOOLS: &[&str] = &["ip", "tc"];

/// Exit status of a wrapped script whose command succeeded without having
/// joined its CPU cgroup.
pub const CPU_CAP_LOST_EXIT: i32 = 197;

/// How a host command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Success,
    /// Exited 0, but ran without its CPU limit.
    Uncapped,
    Failed { code: i32 },
    Signaled,
    TimedOut,
}

impl CommandOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => CommandOutcome::Success,
            Some(CPU_CAP_LOST_EXIT) => CommandOutcome::Uncapped,
            Some(code) => CommandOutcome::Failed { code },
            None => CommandOutcome::Signaled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Success)
    }
}

/// Build the shell script that runs `command` with its output in `log`.
///
/// The script truncates `log` with a `date:` header line, optionally moves
/// itself into a cgroup, then runs the command in a subshell appending its
/// stdout and stderr. The command's exit status is the script's, except
/// that a successful command which failed to join the cgroup exits with
/// [`CPU_CAP_LOST_EXIT`].
pub fn wrap_command(command: &str, log: &Path, cgroup_enter: Option<&str>) -> String {
    let log = shell_quote(&log.to_string_lossy());
    let mut script = format!("echo \"date: $(date)\" > {log}\n");
    let Some(enter) = cgroup_enter else {
        script.push_str(&format!("(\n{command}\n) >> {log} 2>&1\n"));
        return script;
    };

    script.push_str(&format!(
        "cpu_capped=1\n\
         {{ {enter}; }} 2>/dev/null || {{ cpu_capped=0; echo \"warning: could not join CPU cgroup\" >> {log}; }}\n\
         (\n{command}\n) >> {log} 2>&1\n\
         status=$?\n\
         if [ \"$status\" -eq 0 ] && [ \"$cpu_capped\" -eq 0 ]; then exit {CPU_CAP_LOST_EXIT}; fi\n\
         exit $status\n"
    ));
    script
}

/// A command submitted to one emulated host.
pub struct CommandHandle {
    role: HostRole,
    process: NamespaceProcess,
}

impl CommandHandle {
    pub fn role(&self) -> HostRole {
        self.role
    }

    /// Block until the command exits.
    pub fn wait(&mut self) -> Result<CommandOutcome> {
        let status = self
            .process
            .wait()
            .map_err(|e| NetbenchError::resource(format!("wait for {} command", self.role), e))?;
        Ok(CommandOutcome::from_status(status))
    }

    /// Block until the command exits or `timeout` elapses; on timeout the
    /// command's process group is killed.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<CommandOutcome> {
        let status = self
            .process
            .wait_timeout(timeout)
            .map_err(|e| NetbenchError::resource(format!("wait for {} command", self.role), e))?;
        match status {
            Some(status) => Ok(CommandOutcome::from_status(status)),
            None => {
                self.process.kill();
                Ok(CommandOutcome::TimedOut)
            }
        }
    }
}

/// Wait for a submitted command, with an optional deadline.
///
/// Non-success outcomes are logged, never returned as errors.
pub fn await_command(handle: &mut CommandHandle, timeout: Option<Duration>) -> Result<CommandOutcome> {
    let outcome = match timeout {
        Some(t) => handle.wait_timeout(t)?,
        None => handle.wait()?,
    };
    match outcome {
        CommandOutcome::Success => info!(host = %handle.role, "command finished"),
        CommandOutcome::Uncapped => warn!(
            host = %handle.role,
            "command finished but could not join its CPU cgroup and ran without a CPU limit"
        ),
        CommandOutcome::Failed { code } => {
            warn!(host = %handle.role, code, "command exited non-zero, see its log")
        }
        CommandOutcome::Signaled => warn!(host = %handle.role, "command killed by a signal"),
        CommandOutcome::TimedOut => warn!(host = %handle.role, "command timed out and was killed"),
    }
    Ok(outcome)
}

struct HostNode {
    role: HostRole,
    // Dropped first: kills cgroup members, then the namespace kills the rest.
    cpu: CpuLimit,
    ns: Namespace,
}

/// Live virtual network. Dropping it releases every resource.
struct Network {
    hosts: Vec<HostNode>,
    switch: Namespace,
}

impl Network {
    fn host(&self, role: HostRole) -> Result<&HostNode> {
        self.hosts
            .iter()
            .find(|h| h.role == role)
            .ok_or(NetbenchError::NotRunning)
    }
}

pub struct EmulationController {
    topology: TopologyDescriptor,
    network: Option<Network>,
}

impl EmulationController {
    pub fn new(topology: TopologyDescriptor) -> Self {
        Self {
            topology,
            network: None,
        }
    }

    pub fn topology(&self) -> &TopologyDescriptor {
        &self.topology
    }

    pub fn is_running(&self) -> bool {
        self.network.is_some()
    }

    /// Bring the topology up. A second call on a running controller is a
    /// no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.network.is_some() {
            return Ok(());
        }
        check_prerequisites(REQUIRED_TOOLS)
            .map_err(|e| NetbenchError::resource("emulation prerequisites", e))?;

        let network = self.instantiate()?;
        self.network = Some(network);
        info!(
            strategy = ?self.topology.strategy,
            switch = self.topology.switch,
            "emulated network started"
        );
        Ok(())
    }

    fn instantiate(&self) -> Result<Network> {
        let topo = &self.topology;
        let processors = processor_count();

        let switch = Namespace::new(&topo.namespace(&topo.switch))
            .map_err(|e| NetbenchError::resource(format!("switch {}", topo.switch), e))?;
        switch
            .add_bridge(&topo.switch)
            .map_err(|e| NetbenchError::resource(format!("switch {}", topo.switch), e))?;

        let mut hosts = Vec::with_capacity(topo.hosts().len());
        for host in topo.hosts() {
            let name = topo.namespace(&host.name);
            let ns = Namespace::new(&name)
                .map_err(|e| NetbenchError::resource(format!("host {}", host.name), e))?;
            let cpu = CpuLimit::new(&name, host.cpu_share, processors)
                .map_err(|e| NetbenchError::resource(format!("CPU limit of {}", host.name), e))?;
            hosts.push(HostNode {
                role: host.role,
                cpu,
                ns,
            });
        }
        let network = Network { hosts, switch };

        for link in topo.links() {
            let host = topo.host(link.host);
            let node = network.host(link.host)?;
            let ctx = || format!("link {} <-> {}", link.host_iface, link.switch_iface);

            node.ns
                .add_veth_link(&network.switch, &link.host_iface, &link.switch_iface)
                .map_err(|e| NetbenchError::resource(ctx(), e))?;
            node.ns
                .set_address(&link.host_iface, &format!("{}/{}", host.ip, topo.prefix_len))
                .map_err(|e| NetbenchError::resource(ctx(), e))?;
            network
                .switch
                .attach_to_bridge(&link.switch_iface, &topo.switch)
                .map_err(|e| NetbenchError::resource(ctx(), e))?;

            apply_shaping(&node.ns, &link.host_iface, &link.profile.shaping(LinkEnd::Host))
                .map_err(|e| NetbenchError::resource(ctx(), e))?;
            apply_shaping(
                &network.switch,
                &link.switch_iface,
                &link.profile.shaping(LinkEnd::Switch),
            )
            .map_err(|e| NetbenchError::resource(ctx(), e))?;
            debug!(
                host = host.name,
                host_iface = link.host_iface,
                switch_iface = link.switch_iface,
                profile = ?link.profile,
                "link up"
            );
        }

        self.install_static_arp(&network)?;
        Ok(network)
    }

    /// Permanent neighbour entries for the peer host on both hosts.
    fn install_static_arp(&self, network: &Network) -> Result<()> {
        let topo = &self.topology;
        for role in HostRole::ALL {
            let peer = role.peer();
            let peer_iface = &topo.link(peer).host_iface;
            let peer_node = network.host(peer)?;
            let mac = peer_node
                .ns
                .link_mac(peer_iface)
                .map_err(|e| NetbenchError::resource("static ARP", e))?;
            network
                .host(role)?
                .ns
                .add_static_neighbor(
                    &topo.link(role).host_iface,
                    &topo.host(peer).ip.to_string(),
                    &mac,
                )
                .map_err(|e| NetbenchError::resource("static ARP", e))?;
        }
        Ok(())
    }

    /// Ping and iperf3 probes between the two hosts.
    pub fn self_test(&self) -> Result<SelfTestReport> {
        let network = self.network.as_ref().ok_or(NetbenchError::NotRunning)?;
        let server = self.probe_host(network, HostRole::Server)?;
        let client = self.probe_host(network, HostRole::Client)?;
        Ok(selftest::run(server, client))
    }

    fn probe_host<'a>(&'a self, network: &'a Network, role: HostRole) -> Result<ProbeHost<'a>> {
        Ok(ProbeHost {
            role,
            ns: &network.host(role)?.ns,
            ip: self.topology.host(role).ip,
        })
    }

    /// The script [`execute`](Self::execute) would run for `role`.
    pub fn wrapped_command(&self, role: HostRole, command: &str, log: &Path) -> Result<String> {
        let network = self.network.as_ref().ok_or(NetbenchError::NotRunning)?;
        let enter = network.host(role)?.cpu.enter_script();
        Ok(wrap_command(command, log, Some(&enter)))
    }

    /// Start `command` on the host in `role`, output to `log`. Returns as
    /// soon as the command is running.
    pub fn execute(&self, role: HostRole, command: &str, log: &Path) -> Result<CommandHandle> {
        let network = self.network.as_ref().ok_or(NetbenchError::NotRunning)?;
        let script = self.wrapped_command(role, command, log)?;
        let node = network.host(role)?;
        let process = NamespaceProcess::spawn_shell(&node.ns, &script)
            .map_err(|e| NetbenchError::resource(format!("start {role} command"), e))?;
        debug!(host = %role, pid = process.pid(), log = %log.display(), "command submitted");
        Ok(CommandHandle { role, process })
    }

    /// Tear the network down. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(network) = self.network.take() {
            drop(network);
            info!("emulated network stopped");
        }
    }
}

impl Drop for EmulationController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{build_topology, NetworkParams, TopologyNaming};
    use std::process::Command;

    fn run_script(script: &str) -> ExitStatus {
        Command::new("sh")
            .args(["-c", script])
            .status()
            .expect("run sh")
    }

    #[test]
    fn wrapped_command_writes_header_then_output() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("server_1.mnlog");
        std::fs::write(&log, "stale contents\n").unwrap();

        let status = run_script(&wrap_command("echo out; echo err >&2", &log, None));
        assert!(status.success());

        let text = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("date: "), "{text}");
        assert!(!text.contains("stale"), "log not truncated: {text}");
        assert_eq!(&lines[1..], ["out", "err"]);
    }

    #[test]
    fn wrapped_command_keeps_exit_status() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("client_1.mnlog");
        let status = run_script(&wrap_command("echo before; exit 7", &log, None));
        assert_eq!(status.code(), Some(7));
        assert_eq!(
            CommandOutcome::from_status(status),
            CommandOutcome::Failed { code: 7 }
        );
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.ends_with("before\n"));
    }

    #[test]
    fn failed_cgroup_join_is_noted_in_log() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("server_2.mnlog");
        let status = run_script(&wrap_command(
            "echo ran",
            &log,
            Some("echo $$ > /nonexistent-dir/cgroup.procs"),
        ));
        assert_eq!(CommandOutcome::from_status(status), CommandOutcome::Uncapped);
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.contains("warning: could not join CPU cgroup"));
        assert!(text.ends_with("ran\n"));
    }

    #[test]
    fn failed_cgroup_join_keeps_command_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("server_5.mnlog");
        let status = run_script(&wrap_command(
            "exit 4",
            &log,
            Some("echo $$ > /nonexistent-dir/cgroup.procs"),
        ));
        assert_eq!(status.code(), Some(4));
    }

    #[test]
    fn joined_cgroup_reports_plain_success() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("server_6.mnlog");
        let status = run_script(&wrap_command("echo ran", &log, Some("true")));
        assert_eq!(CommandOutcome::from_status(status), CommandOutcome::Success);
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(!text.contains("warning"), "{text}");
    }

    #[test]
    fn command_variables_do_not_leak_into_wrapper() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("client_7.mnlog");
        let status = run_script(&wrap_command(
            "cpu_capped=1; status=0; echo ok",
            &log,
            Some("false"),
        ));
        assert_eq!(CommandOutcome::from_status(status), CommandOutcome::Uncapped);
    }

    #[test]
    fn log_path_with_spaces_is_quoted() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("my logs");
        std::fs::create_dir(&dir).unwrap();
        let log = dir.join("client_3.mnlog");
        assert!(run_script(&wrap_command("echo hi", &log, None)).success());
        assert!(std::fs::read_to_string(&log).unwrap().ends_with("hi\n"));
    }

    #[test]
    fn multiline_command_runs_whole() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("server_4.mnlog");
        let cmd = "for i in 1 2 3\ndo\n  echo line$i\ndone";
        assert!(run_script(&wrap_command(cmd, &log, None)).success());
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.ends_with("line1\nline2\nline3\n"));
    }

    fn topology() -> TopologyDescriptor {
        let params = NetworkParams {
            latency_ms: 5.0,
            bandwidth: "10".parse().unwrap(),
            loss_percent: 2.0,
            cpu_server_percent: 0.5,
            cpu_client_percent: 0.5,
        };
        build_topology(&params, &TopologyNaming::default(), 1).unwrap()
    }

    #[test]
    fn stop_without_start_is_noop() {
        let mut ctl = EmulationController::new(topology());
        assert!(!ctl.is_running());
        ctl.stop();
        ctl.stop();
        assert!(!ctl.is_running());
    }

    #[test]
    fn operations_require_running_network() {
        let ctl = EmulationController::new(topology());
        let log = Path::new("/tmp/unused.mnlog");
        assert!(matches!(
            ctl.execute(HostRole::Server, "true", log),
            Err(NetbenchError::NotRunning)
        ));
        assert!(matches!(ctl.self_test(), Err(NetbenchError::NotRunning)));
    }
}
