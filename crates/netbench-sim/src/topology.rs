use std::process::{Command, Output};

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::command::{privileged, run, run_checked};

const KILL_ROUNDS: usize = 5;
const KILL_SETTLE: Duration = Duration::from_millis(50);

/// A Linux network namespace with RAII cleanup.
///
/// Creates the namespace on construction and brings up loopback. On drop,
/// kills every process left inside and deletes it. Every emulated node (hosts and the switch) lives in its own
/// namespace; interfaces inside different namespaces may share names.
#[derive(Debug)]
pub struct Namespace {
    pub name: String,
}

impl Namespace {
    /// Fails if `name` already exists: another run may own it.
    pub fn new(name: &str) -> Result<Self> {
        if Self::exists(name)? {
            bail!("network namespace '{name}' already exists");
        }

        run_checked("ip", &["netns", "add", name])
            .with_context(|| format!("create netns '{name}'"))?;

        debug!(ns = name, "created network namespace");

        // Loopback is best-effort
        let _ = run("ip", &["netns", "exec", name, "ip", "link", "set", "lo", "up"]);

        Ok(Self {
            name: name.to_string(),
        })
    }

    /// True if a namespace called `name` is registered with `ip netns`.
    pub fn exists(name: &str) -> Result<bool> {
        let out = run_checked("ip", &["netns", "list"]).context("list network namespaces")?;
        Ok(parse_netns_list(&String::from_utf8_lossy(&out.stdout))
            .iter()
            .any(|n| n == name))
    }

    /// Pids of every process attached to this namespace.
    pub fn pids(&self) -> Result<Vec<u32>> {
        let out = run_checked("ip", &["netns", "pids", &self.name])
            .with_context(|| format!("list pids of ns '{}'", self.name))?;
        Ok(String::from_utf8_lossy(&out.stdout)
            .split_whitespace()
            .filter_map(|p| p.parse().ok())
            .collect())
    }

    /// SIGKILL every process still inside the namespace, including ones
    /// left behind in the background by an exited shell.
    ///
    /// Repeats until the namespace is empty, since a dying process may
    /// still fork. Returns the number of processes signalled.
    pub fn kill_all(&self) -> Result<usize> {
        let mut killed = 0;
        for _ in 0..KILL_ROUNDS {
            let pids = self.pids()?;
            if pids.is_empty() {
                return Ok(killed);
            }
            let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
            let mut args = vec!["-KILL", "--"];
            args.extend(pids.iter().map(String::as_str));
            // Some may already be gone; the next round re-lists.
            let _ = run("kill", &args);
            killed += pids.len();
            std::thread::sleep(KILL_SETTLE);
        }
        if !self.pids()?.is_empty() {
            bail!("processes survive in ns '{}' after SIGKILL", self.name);
        }
        Ok(killed)
    }

    /// Privileged command that runs `program args...` inside this namespace.
    ///
    /// Not started; callers choose stdio and whether to spawn or wait.
    pub fn command(&self, program: &str, args: &[&str]) -> Command {
        let mut full_args = vec!["netns", "exec", self.name.as_str(), program];
        full_args.extend_from_slice(args);
        privileged("ip", &full_args)
    }

    /// Run a command inside this namespace, returning raw output.
    pub fn exec(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        let mut full_args = vec!["netns", "exec", self.name.as_str(), cmd];
        full_args.extend_from_slice(args);
        run("ip", &full_args).with_context(|| format!("exec '{cmd}' in ns '{}'", self.name))
    }

    /// Run a command inside this namespace, failing if it exits non-zero.
    pub fn exec_checked(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        let mut full_args = vec!["netns", "exec", self.name.as_str(), cmd];
        full_args.extend_from_slice(args);
        run_checked("ip", &full_args)
            .with_context(|| format!("exec '{cmd}' in ns '{}'", self.name))
    }

    /// Create a bridge device acting as a learning switch and bring it up.
    ///
    /// STP stays off so ports forward as soon as they are attached.
    pub fn add_bridge(&self, bridge: &str) -> Result<()> {
        self.exec_checked(
            "ip",
            &["link", "add", "name", bridge, "type", "bridge", "stp_state", "0"],
        )
        .with_context(|| format!("create bridge '{bridge}'"))?;
        self.exec_checked("ip", &["link", "set", bridge, "up"])
            .with_context(|| format!("bring bridge '{bridge}' up"))?;

        debug!(ns = self.name, bridge, "bridge created");
        Ok(())
    }

    /// Create a veth pair with `local_iface` in this namespace and
    /// `peer_iface` in `peer`, and bring both ends up.
    ///
    /// Both ends are created directly inside their namespaces, so names only
    /// need to be unique per namespace. Names must be <= 15 chars.
    pub fn add_veth_link(&self, peer: &Namespace, local_iface: &str, peer_iface: &str) -> Result<()> {
        run_checked(
            "ip",
            &[
                "link",
                "add",
                local_iface,
                "netns",
                &self.name,
                "type",
                "veth",
                "peer",
                "name",
                peer_iface,
                "netns",
                &peer.name,
            ],
        )
        .context("create veth pair")?;

        self.exec_checked("ip", &["link", "set", local_iface, "up"])
            .context("bring local link up")?;
        peer.exec_checked("ip", &["link", "set", peer_iface, "up"])
            .context("bring peer link up")?;

        debug!(
            ns_local = self.name,
            ns_peer = peer.name,
            local_iface,
            peer_iface,
            "veth link configured"
        );
        Ok(())
    }

    /// Assign `cidr` (e.g. `192.168.1.1/24`) to `iface`.
    pub fn set_address(&self, iface: &str, cidr: &str) -> Result<()> {
        self.exec_checked("ip", &["addr", "add", cidr, "dev", iface])
            .with_context(|| format!("set address {cidr} on {iface}"))?;
        Ok(())
    }

    /// Enslave `iface` to `bridge`.
    pub fn attach_to_bridge(&self, iface: &str, bridge: &str) -> Result<()> {
        self.exec_checked("ip", &["link", "set", iface, "master", bridge])
            .with_context(|| format!("attach {iface} to bridge {bridge}"))?;
        Ok(())
    }

    /// MAC address of `iface`.
    pub fn link_mac(&self, iface: &str) -> Result<String> {
        let out = self.exec_checked("ip", &["-o", "link", "show", "dev", iface])?;
        let stdout = String::from_utf8_lossy(&out.stdout);
        parse_link_mac(&stdout)
            .with_context(|| format!("no MAC address for {iface} in: {}", stdout.trim()))
    }

    /// Install a permanent neighbour entry so `ip` resolves without ARP.
    pub fn add_static_neighbor(&self, iface: &str, ip: &str, mac: &str) -> Result<()> {
        self.exec_checked(
            "ip",
            &[
                "neigh", "replace", ip, "lladdr", mac, "dev", iface, "nud", "permanent",
            ],
        )
        .with_context(|| format!("static ARP {ip} -> {mac} on {iface}"))?;
        Ok(())
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        match self.kill_all() {
            Ok(0) => {}
            Ok(n) => debug!(ns = self.name, killed = n, "killed leftover processes"),
            Err(e) => warn!(ns = self.name, error = %e, "failed to empty network namespace"),
        }

        debug!(ns = self.name, "deleting network namespace");
        match run("ip", &["netns", "del", &self.name]) {
            Ok(out) if !out.status.success() => warn!(
                ns = self.name,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "failed to delete network namespace"
            ),
            Err(e) => warn!(ns = self.name, error = %e, "failed to delete network namespace"),
            Ok(_) => {}
        }
    }
}

/// Namespace names from `ip netns list` output (`name` or `name (id: N)`).
pub fn parse_netns_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Extract the `link/ether` address from `ip -o link show` output.
pub fn parse_link_mac(output: &str) -> Option<String> {
    let mut tokens = output.split_whitespace();
    tokens.find(|t| *t == "link/ether")?;
    tokens.next().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{check_privileges, process_gone, unique_ns_name};

    #[test]
    fn parse_mac_from_ip_link() {
        let line = "2: h1-eth0@if3: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue \
                    state UP mode DEFAULT group default qlen 1000\\    link/ether \
                    6a:1f:0c:aa:bb:cc brd ff:ff:ff:ff:ff:ff link-netns nb-s1";
        assert_eq!(parse_link_mac(line).as_deref(), Some("6a:1f:0c:aa:bb:cc"));
    }

    #[test]
    fn parse_mac_missing() {
        assert_eq!(parse_link_mac("1: lo: <LOOPBACK> link/loopback 00:00:00:00:00:00"), None);
    }

    #[test]
    fn parse_netns_names() {
        let out = "nb1a-h2 (id: 2)\nnb1a-h1 (id: 1)\nplain\n\n";
        assert_eq!(parse_netns_list(out), ["nb1a-h2", "nb1a-h1", "plain"]);
        assert!(parse_netns_list("").is_empty());
    }

    #[test]
    fn test_duplicate_namespace_is_rejected() {
        if !check_privileges() {
            eprintln!("Skipping: insufficient privileges");
            return;
        }

        let name = unique_ns_name("nbt_d");
        let first = Namespace::new(&name).expect("create ns");
        first.add_bridge("s1").expect("bridge");

        let err = Namespace::new(&name).expect_err("duplicate must fail");
        assert!(err.to_string().contains("already exists"), "{err:#}");

        // The first owner is untouched.
        assert!(Namespace::exists(&name).expect("list"));
        let out = first.exec("ip", &["link", "show", "s1"]).expect("ip link");
        assert!(out.status.success(), "bridge of first owner was removed");

        drop(first);
        assert!(!Namespace::exists(&name).expect("list"));
    }

    #[test]
    fn test_drop_kills_background_processes() {
        if !check_privileges() {
            eprintln!("Skipping: insufficient privileges");
            return;
        }

        let ns = Namespace::new(&unique_ns_name("nbt_k")).expect("create ns");
        // The shell exits at once; the sleep stays behind in the namespace.
        let out = ns
            .exec("sh", &["-c", "sleep 300 >/dev/null 2>&1 & echo $!"])
            .expect("spawn background sleep");
        let pid: u32 = String::from_utf8_lossy(&out.stdout)
            .trim()
            .parse()
            .expect("pid");
        assert!(ns.pids().expect("pids").contains(&pid));

        drop(ns);
        assert!(process_gone(pid), "background sleep {pid} survived namespace teardown");
    }

    #[test]
    fn test_namespace_has_loopback() {
        if !check_privileges() {
            eprintln!("Skipping: insufficient privileges");
            return;
        }

        let ns = Namespace::new(&unique_ns_name("nbt_a")).expect("create ns");
        let out = ns.exec("ip", &["link"]).expect("ip link");
        let stdout = String::from_utf8_lossy(&out.stdout);
        assert!(stdout.contains("lo"), "loopback missing: {stdout}");
    }

    #[test]
    fn test_hosts_ping_through_bridge() {
        if !check_privileges() {
            eprintln!("Skipping: insufficient privileges");
            return;
        }

        let sw = Namespace::new(&unique_ns_name("nbt_s")).expect("create switch ns");
        let h1 = Namespace::new(&unique_ns_name("nbt_h")).expect("create h1 ns");
        let h2 = Namespace::new(&unique_ns_name("nbt_h")).expect("create h2 ns");

        sw.add_bridge("br0").expect("bridge");
        h1.add_veth_link(&sw, "h1-eth0", "s1-eth1").expect("link h1");
        h2.add_veth_link(&sw, "h2-eth0", "s1-eth2").expect("link h2");
        sw.attach_to_bridge("s1-eth1", "br0").expect("attach 1");
        sw.attach_to_bridge("s1-eth2", "br0").expect("attach 2");
        h1.set_address("h1-eth0", "10.202.1.1/24").expect("addr h1");
        h2.set_address("h2-eth0", "10.202.1.2/24").expect("addr h2");

        let mac = h2.link_mac("h2-eth0").expect("h2 mac");
        h1.add_static_neighbor("h1-eth0", "10.202.1.2", &mac)
            .expect("static arp");

        let out = h1
            .exec("ping", &["-c", "1", "-W", "2", "10.202.1.2"])
            .expect("ping");
        assert!(
            out.status.success(),
            "ping failed:\n{}",
            String::from_utf8_lossy(&out.stderr)
        );
    }
}
