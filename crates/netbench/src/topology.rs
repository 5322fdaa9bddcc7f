//! Topology descriptors and the two construction strategies.
//!
//! A topology is always one switch, two hosts (server and client) and two
//! host–switch links. The bandwidth shape picks the strategy once:
//! [`BandwidthSpec::Single`] goes through [`build_symmetric`],
//! [`BandwidthSpec::Asymmetric`] through [`build_asymmetric`].

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{NetbenchError, Result};
use crate::link::{BandwidthSpec, LinkProfile};

/// Linux limit on interface name length.
const IFNAMSIZ: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostRole {
    Server,
    Client,
}

impl HostRole {
    pub const ALL: [HostRole; 2] = [HostRole::Server, HostRole::Client];

    pub fn peer(self) -> HostRole {
        match self {
            HostRole::Server => HostRole::Client,
            HostRole::Client => HostRole::Server,
        }
    }
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostRole::Server => write!(f, "server"),
            HostRole::Client => write!(f, "client"),
        }
    }
}

/// Node names and addresses of one topology.
///
/// Passed into the builders explicitly so several topologies can coexist
/// (parallel tests, concurrent runs with distinct prefixes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopologyNaming {
    pub switch: String,
    pub server_name: String,
    pub server_ip: Ipv4Addr,
    pub client_name: String,
    pub client_ip: Ipv4Addr,
    pub prefix_len: u8,
    /// Prepended to every namespace and cgroup name of the run.
    pub namespace_prefix: String,
}

impl Default for TopologyNaming {
    fn default() -> Self {
        Self {
            switch: "s1".into(),
            server_name: "h1".into(),
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            client_name: "h2".into(),
            client_ip: Ipv4Addr::new(192, 168, 1, 2),
            prefix_len: 24,
            namespace_prefix: format!("nb{:x}-", std::process::id()),
        }
    }
}

impl TopologyNaming {
    pub fn host_name(&self, role: HostRole) -> &str {
        match role {
            HostRole::Server => &self.server_name,
            HostRole::Client => &self.client_name,
        }
    }

    pub fn host_ip(&self, role: HostRole) -> Ipv4Addr {
        match role {
            HostRole::Server => self.server_ip,
            HostRole::Client => self.client_ip,
        }
    }

    /// Reject names that cannot become interfaces or distinct nodes.
    pub fn validate(&self) -> Result<()> {
        let names = [&self.switch, &self.server_name, &self.client_name];
        if names.iter().any(|n| n.is_empty() || n.contains(['/', ' '])) {
            return Err(NetbenchError::Configuration(format!(
                "node names must be non-empty and contain no '/' or spaces: {names:?}"
            )));
        }
        if self.switch == self.server_name
            || self.switch == self.client_name
            || self.server_name == self.client_name
        {
            return Err(NetbenchError::Configuration(format!(
                "node names must be distinct: {names:?}"
            )));
        }
        // Longest generated interface names: "<host>-eth0", "<switch>-eth2".
        for name in [&self.server_name, &self.client_name, &self.switch] {
            if name.len() + "-eth0".len() > IFNAMSIZ {
                return Err(NetbenchError::Configuration(format!(
                    "node name '{name}' too long for interface names (max {} chars)",
                    IFNAMSIZ - "-eth0".len()
                )));
            }
        }
        if self.server_ip == self.client_ip {
            return Err(NetbenchError::Configuration(format!(
                "server and client share IP {}",
                self.server_ip
            )));
        }
        if self.prefix_len == 0 || self.prefix_len > 32 {
            return Err(NetbenchError::Configuration(format!(
                "invalid prefix length /{}",
                self.prefix_len
            )));
        }
        Ok(())
    }
}

/// Requested path characteristics, before any per-link split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NetworkParams {
    pub latency_ms: f64,
    pub bandwidth: BandwidthSpec,
    pub loss_percent: f64,
    pub cpu_server_percent: f64,
    pub cpu_client_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostDescriptor {
    pub name: String,
    pub ip: Ipv4Addr,
    pub role: HostRole,
    /// Fraction of total system CPU capacity (all processors together).
    pub cpu_share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkDescriptor {
    pub host: HostRole,
    pub host_iface: String,
    pub switch_iface: String,
    pub profile: LinkProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Symmetric,
    Asymmetric,
}

/// One switch, two hosts, two links.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyDescriptor {
    pub strategy: Strategy,
    pub switch: String,
    hosts: Vec<HostDescriptor>,
    links: Vec<LinkDescriptor>,
    pub prefix_len: u8,
    pub namespace_prefix: String,
}

impl TopologyDescriptor {
    /// Server first, then client.
    pub fn hosts(&self) -> &[HostDescriptor] {
        &self.hosts
    }

    /// In switch port order.
    pub fn links(&self) -> &[LinkDescriptor] {
        &self.links
    }

    pub fn host(&self, role: HostRole) -> &HostDescriptor {
        self.hosts
            .iter()
            .find(|h| h.role == role)
            .expect("topology always holds both roles")
    }

    pub fn link(&self, role: HostRole) -> &LinkDescriptor {
        self.links
            .iter()
            .find(|l| l.host == role)
            .expect("topology always links both roles")
    }

    /// Namespace (and cgroup) name of a node.
    pub fn namespace(&self, node: &str) -> String {
        format!("{}{node}", self.namespace_prefix)
    }
}

/// Normalize a percentage of one core into a share of total capacity.
///
/// The CPU limiter expresses shares as fractions of all processors
/// together, while users think in fractions of a single core.
pub fn cpu_share(percent_of_core: f64, processors: usize) -> f64 {
    (percent_of_core / 100.0) / processors.max(1) as f64
}

/// Logical processors on this machine.
pub fn processor_count() -> usize {
    let mut sys = sysinfo::System::new();
    sys.refresh_cpu_all();
    sys.cpus().len().max(1)
}

/// Pick the strategy matching the bandwidth shape.
pub fn build_topology(
    params: &NetworkParams,
    naming: &TopologyNaming,
    processors: usize,
) -> Result<TopologyDescriptor> {
    naming.validate()?;
    match params.bandwidth {
        BandwidthSpec::Single(bw) => Ok(build_symmetric(bw, params, naming, processors)),
        BandwidthSpec::Asymmetric { uplink, downlink } => {
            build_asymmetric(uplink, downlink, params, naming, processors)
        }
    }
}

fn host_iface(name: &str) -> String {
    format!("{name}-eth0")
}

fn switch_iface(switch: &str, port: usize) -> String {
    format!("{switch}-eth{port}")
}

/// Both links identical, built in one pass.
pub fn build_symmetric(
    bandwidth_mbit: u32,
    params: &NetworkParams,
    naming: &TopologyNaming,
    processors: usize,
) -> TopologyDescriptor {
    let profile = LinkProfile::symmetric(bandwidth_mbit, params.latency_ms, params.loss_percent);
    let percent = |role| match role {
        HostRole::Server => params.cpu_server_percent,
        HostRole::Client => params.cpu_client_percent,
    };

    TopologyDescriptor {
        strategy: Strategy::Symmetric,
        switch: naming.switch.clone(),
        hosts: HostRole::ALL
            .iter()
            .map(|&role| HostDescriptor {
                name: naming.host_name(role).to_string(),
                ip: naming.host_ip(role),
                role,
                cpu_share: cpu_share(percent(role), processors),
            })
            .collect(),
        links: HostRole::ALL
            .iter()
            .enumerate()
            .map(|(idx, &role)| LinkDescriptor {
                host: role,
                host_iface: host_iface(naming.host_name(role)),
                switch_iface: switch_iface(&naming.switch, idx + 1),
                profile,
            })
            .collect(),
        prefix_len: naming.prefix_len,
        namespace_prefix: naming.namespace_prefix.clone(),
    }
}

/// Per-link caps, built node by node.
///
/// The server link carries the uplink cap and the client link the downlink
/// cap; both links get the full requested latency (see [`crate::link`]).
pub fn build_asymmetric(
    uplink_mbit: u32,
    downlink_mbit: u32,
    params: &NetworkParams,
    naming: &TopologyNaming,
    processors: usize,
) -> Result<TopologyDescriptor> {
    if params.loss_percent > 0.0 {
        warn!(
            loss_percent = params.loss_percent,
            "packet loss is not applied with asymmetric bandwidth"
        );
    }

    let mut builder = TopologyBuilder::new(Strategy::Asymmetric, naming);
    builder.add_switch();
    builder.add_host(HostRole::Server, cpu_share(params.cpu_server_percent, processors));
    builder.add_host(HostRole::Client, cpu_share(params.cpu_client_percent, processors));
    builder.add_link(
        HostRole::Server,
        LinkProfile::asymmetric(uplink_mbit, params.latency_ms),
    );
    builder.add_link(
        HostRole::Client,
        LinkProfile::asymmetric(downlink_mbit, params.latency_ms),
    );
    builder.finish()
}

/// Incremental topology construction; [`finish`](Self::finish) enforces
/// the one-switch, two-host, two-link shape.
#[derive(Debug)]
pub struct TopologyBuilder<'a> {
    naming: &'a TopologyNaming,
    strategy: Strategy,
    switches: Vec<String>,
    hosts: Vec<HostDescriptor>,
    links: Vec<LinkDescriptor>,
}

impl<'a> TopologyBuilder<'a> {
    pub fn new(strategy: Strategy, naming: &'a TopologyNaming) -> Self {
        Self {
            naming,
            strategy,
            switches: Vec::new(),
            hosts: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn add_switch(&mut self) -> &mut Self {
        self.switches.push(self.naming.switch.clone());
        self
    }

    pub fn add_host(&mut self, role: HostRole, cpu_share: f64) -> &mut Self {
        self.hosts.push(HostDescriptor {
            name: self.naming.host_name(role).to_string(),
            ip: self.naming.host_ip(role),
            role,
            cpu_share,
        });
        self
    }

    /// Link `role`'s host to the switch on the next free switch port.
    pub fn add_link(&mut self, role: HostRole, profile: LinkProfile) -> &mut Self {
        let port = self.links.len() + 1;
        self.links.push(LinkDescriptor {
            host: role,
            host_iface: host_iface(self.naming.host_name(role)),
            switch_iface: switch_iface(&self.naming.switch, port),
            profile,
        });
        self
    }

    pub fn finish(self) -> Result<TopologyDescriptor> {
        let has_role = |role| self.hosts.iter().filter(|h| h.role == role).count() == 1;
        let linked = |role| self.links.iter().filter(|l| l.host == role).count() == 1;
        let complete = self.switches.len() == 1
            && self.hosts.len() == 2
            && self.links.len() == 2
            && HostRole::ALL.iter().all(|&r| has_role(r) && linked(r));
        if !complete {
            return Err(NetbenchError::Configuration(format!(
                "topology needs one switch, a server, a client and one link each \
                 (got {} switches, {} hosts, {} links)",
                self.switches.len(),
                self.hosts.len(),
                self.links.len()
            )));
        }

        Ok(TopologyDescriptor {
            strategy: self.strategy,
            switch: self.naming.switch.clone(),
            hosts: self.hosts,
            links: self.links,
            prefix_len: self.naming.prefix_len,
            namespace_prefix: self.naming.namespace_prefix.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netbench_sim::Discipline;

    fn params(bandwidth: &str) -> NetworkParams {
        NetworkParams {
            latency_ms: 10.0,
            bandwidth: bandwidth.parse().unwrap(),
            loss_percent: 1.0,
            cpu_server_percent: 50.0,
            cpu_client_percent: 25.0,
        }
    }

    #[test]
    fn single_bandwidth_selects_symmetric() {
        let topo = build_topology(&params("20"), &TopologyNaming::default(), 4).unwrap();
        assert_eq!(topo.strategy, Strategy::Symmetric);
        assert_eq!(topo.links().len(), 2);
        for link in topo.links() {
            assert_eq!(link.profile.bandwidth_mbit, 20);
            assert_eq!(link.profile.delay_ms, 5.0);
            assert_eq!(link.profile.loss_percent, 0.5);
            assert_eq!(link.profile.discipline, Discipline::Htb);
        }
    }

    #[test]
    fn pair_bandwidth_selects_asymmetric() {
        let topo = build_topology(&params("5/2"), &TopologyNaming::default(), 4).unwrap();
        assert_eq!(topo.strategy, Strategy::Asymmetric);
        assert_eq!(topo.links().len(), 2);
        assert_eq!(topo.link(HostRole::Server).profile.bandwidth_mbit, 5);
        assert_eq!(topo.link(HostRole::Client).profile.bandwidth_mbit, 2);
        for link in topo.links() {
            assert_eq!(link.profile.delay_ms, 10.0);
            assert_eq!(link.profile.discipline, Discipline::Tbf);
        }
    }

    #[test]
    fn server_link_is_built_first() {
        let topo = build_topology(&params("5/2"), &TopologyNaming::default(), 1).unwrap();
        assert_eq!(topo.links()[0].host, HostRole::Server);
        assert_eq!(topo.links()[0].switch_iface, "s1-eth1");
        assert_eq!(topo.links()[1].switch_iface, "s1-eth2");
        assert_eq!(topo.links()[0].host_iface, "h1-eth0");
    }

    #[test]
    fn strategies_share_node_layout() {
        let naming = TopologyNaming::default();
        let sym = build_topology(&params("10"), &naming, 2).unwrap();
        let asym = build_topology(&params("10/10"), &naming, 2).unwrap();
        assert_eq!(sym.hosts(), asym.hosts());
        let ifaces = |t: &TopologyDescriptor| {
            t.links()
                .iter()
                .map(|l| (l.host_iface.clone(), l.switch_iface.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(ifaces(&sym), ifaces(&asym));
    }

    #[test]
    fn cpu_share_normalized_by_processors() {
        assert_eq!(cpu_share(50.0, 4), 0.125);
        assert_eq!(cpu_share(100.0, 1), 1.0);
        assert_eq!(cpu_share(0.5, 2), 0.0025);

        let topo = build_topology(&params("10"), &TopologyNaming::default(), 4).unwrap();
        assert_eq!(topo.host(HostRole::Server).cpu_share, 0.125);
        assert_eq!(topo.host(HostRole::Client).cpu_share, 0.0625);
    }

    #[test]
    fn hosts_carry_naming() {
        let naming = TopologyNaming {
            namespace_prefix: "t-".into(),
            ..Default::default()
        };
        let topo = build_topology(&params("10"), &naming, 1).unwrap();
        let server = topo.host(HostRole::Server);
        assert_eq!(server.name, "h1");
        assert_eq!(server.ip, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(topo.host(HostRole::Client).ip, Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(topo.namespace("s1"), "t-s1");
    }

    #[test]
    fn builder_rejects_incomplete_topology() {
        let naming = TopologyNaming::default();
        let mut builder = TopologyBuilder::new(Strategy::Asymmetric, &naming);
        builder.add_switch();
        builder.add_host(HostRole::Server, 0.1);
        builder.add_link(HostRole::Server, LinkProfile::asymmetric(5, 1.0));
        let err = builder.finish().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn naming_validation() {
        let long = TopologyNaming {
            server_name: "a-very-long-host".into(),
            ..Default::default()
        };
        assert!(long.validate().is_err());

        let clash = TopologyNaming {
            client_name: "h1".into(),
            ..Default::default()
        };
        assert!(clash.validate().is_err());

        let same_ip = TopologyNaming {
            client_ip: Ipv4Addr::new(192, 168, 1, 1),
            ..Default::default()
        };
        assert!(same_ip.validate().is_err());

        assert!(TopologyNaming::default().validate().is_ok());
    }

    #[test]
    fn peer_roles() {
        assert_eq!(HostRole::Server.peer(), HostRole::Client);
        assert_eq!(HostRole::Client.peer(), HostRole::Server);
        assert_eq!(HostRole::Server.to_string(), "server");
    }

    mod props {
        use super::*;
        use proptest::prelude::*;
        use super::Strategy;

        fn with(latency_ms: f64, bandwidth: BandwidthSpec, cpu: (f64, f64)) -> NetworkParams {
            NetworkParams {
                latency_ms,
                bandwidth,
                loss_percent: 0.0,
                cpu_server_percent: cpu.0,
                cpu_client_percent: cpu.1,
            }
        }

        proptest! {
            #[test]
            fn single_bandwidth_gives_identical_links(
                bw in 1u32..100_000,
                latency in 0.0f64..5_000.0,
            ) {
                let p = with(latency, BandwidthSpec::Single(bw), (100.0, 100.0));
                let topo = build_topology(&p, &TopologyNaming::default(), 1).unwrap();
                let server = topo.link(HostRole::Server).profile;
                let client = topo.link(HostRole::Client).profile;
                prop_assert_eq!(server, client);
                prop_assert_eq!(server.bandwidth_mbit, bw);
                prop_assert_eq!(server.delay_ms, latency / 2.0);
            }

            #[test]
            fn pair_caps_server_uplink_and_client_downlink(
                up in 1u32..100_000,
                down in 1u32..100_000,
                latency in 0.0f64..5_000.0,
            ) {
                let bw: BandwidthSpec = format!("{up}/{down}").parse().unwrap();
                let topo = build_topology(&with(latency, bw, (100.0, 100.0)), &TopologyNaming::default(), 1)
                    .unwrap();
                prop_assert_eq!(topo.strategy, Strategy::Asymmetric);
                prop_assert_eq!(topo.link(HostRole::Server).profile.bandwidth_mbit, up);
                prop_assert_eq!(topo.link(HostRole::Client).profile.bandwidth_mbit, down);
                for link in topo.links() {
                    prop_assert_eq!(link.profile.delay_ms, latency);
                }
            }

            #[test]
            fn host_share_is_percent_of_one_core_over_all(
                server in 0.1f64..=100.0,
                client in 0.1f64..=100.0,
                processors in 1usize..=256,
            ) {
                let p = with(0.0, BandwidthSpec::Single(10), (server, client));
                let topo = build_topology(&p, &TopologyNaming::default(), processors).unwrap();
                prop_assert_eq!(
                    topo.host(HostRole::Server).cpu_share,
                    (server / 100.0) / processors as f64
                );
                prop_assert_eq!(
                    topo.host(HostRole::Client).cpu_share,
                    (client / 100.0) / processors as f64
                );
            }
        }
    }
}
