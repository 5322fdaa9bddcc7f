use anyhow::{bail, Result};
use tracing::debug;

use crate::topology::Namespace;

/// Root queueing discipline used when an interface carries a rate cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Discipline {
    /// Hierarchical token bucket: a single `htb` class carries the rate.
    #[default]
    Htb,
    /// Token bucket filter as root qdisc.
    Tbf,
}

impl std::fmt::Display for Discipline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Discipline::Htb => write!(f, "htb"),
            Discipline::Tbf => write!(f, "tbf"),
        }
    }
}

/// Traffic shaping for the egress side of one interface.
///
/// Omitted parameters are not passed to `tc`. An all-`None` config clears
/// any existing shaping on the interface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShapingConfig {
    pub rate_mbit: Option<u32>,
    pub delay_ms: Option<f64>,
    pub loss_percent: Option<f64>,
    /// Only consulted when `rate_mbit` is set.
    pub discipline: Discipline,
}

// Handles shared by both rate disciplines; netem always hangs off 5:1.
const ROOT_HANDLE: &str = "5:";
const RATE_CLASS: &str = "5:1";
const NETEM_HANDLE: &str = "10:";
const HTB_BURST: &str = "15k";

impl ShapingConfig {
    fn delay(&self) -> Option<f64> {
        self.delay_ms.filter(|d| *d > 0.0)
    }

    fn loss(&self) -> Option<f64> {
        self.loss_percent.filter(|l| *l > 0.0)
    }

    fn has_netem_params(&self) -> bool {
        self.delay().is_some() || self.loss().is_some()
    }

    /// True if applying this config would leave the interface unshaped.
    pub fn is_empty(&self) -> bool {
        self.rate_mbit.is_none() && !self.has_netem_params()
    }

    fn netem_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(delay) = self.delay() {
            args.push("delay".into());
            args.push(format!("{delay}ms"));
        }
        if let Some(loss) = self.loss() {
            args.push("loss".into());
            args.push(format!("{loss}%"));
        }
        args
    }

    /// The `tc` invocations (without the leading `tc`) that install this
    /// config on `iface`, assuming the root qdisc was already removed.
    pub fn tc_commands(&self, iface: &str) -> Vec<Vec<String>> {
        let mut cmds = Vec::new();
        let netem_parent = match self.rate_mbit {
            Some(rate) => {
                match self.discipline {
                    Discipline::Htb => {
                        cmds.push(strings(&[
                            "qdisc", "add", "dev", iface, "root", "handle", ROOT_HANDLE, "htb",
                            "default", "1",
                        ]));
                        cmds.push(strings(&[
                            "class",
                            "add",
                            "dev",
                            iface,
                            "parent",
                            ROOT_HANDLE,
                            "classid",
                            RATE_CLASS,
                            "htb",
                            "rate",
                            &format!("{rate}Mbit"),
                            "burst",
                            HTB_BURST,
                        ]));
                    }
                    Discipline::Tbf => {
                        cmds.push(strings(&[
                            "qdisc",
                            "add",
                            "dev",
                            iface,
                            "root",
                            "handle",
                            ROOT_HANDLE,
                            "tbf",
                            "rate",
                            &format!("{rate}Mbit"),
                            "burst",
                            &tbf_burst_bytes(rate).to_string(),
                            "latency",
                            "1s",
                        ]));
                    }
                }
                vec!["parent".to_string(), RATE_CLASS.to_string()]
            }
            None => vec!["root".to_string()],
        };

        if self.has_netem_params() {
            let mut netem = strings(&["qdisc", "add", "dev", iface]);
            netem.extend(netem_parent);
            netem.extend(strings(&["handle", NETEM_HANDLE, "netem"]));
            netem.extend(self.netem_args());
            cmds.push(netem);
        }

        cmds
    }
}

/// TBF bucket size: a tenth of a second of traffic, at least ten MTUs.
fn tbf_burst_bytes(rate_mbit: u32) -> u64 {
    let rate_bytes_per_sec = rate_mbit as u64 * 1_000_000 / 8;
    rate_bytes_per_sec.max(154_000) / 10
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Apply `config` to `interface` inside `ns`.
///
/// Always removes the existing root qdisc first (clean slate), then installs
/// the rate discipline (if any) with netem chained below it, or netem alone
/// as root when no rate is set.
pub fn apply_shaping(ns: &Namespace, interface: &str, config: &ShapingConfig) -> Result<()> {
    let _ = ns.exec("tc", &["qdisc", "del", "dev", interface, "root"]);

    for args in config.tc_commands(interface) {
        let args: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let output = ns.exec("tc", &args)?;
        if !output.status.success() {
            bail!(
                "tc {}\n{}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
    }

    debug!(ns = ns.name, interface, ?config, "shaping applied");
    Ok(())
}
