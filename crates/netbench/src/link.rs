//! Link profiles: how the requested end-to-end figures become per-link
//! shaping parameters.
//!
//! Traffic between the two hosts crosses two links (host → switch → host)
//! and the emulation engine applies delay and loss per link, so the
//! symmetric strategy halves the requested latency and loss on each link.
//!
//! The asymmetric strategy does NOT halve the latency. There the link's
//! delay sits on the switch-side interface only, once per direction, and
//! the host-side interface carries the token-bucket rate cap. Each packet
//! therefore crosses exactly one delaying interface on its way between the
//! hosts, and applying the raw requested latency to both links gives a
//! symmetric server→client delay equal to the request. Halving it here
//! would under-delay the path. Both behaviours are intentional; keep them
//! as they are until the owners of the benchmark results decide otherwise.

use std::fmt;
use std::str::FromStr;

use netbench_sim::{Discipline, ShapingConfig};
use serde::Serialize;

use crate::error::NetbenchError;

/// Links on the path between the two hosts.
pub const LINK_COUNT: u32 = 2;

/// Requested bandwidth, in Mbit/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthSpec {
    /// Same cap on both links.
    Single(u32),
    /// Uplink cap on the server link, downlink cap on the client link.
    Asymmetric { uplink: u32, downlink: u32 },
}

impl FromStr for BandwidthSpec {
    type Err = NetbenchError;

    /// Parse `"<mbps>"` or `"<uplink>/<downlink>"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetbenchError::InvalidBandwidth {
            value: s.to_string(),
        };
        let parse = |part: &str| -> Result<u32, NetbenchError> {
            match part.trim().parse::<u32>() {
                Ok(v) if v > 0 => Ok(v),
                _ => Err(invalid()),
            }
        };

        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [bw] => Ok(BandwidthSpec::Single(parse(bw)?)),
            [up, down] => Ok(BandwidthSpec::Asymmetric {
                uplink: parse(up)?,
                downlink: parse(down)?,
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for BandwidthSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandwidthSpec::Single(bw) => write!(f, "{bw}"),
            BandwidthSpec::Asymmetric { uplink, downlink } => write!(f, "{uplink}/{downlink}"),
        }
    }
}

/// One side of a host–switch link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEnd {
    Host,
    Switch,
}

/// Shaping parameters of one host–switch link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinkProfile {
    pub bandwidth_mbit: u32,
    pub delay_ms: f64,
    pub loss_percent: f64,
    #[serde(serialize_with = "serialize_discipline")]
    pub discipline: Discipline,
}

impl LinkProfile {
    /// Class-based shaping with per-link halves of the path latency and loss.
    pub fn symmetric(bandwidth_mbit: u32, total_latency_ms: f64, total_loss_percent: f64) -> Self {
        Self {
            bandwidth_mbit,
            delay_ms: total_latency_ms / LINK_COUNT as f64,
            loss_percent: total_loss_percent / LINK_COUNT as f64,
            discipline: Discipline::Htb,
        }
    }

    /// Token-bucket cap with the full path latency as link delay.
    ///
    /// No loss: this mode has never applied packet loss.
    pub fn asymmetric(bandwidth_mbit: u32, total_latency_ms: f64) -> Self {
        Self {
            bandwidth_mbit,
            delay_ms: total_latency_ms,
            loss_percent: 0.0,
            discipline: Discipline::Tbf,
        }
    }

    /// Egress shaping for one end of the link.
    ///
    /// Class-based links shape both ends identically. Token-bucket links
    /// split the work: the host end caps the rate, the switch end delays.
    pub fn shaping(&self, end: LinkEnd) -> ShapingConfig {
        match (self.discipline, end) {
            (Discipline::Htb, _) => ShapingConfig {
                rate_mbit: Some(self.bandwidth_mbit),
                delay_ms: Some(self.delay_ms),
                loss_percent: Some(self.loss_percent),
                discipline: Discipline::Htb,
            },
            (Discipline::Tbf, LinkEnd::Host) => ShapingConfig {
                rate_mbit: Some(self.bandwidth_mbit),
                discipline: Discipline::Tbf,
                ..Default::default()
            },
            (Discipline::Tbf, LinkEnd::Switch) => ShapingConfig {
                delay_ms: Some(self.delay_ms),
                loss_percent: Some(self.loss_percent),
                discipline: Discipline::Tbf,
                ..Default::default()
            },
        }
    }
}

fn serialize_discipline<S: serde::Serializer>(d: &Discipline, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(d)
}
