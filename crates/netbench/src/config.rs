//! Command line and file configuration.
//!
//! The CLI carries the run parameters; an optional TOML file overrides node
//! naming and log layout. [`Cli::resolve`] validates everything and parses
//! the bandwidth into its [`BandwidthSpec`] shape before any resource is
//! touched.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{NetbenchError, Result};
use crate::link::BandwidthSpec;
use crate::run_record::LogLayout;
use crate::topology::{NetworkParams, TopologyNaming};

pub const DEFAULT_LATENCY_MS: f64 = 5.0;
pub const DEFAULT_BANDWIDTH: &str = "10";
pub const DEFAULT_PACKET_LOSS: f64 = 2.0;
pub const DEFAULT_CPU_PERCENT: f64 = 0.5;

/// Run one command on each of two emulated hosts behind one switch.
///
/// The server is h1 (192.168.1.1) and the client h2 (192.168.1.2) unless a
/// config file renames them. Output of each command goes to its own log
/// file; the run ends when both commands have exited.
#[derive(Parser, Debug, Clone)]
#[command(name = "netbench", version)]
pub struct Cli {
    /// Script that runs within the server (default host h1, IP 192.168.1.1).
    #[arg(value_name = "SERVER_SCRIPT")]
    pub server_script: String,

    /// Script that runs within the client (default host h2, IP 192.168.1.2).
    #[arg(value_name = "CLIENT_SCRIPT")]
    pub client_script: String,

    /// Symmetric latency between server and client (in ms).
    #[arg(short, long, default_value_t = DEFAULT_LATENCY_MS)]
    pub latency: f64,

    /// Bandwidth on each node to switch link (in Mbps), or UPLINK/DOWNLINK.
    #[arg(short, long, default_value = DEFAULT_BANDWIDTH)]
    pub bandwidth: String,

    /// Packet loss between server and client (in percent, e.g. 10).
    #[arg(short = 'p', long, visible_alias = "pl", default_value_t = DEFAULT_PACKET_LOSS)]
    pub packet_loss: f64,

    /// CPU share of the server (in percent of one core, e.g. 33).
    #[arg(long, visible_alias = "cpus", default_value_t = DEFAULT_CPU_PERCENT)]
    pub cpu_server: f64,

    /// CPU share of the client (in percent of one core, e.g. 33).
    #[arg(long, visible_alias = "cpuc", default_value_t = DEFAULT_CPU_PERCENT)]
    pub cpu_client: f64,

    /// Run ping and iperf3 between server and client before the scripts.
    #[arg(long, default_value_t = false)]
    pub ping_iperf: bool,

    /// TOML file with topology naming and log layout overrides.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log directory (overrides the config file).
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Kill a script still running after this many seconds. Off by default:
    /// a hung script blocks the run indefinitely.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

/// Single-dash multi-letter flags accepted by older invocations.
const LEGACY_FLAGS: [(&str, &str); 3] = [
    ("-pl", "--packet-loss"),
    ("-cpus", "--cpu-server"),
    ("-cpuc", "--cpu-client"),
];

/// Rewrite `-pl`, `-cpus` and `-cpuc` (alone or with `=value`) to their long
/// forms. Nothing after a `--` separator is touched.
pub fn normalize_legacy_flags<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut positional_only = false;
    args.into_iter()
        .map(Into::into)
        .map(|arg| {
            if positional_only {
                return arg;
            }
            let Some(text) = arg.to_str() else {
                return arg;
            };
            if text == "--" {
                positional_only = true;
                return arg;
            }
            let (flag, value) = match text.split_once('=') {
                Some((flag, value)) => (flag, Some(value)),
                None => (text, None),
            };
            match LEGACY_FLAGS.iter().find(|(legacy, _)| *legacy == flag) {
                Some((_, long)) => match value {
                    Some(v) => OsString::from(format!("{long}={v}")),
                    None => OsString::from(*long),
                },
                None => arg,
            }
        })
        .collect()
}

impl Cli {
    /// Parse process arguments, accepting the legacy single-dash flags.
    pub fn parse_with_legacy_flags() -> Self {
        Self::parse_from(normalize_legacy_flags(std::env::args_os()))
    }
}

/// Contents of the `--config` file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub topology: TopologyNaming,
    pub logs: LogLayout,
}

impl FileConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(FileConfig::default());
        }
        toml::from_str(input)
            .map_err(|e| NetbenchError::Configuration(format!("invalid config TOML: {e}")))
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let input = std::fs::read_to_string(path).map_err(|e| {
            NetbenchError::Configuration(format!("read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&input)
    }
}

/// Fully validated parameters of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    pub server_command: String,
    pub client_command: String,
    pub latency_ms: f64,
    pub bandwidth: BandwidthSpec,
    pub packet_loss_percent: f64,
    pub cpu_server_percent: f64,
    pub cpu_client_percent: f64,
    pub ping_iperf: bool,
    pub timeout_secs: Option<u64>,
    pub naming: TopologyNaming,
    pub logs: LogLayout,
}

impl RunConfig {
    pub fn network_params(&self) -> NetworkParams {
        NetworkParams {
            latency_ms: self.latency_ms,
            bandwidth: self.bandwidth,
            loss_percent: self.packet_loss_percent,
            cpu_server_percent: self.cpu_server_percent,
            cpu_client_percent: self.cpu_client_percent,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

fn non_negative(name: &str, value: f64) -> Result<f64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(NetbenchError::Configuration(format!(
            "{name} must be a non-negative number, got {value}"
        )))
    }
}

impl Cli {
    /// Validate and merge with the config file, if any.
    pub fn resolve(self) -> Result<RunConfig> {
        let bandwidth: BandwidthSpec = self.bandwidth.parse()?;
        let latency_ms = non_negative("latency", self.latency)?;
        let packet_loss_percent = non_negative("packet loss", self.packet_loss)?;
        if packet_loss_percent > 100.0 {
            return Err(NetbenchError::Configuration(format!(
                "packet loss must be at most 100%, got {packet_loss_percent}"
            )));
        }
        let cpu_server_percent = non_negative("server CPU share", self.cpu_server)?;
        let cpu_client_percent = non_negative("client CPU share", self.cpu_client)?;
        if self.timeout == Some(0) {
            return Err(NetbenchError::Configuration(
                "timeout must be at least one second".into(),
            ));
        }

        let mut file = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        if let Some(dir) = self.log_dir {
            file.logs.dir = dir;
        }
        file.topology.validate()?;

        Ok(RunConfig {
            server_command: self.server_script,
            client_command: self.client_script,
            latency_ms,
            bandwidth,
            packet_loss_percent,
            cpu_server_percent,
            cpu_client_percent,
            ping_iperf: self.ping_iperf,
            timeout_secs: self.timeout,
            naming: file.topology,
            logs: file.logs,
        })
    }
}
