//! Pre-run connectivity and throughput probe.
//!
//! Pings every ordered host pair, then measures TCP throughput in both
//! directions with `iperf3`. Purely diagnostic: every failure is logged and
//! recorded in the report, nothing here fails the run.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use netbench_sim::preflight::check_binary;
use netbench_sim::{Namespace, NamespaceProcess};
use serde::Serialize;
use tracing::{info, warn};

use crate::topology::HostRole;

const PING_COUNT: &str = "3";
const IPERF_SECONDS: &str = "5";
/// Time given to the one-off iperf3 server to start listening.
const IPERF_SERVER_STARTUP: Duration = Duration::from_millis(500);
/// Upper bound on one iperf3 measurement, client runtime included.
const IPERF_DEADLINE: Duration = Duration::from_secs(20);

/// A host as seen by the probes.
#[derive(Debug, Clone, Copy)]
pub struct ProbeHost<'a> {
    pub role: HostRole,
    pub ns: &'a Namespace,
    pub ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingResult {
    pub from: HostRole,
    pub to: HostRole,
    pub transmitted: u32,
    pub received: u32,
    pub loss_percent: f64,
    pub avg_rtt_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThroughputResult {
    pub from: HostRole,
    pub to: HostRole,
    pub mbit_per_s: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SelfTestReport {
    pub pings: Vec<PingResult>,
    pub throughput: Vec<ThroughputResult>,
}

/// Ping summary figures: `(transmitted, received, loss_percent, avg_rtt_ms)`.
///
/// Expects iputils `ping -q` output:
///
/// ```text
/// 3 packets transmitted, 3 received, 0% packet loss, time 2003ms
/// rtt min/avg/max/mdev = 10.112/10.204/10.301/0.077 ms
/// ```
pub fn parse_ping_summary(output: &str) -> Option<(u32, u32, f64, Option<f64>)> {
    let stats = output.lines().find(|l| l.contains("packets transmitted"))?;
    let mut transmitted = None;
    let mut received = None;
    let mut loss = None;
    for field in stats.split(',').map(str::trim) {
        let mut words = field.split_whitespace();
        let value = words.next()?;
        match words.next() {
            Some("packets") => transmitted = value.parse().ok(),
            Some("received") => received = value.parse().ok(),
            Some("packet") => loss = value.trim_end_matches('%').parse().ok(),
            _ => {}
        }
    }

    let avg = output
        .lines()
        .find(|l| l.starts_with("rtt") || l.starts_with("round-trip"))
        .and_then(|l| l.split('=').nth(1))
        .and_then(|v| v.trim().split('/').nth(1))
        .and_then(|v| v.parse().ok());

    Some((transmitted?, received?, loss?, avg))
}

/// Receiver-side throughput in Mbit/s from `iperf3 -J` output.
pub fn parse_iperf_receiver_mbps(json: &str) -> Result<f64> {
    let doc: serde_json::Value = serde_json::from_str(json).context("iperf3 JSON")?;
    if let Some(err) = doc.get("error").and_then(|e| e.as_str()) {
        bail!("iperf3: {err}");
    }
    let bps = doc
        .pointer("/end/sum_received/bits_per_second")
        .and_then(|v| v.as_f64())
        .context("iperf3 JSON lacks end.sum_received.bits_per_second")?;
    Ok(bps / 1_000_000.0)
}

fn ping(from: &ProbeHost<'_>, to: &ProbeHost<'_>) -> Result<PingResult> {
    let target = to.ip.to_string();
    let out = from
        .ns
        .exec("ping", &["-q", "-c", PING_COUNT, "-W", "2", &target])?;
    let stdout = String::from_utf8_lossy(&out.stdout);
    let (transmitted, received, loss_percent, avg_rtt_ms) = parse_ping_summary(&stdout)
        .with_context(|| format!("unexpected ping output: {}", stdout.trim()))?;
    Ok(PingResult {
        from: from.role,
        to: to.role,
        transmitted,
        received,
        loss_percent,
        avg_rtt_ms,
    })
}

/// Data flows from `sender` to `receiver`; the receiver hosts the server.
fn iperf(sender: &ProbeHost<'_>, receiver: &ProbeHost<'_>) -> Result<ThroughputResult> {
    let mut server = NamespaceProcess::spawn(receiver.ns, "iperf3", &["-s", "-1"])?;
    std::thread::sleep(IPERF_SERVER_STARTUP);

    let target = receiver.ip.to_string();
    let out = sender
        .ns
        .exec("iperf3", &["-c", &target, "-t", IPERF_SECONDS, "-J"])?;
    let mbit_per_s = parse_iperf_receiver_mbps(&String::from_utf8_lossy(&out.stdout))?;

    if server.wait_timeout(IPERF_DEADLINE)?.is_none() {
        warn!(server = server.label(), "iperf3 server did not exit, killing");
        server.kill();
    }

    Ok(ThroughputResult {
        from: sender.role,
        to: receiver.role,
        mbit_per_s,
    })
}

/// Probe latency/loss between every ordered pair, then throughput both ways.
pub fn run(server: ProbeHost<'_>, client: ProbeHost<'_>) -> SelfTestReport {
    let mut report = SelfTestReport::default();
    let pairs = [(&server, &client), (&client, &server)];

    info!("self-test: testing ping reachability");
    for (from, to) in pairs {
        match ping(from, to) {
            Ok(r) => {
                info!(
                    from = %r.from,
                    to = %r.to,
                    sent = r.transmitted,
                    received = r.received,
                    loss_percent = r.loss_percent,
                    avg_rtt_ms = ?r.avg_rtt_ms,
                    "ping"
                );
                report.pings.push(r);
            }
            Err(e) => warn!(from = %from.role, to = %to.role, error = %format!("{e:#}"), "ping failed"),
        }
    }

    if check_binary("iperf3").is_none() {
        warn!("self-test: iperf3 not found, skipping throughput probe");
        return report;
    }

    info!("self-test: testing bandwidth with iperf3");
    for (sender, receiver) in pairs {
        match iperf(sender, receiver) {
            Ok(r) => {
                info!(from = %r.from, to = %r.to, mbit_per_s = %format!("{:.2}", r.mbit_per_s), "iperf3");
                report.throughput.push(r);
            }
            Err(e) => warn!(
                from = %sender.role,
                to = %receiver.role,
                error = %format!("{e:#}"),
                "iperf3 failed"
            ),
        }
    }
    report
}
