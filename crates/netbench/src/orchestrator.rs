//! One benchmark run, start to finish.
//!
//! Log directory, topology, network start, optional self-test, both
//! commands submitted, both awaited, network stopped. The network is torn
//! down on every path once it has started, and never touched when it did
//! not.

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{Cli, RunConfig};
use crate::controller::{await_command, CommandOutcome, EmulationController};
use crate::error::Result;
use crate::run_record::RunRecord;
use crate::selftest::SelfTestReport;
use crate::topology::{build_topology, processor_count, HostRole};

const BANNER_WIDTH: usize = 80;

/// What happened during one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub record: RunRecord,
    pub server: CommandOutcome,
    pub client: CommandOutcome,
    pub self_test: Option<SelfTestReport>,
}

/// Parse, validate and run.
pub fn run_from_cli(cli: Cli) -> Result<RunReport> {
    let config = cli.resolve()?;
    run(&config)
}

pub fn run(config: &RunConfig) -> Result<RunReport> {
    match serde_json::to_string_pretty(config) {
        Ok(json) => info!("run configuration:\n{json}"),
        Err(e) => warn!(error = %e, "could not serialize run configuration"),
    }

    let dir = config.logs.ensure_dir()?;
    let record = RunRecord::new(
        &dir,
        &config.logs,
        chrono::Utc::now().timestamp(),
        &config.server_command,
        &config.client_command,
    );

    let topology = build_topology(&config.network_params(), &config.naming, processor_count())?;
    let mut controller = EmulationController::new(topology);
    controller.start()?;

    let result = drive(&controller, config, record);
    controller.stop();
    result
}

fn drive(controller: &EmulationController, config: &RunConfig, record: RunRecord) -> Result<RunReport> {
    let self_test = if config.ping_iperf {
        match controller.self_test() {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "self-test failed");
                None
            }
        }
    } else {
        None
    };

    log_banner(controller, &record)?;

    let mut server = controller.execute(HostRole::Server, &record.server_command, &record.server_log)?;
    let mut client = controller.execute(HostRole::Client, &record.client_command, &record.client_log)?;

    let timeout = config.timeout();
    let server_outcome = await_command(&mut server, timeout)?;
    let client_outcome = await_command(&mut client, timeout)?;

    info!(
        server_log = %record.server_log.display(),
        client_log = %record.client_log.display(),
        "run finished"
    );
    Ok(RunReport {
        record,
        server: server_outcome,
        client: client_outcome,
        self_test,
    })
}

fn log_banner(controller: &EmulationController, record: &RunRecord) -> Result<()> {
    info!("{}", "~".repeat(BANNER_WIDTH));
    for role in HostRole::ALL {
        let name = &controller.topology().host(role).name;
        let script = controller.wrapped_command(role, record.command(role), record.log_path(role))?;
        info!("Executes on {role} [{name}]:\n{script}");
    }
    Ok(())
}
