use tracing_subscriber::EnvFilter;

use netbench::Cli;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse_with_legacy_flags();
    let report = netbench::run_from_cli(cli)?;

    tracing::info!(
        timestamp = report.record.timestamp,
        server = ?report.server,
        client = ?report.client,
        "netbench done"
    );
    Ok(())
}
