use anyhow::{Context, Error, bail};
use clap::Parser;
use tracing::info;

use pmix_exchange::{Cli, harness, logging, pmix};

#[tokio::main]
async fn main() -> Result<(), Error> {
    logging::init();
    let cli = Cli::parse();
    info!(version = pmix::get_version_str(), nproc = cli.nproc, "Starting");

    let summary = harness::run_server(cli.server_config())
        .await
        .context("Server failed")?;
    for (proc, status) in &summary.statuses {
        info!(%proc, %status, "Client exit status");
    }
    if !summary.success() {
        bail!("Job did not complete successfully");
    }
    Ok(())
}
