use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Error, bail};
use clap::Args;
use tracing::info;

use pmix_exchange::{CREDENTIAL_VAR, harness};

#[derive(Debug, Args)]
pub struct ServerArgs {
    #[arg(long, default_value = harness::DEFAULT_NSPACE)]
    nspace: String,
    #[arg(long, env = CREDENTIAL_VAR, default_value = harness::DEFAULT_CREDENTIAL)]
    credential: String,
    #[arg(long, default_value_t = harness::DEFAULT_NPROCS)]
    nprocs: u32,
    /// Seconds to wait for all clients to terminate
    #[arg(long, default_value_t = harness::DEFAULT_TIMEOUT.as_secs())]
    timeout: u64,
    /// Directory to create the server directory in
    #[arg(long)]
    tempdir: Option<PathBuf>,
    /// Client command. Defaults to this program's `client` subcommand.
    #[arg(last = true)]
    command: Vec<String>,
}

/// The client reads the secret from `CREDENTIAL_VAR`, which every client is
/// launched with.
fn client_command() -> Result<Vec<String>, Error> {
    let exe = std::env::current_exe().context("Cannot locate own executable")?;
    Ok(vec![exe.to_string_lossy().into_owned(), "client".to_owned()])
}

pub(crate) async fn run(args: ServerArgs) -> Result<(), Error> {
    let ServerArgs {
        nspace,
        credential,
        nprocs,
        timeout,
        tempdir,
        command,
    } = args;

    let command = if command.is_empty() {
        client_command()?
    } else {
        command
    };

    let config = harness::ServerConfig {
        nspace,
        credential,
        nprocs,
        timeout: Duration::from_secs(timeout),
        tmpdir: tempdir,
        ..harness::ServerConfig::new(command)
    };
    let summary = harness::run_server(config).await.context("Server failed")?;

    for (proc, status) in &summary.statuses {
        info!(%proc, %status, "Client exit status");
    }
    if !summary.complete {
        bail!("Not every client terminated");
    }
    if !summary.success() {
        bail!("A client failed");
    }
    Ok(())
}
