use anyhow::{Context, Error};
use clap::Args;

use pmix_exchange::{CREDENTIAL_VAR, harness, pmix::env::ClientIdentity};

#[derive(Debug, Args)]
pub struct ClientArgs {
    #[arg(long, env = CREDENTIAL_VAR, default_value = harness::DEFAULT_CREDENTIAL)]
    credential: String,
}

pub(crate) async fn run(args: ClientArgs) -> Result<(), Error> {
    let identity = ClientIdentity::from_env().context("Not launched by a PMIx server")?;
    harness::run_client(&identity, &args.credential)
        .await
        .with_context(|| format!("Rank {} failed", identity.rank))
}
