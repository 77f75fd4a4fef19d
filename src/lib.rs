use clap::Parser;

pub mod coordinator;
pub mod harness;
pub mod kv_store;
pub mod launcher;
pub mod logging;
pub mod modex;
pub mod pmix;

/// Environment variable supplying the shared secret
pub const CREDENTIAL_VAR: &str = "PMIX_TEST_CREDENTIAL";

#[derive(Parser, Debug)]
pub struct Cli {
    #[arg(long, default_value = harness::DEFAULT_NSPACE)]
    pub nspace: String,
    #[arg(long, env = CREDENTIAL_VAR, default_value = harness::DEFAULT_CREDENTIAL)]
    pub credential: String,
    #[arg(long)]
    pub nproc: u32,
    /// Seconds to wait for all clients to terminate
    #[arg(long, default_value_t = harness::DEFAULT_TIMEOUT.as_secs())]
    pub timeout: u64,
    #[arg()]
    pub command: String,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl Cli {
    pub fn server_config(&self) -> harness::ServerConfig {
        let command = std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect();
        harness::ServerConfig {
            nspace: self.nspace.clone(),
            credential: self.credential.clone(),
            nprocs: self.nproc,
            timeout: std::time::Duration::from_secs(self.timeout),
            ..harness::ServerConfig::new(command)
        }
    }
}
