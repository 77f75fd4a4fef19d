use anyhow::Error;
use clap::{Parser, Subcommand};

use pmix_exchange::logging;

mod client;
mod server;

#[derive(Subcommand, Debug)]
enum Commands {
    Client(client::ClientArgs),
    Server(server::ServerArgs),
}

#[derive(Parser, Debug)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

fn main() -> Result<(), Error> {
    logging::init();
    let args = Cli::parse();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    match args.cmd {
        Commands::Client(args) => rt.block_on(client::run(args)),
        Commands::Server(args) => rt.block_on(server::run(args)),
    }
}
