use anyhow::Result;
use clap::{Parser, Subcommand};

use zeitwork_cli::deploy::{self, DeployArgs};
use zeitwork_core::logging::{self, LogFormat};

#[derive(Parser)]
#[command(
    name = "zeitwork",
    version,
    about = "Deploy and operate zeitwork services"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build artifacts onto the fleet: upload binaries, ship env, restart
    /// units.
    Deploy(DeployArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LogFormat::Human);

    match cli.command {
        Commands::Deploy(args) => deploy::run(&args),
    }
}
