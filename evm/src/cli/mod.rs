mod config;
mod start;

use clap::{Parser, Subcommand};
use error_stack::Result;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;

pub use self::config::{
    AddressConfig, FactoryConfig, NetworkConfig, NetworkPlan, SourceConfig, SyncConfig,
    TopicConfig,
};
pub use self::start::{CheckConfigCommand, StartCommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    subcommand: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync the configured networks.
    Start(StartCommand),
    /// Validate the configuration file and exit.
    CheckConfig(CheckConfigCommand),
}

impl Cli {
    pub async fn run(self, ct: CancellationToken) -> Result<(), SyncError> {
        match self.subcommand {
            Command::Start(command) => command.run(ct).await,
            Command::CheckConfig(command) => command.run(),
        }
    }
}
