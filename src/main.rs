use anyhow::Result;
use clap::{Parser, Subcommand};

use telebot_console::commands::{initial_setup, start, InitialSetupArgs, StartArgs};

#[derive(Parser, Debug)]
#[command(name = "telebot-console", about = "Drive a telebot over a WebRTC link")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the console configuration
    InitialSetup(InitialSetupArgs),
    /// Connect to the telebot and start driving
    Start(StartArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Commands::InitialSetup(args) => initial_setup(args).await,
        Commands::Start(args) => start(args).await,
    }
}
