use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use crate::commands::config::{write_config, ConsoleConfig};

#[derive(Parser, Debug)]
pub struct InitialSetupArgs {
    /// Signaling URL of the telebot
    #[arg(short, long)]
    signaling_url: String,
    /// Capture and attach local audio to the link
    #[arg(long, default_value_t = false)]
    send_audio: bool,
    /// Override default config path
    #[arg(short, long, value_name = "FILE")]
    config_override: Option<PathBuf>,
}

pub async fn initial_setup(args: InitialSetupArgs) -> Result<()> {
    let config = ConsoleConfig {
        signaling_url: args.signaling_url,
        send_audio: args.send_audio,
    };
    write_config(&config, args.config_override)
}
