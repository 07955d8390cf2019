use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::commands::config::read_config;
use crate::control::{ControlSink, Controller};
use crate::telebot_link::TelebotLink;

#[derive(Parser, Debug)]
pub struct StartArgs {
    /// Override default config path
    #[arg(short, long, value_name = "FILE")]
    pub config_override: Option<PathBuf>,
    /// Allow not checking certificates on the signaling link
    #[arg(long, default_value_t = false)]
    allow_skip_cert_check: bool,
}

pub async fn start(args: StartArgs) -> Result<()> {
    let config = read_config(args.config_override)?;

    let sink = ControlSink::new();
    let controller = Arc::new(Controller::new(sink.clone()));
    let mut link = TelebotLink::new(
        &config.signaling_url,
        config.send_audio,
        args.allow_skip_cert_check,
        sink,
    );

    info!("Creating system components and callbacks");

    // Remote video is rendered outside this crate; just note its arrival
    link.on_remote_track(Box::new(move |track| {
        Box::pin(async move {
            info!(
                "Remote track ready for rendering: kind={}, ssrc={}",
                track.kind(),
                track.ssrc()
            );
        })
    }))
    .await;

    link.try_connect().await?;

    // Operator input arrives as lines on stdin:
    //   press <up|down|left|right>
    //   release <up|down|left|right>
    //   axes <x> <y>
    let controller_clone = Arc::clone(&controller);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            dispatch_input_line(&controller_clone, line.trim()).await;
        }
    });

    let _ = tokio::signal::ctrl_c().await;
    info!("Exit requested, releasing controls...");
    controller.gamepad_disconnected().await;
    Ok(())
}

async fn dispatch_input_line(controller: &Controller, line: &str) {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("press") => match parts.next().map(str::parse) {
            Some(Ok(direction)) => controller.key_down(direction).await,
            _ => warn!("press requires a direction (up/down/left/right)"),
        },
        Some("release") => match parts.next().map(str::parse) {
            Some(Ok(direction)) => controller.key_up(direction).await,
            _ => warn!("release requires a direction (up/down/left/right)"),
        },
        Some("axes") => {
            let x = parts.next().and_then(|v| v.parse::<f64>().ok());
            let y = parts.next().and_then(|v| v.parse::<f64>().ok());
            match (x, y) {
                (Some(x), Some(y)) => controller.set_axes(x, y).await,
                _ => warn!("axes requires two numbers"),
            }
        }
        Some(other) => warn!("Unrecognised control input: {other}"),
        None => (),
    }
}
