use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod handler;
mod recorder;
mod storage;

#[derive(Parser, Debug)]
#[command(version, about = "Screen and microphone recorder")]
struct Cli {
    /// JSON config file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("record_bus", log::LevelFilter::Debug)
        .filter_module("screen_recorder", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        match config::RecorderConfig::load(path) {
            Ok(loaded) => config::init(loaded),
            Err(e) => {
                log::error!("{:#}", e);
                std::process::exit(1);
            }
        }
    }
    if let Err(e) = record_bus::init() {
        log::error!("ffmpeg init failed: {:#}", e);
        std::process::exit(1);
    }
    let config = config::config();

    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    api::start_api_server(cancel_clone, config.listen.clone());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    recorder::get_recorder().shutdown().await;
    std::process::exit(0);
}
