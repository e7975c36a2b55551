//! alert_receiver - display-node side of TeaTime alerts
//!
//! Serves `GET /`, `POST /alert` and `GET /status`. The display state is
//! logged; an alert stays up for the display duration, then the node returns
//! to its idle screen.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::mpsc;
use std::time::Duration;

use teatime_edge::{AlertReceiver, ReceiverConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Receive TeaTime alerts for the display node")]
struct Args {
    /// Listen address.
    #[arg(long, env = "TEATIME_RECEIVER_ADDR", default_value = "0.0.0.0:80")]
    addr: String,

    /// Seconds an alert stays on screen.
    #[arg(long, env = "TEATIME_DISPLAY_SECS", default_value_t = 60)]
    display_secs: u64,

    /// Service windows shown on the idle screen, comma separated.
    #[arg(
        long,
        env = "TEATIME_DISPLAY_WINDOWS",
        value_delimiter = ',',
        default_value = "10:00 - 12:00,14:30 - 16:00"
    )]
    windows: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let handle = AlertReceiver::new(ReceiverConfig {
        addr: args.addr,
        display_duration: Duration::from_secs(args.display_secs),
        windows: args.windows.iter().map(|w| w.trim().to_string()).collect(),
    })
    .spawn()?;
    log::info!("alert receiver listening on {}", handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("alert_receiver waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping receiver...");
    handle.stop()?;
    Ok(())
}
