//! teatimed - TeaTime edge daemon
//!
//! Polling mode pulls frames from the camera, detects people and checks
//! their clothing against the uniform colour. Push mode takes frames and
//! detections from MQTT instead. Either way an alert goes to the display
//! node when the gate is armed.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use teatime_edge::config::RunMode;
use teatime_edge::{
    transport, AlertGate, BackendChain, HttpAlertSink, LatestFrame, Pipeline, PipelineSettings,
    RtspConfig, RtspSource, SystemClock, TeatimeConfig, UniformClassifier,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "TeaTime edge node: uniform-aware person alerts")]
struct Args {
    /// JSON or TOML configuration file.
    #[arg(long, env = "TEATIME_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured mode: 'polling' or 'push'.
    #[arg(long)]
    mode: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = TeatimeConfig::load_from(args.config.as_deref())?;
    if let Some(mode) = &args.mode {
        cfg.mode = mode.parse()?;
    }

    log::info!("teatimed {} starting in {:?} mode", env!("CARGO_PKG_VERSION"), cfg.mode);
    for window in &cfg.time_windows {
        log::info!("active window {}", window);
    }
    log::info!(
        "alerts go to {} (cooldown {}s)",
        cfg.alert.url(),
        cfg.cooldown.as_secs()
    );

    let classifier = UniformClassifier::new(cfg.uniform.range, cfg.uniform.match_threshold)?;
    let gate = AlertGate::new(cfg.time_windows.clone(), cfg.cooldown, SystemClock);
    let pipeline = Pipeline::new(
        classifier,
        gate,
        Box::new(HttpAlertSink::from_settings(&cfg.alert)),
        PipelineSettings::from_config(&cfg),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let shutdown_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_signal.store(true, Ordering::SeqCst);
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    match cfg.mode {
        RunMode::Polling => {
            let backend = BackendChain::from_config(&cfg).select()?;
            let mut pipeline = pipeline.with_backend(backend);

            let mut source = RtspSource::new(RtspConfig {
                url: cfg.source.url.clone(),
                target_fps: cfg.source.target_fps,
                width: cfg.source.width,
                height: cfg.source.height,
                figure_every: cfg.source.figure_every,
            })?;
            source.connect()?;

            pipeline.run_polling(&mut source, &shutdown)?;
            let stats = pipeline.stats();
            log::info!(
                "stopped after {} cycles, {} alerts ({} delivered)",
                stats.cycles,
                stats.alerts,
                stats.delivered
            );
        }
        RunMode::Push => {
            let latest = Arc::new(LatestFrame::new());
            let push = cfg.push.clone();
            let subscriber_shutdown = shutdown.clone();
            // the MQTT iterator blocks, so the subscriber is not joined on shutdown
            std::thread::spawn(move || {
                if let Err(err) = transport::run_push(&push, pipeline, latest, &subscriber_shutdown) {
                    log::error!("push subscriber failed: {:#}", err);
                    std::process::exit(1);
                }
            });
            log::info!("teatimed waiting for shutdown signal (Ctrl-C)...");
            let _ = rx.recv();
        }
    }

    log::info!("teatimed stopped");
    Ok(())
}
