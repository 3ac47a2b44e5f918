//! motiond - gated motion capture daemon
//!
//! This daemon:
//! 1. Loads the configuration (file named by --config / MOTION_CONFIG, plus env overrides)
//! 2. Opens the configured video source and motion analyzer
//! 3. Registers the mail and upload extensions with spool-directory transports
//! 4. Starts the orchestrator, which captures only inside activation windows
//!    and while no trusted device is on the network
//! 5. Logs a status line periodically and stops cleanly on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use motion_gate::config::MotionConfig;
use motion_gate::extension::{smtp, upload, SpoolMailTransport, SpoolSink};
use motion_gate::net::{ArpScanner, UdpLocalAddress};
use motion_gate::{
    analyzer_by_name, open_source, Components, Dispatcher, ExtensionHandle, FtpUploader,
    JpegEncoder, LatestFrame, Logger, Orchestrator, PresenceEvaluator, SmtpNotifier, SystemClock,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Gated motion capture daemon")]
struct Args {
    /// Path to a JSON (or .toml) configuration file.
    #[arg(long, env = "MOTION_CONFIG")]
    config: Option<PathBuf>,

    /// Default log filter when RUST_LOG is not set.
    #[arg(long, env = "MOTION_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Seconds between status log lines.
    #[arg(long, default_value = "60")]
    status_interval_secs: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = MotionConfig::load_from(args.config.as_deref())?;
    let root = Logger::new("motiond");
    let clock = Arc::new(SystemClock);

    let source = open_source(&config.video_source, &root)?;
    let analyzer = analyzer_by_name(&config.analyzer)?;

    let mut dispatcher = Dispatcher::new(root.child("dispatch"));
    let extensions_log = root.child("extension");
    dispatcher.register(ExtensionHandle::new(
        Box::new(SmtpNotifier::new(
            SpoolMailTransport::new(config.spool_dir.join("mail")),
            extensions_log.child(smtp::KIND),
        )),
        config.extension(smtp::KIND),
        clock.clone(),
        &extensions_log,
    ));
    dispatcher.register(ExtensionHandle::new(
        Box::new(FtpUploader::new(
            SpoolSink::new(config.spool_dir.join("upload")),
            extensions_log.child(upload::KIND),
        )),
        config.extension(upload::KIND),
        clock.clone(),
        &extensions_log,
    ));
    for handle in dispatcher.extensions() {
        log::info!(
            "extension {}: {}",
            handle.name(),
            if handle.config().enabled { "enabled" } else { "disabled" }
        );
    }

    let presence = PresenceEvaluator::new(
        Box::new(ArpScanner::new(root.child("scan"))),
        Box::new(UdpLocalAddress),
        root.child("presence"),
    );

    let orchestrator = Orchestrator::new(
        Components {
            source,
            analyzer,
            encoder: Arc::new(JpegEncoder::default()),
            dispatcher: Arc::new(dispatcher),
            presence,
            clock,
        },
        config.orchestrator_settings(),
        root.child("orchestrator"),
    );
    let preview = Arc::new(LatestFrame::new());
    orchestrator.add_frame_observer(preview.clone());

    log::info!(
        "motiond running. device={}, source={}, analyzer={}, spool={}",
        config.device_name,
        config.video_source,
        config.analyzer,
        config.spool_dir.display()
    );
    log::info!(
        "{} trusted device(s), notification delay {}s",
        config.trusted.len(),
        config.notification_delay.as_secs()
    );
    orchestrator.start()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let status_interval = Duration::from_secs(args.status_interval_secs.max(1));
    loop {
        match rx.recv_timeout(status_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let status = orchestrator.status();
                log::info!(
                    "status: running={} activated={} suspended={} capturing={} launches={} preview={}",
                    status.running,
                    status.activated,
                    status.suspended,
                    status.capture_active,
                    status.capture_launches,
                    preview.get().map(|frame| frame.len()).unwrap_or(0)
                );
            }
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("shutdown signal received, stopping...");
    orchestrator.stop();
    Ok(())
}
