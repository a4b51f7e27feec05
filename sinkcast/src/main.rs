//! sinkcast - Main entry point
//!
//! Streams this machine's audio output to a network speaker until the
//! transcoder exits or the process is interrupted.
//!
//! Exit codes: 0 shutdown, 1 startup/config error, 3 no speaker found,
//! 4 transcoder produced no output, 5 no usable audio sink.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sinkcast::command::SystemCommandRunner;
use sinkcast::config::{CliOverrides, SessionConfig};
use sinkcast::keepalive::KeepAliveNoise;
use sinkcast::net::local_ip;
use sinkcast::process::SystemLauncher;
use sinkcast::sink::SinkManager;
use sinkcast::speaker::{SpeakerController, UpnpSpeakers};
use sinkcast::transcoder::{StreamTranscoder, TranscoderSettings};
use sinkcast::Orchestrator;
use sinkcast_common::config::{
    load_or_default, user_config_path, write_toml_config, LoadedConfig, TomlConfig, CONFIG_ENV_VAR,
};

/// Command-line arguments for sinkcast
#[derive(Parser, Debug)]
#[command(name = "sinkcast")]
#[command(about = "Stream local audio output to a network speaker")]
#[command(version)]
struct Args {
    /// Preferred speaker IP address (default: first speaker found)
    #[arg(short, long, env = "SINKCAST_DEVICE")]
    device: Option<String>,

    /// Volume for the local sink and the speaker, 0-100 (default: 60)
    #[arg(short, long, env = "SINKCAST_VOLUME", value_parser = clap::value_parser!(u8).range(0..=100))]
    volume: Option<u8>,

    /// Config file to load instead of the default locations
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP port the stream is served on
    #[arg(short, long)]
    port: Option<u16>,

    /// How long to wait for speakers to answer discovery
    #[arg(long)]
    discovery_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Config is read before tracing starts so its log level can apply
    let loaded = load_or_default(args.config.as_deref());
    let level = match &loaded {
        Ok(loaded) => loaded.config.logging.level.clone(),
        Err(_) => "info".to_string(),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sinkcast={level},sinkcast_common={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting sinkcast v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let LoadedConfig { config: toml_config, location } = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::from(1);
        }
    };

    if let Some(path) = &location.skipped_env_path {
        warn!(
            "{} points to missing file {}, ignoring it",
            CONFIG_ENV_VAR,
            path.display()
        );
    }

    match &location.path {
        Some(path) => info!("Config file: {}", path.display()),
        None => {
            warn!("No config file found, using compiled defaults");
            write_default_config();
        }
    }

    let cli = CliOverrides {
        device: args.device,
        volume: args.volume,
        port: args.port,
        discovery_timeout_ms: args.discovery_timeout_ms,
    };
    let config = match SessionConfig::resolve(cli, toml_config) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::from(1);
        }
    };

    let speakers = match UpnpSpeakers::new(config.discovery_timeout) {
        Ok(speakers) => speakers,
        Err(e) => {
            error!("Failed to initialize speaker client: {:#}", e);
            return ExitCode::from(1);
        }
    };

    let orchestrator = Orchestrator::new(
        SinkManager::new(SystemCommandRunner, config.sink_name.clone()),
        KeepAliveNoise::new(SystemLauncher, config.noise_binary.clone(), config.noise_amplitude),
        StreamTranscoder::new(
            SystemLauncher,
            TranscoderSettings {
                binary: config.transcoder_binary.clone(),
                sink_name: config.sink_name.clone(),
                host: local_ip(),
                port: config.http_port,
                stream_name: config.stream_name.clone(),
            },
        ),
        SpeakerController::new(speakers),
        config.preferred_device.clone(),
        config.volume,
    );

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let report = orchestrator.run(cancel).await;
    info!(
        outcome = ?report.outcome,
        lines = report.lines_drained,
        "Session finished"
    );

    ExitCode::from(report.outcome.exit_code())
}

/// First run: leave a template with the compiled defaults for the user to edit
fn write_default_config() {
    let Some(path) = user_config_path() else {
        return;
    };
    match write_toml_config(&TomlConfig::default(), &path) {
        Ok(()) => info!("Wrote default config to {}", path.display()),
        Err(e) => warn!("Could not write default config to {}: {}", path.display(), e),
    }
}

/// Cancel `token` on Ctrl+C or SIGTERM
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }

    token.cancel();
}
