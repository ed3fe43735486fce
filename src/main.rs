//! iot-onboard - Main Entry Point
//!
//! Provisions the device, opens the hub session and sends telemetry until
//! interrupted.

use bytes::Bytes;
use clap::{Parser, Subcommand};
use iot_onboard::config::OnboardConfig;
use iot_onboard::error::ClientResult;
use iot_onboard::observability::{init_default_logging, metrics};
use iot_onboard::protocol::HubMessage;
use iot_onboard::transport::MqttConnector;
use iot_onboard::workflow::{
    channel_message_handler, IntervalTelemetrySource, SessionPhase, WorkflowOrchestrator,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Device onboarding client
#[derive(Parser)]
#[command(name = "iot-onboard")]
#[command(about = "Provision a device and stream telemetry to its assigned hub")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the device and print the assignment
    Provision,
    /// Provision, open the hub session and send telemetry until interrupted
    Run {
        /// Telemetry messages to send once the session is ready
        #[arg(long, default_value_t = 1)]
        messages: u32,
        /// Start periodic telemetry
        #[arg(long)]
        periodic: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["onboard.toml", "config/onboard.toml"];
const MESSAGE_BUFFER: usize = 64;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting iot-onboard v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Provision => provision(config).await,
        Commands::Run { messages, periodic } => run(config, messages, periodic).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> ClientResult<OnboardConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(OnboardConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(OnboardConfig::load_from_file(&path)?);
        }
    }

    error!("No configuration file found. Please provide one with -c/--config or create onboard.toml");
    process::exit(1);
}

fn build_orchestrator(config: &OnboardConfig) -> ClientResult<WorkflowOrchestrator<MqttConnector>> {
    let settings = config.to_settings();
    let connector = match &config.tls {
        Some(tls) => MqttConnector::new(tls.load()?),
        None => {
            warn!("mqtt.insecure is set, connecting without TLS");
            MqttConnector::plaintext()
        }
    };
    let source = Arc::new(IntervalTelemetrySource::new(
        settings.session.telemetry_interval,
    ));

    Ok(WorkflowOrchestrator::new(
        config.identity()?,
        connector,
        settings.provisioning,
        settings.session,
        source,
    ))
}

async fn provision(config: OnboardConfig) -> ClientResult<()> {
    let orchestrator = build_orchestrator(&config)?;
    let assignment = orchestrator.start_provisioning().await?;

    println!("endpoint = {}", assignment.endpoint);
    println!("device_id = {}", assignment.device_id);
    Ok(())
}

fn log_hub_message(message: &HubMessage) {
    info!(
        topic = %message.topic,
        kind = ?message.kind,
        command = ?message.command_name(),
        request_id = ?message.request_id(),
        payload = %String::from_utf8_lossy(&message.payload),
        "Hub message"
    );
}

async fn run(config: OnboardConfig, messages: u32, periodic: bool) -> ClientResult<()> {
    let orchestrator = Arc::new(build_orchestrator(&config)?);

    let (tx, mut rx) = mpsc::channel::<HubMessage>(MESSAGE_BUFFER);
    orchestrator.set_message_handler(channel_message_handler(tx));
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            log_hub_message(&message);
        }
    });

    orchestrator.start_provisioning().await?;
    orchestrator.start_session().await?;

    for sequence in 0..messages {
        let payload = Bytes::from(format!(r#"{{"message":{sequence}}}"#));
        if let Err(e) = orchestrator.send_telemetry_once(Some(payload)).await {
            warn!(error = %e, "Telemetry send failed");
        }
    }
    if periodic {
        orchestrator.toggle_periodic_telemetry().await;
    }

    let mut phase_rx = match orchestrator.session_handle() {
        Some(handle) => handle.subscribe_phase(),
        None => return Ok(()),
    };

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Session running, press Ctrl-C to stop");

    let mut changes = orchestrator.outcome_changes();
    let mut last = orchestrator.current_outcome();
    info!(outcome = ?last, "Workflow outcome");
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            _ = phase_rx.wait_for(|phase| *phase == SessionPhase::Idle) => {
                error!("Hub session lost, shutting down...");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let outcome = orchestrator.current_outcome();
                if outcome != last {
                    info!(outcome = ?outcome, "Workflow outcome");
                    last = outcome;
                }
            }
        }
    }

    orchestrator.end_session().await;
    info!(
        outcome = ?orchestrator.current_outcome(),
        metrics = ?metrics().snapshot(),
        "Session closed"
    );
    Ok(())
}

fn handle_config_command(config: &OnboardConfig, show: bool) -> ClientResult<()> {
    if show {
        match toml::to_string_pretty(config) {
            Ok(rendered) => {
                println!("Current configuration:");
                println!("{rendered}");
            }
            Err(e) => warn!(error = %e, "Failed to render configuration"),
        }
    }

    info!("Configuration validation complete");
    Ok(())
}
