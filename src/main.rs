//! Command line front end for the MQTT adapter
//!
//! `listen` keeps a session open and prints incoming messages, `publish`
//! sends one message, `config` validates or prints the configuration.

use clap::{Parser, Subcommand, ValueEnum};
use mqtt_adapter::config::AdapterConfig;
use mqtt_adapter::observability::{init_default_logging, init_logging, LogFormat};
use mqtt_adapter::runtime::TokioEventLoop;
use mqtt_adapter::session::qos_from_u8;
use mqtt_adapter::transport::mqtt::{
    ClientEvent, Message, MqttClient, ReconnectDecision, ReconnectPolicy, TcpEngine,
};
use mqtt_adapter::{mqtt_span, session_span, ConnectionState};
use rumqttc::QoS;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tokio::signal;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{error, info, warn, Instrument};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Event-loop driven MQTT client
#[derive(Parser)]
#[command(name = "mqtt-adapter")]
#[command(about = "Event-loop driven MQTT client")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe and print incoming messages until interrupted
    Listen {
        /// Additional subscription filters
        #[arg(short, long = "topic", value_name = "FILTER")]
        topics: Vec<String>,

        /// QoS for the filters given with --topic
        #[arg(short, long, default_value_t = 0)]
        qos: u8,

        /// Output format
        #[arg(short, long, default_value = "pretty")]
        format: OutputFormat,
    },
    /// Publish one message and exit
    Publish {
        #[arg(short, long)]
        topic: String,

        #[arg(short, long, default_value = "")]
        message: String,

        #[arg(short, long, default_value_t = 0)]
        qos: u8,

        #[arg(short, long)]
        retain: bool,

        /// Give up if the message is not delivered in time
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

/// Output formatting options
#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    /// Timestamp, topic and payload, JSON payloads pretty printed
    Pretty,
    /// Single line per message
    Compact,
    /// One JSON object per message
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let logging = match cli.verbose {
        0 => init_default_logging(),
        verbose => {
            let level = if verbose == 1 {
                tracing::Level::DEBUG
            } else {
                tracing::Level::TRACE
            };
            let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default());
            init_logging(level, format, false)
        }
    };
    if let Err(e) = logging {
        eprintln!("Failed to initialise logging: {e}");
    }

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Listen {
            topics,
            qos,
            format,
        } => listen(config, topics, qos, format).await,
        Commands::Publish {
            topic,
            message,
            qos,
            retain,
            timeout_secs,
        } => {
            let span = mqtt_span!(topic = %topic, qos);
            publish(config, topic, message, qos, retain, Duration::from_secs(timeout_secs))
                .instrument(span)
                .await
        }
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: Option<&Path>) -> CliResult<AdapterConfig> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AdapterConfig::load_from_file(path)?);
    }

    for candidate in ["mqtt-adapter.toml", "config/mqtt-adapter.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AdapterConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults");
    Ok(AdapterConfig::default())
}

fn parse_qos(level: u8) -> CliResult<QoS> {
    qos_from_u8(level).ok_or_else(|| format!("QoS must be 0, 1 or 2, got {level}").into())
}

fn build_client(config: &AdapterConfig) -> CliResult<MqttClient<TcpEngine, TokioEventLoop>> {
    let session = config.to_session_config()?;
    Ok(MqttClient::with_options(
        TcpEngine::new(),
        TokioEventLoop::new(),
        session,
        config.client_options(),
    ))
}

async fn listen(
    config: AdapterConfig,
    topics: Vec<String>,
    qos: u8,
    format: OutputFormat,
) -> CliResult<()> {
    let extra_qos = parse_qos(qos)?;
    let mut subscriptions: Vec<(String, QoS, Option<i32>)> = config
        .subscriptions
        .iter()
        .map(|s| (s.topic.clone(), s.qos(), s.id))
        .collect();
    subscriptions.extend(topics.into_iter().map(|topic| (topic, extra_qos, None)));
    if subscriptions.is_empty() {
        warn!("No subscriptions configured, only session events will be shown");
    }

    let mut client = build_client(&config)?;
    let span = session_span!(
        host = %client.settings().config().hostname,
        port = client.settings().config().port
    );
    run_listener(&mut client, &subscriptions, format)
        .instrument(span)
        .await
}

async fn run_listener(
    client: &mut MqttClient<TcpEngine, TokioEventLoop>,
    subscriptions: &[(String, QoS, Option<i32>)],
    format: OutputFormat,
) -> CliResult<()> {
    let policy = ReconnectPolicy::default();
    let mut events = client.event_channel();
    let mut attempts: u32 = 0;
    let mut reconnect_at: Option<Instant> = None;

    if let Err(e) = client.connect_to_host() {
        warn!("Initial connect failed: {}", e);
        reconnect_at = schedule_reconnect(&policy, &mut attempts);
    }

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                info!("Received interrupt, shutting down");
                break;
            }
            event = client.event_loop_mut().next_event() => {
                client.handle_event(event);
            }
            Some(event) = events.recv() => {
                match event {
                    ClientEvent::Connected => {
                        info!("Connected to broker");
                        attempts = 0;
                        for (filter, qos, id) in subscriptions {
                            let result = match id {
                                Some(id) => client.subscribe_with_id(filter, *qos, *id),
                                None => client.subscribe(filter, *qos),
                            };
                            if let Err(e) = result {
                                error!(filter = %filter, "Subscribe failed: {}", e);
                            }
                        }
                    }
                    ClientEvent::Message { message, id } => print_message(&message, id, format),
                    ClientEvent::Subscribed { topic, granted, .. } => {
                        if granted.contains(&0x80) {
                            warn!(?topic, "Broker rejected subscription");
                        } else {
                            info!(?topic, ?granted, "Subscribed");
                        }
                    }
                    ClientEvent::Error(e) => warn!(status = ?e.status_code(), "{}", e),
                    ClientEvent::Disconnected { code } => warn!(code, "Disconnected from broker"),
                    _ => {}
                }

                if client.state() == ConnectionState::Disconnected && reconnect_at.is_none() {
                    reconnect_at = schedule_reconnect(&policy, &mut attempts);
                    if reconnect_at.is_none() {
                        return Err("giving up after repeated reconnect failures".into());
                    }
                }
            }
            _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                reconnect_at = None;
                if let Err(e) = client.reconnect_to_host() {
                    warn!(attempt = attempts, "Reconnect failed: {}", e);
                    reconnect_at = schedule_reconnect(&policy, &mut attempts);
                    if reconnect_at.is_none() {
                        return Err(e.into());
                    }
                }
            }
        }
    }

    if client.state() != ConnectionState::Disconnected {
        client.disconnect_from_host()?;
    }
    Ok(())
}

fn schedule_reconnect(policy: &ReconnectPolicy, attempts: &mut u32) -> Option<Instant> {
    match policy.decide(*attempts, false) {
        ReconnectDecision::Proceed { attempt, delay_ms } => {
            *attempts = attempt;
            info!(attempt, delay_ms, "Scheduling reconnect");
            Some(Instant::now() + Duration::from_millis(delay_ms))
        }
        ReconnectDecision::AbortShutdownRequested | ReconnectDecision::AbortMaxAttemptsExceeded => {
            error!(attempts = *attempts, "Not reconnecting");
            None
        }
    }
}

async fn publish(
    config: AdapterConfig,
    topic: String,
    message: String,
    qos: u8,
    retain: bool,
    timeout: Duration,
) -> CliResult<()> {
    let qos = parse_qos(qos)?;
    let mut client = build_client(&config)?;
    let mut events = client.event_channel();
    client.connect_to_host()?;

    let deadline = sleep(timeout);
    tokio::pin!(deadline);
    let mut sent: Option<u16> = None;

    loop {
        if sent == Some(0) && !client.has_pending_output() {
            break;
        }

        tokio::select! {
            _ = &mut deadline => return Err("timed out waiting for delivery".into()),
            event = client.event_loop_mut().next_event() => {
                client.handle_event(event);
            }
            Some(event) = events.recv() => match event {
                ClientEvent::Connected => {
                    let mid = client.publish_text(&topic, &message, qos, retain)?;
                    info!(mid, "Message queued");
                    sent = Some(mid);
                }
                ClientEvent::Published { mid, .. } if Some(mid) == sent => {
                    info!(mid, "Message delivered");
                    break;
                }
                ClientEvent::Error(e) => return Err(e.into()),
                ClientEvent::Disconnected { code } => {
                    return Err(format!("disconnected before delivery (code {code})").into());
                }
                _ => {}
            }
        }
    }

    client.disconnect_from_host()?;
    Ok(())
}

fn print_message(message: &Message, id: Option<i32>, format: OutputFormat) {
    let timestamp = chrono::Utc::now();
    let text = message.text();
    let parsed = serde_json::from_str::<serde_json::Value>(&text).ok();

    match format {
        OutputFormat::Json => {
            let line = serde_json::json!({
                "timestamp": timestamp.to_rfc3339(),
                "topic": message.topic,
                "id": id,
                "qos": mqtt_adapter::session::qos_to_u8(message.qos),
                "retain": message.retain,
                "payload": parsed.unwrap_or_else(|| serde_json::Value::String(text.to_string())),
            });
            println!("{line}");
        }
        OutputFormat::Compact => println!(
            "{} {} {}",
            timestamp.format("%H:%M:%S"),
            message.topic,
            text.replace('\n', " ").trim()
        ),
        OutputFormat::Pretty => {
            let payload = parsed
                .and_then(|json| serde_json::to_string_pretty(&json).ok())
                .unwrap_or_else(|| text.to_string());
            let id = id.map(|id| format!(" [{id}]")).unwrap_or_default();
            println!(
                "{} {}{}{}\n{}\n",
                timestamp.format("%H:%M:%S"),
                message.topic,
                id,
                if message.retain { " (retained)" } else { "" },
                payload
            );
        }
    }
}

fn handle_config_command(config: &AdapterConfig, show: bool) -> CliResult<()> {
    let session = config.to_session_config()?;
    if show {
        println!("{}", config.to_display_string()?);
    }
    info!(
        host = %session.hostname,
        port = session.port,
        subscriptions = config.subscriptions.len(),
        "Configuration is valid"
    );
    Ok(())
}
