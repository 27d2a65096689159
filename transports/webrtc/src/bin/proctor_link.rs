//! Proctor link binary entry point
//!
//! Runs either side of the proctoring stream against a signaling relay.
//!
//! # Usage
//!
//! ```bash
//! # Exam taker: serve stream requests for one participant
//! cargo run --bin proctor_link -- \
//!   --relay-url ws://localhost:5000/signaling \
//!   publisher --exam-id exam-1 --participant-id student-7
//!
//! # Proctor: watch two sessions (session=participant)
//! cargo run --bin proctor_link -- \
//!   viewer --exam-id exam-1 --participant-id proctor-1 \
//!   --watch attempt-1=student-7,attempt-2=student-8
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use proctor_link::{
    CaptureManager, ChannelRegistry, DesiredSessions, ParticipantId, PublisherService,
    ReconciliationLoop, Role, RtcTransportFactory, SampleTrackDevice, SessionId,
    SignalingContext, StreamStateStore, StreamingConfig, ViewerService,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Proctoring peer-stream client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Signaling relay URL
    #[arg(
        long,
        default_value = "ws://localhost:5000/signaling",
        env = "PROCTOR_RELAY_URL"
    )]
    relay_url: String,

    /// STUN server used for candidate gathering
    #[arg(
        long,
        default_value = "stun:stun.l.google.com:19302",
        env = "PROCTOR_STUN_SERVER"
    )]
    stun_server: String,

    /// Maximum relay reconnection attempts
    #[arg(long, default_value_t = 5, env = "PROCTOR_MAX_RECONNECT_ATTEMPTS")]
    max_reconnect_attempts: u32,

    /// Seconds before a stuck negotiation is re-requested (0 disables)
    #[arg(long, default_value_t = 30, env = "PROCTOR_NEGOTIATION_DEADLINE")]
    negotiation_deadline_secs: u64,

    /// Emit JSON logs
    #[arg(long, default_value_t = false, env = "PROCTOR_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Exam taker side
    Publisher {
        /// Exam identifier
        #[arg(long)]
        exam_id: String,

        /// Local participant (student) identifier
        #[arg(long)]
        participant_id: String,
    },
    /// Proctor side
    Viewer {
        /// Exam identifier
        #[arg(long)]
        exam_id: String,

        /// Local participant (proctor) identifier
        #[arg(long)]
        participant_id: String,

        /// Sessions to watch as session=participant pairs
        #[arg(long, value_delimiter = ',', value_parser = parse_watch)]
        watch: Vec<(SessionId, ParticipantId)>,
    },
}

fn parse_watch(s: &str) -> Result<(SessionId, ParticipantId), String> {
    match s.split_once('=') {
        Some((session, participant)) if !session.is_empty() && !participant.is_empty() => {
            Ok((SessionId::new(session), ParticipantId::new(participant)))
        }
        _ => Err(format!(
            "Invalid watch entry: '{}'. Expected: session=participant",
            s
        )),
    }
}

fn build_config(args: &Args) -> anyhow::Result<StreamingConfig> {
    let mut config = StreamingConfig {
        relay_url: args.relay_url.clone(),
        stun_server: args.stun_server.clone(),
        negotiation_deadline_secs: Some(args.negotiation_deadline_secs).filter(|s| *s > 0),
        ..Default::default()
    };
    config.reconnect.max_attempts = args.max_reconnect_attempts;

    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = build_config(&args)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        relay_url = %config.relay_url,
        stun_server = %config.stun_server,
        max_reconnect_attempts = config.reconnect.max_attempts,
        negotiation_deadline = ?config.negotiation_deadline(),
        "Proctor link starting"
    );

    let registry = ChannelRegistry::from_config(&config)?;
    let factory = Arc::new(RtcTransportFactory::new(&config)?);

    match args.mode {
        Mode::Publisher {
            exam_id,
            participant_id,
        } => {
            let context = SignalingContext::new(exam_id, Role::Publisher, participant_id.as_str());
            let channel = registry.open(&context);
            let capture = Arc::new(CaptureManager::new(Arc::new(SampleTrackDevice::new(
                config.video.clone(),
            ))));

            let publisher =
                PublisherService::start(channel, ParticipantId::new(participant_id), capture, factory);
            let mut notices = publisher.subscribe();

            info!(context = %context, "Serving stream requests");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    notice = notices.recv() => match notice {
                        Ok(notice) => info!(?notice, "Publisher link"),
                        Err(e) => warn!("Notice stream lagged: {}", e),
                    },
                }
            }

            publisher.shutdown();
        }
        Mode::Viewer {
            exam_id,
            participant_id,
            watch: sessions,
        } => {
            let context = SignalingContext::new(exam_id, Role::Viewer, participant_id);
            let channel = registry.open(&context);
            let store = Arc::new(StreamStateStore::new());
            let mut updates = store.subscribe();

            let viewer = ViewerService::start(channel, Arc::clone(&store), factory);
            let desired: DesiredSessions = sessions.into_iter().collect();
            let (_desired_tx, desired_rx) = watch::channel(desired);

            let reconciler = ReconciliationLoop::new(Arc::clone(&viewer), config.negotiation_deadline());
            let reconcile_task = tokio::spawn(async move { reconciler.run(desired_rx).await });

            info!(context = %context, "Watching sessions");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    update = updates.recv() => match update {
                        Ok(update) => info!(
                            session = %update.session,
                            status = %update.state.status,
                            error = ?update.state.error,
                            "Stream state"
                        ),
                        Err(e) => warn!("State stream lagged: {}", e),
                    },
                }
            }

            reconcile_task.abort();
            viewer.shutdown();
        }
    }

    info!("Shutting down");
    registry.close_all();
    Ok(())
}

fn init_tracing(json: bool) {
    // Initialize tracing with EnvFilter for RUST_LOG support
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
