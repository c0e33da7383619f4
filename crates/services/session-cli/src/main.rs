//! DH2D operator CLI
//!
//! Small tools for checking a DH2D service without a render surface.
//!
//! # Usage
//!
//! ```bash
//! # Is a user logged in? Optionally install an access token first
//! dh2d --endpoint http://localhost:32101 auth --token "$DH2D_TOKEN"
//!
//! # Open a control channel, wait for session ready and measure ping latency
//! dh2d probe --video-id liruyun --pings 5
//!
//! # Follow component install/download status until Ctrl+C
//! RUST_LOG=debug dh2d components
//! ```

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use dh2d_session::control::{
    ControlChannel, ControlConnector, ControlEvent, ControlEventKind, WsConnector,
};
use dh2d_session::protocol::{ping_timestamp, ClientMessage, ServerMessage};
use dh2d_session::{AuthCheck, ClientConfig, ComponentFeed, HttpAuthCheck, SessionConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// DH2D service tools
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Service base URL
    #[arg(long, default_value = "http://localhost:32101", env = "DH2D_ENDPOINT")]
    endpoint: String,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "DH2D_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report whether the service has a logged-in user
    Auth {
        /// Access token to install before checking
        #[arg(long, env = "DH2D_TOKEN")]
        token: Option<String>,
    },
    /// Open a control channel and measure ping round trips
    Probe {
        /// Session configuration file (TOML)
        #[arg(long, env = "DH2D_SESSION_CONFIG")]
        config: Option<PathBuf>,

        /// Avatar to request, overriding the configuration file
        #[arg(long)]
        video_id: Option<String>,

        /// Number of ping round trips
        #[arg(long, default_value_t = 3)]
        pings: u32,

        /// Seconds to wait for session ready and for each pong
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
    /// Log component status updates until Ctrl+C
    Components,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        eprintln!("\nCtrl+C received, shutting down...");
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing immediate exit");
            std::process::exit(130);
        }
    })
    .context("failed to set Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("dh2d-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    init_tracing(args.log_json);

    let client = ClientConfig::new(args.endpoint);
    client.validate()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %client.endpoint,
        "dh2d starting"
    );

    match args.command {
        Command::Auth { token } => run_auth(client, token).await,
        Command::Probe {
            config,
            video_id,
            pings,
            wait_secs,
        } => {
            let mut session = match config {
                Some(path) => SessionConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => SessionConfig::default(),
            };
            if let Some(video_id) = video_id {
                session = session.with_video_id(video_id);
            }
            run_probe(
                client,
                session,
                pings,
                Duration::from_secs(wait_secs),
                shutdown_flag,
            )
            .await
        }
        Command::Components => run_components(client, shutdown_flag).await,
    }
}

async fn run_auth(client: ClientConfig, token: Option<String>) -> anyhow::Result<()> {
    let auth = HttpAuthCheck::new(client);
    if let Some(token) = token.as_deref() {
        auth.set_auth(Some(token)).await?;
    }

    let logged_in = auth.is_logged_in().await?;
    println!("logged_in: {}", logged_in);
    Ok(())
}

async fn run_probe(
    client: ClientConfig,
    session: SessionConfig,
    pings: u32,
    wait: Duration,
    shutdown_flag: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    session.validate()?;
    let url = client.control_url(&session)?;
    info!(%url, "Opening control channel");

    let control = WsConnector::new().connect(&url).await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let text_tx = tx.clone();
    let text = control.on(ControlEventKind::Text, move |event| {
        if let ControlEvent::Text(text) = event {
            match ServerMessage::parse(text) {
                Ok(message) => {
                    let _ = text_tx.send(Some(message));
                }
                Err(e) => warn!(error = %e, "Ignoring malformed control frame"),
            }
        }
    });
    let closed = control.on(ControlEventKind::Closed, move |_| {
        let _ = tx.send(None);
    });
    control.resume();

    let result = probe_round_trips(&control, &mut rx, pings, wait, &shutdown_flag).await;

    text.unsubscribe();
    closed.unsubscribe();
    control.close();
    result
}

async fn probe_round_trips(
    control: &ControlChannel,
    rx: &mut mpsc::UnboundedReceiver<Option<ServerMessage>>,
    pings: u32,
    wait: Duration,
    shutdown_flag: &AtomicBool,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let session_id = tokio::time::timeout(wait, async {
        while let Some(message) = rx.recv().await {
            match message {
                Some(ServerMessage::SessionReady { session_id }) => return Ok(session_id),
                Some(_) => continue,
                None => break,
            }
        }
        Err(anyhow!("control channel closed before session ready"))
    })
    .await
    .map_err(|_| anyhow!("no session ready within {:?}", wait))??;
    println!(
        "session ready: {} ({} ms)",
        session_id,
        started.elapsed().as_millis()
    );

    let mut latencies = Vec::new();
    for round in 1..=pings {
        if shutdown_flag.load(Ordering::SeqCst) {
            break;
        }

        let timestamp = ping_timestamp();
        let sent = Instant::now();
        control.send(&ClientMessage::ping(&timestamp))?;

        let answered = tokio::time::timeout(wait, async {
            while let Some(message) = rx.recv().await {
                match message {
                    Some(ServerMessage::Application(app))
                        if app.pong_timestamp() == Some(timestamp.as_str()) =>
                    {
                        return Ok(());
                    }
                    Some(_) => continue,
                    None => break,
                }
            }
            Err(anyhow!("control channel closed while waiting for pong"))
        })
        .await;

        match answered {
            Ok(Ok(())) => {
                let latency = sent.elapsed();
                println!("pong {}/{}: {} ms", round, pings, latency.as_millis());
                latencies.push(latency);
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => println!("pong {}/{}: timed out after {:?}", round, pings, wait),
        }

        if round < pings {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    if let (Some(min), Some(max)) = (latencies.iter().min(), latencies.iter().max()) {
        let total: Duration = latencies.iter().sum();
        let avg = total / latencies.len() as u32;
        println!(
            "round trips: {}/{} answered, min {} ms, avg {} ms, max {} ms",
            latencies.len(),
            pings,
            min.as_millis(),
            avg.as_millis(),
            max.as_millis()
        );
    }
    Ok(())
}

async fn run_components(client: ClientConfig, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    let feed = ComponentFeed::new(client);
    let subscription = feed.on_update(|statuses| {
        for status in statuses {
            let download = status.download.as_ref();
            info!(
                component = %status.component.name,
                installed = status.is_installed(),
                local_version = status.local_version.as_deref().unwrap_or("-"),
                latest_version = status.component.version.as_deref().unwrap_or("-"),
                update_available = status.update_available(),
                download = ?download.map(|d| d.status),
                progress = download.map(|d| d.progress).unwrap_or_default(),
                "Component status"
            );
        }
    });

    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    subscription.unsubscribe();
    info!("Component feed stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    // RUST_LOG wins over the default level
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
