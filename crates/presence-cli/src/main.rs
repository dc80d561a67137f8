use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use presence_hw::{BrokerConfig, Camera, Frame, FrameBroker, V4l2Backend};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "presence", about = "Presence attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an attendance session
    Start {
        /// Session identifier (e.g., a class or meeting id)
        session: String,
    },
    /// End an attendance session
    End { session: String },
    /// Identify whoever is in front of the camera
    Identify,
    /// Enroll a new identity from live camera samples
    Enroll {
        /// Identity to register (e.g., a student id)
        identity: String,
        /// Extra metadata as a JSON object
        #[arg(long)]
        meta: Option<String>,
    },
    /// Reload the daemon's local cache from the remote index
    Sync,
    /// Show daemon status
    Status,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// Device to test; defaults to every /dev/video* node found
        #[arg(short, long)]
        device: Option<String>,
        /// Save one captured frame as a PNG
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

// `#[zbus::proxy]` generates `PresenceProxy` (async) and `PresenceProxyBlocking`.
#[zbus::proxy(
    interface = "org.presence.Presence1",
    default_service = "org.presence.Presence1",
    default_path = "/org/presence/Presence1"
)]
trait Presence {
    async fn start_session(&self, session: &str) -> zbus::Result<bool>;
    async fn end_session(&self, session: &str) -> zbus::Result<bool>;
    async fn identify(&self) -> zbus::Result<String>;
    async fn enroll(&self, identity: &str, metadata: &str) -> zbus::Result<String>;
    async fn sync_cache(&self) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { session } => {
            let proxy = connect(cli.session_bus).await?;
            if proxy.start_session(&session).await? {
                println!("Session {session} started");
            } else {
                println!("Session {session} is already running");
            }
        }
        Commands::End { session } => {
            let proxy = connect(cli.session_bus).await?;
            if proxy.end_session(&session).await? {
                println!("Session {session} ended");
            } else {
                println!("Session {session} was not running");
            }
        }
        Commands::Identify => {
            let proxy = connect(cli.session_bus).await?;
            let outcome = parse_json(&proxy.identify().await?)?;
            println!(
                "{} (confidence {:.3}, via {})",
                outcome["identity"].as_str().unwrap_or("Unknown"),
                outcome["confidence"].as_f64().unwrap_or(0.0),
                outcome["source"].as_str().unwrap_or("?"),
            );
        }
        Commands::Enroll { identity, meta } => {
            let meta = meta.unwrap_or_default();
            if !meta.trim().is_empty() {
                let parsed = parse_json(&meta).context("--meta is not valid JSON")?;
                if !parsed.is_object() {
                    bail!("--meta must be a JSON object");
                }
            }
            let proxy = connect(cli.session_bus).await?;
            println!("Look at the camera...");
            let outcome = parse_json(&proxy.enroll(&identity, &meta).await?)?;
            println!(
                "Enrolled {identity} from {} samples{}",
                outcome["samples_used"],
                if outcome["remote_stored"].as_bool() == Some(true) {
                    ""
                } else {
                    " (local cache only)"
                }
            );
        }
        Commands::Sync => {
            let proxy = connect(cli.session_bus).await?;
            let count = proxy.sync_cache().await?;
            println!("Cache synced: {count} identities");
        }
        Commands::Status => {
            let proxy = connect(cli.session_bus).await?;
            let status = parse_json(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Test { device, save } => {
            tokio::task::spawn_blocking(move || camera_test(device, save.as_deref())).await??;
        }
    }

    Ok(())
}

fn bus_label(session_bus: bool) -> &'static str {
    if session_bus {
        "session"
    } else {
        "system"
    }
}

async fn connect(session_bus: bool) -> Result<PresenceProxy<'static>> {
    tracing::debug!(bus = bus_label(session_bus), "connecting to presenced");
    let conn = if session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("cannot reach D-Bus")?;
    PresenceProxy::new(&conn)
        .await
        .context("presenced is not running")
}

fn parse_json(raw: &str) -> Result<serde_json::Value> {
    Ok(serde_json::from_str(raw)?)
}

/// Open the camera through the broker, report on the first fresh frame and
/// optionally save it.
fn camera_test(device: Option<String>, save: Option<&Path>) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = Camera::list_devices();
    for info in &devices {
        println!("  {}: {} ({}, {})", info.path, info.name, info.driver, info.bus);
    }

    let paths: Vec<String> = match device {
        Some(d) => vec![d],
        None => devices.into_iter().map(|d| d.path).collect(),
    };
    if paths.is_empty() {
        bail!("no video devices found");
    }

    tracing::debug!(devices = ?paths, "opening camera for diagnostics");
    let broker = FrameBroker::new(V4l2Backend::strategies(&paths), BrokerConfig::default());
    if !broker.acquire() {
        bail!("no backend could open {}", paths.join(", "));
    }

    let frame = wait_for_frame(&broker, Duration::from_secs(3));
    let status = broker.status();
    broker.release();

    let frame = frame.context("camera opened but produced no fresh frame")?;
    println!("Backend:    {}", status.backend.as_deref().unwrap_or("?"));
    println!("Resolution: {}x{}", frame.width, frame.height);
    println!("Brightness: {:.1}", frame.avg_brightness());
    println!("Dark frame: {}", if frame.is_dark { "yes" } else { "no" });

    if let Some(path) = save {
        let image = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame buffer does not match its dimensions")?;
        image
            .save(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Saved:      {}", path.display());
    }

    Ok(())
}

fn wait_for_frame(broker: &FrameBroker, timeout: Duration) -> Option<Frame> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(frame) = broker.get_frame() {
            return Some(frame);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
