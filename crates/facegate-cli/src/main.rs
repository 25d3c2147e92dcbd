use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{Descriptor, StoredDescriptor};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "facegate", about = "facegate face identification and QR scanning CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start capturing
    Start {
        /// Detection mode: "face" or "qr"
        #[arg(short, long, default_value = "face")]
        mode: String,
    },
    /// Stop capturing and release the camera
    Stop,
    /// Switch detection mode
    Mode {
        /// "face" or "qr"
        mode: String,
    },
    /// Enroll a face descriptor for an identity
    Enroll {
        /// Identity the descriptor belongs to
        #[arg(short, long)]
        identity: String,
        /// JSON file holding {"descriptor": [...]}
        #[arg(short, long, conflicts_with = "capture")]
        descriptor: Option<PathBuf>,
        /// Capture from the live face stream instead
        #[arg(short, long)]
        capture: bool,
    },
    /// List enrolled descriptors
    List {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Reload the gallery from storage
    Reload,
    /// Show session status
    Status,
    /// List local V4L2 capture devices (bypasses the daemon)
    Devices,
}

#[zbus::proxy(
    interface = "org.facegate.Session1",
    default_service = "org.facegate.Session1",
    default_path = "/org/facegate/Session1"
)]
trait Session {
    async fn start(&self, mode: &str) -> zbus::Result<()>;
    async fn stop(&self) -> zbus::Result<()>;
    async fn set_mode(&self, mode: &str) -> zbus::Result<String>;
    async fn enroll(&self, identity: &str, descriptor_json: &str) -> zbus::Result<u32>;
    async fn enroll_capture(&self, identity: &str) -> zbus::Result<u32>;
    async fn list_enrollments(&self) -> zbus::Result<String>;
    async fn reload(&self) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
}

async fn connect() -> Result<SessionProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    SessionProxy::new(&conn)
        .await
        .context("facegated is not running")
}

fn read_descriptor(path: &PathBuf) -> Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let descriptor: Descriptor = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a {{\"descriptor\": [...]}} record", path.display()))?;
    if descriptor.descriptor.is_empty() {
        bail!("{}: descriptor is empty", path.display());
    }
    Ok(serde_json::to_string(&descriptor)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { mode } => {
            connect().await?.start(&mode).await?;
            println!("Capturing in {mode} mode");
        }
        Commands::Stop => {
            connect().await?.stop().await?;
            println!("Stopped");
        }
        Commands::Mode { mode } => {
            let outcome = connect().await?.set_mode(&mode).await?;
            println!("Mode {mode}: {outcome}");
        }
        Commands::Enroll {
            identity,
            descriptor,
            capture,
        } => {
            let proxy = connect().await?;
            let count = match (descriptor, capture) {
                (Some(path), false) => {
                    let json = read_descriptor(&path)?;
                    proxy.enroll(&identity, &json).await?
                }
                (None, true) => {
                    println!("Look at the camera...");
                    proxy.enroll_capture(&identity).await?
                }
                _ => bail!("pass either --descriptor <file> or --capture"),
            };
            println!("Enrolled {identity} ({count} embedding(s))");
        }
        Commands::List { json } => {
            let raw = connect().await?.list_enrollments().await?;
            if json {
                println!("{raw}");
            } else {
                let rows: Vec<StoredDescriptor> = serde_json::from_str(&raw)?;
                if rows.is_empty() {
                    println!("No faces enrolled");
                }
                for row in rows {
                    println!(
                        "{:>5}  {:<24} {:>4} dims  {}",
                        row.id,
                        row.identity,
                        row.descriptor.descriptor.len(),
                        row.created_at
                    );
                }
            }
        }
        Commands::Reload => {
            let identities = connect().await?.reload().await?;
            println!("Gallery reloaded: {identities} identities");
        }
        Commands::Status => {
            let raw = connect().await?.status().await?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Devices => {
            let devices = facegate_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
    }

    Ok(())
}
