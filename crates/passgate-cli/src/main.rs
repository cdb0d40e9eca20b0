use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use passgate_hw::{Camera, CaptureSettings};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "passgate", about = "passgate passport photo verification CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a passport document (PDF or image) and verify it against the camera
    Process {
        /// Document to upload
        file: PathBuf,
    },
    /// Verify a document image against the camera, skipping OCR
    Verify {
        /// Image containing the reference face
        image: PathBuf,
    },
    /// Delete all uploads and results held by the daemon
    Cleanup,
    /// Show daemon status
    Status,
    /// Print the BLAKE3 hash of a passport number
    Hash {
        /// Passport number (normalized to uppercase)
        number: String,
        /// Also write a QR code of the hash to this PNG file
        #[arg(long)]
        qr: Option<PathBuf>,
    },
    /// List V4L2 capture devices
    Devices,
    /// Run a brightness-stabilized capture directly on the camera
    Test {
        /// Camera device
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Directory for the sweep frames and the captured frame
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
        /// Number of brightness sweep steps
        #[arg(long, default_value_t = 11)]
        steps: usize,
    },
}

#[zbus::proxy(
    interface = "org.passgate.Verifier1",
    default_service = "org.passgate.Verifier1",
    default_path = "/org/passgate/Verifier1"
)]
trait Verifier {
    fn process_document(&self, path: &str) -> zbus::Result<String>;
    fn verify(&self, image_path: &str) -> zbus::Result<String>;
    fn cleanup(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Process { file } => {
            let proxy = connect(cli.system).await?;
            let path = absolute(&file)?;
            println!("Processing {}...", path.display());
            let reply = proxy.process_document(&path.to_string_lossy()).await?;
            print_json(&reply)?;
        }
        Commands::Verify { image } => {
            let proxy = connect(cli.system).await?;
            let path = absolute(&image)?;
            println!("Verifying against {}...", path.display());
            let reply = proxy.verify(&path.to_string_lossy()).await?;
            print_json(&reply)?;
        }
        Commands::Cleanup => {
            let proxy = connect(cli.system).await?;
            print_json(&proxy.cleanup().await?)?;
        }
        Commands::Status => {
            let proxy = connect(cli.system).await?;
            print_json(&proxy.status().await?)?;
        }
        Commands::Hash { number, qr } => {
            let number = number.trim().to_uppercase();
            let hash = passgate_doc::codes::blake3_hex(&number);
            println!("Passport number: {number}");
            println!("BLAKE3 hash:     {hash}");
            if let Some(path) = qr {
                passgate_doc::codes::write_qr(&hash, &path)?;
                println!("QR code:         {}", path.display());
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Test { device, out, steps } => run_capture_test(&device, &out, steps)?,
    }

    Ok(())
}

async fn connect(system: bool) -> Result<VerifierProxy<'static>> {
    tracing::debug!(system, "connecting to passgated");
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    VerifierProxy::new(&conn)
        .await
        .context("passgated is not reachable")
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path).with_context(|| format!("cannot read {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn run_capture_test(device: &str, out: &Path, steps: usize) -> Result<()> {
    std::fs::create_dir_all(out).with_context(|| format!("cannot create {}", out.display()))?;
    println!("Running camera diagnostics on {device}...");

    let camera = Camera::open(device)?;
    println!("  format: {}x{} {:?}", camera.width, camera.height, camera.fourcc);

    let settings = CaptureSettings {
        sweep_steps: steps,
        diagnostics_dir: Some(out.to_path_buf()),
        timeout: Duration::from_secs(30),
        ..CaptureSettings::default()
    };
    let frame = camera.capture_stabilized(&settings)?;

    let path = out.join("live_frame.png");
    frame.save_png(&path)?;
    println!(
        "  captured frame #{} avg brightness {:.1}{}",
        frame.sequence,
        frame.avg_brightness(),
        if frame.is_dark { " (dark)" } else { "" }
    );
    println!("  saved {}", path.display());
    Ok(())
}
