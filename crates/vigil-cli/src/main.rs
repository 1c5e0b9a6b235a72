use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil proctoring monitor CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a monitored session
    Start {
        /// Camera device (defaults to the daemon's configured device)
        #[arg(short, long, default_value = "")]
        device: String,
    },
    /// End the active session
    End,
    /// Switch the active session to another camera
    Switch {
        #[arg(short, long)]
        device: String,
    },
    /// Remove the camera from the active session
    Detach,
    /// Show daemon status
    Status,
    /// Print monitoring flags as they change
    Watch {
        /// Polling interval in milliseconds
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// Run camera diagnostics
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Save the captured frame as a PNG
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

#[zbus::proxy(
    interface = "org.freedesktop.Vigil1",
    default_service = "org.freedesktop.Vigil1",
    default_path = "/org/freedesktop/Vigil1"
)]
trait Vigil {
    async fn start_session(&self, camera_device: &str) -> zbus::Result<String>;
    async fn end_session(&self) -> zbus::Result<bool>;
    async fn switch_camera(&self, camera_device: &str) -> zbus::Result<bool>;
    async fn detach_camera(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

async fn connect() -> Result<zbus::Connection> {
    let system = std::env::var("VIGIL_SYSTEM_BUS").is_ok_and(|v| v == "1");
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    };
    conn.context("failed to connect to D-Bus")
}

async fn proxy(conn: &zbus::Connection) -> Result<VigilProxy<'_>> {
    VigilProxy::new(conn)
        .await
        .context("vigild is not reachable")
}

fn report(done: bool, ok: &str, none: &str) {
    println!("{}", if done { ok } else { none });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Test { device, save } => camera_test(&device, save.as_deref())?,
        Commands::Start { device } => {
            let conn = connect().await?;
            let id = proxy(&conn).await?.start_session(&device).await?;
            println!("Session started: {id}");
        }
        Commands::End => {
            let conn = connect().await?;
            report(proxy(&conn).await?.end_session().await?, "Session ended", "No active session");
        }
        Commands::Switch { device } => {
            let conn = connect().await?;
            let switched = proxy(&conn).await?.switch_camera(&device).await?;
            report(switched, "Camera switched", "No active session");
        }
        Commands::Detach => {
            let conn = connect().await?;
            report(proxy(&conn).await?.detach_camera().await?, "Camera detached", "No active session");
        }
        Commands::Status => {
            let conn = connect().await?;
            let status: serde_json::Value = serde_json::from_str(&proxy(&conn).await?.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Watch { interval_ms } => {
            let conn = connect().await?;
            watch(&proxy(&conn).await?, interval_ms).await?;
        }
    }

    Ok(())
}

async fn watch(vigil: &VigilProxy<'_>, interval_ms: u64) -> Result<()> {
    tracing::debug!(interval_ms, "watching monitor state");
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(50)));
    let mut last = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = interval.tick() => {}
        }
        let status: serde_json::Value = serde_json::from_str(&vigil.status().await?)?;
        let monitor = status["monitor"].clone();
        if last.as_ref() == Some(&monitor) {
            continue;
        }
        println!("{}", describe(&monitor));
        last = Some(monitor);
    }
}

fn describe(monitor: &serde_json::Value) -> String {
    if let Some(error) = monitor["error"].as_str() {
        return format!("error: {error}");
    }
    if monitor["isMonitoring"] != true {
        return "not monitoring".to_string();
    }
    let source = monitor["detectorSource"].as_str().unwrap_or("unknown");
    let flags: Vec<String> = monitor["flags"]
        .as_array()
        .map(|flags| {
            flags
                .iter()
                .map(|f| {
                    format!(
                        "{} since {}",
                        f["message"].as_str().unwrap_or("?"),
                        f["since"].as_str().unwrap_or("?")
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    if flags.is_empty() {
        format!("[{source}] ok")
    } else {
        format!("[{source}] {}", flags.join("; "))
    }
}

fn camera_test(device: &str, save: Option<&std::path::Path>) -> Result<()> {
    println!("Running camera diagnostics on {device}...");
    for info in vigil_hw::Camera::list_devices() {
        println!("  found {} ({}, {})", info.path, info.name, info.driver);
    }

    let camera = vigil_hw::Camera::open(device)?;
    let frame = camera.capture_frame()?;
    println!(
        "Captured {}x{} frame, format {:?}, brightness {:.1}",
        frame.width,
        frame.height,
        camera.fourcc,
        frame.avg_brightness()
    );

    if let Some(path) = save {
        let image = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame buffer does not match its dimensions")?;
        image
            .save(path)
            .with_context(|| format!("failed to save {}", path.display()))?;
        println!("Saved frame to {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_describe_idle_and_error() {
        assert_eq!(describe(&json!({ "isMonitoring": false, "error": null })), "not monitoring");
        assert_eq!(
            describe(&json!({ "isMonitoring": false, "error": "face detector unavailable: x" })),
            "error: face detector unavailable: x"
        );
    }

    #[test]
    fn test_describe_flags() {
        let monitor = json!({
            "isMonitoring": true,
            "detectorSource": "fallback",
            "flags": [{ "type": "no_face", "message": "No face detected", "since": "2026-01-01T00:00:00Z" }],
        });
        assert_eq!(describe(&monitor), "[fallback] No face detected since 2026-01-01T00:00:00Z");
        assert_eq!(
            describe(&json!({ "isMonitoring": true, "detectorSource": "native", "flags": [] })),
            "[native] ok"
        );
    }
}
