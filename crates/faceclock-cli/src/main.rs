use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "faceclock", about = "faceclock attendance face identity CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face for an identity that has none yet
    Enroll {
        /// Identity key (e.g., employee id)
        key: String,
        /// JPEG, PNG or WEBP image containing exactly one face
        image: PathBuf,
    },
    /// Replace the enrolled face for an identity
    Replace { key: String, image: PathBuf },
    /// Verify a face against the enrolled one
    Verify { key: String, image: PathBuf },
    /// Show whether an identity has an enrolled face
    Status { key: String },
    /// Remove an identity's enrolled face
    Remove { key: String },
    /// Show enrollment counts
    Stats,
    /// Show daemon health
    Health,
}

#[zbus::proxy(
    interface = "org.faceclock.Attendance1",
    default_service = "org.faceclock.Attendance1",
    default_path = "/org/faceclock/Attendance1"
)]
trait Attendance {
    fn enroll(&self, identity_key: &str, image: &[u8]) -> zbus::Result<String>;
    fn replace(&self, identity_key: &str, image: &[u8]) -> zbus::Result<String>;
    fn verify(&self, identity_key: &str, image: &[u8]) -> zbus::Result<String>;
    fn status(&self, identity_key: &str) -> zbus::Result<String>;
    fn remove(&self, identity_key: &str) -> zbus::Result<String>;
    fn statistics(&self) -> zbus::Result<String>;
    fn health(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn).await?;
    tracing::debug!(session = cli.session, "connected to faceclockd");

    let reply = match &cli.command {
        Commands::Enroll { key, image } => proxy.enroll(key, &read_image(image)?).await,
        Commands::Replace { key, image } => proxy.replace(key, &read_image(image)?).await,
        Commands::Verify { key, image } => proxy.verify(key, &read_image(image)?).await,
        Commands::Status { key } => proxy.status(key).await,
        Commands::Remove { key } => proxy.remove(key).await,
        Commands::Stats => proxy.statistics().await,
        Commands::Health => proxy.health().await,
    }
    .context("faceclockd request failed")?;

    let value: serde_json::Value =
        serde_json::from_str(&reply).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);

    if !succeeded(&cli.command, &value) {
        std::process::exit(1);
    }
    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Enrollment and verification exit non-zero when the daemon said no.
fn succeeded(command: &Commands, reply: &serde_json::Value) -> bool {
    match command {
        Commands::Enroll { .. } | Commands::Replace { .. } => reply["success"] == true,
        Commands::Verify { .. } => reply["verified"] == true,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enroll() {
        let cli = Cli::try_parse_from(["faceclock", "enroll", "emp-1", "/tmp/face.jpg"]).unwrap();
        assert!(!cli.session);
        match cli.command {
            Commands::Enroll { key, image } => {
                assert_eq!(key, "emp-1");
                assert_eq!(image, PathBuf::from("/tmp/face.jpg"));
            }
            _ => panic!("expected enroll"),
        }
    }

    #[test]
    fn test_session_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["faceclock", "stats", "--session"]).unwrap();
        assert!(cli.session);
        assert!(matches!(cli.command, Commands::Stats));
    }

    #[test]
    fn test_verify_requires_image() {
        assert!(Cli::try_parse_from(["faceclock", "verify", "emp-1"]).is_err());
    }

    #[test]
    fn test_exit_status_follows_reply() {
        let verify = Commands::Verify { key: "emp-1".into(), image: "x.png".into() };
        assert!(succeeded(&verify, &serde_json::json!({"status": "completed", "verified": true})));
        let rejected = serde_json::json!({"status": "rejected", "reason": "no_face"});
        assert!(!succeeded(&verify, &rejected));

        let enroll = Commands::Enroll { key: "emp-1".into(), image: "x.png".into() };
        assert!(!succeeded(&enroll, &serde_json::json!({"success": false})));
        assert!(succeeded(&Commands::Stats, &serde_json::json!({"total": 0})));
    }
}
