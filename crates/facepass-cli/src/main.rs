use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use facepass_capture::{CaptureSession, CaptureState, V4l2Camera};
use facepass_core::{
    BoundingBox, CapturedFace, DescriptorExtractor, Embedding, EmbeddingModel, EnrollmentRegistry,
    FaceAuth, Identity, MatchResult, ModelError, ModelHandle, ModelLoadError, PassthroughEnhancer,
    Profile, RetryAction, StillFrame,
};
use facepass_store::SqliteRosterStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "facepass", about = "Face enrollment and identity matching")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List V4L2 capture devices
    Devices,
    /// Capture one still from the camera and write it as PNG
    Snapshot {
        /// Output file
        #[arg(short, long, default_value = "snapshot.png")]
        out: PathBuf,
        /// Camera device, overriding the configured one
        #[arg(short, long)]
        device: Option<String>,
        /// Let exposure settle this long before grabbing
        #[arg(long, default_value_t = 500)]
        warmup_ms: u64,
    },
    /// List enrolled identities
    List {
        #[arg(long)]
        json: bool,
    },
    /// Remove an enrolled identity
    Remove {
        /// Identity ID to remove
        id: String,
    },
    /// Enroll an identity from a face image and its precomputed embedding
    Enroll {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        email: String,
        /// JSON file: an array of numbers, or {"values": [...], "model_version": "..."}
        #[arg(long)]
        embedding: PathBuf,
        /// Face image (PNG or JPEG)
        #[arg(long)]
        image: PathBuf,
    },
    /// Match a precomputed embedding against the roster
    Match {
        #[arg(long)]
        embedding: PathBuf,
        /// Make the matched identity the active one
        #[arg(long)]
        login: bool,
    },
    /// Show the active identity
    Whoami,
    /// Clear the active identity
    Logout,
}

/// The CLI ships without inference weights. Descriptors come in precomputed,
/// and camera capture runs with face gating off.
struct NoModel;

#[async_trait]
impl EmbeddingModel for NoModel {
    async fn ready(&self) -> Result<(), ModelLoadError> {
        Err(ModelLoadError::WeightsMissing(
            "no embedding model is bundled with the facepass CLI".into(),
        ))
    }

    async fn detect_faces(&self, _frame: &StillFrame) -> Result<Vec<BoundingBox>, ModelError> {
        Ok(Vec::new())
    }

    async fn extract_embedding(&self, _frame: &StillFrame) -> Result<Option<Embedding>, ModelError> {
        Ok(None)
    }

    fn dimension(&self) -> usize {
        0
    }
}

type Auth = FaceAuth<NoModel, PassthroughEnhancer, SqliteRosterStore>;

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingFile {
    Bare(Vec<f32>),
    Tagged(Embedding),
}

#[derive(Serialize)]
struct IdentitySummary<'a> {
    id: &'a str,
    display_name: &'a str,
    email: &'a str,
    is_privileged: bool,
    enrolled_at: &'a str,
    dimension: usize,
    model_version: Option<&'a str>,
    active: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    tracing::debug!(source = ?config.source, db = %config.db_path.display(), "config resolved");

    match cli.command {
        Commands::Devices => {
            let devices = V4l2Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Snapshot {
            out,
            device,
            warmup_ms,
        } => {
            let device = device.unwrap_or_else(|| config.camera_device.clone());
            let frame = snapshot(&config, &device, Duration::from_millis(warmup_ms)).await?;
            let png = frame.to_png()?;
            std::fs::write(&out, &png.bytes)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!(
                "Wrote {}x{} still to {} (brightness {:.0})",
                frame.width,
                frame.height,
                out.display(),
                frame.avg_brightness()
            );
            if let Some(warning) = exposure_warning(&frame) {
                eprintln!("warning: {warning}");
            }
        }
        Commands::List { json } => {
            let registry = open_registry(&config)?;
            let active = registry.active().map(|identity| identity.id);
            let roster = registry.list_roster();
            let summaries: Vec<_> = roster
                .identities()
                .iter()
                .map(|identity| summarize(identity, active.as_deref()))
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else if summaries.is_empty() {
                println!("No identities enrolled");
            } else {
                for s in &summaries {
                    println!(
                        "{}{} {}  <{}>  enrolled {}{}",
                        if s.active { "* " } else { "  " },
                        s.id,
                        s.display_name,
                        s.email,
                        s.enrolled_at,
                        if s.is_privileged { "  [privileged]" } else { "" },
                    );
                }
            }
        }
        Commands::Remove { id } => {
            let registry = open_registry(&config)?;
            let removed = registry
                .remove(&id)
                .with_context(|| format!("failed to remove {id}"))?;
            println!("Removed {} <{}>", removed.display_name, removed.email);
        }
        Commands::Enroll {
            name,
            email,
            embedding,
            image,
        } => {
            let auth = open_auth(&config)?;
            let embedding = read_embedding(&embedding)?;
            let bytes =
                std::fs::read(&image).with_context(|| format!("failed to read {}", image.display()))?;
            let frame = StillFrame::decode(&bytes)
                .with_context(|| format!("failed to decode {}", image.display()))?;

            let identity = auth
                .enroll_captured(
                    CapturedFace { frame, embedding },
                    Profile {
                        display_name: name,
                        email,
                    },
                )
                .await
                .context("enrollment failed")?;
            println!(
                "Enrolled {} <{}> as {}{}",
                identity.display_name,
                identity.email,
                identity.id,
                if identity.is_privileged { " (privileged)" } else { "" }
            );
        }
        Commands::Match { embedding, login } => {
            let auth = open_auth(&config)?;
            let probe = read_embedding(&embedding)?;
            match auth.identify(&probe) {
                MatchResult::NoEnrolledIdentities => {
                    println!("No identities enrolled; run `facepass enroll` first");
                }
                MatchResult::Unknown { best_distance } => {
                    println!(
                        "No match (best distance {best_distance:.4}, threshold {:.4})",
                        config.match_threshold
                    );
                }
                MatchResult::Matched {
                    identity_id,
                    distance,
                } => {
                    let identity = auth
                        .registry()
                        .get(&identity_id)
                        .with_context(|| format!("identity {identity_id} vanished from roster"))?;
                    if login {
                        auth.registry().set_active(Some(&identity_id))?;
                    }
                    println!(
                        "Matched {} <{}> at distance {distance:.4}{}",
                        identity.display_name,
                        identity.email,
                        if login { "; now active" } else { "" }
                    );
                }
            }
        }
        Commands::Whoami => {
            let registry = open_registry(&config)?;
            match registry.active() {
                Some(identity) => println!("{} <{}> ({})", identity.display_name, identity.email, identity.id),
                None => println!("Nobody is logged in"),
            }
        }
        Commands::Logout => {
            let auth = open_auth(&config)?;
            auth.logout()?;
            println!("Logged out");
        }
    }

    Ok(())
}

/// Run one capture session to completion: start, wait for live, grab, confirm.
async fn snapshot(config: &Config, device: &str, warmup: Duration) -> Result<StillFrame> {
    let camera = Arc::new(V4l2Camera::new(device));
    let model = Arc::new(ModelHandle::new(NoModel, config.model_load_timeout()));
    let session = CaptureSession::spawn(camera, model, config.session_config());

    session.start().await?;
    let settled = session.settled().await?;
    if settled.state != CaptureState::Live {
        session.stop().await?;
        match settled.last_error {
            Some(err) if err.retry_action() == Some(RetryAction::RetryCamera) => {
                bail!("camera unavailable: {err} (close other camera applications and retry)")
            }
            Some(err) => bail!("camera unavailable: {err}"),
            None => bail!("camera session ended in {:?}", settled.state),
        }
    }

    tokio::time::sleep(warmup).await;
    if let Err(err) = session.capture().await {
        session.stop().await?;
        return Err(err).context("capture failed");
    }
    Ok(session.confirm().await?)
}

/// Share of near-black pixels above which a still is unusable for enrollment.
const DARK_FRACTION: f32 = 0.95;

fn exposure_warning(frame: &StillFrame) -> Option<&'static str> {
    frame
        .is_dark(DARK_FRACTION)
        .then_some("the still is almost entirely black; check lighting or the camera shutter")
}

fn open_registry(config: &Config) -> Result<EnrollmentRegistry<SqliteRosterStore>> {
    let store = SqliteRosterStore::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    Ok(EnrollmentRegistry::load(store)?)
}

fn open_auth(config: &Config) -> Result<Auth> {
    let registry = Arc::new(open_registry(config)?);
    let model = Arc::new(ModelHandle::new(NoModel, config.model_load_timeout()));
    Ok(FaceAuth::new(
        DescriptorExtractor::new(model),
        PassthroughEnhancer,
        registry,
        config.match_policy(),
    ))
}

fn read_embedding(path: &Path) -> Result<Embedding> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let embedding = match serde_json::from_str(&contents)
        .with_context(|| format!("{} is not an embedding", path.display()))?
    {
        EmbeddingFile::Bare(values) => Embedding::new(values),
        EmbeddingFile::Tagged(embedding) => embedding,
    };
    if embedding.dimension() == 0 {
        bail!("{} holds an empty embedding", path.display());
    }
    Ok(embedding)
}

fn summarize<'a>(identity: &'a Identity, active: Option<&str>) -> IdentitySummary<'a> {
    IdentitySummary {
        id: &identity.id,
        display_name: &identity.display_name,
        email: &identity.email,
        is_privileged: identity.is_privileged,
        enrolled_at: &identity.enrolled_at,
        dimension: identity.embedding.dimension(),
        model_version: identity.embedding.model_version(),
        active: active == Some(identity.id.as_str()),
    }
}
