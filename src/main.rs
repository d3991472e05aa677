use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use image::DynamicImage;
use invigil::{
    banner, config,
    engine::FaceEngine,
    reference, FrameSource, IdentityMonitor, ModelPaths, MonitorSnapshot, OrtFaceEngine,
    ReferenceSource, VerificationResult,
};
use invigil_vision::Camera;
use log::{info, warn};

#[derive(Parser)]
#[command(name = "invigil")]
#[command(
    version,
    about = "Interview proctoring - periodic face verification against a reference photo"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the identity monitor against the camera until Ctrl-C
    Watch {
        /// Reference photo URL or path (overrides config)
        #[arg(short, long)]
        reference: Option<String>,
        /// Camera device (overrides config)
        #[arg(short, long)]
        camera: Option<String>,
    },
    /// One-shot verification of a still image against the reference
    Check {
        /// Image to verify
        #[arg(short, long)]
        image: PathBuf,
        /// Reference photo URL or path (overrides config)
        #[arg(short, long)]
        reference: Option<String>,
        /// Print the verification result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Open config file in editor
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load_config(None)?;

    match cli.command {
        Commands::Watch { reference, camera } => {
            if let Some(reference) = reference {
                cfg.reference_image = Some(reference);
            }
            if let Some(camera) = camera {
                cfg.camera = camera;
            }
            watch(&cfg).await
        }
        Commands::Check {
            image,
            reference,
            json,
        } => {
            if let Some(reference) = reference {
                cfg.reference_image = Some(reference);
            }
            check(&cfg, &image, json).await
        }
        Commands::Config => open_config(),
    }
}

/// Frame source backed by a capture thread that keeps the latest camera
/// frame around for the monitor to pick up on demand.
struct CameraFrames {
    latest: Arc<Mutex<Option<DynamicImage>>>,
}

impl FrameSource for CameraFrames {
    fn current_frame(&self) -> Option<DynamicImage> {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

fn spawn_camera(device: &str) -> Result<CameraFrames> {
    let mut camera = Camera::open(device).context("failed to open camera")?;
    let (width, height) = camera.dimensions();
    info!("camera opened: {device} ({width}x{height})");

    let latest: Arc<Mutex<Option<DynamicImage>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&latest);
    std::thread::spawn(move || loop {
        match camera.frame() {
            Ok(frame) => {
                let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                *guard = Some(DynamicImage::ImageRgb8(frame));
            }
            Err(e) => warn!("camera frame capture failed: {e}"),
        }
        std::thread::sleep(Duration::from_millis(100));
    });

    Ok(CameraFrames { latest })
}

async fn watch(cfg: &config::Config) -> Result<()> {
    let engine: Arc<dyn FaceEngine> = Arc::new(OrtFaceEngine::new(ModelPaths::from_dir(
        &cfg.models_dir,
    )));
    let frames = Arc::new(spawn_camera(&cfg.camera)?);

    let monitor = IdentityMonitor::start(cfg.monitor_config(), engine, frames);
    info!("monitor session {}", monitor.session_id());

    let mut rx = monitor.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = rx.borrow_and_update().clone();
                report(&snapshot);
            }
        }
    }

    monitor.shutdown().await;
    Ok(())
}

fn report(snapshot: &MonitorSnapshot) {
    if let Some(warning) = banner::warning_for(snapshot) {
        warn!(
            "[{:?}] {} (mismatches: {})",
            warning.severity, warning.message, warning.mismatch_count
        );
        return;
    }
    match &snapshot.result.last_checked {
        Some(_) => info!(
            "verified: match={} confidence={:.2}",
            snapshot.result.is_match, snapshot.result.confidence
        ),
        None => info!("monitor phase: {:?}", snapshot.phase),
    }
}

async fn check(cfg: &config::Config, image_path: &std::path::Path, json: bool) -> Result<()> {
    let engine = OrtFaceEngine::new(ModelPaths::from_dir(&cfg.models_dir));
    engine.load_models().await?;

    let source = cfg
        .reference_image
        .as_deref()
        .map(ReferenceSource::parse)
        .context("no reference image configured; pass --reference or set it in the config")?;
    let reference_embedding = reference::acquire(&engine, &source)
        .await
        .context("failed to acquire reference profile")?;

    let img = image::open(image_path)
        .with_context(|| format!("reading image {}", image_path.display()))?;

    let result = match engine.detect_single_face(img).await? {
        Some(live) => {
            let distance = engine.distance(&reference_embedding, &live);
            info!("embedding distance: {distance:.3}");
            VerificationResult::compared(distance, cfg.match_threshold, Utc::now())
        }
        None => VerificationResult::no_face(Utc::now()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.is_match {
        info!("match (confidence {:.2})", result.confidence);
    } else {
        warn!(
            "no match (confidence {:.2}, face detected: {})",
            result.confidence, result.face_detected
        );
    }

    if !result.is_match {
        anyhow::bail!("verification failed");
    }
    Ok(())
}

fn open_config() -> Result<()> {
    let config_path = config::CONFIG_PATH.as_os_str();
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("opening config file: {config_path:?}");

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("failed to open editor")?;

    if !status.success() {
        anyhow::bail!("editor exited with non-zero status");
    }

    Ok(())
}
