use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use portrait_core::{AnimationError, AnimationReport, AnimationRequest, Phase};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod setup;

use config::Config;
use engine::{AnimateJob, AnimateOutcome, EngineError};

#[derive(Parser)]
#[command(name = "portrait", version, about = "Bring a still portrait to life")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Render a short rotating, blinking clip from each image
    Animate(AnimateArgs),
    /// Download the detector and landmark models
    Setup {
        /// Model directory (default: $PORTRAIT_MODEL_DIR or the per-user data dir)
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Check that every model file is present and intact
    VerifyModels {
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
}

#[derive(Args)]
struct AnimateArgs {
    /// Portrait images to animate
    #[arg(required = true)]
    images: Vec<PathBuf>,
    /// Output video (single image only; default: a temporary .mp4)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Clip length in seconds (default: $PORTRAIT_DURATION or 4)
    #[arg(short, long)]
    duration: Option<f64>,
    /// Also save the frame at one second as an image (single image only)
    #[arg(long)]
    thumbnail: Option<PathBuf>,
    /// Print one JSON report per image instead of progress
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Command::Animate(args) => animate(args, &config).await,
        Command::Setup { model_dir } => setup::run(&model_dir.unwrap_or(config.model_dir)),
        Command::VerifyModels { model_dir } => {
            setup::verify(&model_dir.unwrap_or(config.model_dir))
        }
    }
}

async fn animate(args: AnimateArgs, config: &Config) -> Result<()> {
    if args.images.len() > 1 && (args.output.is_some() || args.thumbnail.is_some()) {
        bail!("--output and --thumbnail need exactly one image");
    }
    let duration = args.duration.unwrap_or(config.duration_secs);

    let engine = engine::spawn_engine(config)
        .context("failed to start animation engine (try `portrait setup`)")?;

    let interrupt = engine.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt.is_cancelled() {
                std::process::exit(130);
            }
            tracing::warn!("interrupt received, cancelling (press again to force)");
            interrupt.cancel();
        }
    });

    let mut failures = 0;
    for image in &args.images {
        if engine.is_cancelled() {
            bail!("cancelled");
        }

        let mut request = AnimationRequest::new(image).with_duration(duration);
        if let Some(output) = &args.output {
            request = request.with_output(output);
        }
        let job = AnimateJob {
            request,
            thumbnail: args.thumbnail.clone(),
        };

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(print_progress(image.clone(), progress_rx, !args.json));
        let result = engine.animate(job, progress_tx).await;
        let _ = printer.await;

        match result {
            Ok(outcome) => print_outcome(&outcome, args.json)?,
            Err(EngineError::Animation(AnimationError::Cancelled)) => bail!("cancelled"),
            Err(EngineError::ChannelClosed) => bail!(EngineError::ChannelClosed),
            Err(e) => {
                tracing::debug!(error = ?e, "animation failed");
                eprintln!("{}: {e}", image.display());
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {} image(s) failed", args.images.len());
    }
    Ok(())
}

#[derive(Serialize)]
struct AnimateSummary<'a> {
    #[serde(flatten)]
    report: &'a AnimationReport,
    thumbnail: Option<&'a Path>,
}

fn print_outcome(outcome: &AnimateOutcome, json: bool) -> Result<()> {
    let report = &outcome.report;
    if json {
        let summary = AnimateSummary {
            report,
            thumbnail: outcome.thumbnail.as_deref(),
        };
        println!("{}", serde_json::to_string(&summary)?);
        return Ok(());
    }

    println!(
        "{} -> {} ({} frames at {} fps, face found by {})",
        report.source.display(),
        report.output.display(),
        report.total_frames,
        report.fps,
        report.detector
    );
    if let Some(thumbnail) = &outcome.thumbnail {
        println!("  thumbnail: {}", thumbnail.display());
    }
    Ok(())
}

async fn print_progress(image: PathBuf, mut rx: mpsc::UnboundedReceiver<Phase>, visible: bool) {
    let mut last_step = None;
    while let Some(phase) = rx.recv().await {
        if !visible {
            continue;
        }
        match phase {
            Phase::Rendering { frame, total } => {
                let step = render_step(frame, total);
                if last_step != Some(step) {
                    print!("  rendering {}/{total}\r", frame + 1);
                    std::io::stdout().flush().ok();
                    last_step = Some(step);
                }
            }
            other => println!("{}", describe_phase(&image, &other)),
        }
    }
}

/// Tenths of the clip rendered so far.
fn render_step(frame: usize, total: usize) -> usize {
    (frame + 1) * 10 / total.max(1)
}

fn describe_phase(image: &Path, phase: &Phase) -> String {
    match phase {
        Phase::ImageLoaded { width, height } => {
            format!("{}: loaded {width}x{height}", image.display())
        }
        Phase::LandmarksReady => "  landmarks ready".to_string(),
        Phase::Rendering { frame, total } => format!("  rendering {}/{total}", frame + 1),
        Phase::Finalized => "\n  video finalized".to_string(),
        Phase::Failed => "\n  failed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn animate_accepts_several_images() {
        let cli = Cli::try_parse_from(["portrait", "animate", "a.jpg", "b.png", "-d", "2"]).unwrap();
        let Command::Animate(args) = cli.command else {
            panic!("expected animate");
        };
        assert_eq!(args.images.len(), 2);
        assert_eq!(args.duration, Some(2.0));
        assert!(!args.json);
    }

    #[test]
    fn animate_requires_an_image() {
        assert!(Cli::try_parse_from(["portrait", "animate"]).is_err());
    }

    #[test]
    fn verify_models_takes_model_dir() {
        let cli =
            Cli::try_parse_from(["portrait", "verify-models", "--model-dir", "/opt/m"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::VerifyModels { model_dir: Some(ref d) } if d == Path::new("/opt/m")
        ));
    }

    #[test]
    fn render_steps_advance_by_tenths() {
        assert_eq!(render_step(0, 120), 0);
        assert_eq!(render_step(11, 120), 1);
        assert_eq!(render_step(119, 120), 10);
        assert_eq!(render_step(0, 1), 10);
    }

    #[test]
    fn phases_are_described_for_humans() {
        let image = Path::new("me.jpg");
        assert_eq!(
            describe_phase(image, &Phase::ImageLoaded { width: 640, height: 480 }),
            "me.jpg: loaded 640x480"
        );
        assert!(describe_phase(image, &Phase::Finalized).contains("finalized"));
    }

    #[test]
    fn json_summary_flattens_report() {
        let report = AnimationReport {
            source: PathBuf::from("in.jpg"),
            output: PathBuf::from("out.mp4"),
            total_frames: 30,
            fps: 30,
            width: 256,
            height: 256,
            pivot: portrait_core::Point::new(128.0, 140.0),
            face: portrait_core::FaceRect::new(64.0, 64.0, 129.0, 129.0, 0.9),
            detector: "scrfd",
        };
        let summary = AnimateSummary {
            report: &report,
            thumbnail: None,
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["total_frames"], 30);
        assert_eq!(value["detector"], "scrfd");
        assert_eq!(value["output"], "out.mp4");
        assert!(value["thumbnail"].is_null());
    }
}
