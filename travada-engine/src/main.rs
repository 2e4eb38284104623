//! # Travada
//!
//! Command-line front end for the Travada audio engine: stream files
//! through the realtime mix graph, render a mix offline, or build peak
//! files.
//!
//! Startup order is fixed: load config, build the Runtime, open the
//! device, assemble the session.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use travada_common::config::{BitDepth, Config, RecordFormat};
use travada_common::{EngineEvent, TimeRef};
use travada_engine::audiofile::dither::Dither;
use travada_engine::device::AudioDevice;
use travada_engine::export::{self, ExportSpecification};
use travada_engine::project::sheet::{SheetCommand, SheetController};
use travada_engine::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "travada")]
#[command(about = "Travada - multitrack audio engine")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Project directory (created if missing)
    #[arg(short, long, default_value = "travada-project")]
    project: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream one or more audio files through the engine
    Play {
        /// Audio files, one track each
        files: Vec<PathBuf>,
    },
    /// Render a mix of the given files to an audio file
    Export {
        /// Audio files, one track each
        files: Vec<PathBuf>,

        /// Output file (extension selects wav/w64)
        #[arg(short, long)]
        out: PathBuf,

        /// Output sample rate (defaults to the device rate)
        #[arg(long)]
        rate: Option<u32>,

        /// Bit depth: 16, 24 or f32
        #[arg(long, default_value = "f32")]
        depth: String,

        /// Export start in seconds
        #[arg(long, default_value_t = 0.0)]
        start: f64,

        /// Export end in seconds (defaults to the end of material)
        #[arg(long)]
        end: Option<f64>,
    },
    /// Build peak files for the given audio files
    Peaks {
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "travada=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    let mut runtime = Runtime::new(config, "travada", args.project.clone())?;
    spawn_event_logger(&runtime);

    match args.command {
        Command::Play { files } => play(&mut runtime, files).await,
        Command::Export {
            files,
            out,
            rate,
            depth,
            start,
            end,
        } => render_export(&mut runtime, files, out, rate, &depth, start, end),
        Command::Peaks { files } => build_peaks(&mut runtime, files).await,
    }
}

/// Print engine events (messages, finished builds, sync trouble) as they
/// arrive.
fn spawn_event_logger(runtime: &Runtime) {
    let mut events = runtime.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                EngineEvent::Message { level, text } => info!("[{}] {}", level, text),
                EngineEvent::SourceInvalid { source_id, reason } => {
                    warn!("source {} invalid: {}", source_id, reason)
                }
                EngineEvent::PeakBuildFinished { source_id, success } => {
                    info!("peaks for source {}: {}", source_id, if *success { "done" } else { "failed" })
                }
                EngineEvent::RecordingFinished {
                    file_name, frames, ..
                } => info!("recording finished: {} ({} frames)", file_name, frames),
                _ => {}
            }
        }
    });
}

/// Forward rings until every imported source can stream.
fn wait_for_rings(
    runtime: &mut Runtime,
    controller: &mut SheetController,
    expected: usize,
) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut delivered = 0;
    while delivered < expected {
        delivered += runtime.pump(controller);
        if Instant::now() > deadline {
            bail!("disk I/O never delivered all stream buffers");
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

async fn play(runtime: &mut Runtime, files: Vec<PathBuf>) -> Result<()> {
    if files.is_empty() {
        bail!("nothing to play");
    }
    let (sheet, mut controller) = runtime.build_session(&files)?;
    let end = sheet.end_location();
    wait_for_rings(runtime, &mut controller, files.len())?;

    let device_config = runtime.config().device.clone();
    let device = AudioDevice::open(&device_config, sheet).context("opening audio device")?;
    controller
        .send(SheetCommand::Start)
        .ok()
        .context("queueing transport start")?;
    info!("Playing {} file(s), material ends at {}", files.len(), end);

    let transport = controller.transport().clone();
    loop {
        runtime.pump(&mut controller);
        if transport.location() >= end {
            info!("End of material");
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }

    let _ = controller.send(SheetCommand::Stop);
    tokio::time::sleep(Duration::from_millis(100)).await;
    runtime.pump(&mut controller);
    device.stop();
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn render_export(
    runtime: &mut Runtime,
    files: Vec<PathBuf>,
    out: PathBuf,
    rate: Option<u32>,
    depth: &str,
    start: f64,
    end: Option<f64>,
) -> Result<()> {
    if files.is_empty() {
        bail!("nothing to export");
    }
    let bit_depth = match depth {
        "16" => BitDepth::Int16,
        "24" => BitDepth::Int24,
        "f32" | "32" => BitDepth::Float32,
        other => bail!("unsupported bit depth '{}'", other),
    };
    let format = match out.extension().and_then(|e| e.to_str()) {
        Some("w64") => RecordFormat::W64,
        _ => RecordFormat::Wav,
    };

    let (mut sheet, mut controller) = runtime.build_session(&files)?;
    wait_for_rings(runtime, &mut controller, files.len())?;

    let export_end = match end {
        Some(seconds) => TimeRef::from_ms((seconds * 1000.0) as i64),
        None => sheet.end_location(),
    };
    let spec = ExportSpecification {
        export_dir: out
            .parent()
            .map(|p| p.to_path_buf())
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from(".")),
        file_name: out
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("output file name missing")?,
        format,
        channel_count: 2,
        sample_rate: rate.unwrap_or(runtime.config().device.sample_rate),
        bit_depth,
        dither: Dither::default_mode(bit_depth),
        export_start: TimeRef::from_ms((start * 1000.0) as i64),
        export_end,
        block_size: runtime.config().device.block_size as usize,
        extra_format: Default::default(),
    };

    let path = export::render(&mut sheet, &mut controller, runtime.disk(), &spec)?;
    info!("Wrote {}", path.display());
    Ok(())
}

async fn build_peaks(runtime: &mut Runtime, files: Vec<PathBuf>) -> Result<()> {
    if files.is_empty() {
        bail!("no files given");
    }
    let mut events = runtime.events().subscribe();
    let mut pending = Vec::new();
    for file in &files {
        let handles = runtime.import_file(file)?;
        pending.push(handles.id());
    }

    // import_file only queues builds for missing/stale caches; anything
    // not queued is already done.
    let deadline = Instant::now() + Duration::from_secs(600);
    while !pending.is_empty() {
        if Instant::now() > deadline {
            bail!("peak builds timed out");
        }
        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Ok(EngineEvent::PeakBuildFinished { source_id, success })) => {
                pending.retain(|id| *id != source_id);
                if !success {
                    warn!("peak build failed for source {}", source_id);
                }
            }
            Ok(Ok(_)) | Err(_) => {
                // Sources whose peaks were already current never emit an
                // event; verify and clear them.
                let peak_dir = runtime.project().peakfiles_dir();
                let project = runtime.project();
                pending.retain(|id| {
                    project
                        .source(*id)
                        .map(|handles| {
                            !travada_engine::peak::builder::peaks_are_current(
                                &peak_dir,
                                &handles.info.path,
                                handles.info.channel_count,
                            )
                        })
                        .unwrap_or(false)
                });
            }
            Ok(Err(_)) => break,
        }
    }
    info!("Peak files ready under {}", runtime.project().peakfiles_dir().display());
    Ok(())
}
