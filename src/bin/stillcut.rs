use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use stillcut::{
    DirectoryStore, ExtractedFrame, ExtractionConfig, FfmpegBackend, FfmpegLogLevel,
    FrameExtractor, FrameStore, OutputFormat, ProcessingStatus, ProgressInfo, SessionId,
};

#[cfg(feature = "hardware")]
use stillcut::{HardwareAccelerationMode, HardwareDeviceType};

const CLI_AFTER_HELP: &str = "Examples:\n  stillcut extract lecture.mp4 --interval 5 --progress\n  stillcut extract input.mp4 --format png --start 1:30 --end 2:00\n  stillcut list session-3f2a... --json\n  stillcut export session-3f2a... --out stills --name lecture\n  stillcut completions zsh > _stillcut";

#[derive(Debug, Parser)]
#[command(
    name = "stillcut",
    version,
    about = "Extract still frames from video files at a fixed interval",
    after_help = CLI_AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Parser, Clone)]
struct GlobalOptions {
    /// Show additional logging output.
    #[arg(long, global = true)]
    verbose: bool,

    /// Show a progress bar where supported.
    #[arg(long, global = true)]
    progress: bool,

    /// Root directory of the frame store.
    #[arg(long, global = true, default_value = "frames")]
    store: PathBuf,

    /// FFmpeg log level (quiet, fatal, error, warning, info, debug).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Hardware decode mode (auto, software, cuda, vaapi, dxva2, d3d11va, videotoolbox, qsv).
    #[arg(long, global = true)]
    hardware: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract frames from a video into a new session.
    #[command(
        about = "Extract still frames",
        after_help = "Examples:\n  stillcut extract input.mp4 --interval 10 --format jpg --quality 85\n  stillcut extract input.mp4 --start 0:00:10 --end 0:00:20 --progress"
    )]
    Extract {
        /// Input video path.
        input: PathBuf,
        /// Seconds between kept frames.
        #[arg(long, default_value_t = 1.0)]
        interval: f64,
        /// Output image format (jpg, png, webp).
        #[arg(long, default_value = "jpg")]
        format: String,
        /// JPEG quality, 0-100.
        #[arg(long, default_value_t = 100)]
        quality: u8,
        /// Window start (seconds or [hh:]mm:ss).
        #[arg(long)]
        start: Option<String>,
        /// Window end (seconds or [hh:]mm:ss). Omit to run to the end.
        #[arg(long)]
        end: Option<String>,
    },

    /// List the frames of a session.
    #[command(about = "List a session's frames")]
    List {
        /// Session id printed by `extract`.
        session: String,
        /// Output as machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// List sessions in the store.
    #[command(about = "List stored sessions")]
    Sessions {
        /// Output as machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Copy a session's frames into a directory with readable names.
    #[command(
        about = "Export a session's frames",
        after_help = "Files are named <name>_<MM-SS-mmm>.<ext> after each frame's timestamp."
    )]
    Export {
        /// Session id printed by `extract`.
        session: String,
        /// Destination directory.
        #[arg(long)]
        out: PathBuf,
        /// File name prefix, usually the video's name.
        #[arg(long, default_value = "frame")]
        name: String,
        /// Allow overwriting existing files.
        #[arg(long)]
        overwrite: bool,
    },

    /// Delete one session.
    #[command(about = "Delete a session")]
    Delete {
        /// Session id to delete.
        session: String,
    },

    /// Delete every session in the store.
    #[command(about = "Delete all sessions")]
    Clear,

    /// Generate shell completion scripts.
    #[command(about = "Generate shell completions")]
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Parse seconds (`75`, `75.5`) or a `[hh:]mm:ss[.fff]` timecode.
fn parse_timecode(value: &str) -> CliResult<f64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("time value cannot be empty".into());
    }
    if let Ok(seconds) = trimmed.parse::<f64>() {
        return Ok(seconds.max(0.0));
    }

    let parts: Vec<&str> = trimmed.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [minutes, seconds] => (0, minutes.parse::<u64>()?, seconds.parse::<f64>()?),
        [hours, minutes, seconds] => (
            hours.parse::<u64>()?,
            minutes.parse::<u64>()?,
            seconds.parse::<f64>()?,
        ),
        _ => return Err(format!("invalid time format: {trimmed}").into()),
    };
    Ok((hours as f64 * 3600.0 + minutes as f64 * 60.0 + seconds).max(0.0))
}

/// `MM-SS-mmm` for a timestamp in microseconds. Minutes are not wrapped
/// into hours.
fn export_timestamp(micros: i64) -> String {
    let millis = micros.max(0) / 1000;
    format!(
        "{:02}-{:02}-{:03}",
        millis / 60_000,
        (millis / 1000) % 60,
        millis % 1000
    )
}

/// One file name per frame, numbering frames that share a timestamp.
fn export_file_names(frames: &[ExtractedFrame], name: &str) -> Vec<String> {
    let mut used = HashSet::new();
    frames
        .iter()
        .map(|frame| {
            let stem = format!("{name}_{}", export_timestamp(frame.timestamp));
            let mut file_name = format!("{stem}.{}", frame.format.extension());
            let mut duplicate = 1;
            while !used.insert(file_name.clone()) {
                duplicate += 1;
                file_name = format!("{stem}_{duplicate}.{}", frame.format.extension());
            }
            file_name
        })
        .collect()
}

fn parse_log_level(value: &str) -> Option<FfmpegLogLevel> {
    match value.to_ascii_lowercase().as_str() {
        "quiet" => Some(FfmpegLogLevel::Quiet),
        "fatal" | "panic" => Some(FfmpegLogLevel::Fatal),
        "error" => Some(FfmpegLogLevel::Error),
        "warning" | "warn" => Some(FfmpegLogLevel::Warning),
        "info" | "verbose" => Some(FfmpegLogLevel::Info),
        "debug" | "trace" => Some(FfmpegLogLevel::Debug),
        _ => None,
    }
}

#[cfg(feature = "hardware")]
fn parse_hardware_mode(value: &str) -> Option<HardwareAccelerationMode> {
    let device = match value.to_ascii_lowercase().as_str() {
        "auto" => return Some(HardwareAccelerationMode::Auto),
        "software" | "sw" | "cpu" => return Some(HardwareAccelerationMode::Software),
        "cuda" => HardwareDeviceType::Cuda,
        "vaapi" => HardwareDeviceType::Vaapi,
        "dxva2" => HardwareDeviceType::Dxva2,
        "d3d11va" => HardwareDeviceType::D3d11va,
        "videotoolbox" => HardwareDeviceType::VideoToolbox,
        "qsv" => HardwareDeviceType::Qsv,
        _ => return None,
    };
    Some(HardwareAccelerationMode::Specific(device))
}

fn build_backend(global: &GlobalOptions) -> CliResult<FfmpegBackend> {
    let mut backend = FfmpegBackend::new();
    if let Some(level) = &global.log_level {
        let parsed = parse_log_level(level).ok_or(format!("unsupported --log-level: {level}"))?;
        backend = backend.with_log_level(parsed);
    }

    #[cfg(feature = "hardware")]
    if let Some(hardware) = &global.hardware {
        let mode = parse_hardware_mode(hardware)
            .ok_or(format!("unsupported --hardware mode: {hardware}"))?;
        backend = backend.with_hardware_acceleration(mode);
    }

    #[cfg(not(feature = "hardware"))]
    if global.hardware.is_some() {
        eprintln!(
            "{} {}",
            "warning:".yellow().bold(),
            "--hardware requires building with the `hardware` feature".yellow()
        );
    }

    Ok(backend)
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .init();
}

fn progress_bar(length: u64, template: &str) -> CliResult<ProgressBar> {
    let bar = ProgressBar::new(length);
    bar.set_style(ProgressStyle::with_template(template)?.progress_chars("##-"));
    Ok(bar)
}

fn parse_session(value: &str) -> CliResult<SessionId> {
    Ok(value.parse::<SessionId>()?)
}

async fn extract(
    global: &GlobalOptions,
    input: &Path,
    config: ExtractionConfig,
) -> CliResult<()> {
    let store: Arc<dyn FrameStore> = Arc::new(DirectoryStore::new(&global.store));
    let mut builder = FrameExtractor::builder()
        .with_store(Arc::clone(&store))
        .with_backend(Arc::new(build_backend(global)?));

    let bar = if global.progress {
        let bar = progress_bar(0, "{spinner:.green} {bar:40.cyan/blue} {pos}/{len} frames {msg}")?;
        let callback_bar = bar.clone();
        builder = builder.with_progress(Arc::new(move |info: &ProgressInfo| {
            if info.total_frames > 0 {
                callback_bar.set_length(info.total_frames.max(info.processed_frames));
            }
            callback_bar.set_position(info.processed_frames);
            callback_bar.set_message(info.status.to_string());
        }));
        Some(bar)
    } else {
        None
    };

    let extractor = builder.build();
    let session = extractor.start(input, config).await?;
    let state = extractor.wait().await;

    if let Some(bar) = bar {
        bar.finish_with_message(state.status.to_string());
    }

    match state.status {
        ProcessingStatus::Error => Err(state
            .error
            .unwrap_or_else(|| "extraction failed".to_string())
            .into()),
        _ => {
            println!(
                "{} {}",
                "success:".green().bold(),
                format!(
                    "Kept {} frame(s) in session {session} under {}",
                    state.processed_frames,
                    global.store.display()
                )
                .green()
            );
            println!("{session}");
            Ok(())
        }
    }
}

async fn export(
    global: &GlobalOptions,
    store: &DirectoryStore,
    session: &SessionId,
    out: &Path,
    name: &str,
    overwrite: bool,
) -> CliResult<()> {
    let frames = store.get_by_session(session).await?;
    if frames.is_empty() {
        return Err(format!("session {session} has no frames").into());
    }
    tokio::fs::create_dir_all(out).await?;

    let bar = if global.progress {
        Some(progress_bar(100, "{spinner:.green} {bar:40.cyan/blue} {pos}% {msg}")?)
    } else {
        None
    };

    let file_names = export_file_names(&frames, name);
    for (index, (frame, file_name)) in frames.iter().zip(file_names).enumerate() {
        let path = out.join(&file_name);
        if !overwrite && tokio::fs::try_exists(&path).await? {
            return Err(format!(
                "output file already exists: {} (use --overwrite)",
                path.display()
            )
            .into());
        }
        tokio::fs::write(&path, &frame.data).await?;

        if let Some(bar) = &bar {
            bar.set_position(((index + 1) * 100 / frames.len()) as u64);
        }
        if global.verbose {
            eprintln!("saved {} -> {}", frame.id, path.display());
        }
    }

    if let Some(bar) = bar {
        bar.finish_with_message("done");
    }
    println!(
        "{} {}",
        "success:".green().bold(),
        format!("Exported {} frame(s) to {}", frames.len(), out.display()).green()
    );
    Ok(())
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);
    let store = DirectoryStore::new(&cli.global.store);

    match cli.command {
        Commands::Extract {
            input,
            interval,
            format,
            quality,
            start,
            end,
        } => {
            let format = OutputFormat::from_name(&format)
                .ok_or(format!("unsupported --format: {format}"))?;
            let start = start.as_deref().map(parse_timecode).transpose()?.unwrap_or(0.0);
            let end = end.as_deref().map(parse_timecode).transpose()?.unwrap_or(0.0);
            let config = ExtractionConfig::new(interval)
                .with_format(format)
                .with_quality(quality)
                .with_window(start, end);
            extract(&cli.global, &input, config).await?;
        }
        Commands::List { session, json } => {
            let session = parse_session(&session)?;
            let frames = store.get_by_session(&session).await?;
            if json {
                let payload = json!({
                    "session": session.as_str(),
                    "frames": frames.iter().map(|frame| json!({
                        "id": frame.id,
                        "timestamp_micros": frame.timestamp,
                        "mime_type": frame.mime_type(),
                        "bytes": frame.data.len(),
                    })).collect::<Vec<_>>(),
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                for frame in &frames {
                    println!(
                        "{:>10.3}s  {}  {}  {} bytes",
                        frame.timestamp_seconds(),
                        frame.id,
                        frame.mime_type(),
                        frame.data.len()
                    );
                }
                println!("{} frame(s)", frames.len());
            }
        }
        Commands::Sessions { json } => {
            let sessions = store.sessions().await?;
            let mut rows = Vec::with_capacity(sessions.len());
            for session in sessions {
                let count = store.frame_count(&session).await?;
                rows.push((session, count));
            }
            if json {
                let payload: Vec<_> = rows
                    .iter()
                    .map(|(session, count)| json!({ "session": session.as_str(), "frames": count }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                for (session, count) in &rows {
                    println!("{session}  {count} frame(s)");
                }
            }
        }
        Commands::Export {
            session,
            out,
            name,
            overwrite,
        } => {
            let session = parse_session(&session)?;
            export(&cli.global, &store, &session, &out, &name, overwrite).await?;
        }
        Commands::Delete { session } => {
            let session = parse_session(&session)?;
            store.delete_session(&session).await?;
            println!("{} {session}", "deleted".green().bold());
        }
        Commands::Clear => {
            store.clear().await?;
            println!(
                "{} {}",
                "cleared".green().bold(),
                cli.global.store.display()
            );
        }
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "stillcut", &mut std::io::stdout());
        }
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("{} {error}", "error:".red().bold());
        std::process::exit(1);
    }
}
