mod checkpoint;
mod error;
mod extract;
mod fetch;
mod filter;
mod merge;
mod model;
mod pipeline;
mod processor;
mod session;
mod settings;
mod source;
#[cfg(test)]
mod testutil;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use checkpoint::CheckpointStore;
use fetch::HttpFetcher;
use filter::SpamFilter;
use model::WorkItem;
use pipeline::{Pipeline, PipelineConfig, RunPhase};
use processor::{CommandRecognizer, ItemProcessor, OcrProcessor, PageProcessor};
use session::Session;
use settings::Settings;

const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "notes_harvest", about = "Resumable extraction and OCR passes over a notes export")]
struct Cli {
    /// Data directory (default: data, or NOTES_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Pause between notes in milliseconds
    #[arg(long, global = true)]
    delay_ms: Option<u64>,
    /// Save progress every N notes
    #[arg(long, global = true)]
    checkpoint_interval: Option<usize>,
    /// Don't draw the progress bar
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Range {
    /// First note index (inclusive)
    #[arg(default_value_t = 0)]
    start: usize,
    /// Last note index (exclusive, default: end of snapshot)
    end: Option<usize>,
}

#[derive(Args)]
struct Files {
    /// Input snapshot (default depends on the command)
    #[arg(short, long)]
    input: Option<PathBuf>,
    /// Output snapshot (default depends on the command)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch each note page and extract title, text, images and tags
    Extract {
        #[command(flatten)]
        range: Range,
        #[command(flatten)]
        files: Files,
        /// Abort if no session cookies are available
        #[arg(long)]
        require_session: bool,
    },
    /// Download note images and run text recognition on them
    Ocr {
        #[command(flatten)]
        range: Range,
        #[command(flatten)]
        files: Files,
    },
    /// Merge all OCR batch files into the notes snapshot
    Merge {
        #[command(flatten)]
        files: Files,
    },
    /// Drop boilerplate notes and non-content images
    Clean {
        #[command(flatten)]
        files: Files,
    },
    /// Rebuild note text from recognized image text
    Rebuild {
        #[command(flatten)]
        files: Files,
    },
    /// Import browser-exported cookies into the session file, or show it
    Cookies {
        /// Cookie JSON exported from a logged-in browser
        from: Option<PathBuf>,
    },
    /// Show coverage statistics for a snapshot
    Status {
        /// Snapshot to inspect (default: <data>/notes.json)
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    let show_progress = !cli.quiet;

    let result = match cli.command {
        Commands::Extract {
            range,
            files,
            require_session,
        } => {
            let session = Session::load(&settings.cookies_path())?;
            let session = if require_session {
                session.require()?
            } else {
                session
            };

            let input = files.input.unwrap_or_else(|| settings.notes_path());
            let notes = source::load(&input)?;
            let Some((start, end)) = selected(notes.len(), &range) else {
                return Ok(ExitCode::SUCCESS);
            };

            let fetcher = Arc::new(HttpFetcher::new(
                &session,
                &settings.user_agent,
                settings.referer.as_deref(),
                settings.fetch_timeout(),
            )?);
            let processor = PageProcessor::new(fetcher, Arc::new(SpamFilter::from_settings(&settings)));

            let batch_dir = settings.extract_dir();
            let mut config = PipelineConfig::from_settings(
                &settings,
                settings.path("extract-progress.json"),
                batch_path(&batch_dir, start, end),
            );
            config.first_index = start;
            config.show_progress = show_progress;

            println!("Extracting notes {}..{} of {} from {}...", start, end, notes.len(), input.display());
            let batch = source::slice(&notes, start, Some(end)).to_vec();
            let pipeline = Pipeline::new(config, CheckpointStore::new())?
                .with_cancellation(interrupt_token());
            let report = pipeline.run(batch, &processor).await?;
            report.print();

            if report.phase == RunPhase::Completed {
                let output = files
                    .output
                    .unwrap_or_else(|| settings.path("notes-extracted.json"));
                let count = publish_extracted(&notes, &batch_dir, &output)?;
                println!("{} extracted notes so far in {}", count, output.display());
            }
            Ok(exit_code(report.phase))
        }
        Commands::Ocr { range, files } => {
            let input = files.input.unwrap_or_else(|| settings.notes_path());
            let notes = source::load(&input)?;
            let Some((start, end)) = selected(notes.len(), &range) else {
                return Ok(ExitCode::SUCCESS);
            };

            let session = Session::load(&settings.cookies_path())?;
            let fetcher = Arc::new(HttpFetcher::new(
                &session,
                &settings.user_agent,
                settings.referer.as_deref(),
                settings.fetch_timeout(),
            )?);
            let recognizer = Arc::new(CommandRecognizer::new(
                settings.ocr_program.clone(),
                settings.ocr_args.clone(),
                settings.ocr_timeout(),
            ));
            let processor = OcrProcessor::new(
                fetcher,
                recognizer,
                settings.path("tmp-images"),
                settings.image_delay(),
            )?;

            let output = files
                .output
                .unwrap_or_else(|| batch_path(&settings.ocr_dir(), start, end));
            let mut config =
                PipelineConfig::from_settings(&settings, settings.ocr_dir().join("progress.json"), output);
            config.first_index = start;
            config.show_progress = show_progress;

            println!(
                "OCR on notes {}..{} of {} (images via {})...",
                start,
                end,
                notes.len(),
                processor.name()
            );
            let batch = source::slice(&notes, start, Some(end)).to_vec();
            let pipeline = Pipeline::new(config, CheckpointStore::new())?
                .with_cancellation(interrupt_token());
            let report = pipeline.run(batch, &processor).await?;
            report.print();

            let recognized: usize = report
                .items
                .iter()
                .map(|p| p.image_texts.iter().flatten().filter(|t| t.has_text()).count())
                .sum();
            let chars: usize = report
                .items
                .iter()
                .map(|p| p.joined_image_text().chars().count())
                .sum();
            println!("Images with text: {} ({} characters)", recognized, chars);
            Ok(exit_code(report.phase))
        }
        Commands::Merge { files } => {
            let input = files.input.unwrap_or_else(|| settings.notes_path());
            let output = files
                .output
                .unwrap_or_else(|| settings.path("notes-with-ocr.json"));
            let notes = source::load(&input)?;
            let batches = merge::load_batches(&settings.ocr_dir())?;
            println!("Merging {} batch files into {} notes...", batches.len(), notes.len());

            let merged = merge::merge_batches(notes, &batches);
            CheckpointStore::new()
                .finalize(&merged, &output)
                .context("Failed to write merged snapshot")?;
            merge::SnapshotStats::collect(&merged).print();
            println!("Saved to {}", output.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Clean { files } => {
            let input = files
                .input
                .unwrap_or_else(|| settings.path("notes-with-ocr.json"));
            let output = files
                .output
                .unwrap_or_else(|| settings.path("notes-cleaned.json"));
            let notes = source::load(&input)?;
            let total = notes.len();

            let report = merge::clean(notes, &SpamFilter::from_settings(&settings));
            CheckpointStore::new()
                .finalize(&report.notes, &output)
                .context("Failed to write cleaned snapshot")?;
            println!(
                "Kept {} of {} notes ({} removed); images {} -> {}.",
                report.notes.len(),
                total,
                report.removed,
                report.images_before,
                report.images_after
            );
            println!("Saved to {}", output.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rebuild { files } => {
            let input = files
                .input
                .unwrap_or_else(|| settings.path("notes-with-ocr.json"));
            let output = files
                .output
                .unwrap_or_else(|| settings.path("notes-rebuilt.json"));
            let notes = source::load(&input)?;
            let total = notes.len();

            let filter = SpamFilter::from_settings(&settings);
            let report = merge::rebuild(notes, &filter, settings.min_content_chars);
            CheckpointStore::new()
                .finalize(&report.notes, &output)
                .context("Failed to write rebuilt snapshot")?;
            println!(
                "Rebuilt {} notes: {} had boilerplate bodies, {} now use image text only, {} dropped.",
                total, report.spam, report.from_images_only, report.dropped
            );
            println!("Kept {} notes. Saved to {}", report.notes.len(), output.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cookies { from } => {
            let mut session = Session::load(&settings.cookies_path())?;
            if let Some(from) = from {
                let exported = Session::load(&from)?.require()?;
                let taken = session.absorb(exported);
                session.save()?;
                println!("Imported {} cookies from {}", taken, from.display());
            }
            println!(
                "{}: {} cookies, {}",
                session.path().display(),
                session.len(),
                if session.cookie_header(chrono::Utc::now()).is_some() {
                    "usable"
                } else {
                    "none unexpired"
                }
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { file } => {
            let path = file.unwrap_or_else(|| settings.notes_path());
            let notes = source::load(&path)?;
            println!("{}", path.display());
            merge::SnapshotStats::collect(&notes).print();
            Ok(ExitCode::SUCCESS)
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_elapsed(elapsed));
    }

    result
}

fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = Settings::load().context("Failed to load settings")?;
    if let Some(dir) = &cli.data_dir {
        settings.data_dir = dir.clone();
    }
    if let Some(ms) = cli.delay_ms {
        settings.delay_ms = ms;
    }
    if let Some(n) = cli.checkpoint_interval {
        settings.checkpoint_interval = n;
    }
    settings.validate()?;
    Ok(settings)
}

/// Cancelled on the first Ctrl-C so the running pass can save and stop.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, saving progress...");
            on_signal.cancel();
        }
    });
    token
}

/// Clamped `[start, end)` of the requested range, or `None` (with a note on
/// stdout) when it selects nothing.
fn selected(len: usize, range: &Range) -> Option<(usize, usize)> {
    let (start, end) = source::bounds(len, range.start, range.end);
    if start == end {
        println!("No notes in range {}..{} ({} total), nothing to do.", start, end, len);
        return None;
    }
    Some((start, end))
}

/// `<dir>/batch-<start>-<last>.json` for the notes `[start, end)`.
fn batch_path(dir: &Path, start: usize, end: usize) -> PathBuf {
    dir.join(format!("batch-{}-{}.json", start, end.saturating_sub(1)))
}

/// Rewrite `dest` from every extract batch in `batch_dir`, in snapshot order.
fn publish_extracted(notes: &[WorkItem], batch_dir: &Path, dest: &Path) -> anyhow::Result<usize> {
    let batches = merge::load_batches(batch_dir).context("Failed to read extract batches")?;
    let combined = merge::combine_batches(notes, batches);
    CheckpointStore::new()
        .finalize(&combined, dest)
        .context("Failed to write extracted snapshot")?;
    Ok(combined.len())
}

fn exit_code(phase: RunPhase) -> ExitCode {
    match phase {
        RunPhase::Aborted => ExitCode::from(EXIT_INTERRUPTED),
        _ => ExitCode::SUCCESS,
    }
}

fn format_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    match (secs / 3600, secs % 3600 / 60, secs % 60) {
        (0, 0, _) => format!("{:.1}s", d.as_secs_f64()),
        (0, m, s) => format!("{}m {:02}s", m, s),
        (h, m, s) => format!("{}h {:02}m {:02}s", h, m, s),
    }
}
