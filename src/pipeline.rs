use std::path::PathBuf;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::{CheckpointError, ConfigError};
use crate::model::{ProcessedItem, WorkItem};
use crate::processor::ItemProcessor;
use crate::settings::Settings;

const PROGRESS_TEMPLATE: &str = "[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Flush after every this many processed items.
    pub checkpoint_interval: usize,
    /// Pause between two items.
    pub delay: Duration,
    /// Up to this much extra pause, drawn uniformly per gap.
    pub jitter: Duration,
    pub checkpoint_path: PathBuf,
    pub final_path: PathBuf,
    /// Snapshot index of the first item, for progress lines.
    pub first_index: usize,
    pub show_progress: bool,
}

impl PipelineConfig {
    pub fn from_settings(settings: &Settings, checkpoint_path: PathBuf, final_path: PathBuf) -> Self {
        PipelineConfig {
            checkpoint_interval: settings.checkpoint_interval,
            delay: settings.delay(),
            jitter: settings.jitter(),
            checkpoint_path,
            final_path,
            first_index: 0,
            show_progress: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Running,
    Completed,
    Aborted,
}

/// Outcome of one run.
#[derive(Debug)]
pub struct RunReport {
    pub items: Vec<ProcessedItem>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub phase: RunPhase,
    /// Where `items` ended up: the final path, or the checkpoint on abort.
    pub output: PathBuf,
}

impl RunReport {
    pub fn print(&self) {
        println!(
            "Processed {} of {} items ({} ok, {} failed).",
            self.items.len(),
            self.total,
            self.succeeded,
            self.failed
        );
        println!("Saved to {}", self.output.display());
    }
}

/// Sequential, paced, checkpointed run of one processor over a snapshot.
pub struct Pipeline {
    config: PipelineConfig,
    store: CheckpointStore,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, store: CheckpointStore) -> Result<Self, ConfigError> {
        if config.checkpoint_interval == 0 {
            return Err(ConfigError::Invalid("checkpoint_interval must be at least 1".into()));
        }
        Ok(Pipeline {
            config,
            store,
            cancel: CancellationToken::new(),
        })
    }

    /// Stop the run when `token` is cancelled. The item in flight is
    /// dropped and what was finished so far is flushed.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub async fn run(
        &self,
        items: Vec<WorkItem>,
        processor: &dyn ItemProcessor,
    ) -> Result<RunReport, CheckpointError> {
        let total = items.len();
        debug!("Phase {:?}: {} items through {}", RunPhase::Running, total, processor.name());
        let pb = progress_bar(total, self.config.show_progress);

        let mut state: Vec<ProcessedItem> = Vec::with_capacity(total);
        let mut succeeded = 0usize;
        let mut aborted = false;

        for (i, item) in items.into_iter().enumerate() {
            if i > 0 && !self.pace().await {
                aborted = true;
                break;
            }

            let index = self.config.first_index + i;
            let label = item.display_name().to_string();
            let processed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    aborted = true;
                    break;
                }
                p = processor.process(item) => p,
            };

            if processed.is_success() {
                succeeded += 1;
                pb.println(format!("[{}] ok      {}", index + 1, label));
            } else {
                let reason = processed.error.as_deref().unwrap_or("failed");
                pb.println(format!("[{}] FAILED  {} ({})", index + 1, label, reason));
            }
            debug!(index, id = processed.id(), success = processed.is_success(), "item done");
            state.push(processed);
            pb.inc(1);

            if state.len() % self.config.checkpoint_interval == 0 {
                self.checkpoint(&state);
            }
        }
        pb.finish_and_clear();

        let failed = state.len() - succeeded;
        if aborted {
            warn!("Run interrupted after {} of {} items", state.len(), total);
            self.checkpoint(&state);
            return Ok(RunReport {
                items: state,
                total,
                succeeded,
                failed,
                phase: RunPhase::Aborted,
                output: self.config.checkpoint_path.clone(),
            });
        }

        if let Err(e) = self.store.finalize(&state, &self.config.final_path) {
            warn!("Final write failed, saving checkpoint instead: {}", e);
            self.checkpoint(&state);
            return Err(e);
        }
        info!(
            "Run complete: {} items ({} ok, {} failed) -> {}",
            state.len(),
            succeeded,
            failed,
            self.config.final_path.display()
        );

        Ok(RunReport {
            items: state,
            total,
            succeeded,
            failed,
            phase: RunPhase::Completed,
            output: self.config.final_path.clone(),
        })
    }

    /// Flush to the checkpoint path. A failure here only costs durability,
    /// so it is logged and the run goes on.
    fn checkpoint(&self, state: &[ProcessedItem]) {
        match self.store.flush(state, &self.config.checkpoint_path) {
            Ok(()) => info!(
                "Checkpoint: {} items -> {}",
                state.len(),
                self.config.checkpoint_path.display()
            ),
            Err(e) => warn!("Checkpoint at {} items failed: {}", state.len(), e),
        }
    }

    /// Wait the pacing delay. Returns false if cancelled meanwhile.
    async fn pace(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let wait = self.config.delay + jitter(self.config.jitter);
        if wait.is_zero() {
            return true;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

fn progress_bar(total: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template(PROGRESS_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    pb.set_style(style);
    pb
}
