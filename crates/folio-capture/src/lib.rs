//! Screenshot capture orchestration: batch planning, throttled dispatch, and
//! the out-of-process capture backend.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use folio_core::{CaptureOutcome, CaptureStatus, PortfolioEntry, ScreenshotRef};
use folio_storage::{CatalogRepo, ScreenshotStore};
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "folio-capture";

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture backend failed: {0}")]
    Backend(String),
    #[error("capture backend produced no file at {}", .0.display())]
    NoOutput(PathBuf),
    #[error("screenshot storage failed: {0}")]
    Storage(#[from] anyhow::Error),
}

/// An out-of-process capability that renders `url` into an image at `output`.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn capture(&self, url: &str, output: &Path) -> Result<(), CaptureError>;
}

/// Backend that shells out to a configured command, appending the URL and the
/// output path as the final two arguments. Timeout, spawn failure, and
/// non-zero exit all collapse into [`CaptureError::Backend`].
#[derive(Debug, Clone)]
pub struct CommandCapture {
    program: String,
    leading_args: Vec<String>,
    timeout: Duration,
}

impl CommandCapture {
    pub fn new(program: impl Into<String>, leading_args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            leading_args,
            timeout,
        }
    }

    /// Build from a single command line such as `node script/capture_screenshot.mjs`.
    pub fn from_command_line(command_line: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut parts = command_line.split_whitespace().map(ToString::to_string);
        let program = parts.next().context("capture command is empty")?;
        Ok(Self {
            program,
            leading_args: parts.collect(),
            timeout,
        })
    }
}

fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        "no stderr output".to_string()
    } else {
        trimmed.chars().take(240).collect()
    }
}

#[async_trait]
impl CaptureBackend for CommandCapture {
    async fn capture(&self, url: &str, output: &Path) -> Result<(), CaptureError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .arg(url)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let finished = match timeout(self.timeout, cmd.output()).await {
            Ok(result) => result,
            Err(_) => {
                return Err(CaptureError::Backend(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        };

        let out = finished.map_err(|err| {
            CaptureError::Backend(format!("failed to start {}: {err}", self.program))
        })?;

        if !out.status.success() {
            return Err(CaptureError::Backend(format!(
                "{} ({})",
                out.status,
                stderr_excerpt(&out.stderr)
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub work_dir: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_delay: Duration::from_secs(30),
            work_dir: PathBuf::from("tmp/captures"),
        }
    }
}

/// One planned batch: the jobs to dispatch and how long after trigger time
/// they become eligible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledBatch {
    pub index: usize,
    pub start_after: Duration,
    pub entry_ids: Vec<Uuid>,
}

/// Partition entries into fixed-size batches with a linear stagger: batch `k`
/// starts `k * delay` after trigger time, keeping concurrent capture
/// processes bounded without a real rate limiter.
pub fn plan_batches(
    entries: &[PortfolioEntry],
    batch_size: usize,
    delay: Duration,
) -> Vec<ScheduledBatch> {
    let size = batch_size.max(1);
    entries
        .chunks(size)
        .enumerate()
        .map(|(index, chunk)| ScheduledBatch {
            index,
            start_after: delay.saturating_mul(index as u32),
            entry_ids: chunk.iter().map(|e| e.id).collect(),
        })
        .collect()
}

/// Capture one entry end to end. Nothing propagates out of this boundary:
/// every failure is logged and returned as a `Failed` outcome, and the temp
/// output file is removed on every exit path.
pub async fn capture_entry(
    catalog: &dyn CatalogRepo,
    screenshots: &ScreenshotStore,
    backend: &dyn CaptureBackend,
    work_dir: &Path,
    entry_id: Uuid,
) -> CaptureOutcome {
    // Re-validate at capture time; the entry may have been deactivated (or
    // removed) between batch planning and dispatch.
    let entry = match catalog.find_by_id(entry_id).await {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            debug!(%entry_id, "entry vanished before capture; skipping");
            return CaptureOutcome {
                entry_id,
                url: String::new(),
                status: CaptureStatus::Skipped,
            };
        }
        Err(err) => {
            warn!(%entry_id, error = %err, "loading entry for capture failed");
            let reason = CaptureError::Storage(err.into()).to_string();
            return CaptureOutcome {
                entry_id,
                url: String::new(),
                status: CaptureStatus::Failed { reason },
            };
        }
    };

    if !entry.active || entry.url.trim().is_empty() {
        debug!(%entry_id, "entry inactive or without url; skipping capture");
        return CaptureOutcome {
            entry_id,
            url: entry.url,
            status: CaptureStatus::Skipped,
        };
    }

    let temp_path = work_dir.join(format!(
        "portfolio_{}_{}.png",
        entry.id,
        Utc::now().timestamp()
    ));

    let result = capture_into(catalog, screenshots, backend, &entry, &temp_path).await;

    if let Err(err) = fs::remove_file(&temp_path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(%entry_id, error = %err, "removing capture temp file failed");
        }
    }

    match result {
        Ok(shot) => {
            info!(%entry_id, url = %entry.url, bytes = shot.byte_size, "captured screenshot");
            CaptureOutcome {
                entry_id,
                url: entry.url,
                status: CaptureStatus::Captured(shot),
            }
        }
        Err(err) => {
            warn!(%entry_id, url = %entry.url, error = %err, "screenshot capture failed");
            CaptureOutcome {
                entry_id,
                url: entry.url,
                status: CaptureStatus::Failed {
                    reason: err.to_string(),
                },
            }
        }
    }
}

async fn capture_into(
    catalog: &dyn CatalogRepo,
    screenshots: &ScreenshotStore,
    backend: &dyn CaptureBackend,
    entry: &PortfolioEntry,
    temp_path: &Path,
) -> Result<ScreenshotRef, CaptureError> {
    if let Some(parent) = temp_path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating capture work directory {}", parent.display()))?;
    }

    backend.capture(&entry.url, temp_path).await?;

    let exists = fs::try_exists(temp_path)
        .await
        .with_context(|| format!("checking capture output {}", temp_path.display()))?;
    if !exists {
        return Err(CaptureError::NoOutput(temp_path.to_path_buf()));
    }

    let bytes = fs::read(temp_path)
        .await
        .with_context(|| format!("reading capture output {}", temp_path.display()))?;

    let shot = screenshots
        .attach(entry.id, &bytes, "image/png")
        .await
        .map_err(CaptureError::Storage)?;

    catalog
        .set_screenshot(entry.id, Some(shot.clone()))
        .await
        .map_err(|err| CaptureError::Storage(err.into()))?;

    Ok(shot)
}

/// Drives captures for a set of entries: one task per batch, one task per
/// entry, outcomes streamed over a channel.
pub struct CaptureRunner {
    catalog: Arc<dyn CatalogRepo>,
    screenshots: Arc<ScreenshotStore>,
    backend: Arc<dyn CaptureBackend>,
    config: CaptureConfig,
}

impl CaptureRunner {
    pub fn new(
        catalog: Arc<dyn CatalogRepo>,
        screenshots: Arc<ScreenshotStore>,
        backend: Arc<dyn CaptureBackend>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            catalog,
            screenshots,
            backend,
            config,
        }
    }

    /// Schedule captures for `entries` and hand back the outcome stream
    /// without waiting. Dropping the receiver is fine; the captures still
    /// run to completion.
    pub fn spawn_all(&self, entries: &[PortfolioEntry]) -> mpsc::Receiver<CaptureOutcome> {
        let plan = plan_batches(entries, self.config.batch_size, self.config.batch_delay);
        let (tx, rx) = mpsc::channel(entries.len().max(1));
        let trigger = Instant::now();

        for batch in plan {
            let catalog = Arc::clone(&self.catalog);
            let screenshots = Arc::clone(&self.screenshots);
            let backend = Arc::clone(&self.backend);
            let work_dir = self.config.work_dir.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                sleep_until(trigger + batch.start_after).await;
                debug!(
                    batch = batch.index,
                    jobs = batch.entry_ids.len(),
                    "dispatching capture batch"
                );

                let mut handles = Vec::with_capacity(batch.entry_ids.len());
                for entry_id in batch.entry_ids {
                    let catalog = Arc::clone(&catalog);
                    let screenshots = Arc::clone(&screenshots);
                    let backend = Arc::clone(&backend);
                    let work_dir = work_dir.clone();
                    let tx = tx.clone();

                    handles.push(tokio::spawn(async move {
                        let outcome = capture_entry(
                            catalog.as_ref(),
                            screenshots.as_ref(),
                            backend.as_ref(),
                            &work_dir,
                            entry_id,
                        )
                        .await;
                        // The receiver may be gone for fire-and-forget callers.
                        let _ = tx.send(outcome).await;
                    }));
                }

                for handle in handles {
                    if let Err(err) = handle.await {
                        error!("capture task panicked: {err}");
                    }
                }
            });
        }

        rx
    }

    /// Run captures for `entries` and collect every outcome.
    pub async fn run_to_completion(&self, entries: &[PortfolioEntry]) -> Vec<CaptureOutcome> {
        let mut rx = self.spawn_all(entries);
        let mut outcomes = Vec::with_capacity(entries.len());
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        outcomes
    }
}
