use crate::client::{ClientError, JobFilter, JobInfo, TorrentClient};
use crate::config::Tags;
use std::time::Duration;

/// Rolling window over completed jobs, newest-completed first.
#[derive(Debug, Clone)]
pub struct KickstartWindow {
    batch_size: usize,
    multiplier: usize,
}

impl KickstartWindow {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            multiplier: 0,
        }
    }

    pub fn multiplier(&self) -> usize {
        self.multiplier
    }

    pub fn reset(&mut self) {
        self.multiplier = 0;
    }

    /// Returns the batch at the current offset. An offset at or past the end
    /// wraps back to the newest jobs. The window only moves on `advance`.
    pub fn batch<'a, T>(&mut self, jobs: &'a [T]) -> &'a [T] {
        let mut offset = self.multiplier.saturating_mul(self.batch_size);
        if offset >= jobs.len() {
            self.multiplier = 0;
            offset = 0;
        }
        let end = offset.saturating_add(self.batch_size).min(jobs.len());
        &jobs[offset..end]
    }

    pub fn advance(&mut self) {
        self.multiplier += 1;
    }
}

/// Completed jobs carrying one of our tags, newest completion first.
pub fn completed_jobs(jobs: Vec<JobInfo>, tags: &Tags) -> Vec<JobInfo> {
    let mut done: Vec<JobInfo> = jobs
        .into_iter()
        .filter(|j| j.is_complete() && j.category(tags).is_some())
        .collect();
    done.sort_by(|a, b| b.completion_on.cmp(&a.completion_on));
    done
}

/// Cycles one batch through pause, resume and reannounce, settling between
/// steps. Returns how many jobs were touched.
pub async fn kickstart(
    client: &dyn TorrentClient,
    tags: &Tags,
    window: &mut KickstartWindow,
    settle: Duration,
) -> Result<usize, ClientError> {
    let completed = completed_jobs(client.jobs(&JobFilter::completed()).await?, tags);
    let multiplier = window.multiplier();
    let batch: Vec<String> = window
        .batch(&completed)
        .iter()
        .map(|j| j.hash.clone())
        .collect();
    if batch.is_empty() {
        tracing::info!("kickstart: no completed jobs to cycle");
        return Ok(0);
    }
    tracing::info!(
        jobs = batch.len(),
        completed = completed.len(),
        multiplier,
        "kickstart: cycling completed jobs"
    );

    client.pause_jobs(&batch).await?;
    tokio::time::sleep(settle).await;
    // One retry. On failure the window stays put so the next kickstart
    // resumes this batch.
    if let Err(err) = client.resume_jobs(&batch).await {
        tracing::warn!(%err, jobs = batch.len(), "kickstart: resume failed, retrying");
        tokio::time::sleep(settle).await;
        if let Err(err) = client.resume_jobs(&batch).await {
            tracing::error!(%err, hashes = ?batch, "kickstart: batch left paused");
            return Err(err);
        }
    }
    tokio::time::sleep(settle).await;
    client.reannounce_jobs(&batch).await?;
    tokio::time::sleep(settle).await;

    window.advance();
    tracing::info!(jobs = batch.len(), next_multiplier = window.multiplier(), "kickstart: batch done");
    Ok(batch.len())
}
