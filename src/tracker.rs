use crate::client::{Category, JobInfo};
use crate::config::{Checkpoint, Config, Tags, bytes_to_gb};
use crate::marker::Marker;

/// The one download currently under observation.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedJob {
    pub hash: String,
    pub name: String,
    /// Client-side `added_on` (unix seconds), so accounting survives restarts.
    pub start_time: i64,
    pub size_bytes: u64,
    /// 0 means unbounded.
    pub timeout_secs: f64,
    /// Indices into the configured checkpoint table.
    pub visited: Vec<usize>,
    pub category: Category,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum ActiveDownload {
    #[default]
    Idle,
    Tracking(TrackedJob),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Verdict {
    Continue,
    TimedOut,
    EarlyAbandon(Checkpoint),
    Stalled,
}

impl Verdict {
    /// Marker applied to the originating descriptor when the verdict is acted on.
    pub fn marker(self) -> Option<Marker> {
        match self {
            Self::Continue => None,
            Self::Stalled => Some(Marker::Dead),
            Self::TimedOut | Self::EarlyAbandon(_) => Some(Marker::Slow),
        }
    }
}

/// `(max(size_gb, floor) / gb_per_hour) * 3600`, or 0 for Keep jobs.
pub fn timeout_secs(size_bytes: u64, category: Category, cfg: &Config) -> f64 {
    if category == Category::Keep {
        return 0.0;
    }
    let size_gb = bytes_to_gb(size_bytes).max(cfg.timeout_floor_gb);
    (size_gb / cfg.gb_per_hour) * 3600.0
}

/// Earliest-added unfinished job carrying a recognized category tag.
pub fn active_job<'a>(jobs: &'a [JobInfo], tags: &Tags) -> Option<(&'a JobInfo, Category)> {
    jobs.iter()
        .filter(|j| !j.is_complete())
        .filter_map(|j| j.category(tags).map(|c| (j, c)))
        .min_by_key(|(j, _)| j.added_on)
}

impl ActiveDownload {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn tracked(&self) -> Option<&TrackedJob> {
        match self {
            Self::Idle => None,
            Self::Tracking(job) => Some(job),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::Idle;
    }

    /// Syncs with the client's current active job. A different job replaces
    /// the state wholesale; the same job keeps its visited checkpoints.
    /// Returns true when a new job started being tracked.
    pub fn observe(&mut self, active: Option<(&JobInfo, Category)>, cfg: &Config) -> bool {
        let Some((job, category)) = active else {
            if let Self::Tracking(prev) = self {
                tracing::info!(hash = %prev.hash, name = %prev.name, "tracker: no active download, going idle");
            }
            self.reset();
            return false;
        };
        if self
            .tracked()
            .is_some_and(|t| t.hash.eq_ignore_ascii_case(&job.hash))
        {
            return false;
        }

        let size_bytes = u64::try_from(job.size).unwrap_or(0);
        let timeout = timeout_secs(size_bytes, category, cfg);
        tracing::info!(
            hash = %job.hash,
            name = %job.name,
            %category,
            size_gb = bytes_to_gb(size_bytes),
            timeout_secs = timeout,
            "tracker: tracking download"
        );
        *self = Self::Tracking(TrackedJob {
            hash: job.hash.clone(),
            name: job.name.clone(),
            start_time: job.added_on,
            size_bytes,
            timeout_secs: timeout,
            visited: Vec::new(),
            category,
        });
        true
    }

    /// Evaluates the tracked job at wall-clock `now` (unix seconds).
    pub fn evaluate(&mut self, now: i64, progress: f64, cfg: &Config) -> Verdict {
        match self {
            Self::Idle => Verdict::Continue,
            Self::Tracking(job) => job.evaluate(now, progress, cfg),
        }
    }
}

impl TrackedJob {
    pub fn elapsed_secs(&self, now: i64) -> f64 {
        now.saturating_sub(self.start_time).max(0) as f64
    }

    fn stall_threshold(&self, cfg: &Config) -> f64 {
        match self.category {
            Category::Keep => cfg.keep_stall_secs as f64,
            Category::Standard | Category::UploadSimulation => cfg.stall_secs as f64,
        }
    }

    pub fn evaluate(&mut self, now: i64, progress: f64, cfg: &Config) -> Verdict {
        let elapsed = self.elapsed_secs(now);

        let stall = self.stall_threshold(cfg);
        if elapsed > stall && progress == 0.0 {
            tracing::warn!(
                hash = %self.hash,
                name = %self.name,
                elapsed_secs = elapsed,
                stall_secs = stall,
                "tracker: no data received, stalled"
            );
            return Verdict::Stalled;
        }

        if self.category == Category::Keep {
            return Verdict::Continue;
        }

        if elapsed > self.timeout_secs {
            tracing::warn!(
                hash = %self.hash,
                name = %self.name,
                elapsed_secs = elapsed,
                timeout_secs = self.timeout_secs,
                progress,
                "tracker: download timed out"
            );
            return Verdict::TimedOut;
        }

        let crossed = cfg
            .checkpoints
            .iter()
            .enumerate()
            .rev()
            .find(|(i, cp)| {
                !self.visited.contains(i) && elapsed >= cp.time_fraction * self.timeout_secs
            });
        let Some((index, checkpoint)) = crossed else {
            return Verdict::Continue;
        };

        if progress < checkpoint.min_progress {
            tracing::warn!(
                hash = %self.hash,
                name = %self.name,
                elapsed_secs = elapsed,
                progress,
                time_fraction = checkpoint.time_fraction,
                min_progress = checkpoint.min_progress,
                "tracker: behind schedule at checkpoint, abandoning"
            );
            return Verdict::EarlyAbandon(*checkpoint);
        }

        tracing::info!(
            hash = %self.hash,
            elapsed_secs = elapsed,
            progress,
            time_fraction = checkpoint.time_fraction,
            min_progress = checkpoint.min_progress,
            "tracker: checkpoint passed"
        );
        self.visited.push(index);
        Verdict::Continue
    }
}
