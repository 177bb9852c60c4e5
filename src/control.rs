use crate::catalog::{Catalog, Selection};
use crate::client::{AddJob, ClientError, JobFilter, TorrentClient};
use crate::config::{Config, bytes_to_gb};
use crate::disk::{DiskGate, FsProbe, SpaceProbe};
use crate::evict;
use crate::kickstart::{self, KickstartWindow};
use crate::qbittorrent::QbClient;
use crate::simulate;
use crate::tracker::{self, ActiveDownload, Verdict};
use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{Instant, sleep};

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Admitted,
    Wait(Duration),
}

/// Everything the loop owns for the lifetime of one client session.
pub struct Controller<'a, P> {
    cfg: &'a Config,
    client: &'a dyn TorrentClient,
    gate: DiskGate<P>,
    peer_host: String,
    state: ActiveDownload,
    window: KickstartWindow,
    blocked_since: Option<Instant>,
    failures: u32,
}

impl<'a, P: SpaceProbe> Controller<'a, P> {
    pub fn new(
        cfg: &'a Config,
        client: &'a dyn TorrentClient,
        gate: DiskGate<P>,
        peer_host: String,
    ) -> Self {
        Self {
            cfg,
            client,
            gate,
            peer_host,
            state: ActiveDownload::Idle,
            window: KickstartWindow::new(cfg.kickstart_batch),
            blocked_since: None,
            failures: 0,
        }
    }

    fn catalog(&self) -> Catalog<'a> {
        Catalog::new(&self.cfg.queues, &self.cfg.tracker_priority)
    }

    /// Runs iterations until the session is lost.
    pub async fn run(&mut self) -> ClientError {
        loop {
            if let Err(err) = self.run_once().await {
                return err;
            }
        }
    }

    /// Downloads clear, optional simulated-peer session, upload protection,
    /// then admission of exactly one new job.
    pub async fn run_once(&mut self) -> Result<(), ClientError> {
        self.wait_for_downloads().await?;

        if self.cfg.sim_enabled {
            match simulate::run_session(self.client, self.cfg, &self.peer_host).await {
                Some(outcome) => tracing::info!(?outcome, "control: simulated-peer session finished"),
                None => tracing::debug!("control: no job eligible for a simulated-peer session"),
            }
        }

        self.protect_uploads().await?;

        loop {
            match self.admission_step().await? {
                Step::Admitted => return Ok(()),
                Step::Wait(d) => sleep(d).await,
            }
        }
    }

    /// Swallows a transient failure unless too many happened in a row.
    fn note_failure(&mut self, what: &str, err: ClientError) -> Result<(), ClientError> {
        if err.is_connectivity_lost() {
            return Err(err);
        }
        self.failures += 1;
        if self.failures >= self.cfg.max_transient_failures.max(1) {
            tracing::error!(%err, failures = self.failures, "control: {what} keeps failing, dropping session");
            return Err(err);
        }
        tracing::warn!(%err, failures = self.failures, "control: {what} failed, retrying");
        Ok(())
    }

    fn note_success(&mut self) {
        self.failures = 0;
    }

    async fn wait_for_downloads(&mut self) -> Result<(), ClientError> {
        loop {
            match self.tick().await {
                Ok(false) => {
                    self.note_success();
                    return Ok(());
                }
                Ok(true) => self.note_success(),
                Err(err) => self.note_failure("tracker poll", err)?,
            }
            sleep(self.cfg.poll_interval()).await;
        }
    }

    /// One tracker tick. Returns whether a download is still active. After an
    /// eviction the client is asked again at once, since another tagged job
    /// may still be downloading.
    async fn tick(&mut self) -> Result<bool, ClientError> {
        loop {
            let downloading = self.client.jobs(&JobFilter::downloading()).await?;
            let active = tracker::active_job(&downloading, &self.cfg.tags);
            self.state.observe(active, self.cfg);
            let Some((job, _)) = active else {
                return Ok(false);
            };

            let now = now_unix();
            let verdict = self.state.evaluate(now, job.progress, self.cfg);
            let pending = self.pending().await;
            if let Some(t) = self.state.tracked() {
                tracing::info!(
                    hash = %job.short_hash(),
                    name = %job.name,
                    progress = job.progress,
                    elapsed_secs = t.elapsed_secs(now),
                    timeout_secs = t.timeout_secs,
                    pending,
                    "tracker: download in progress"
                );
            }

            if verdict == Verdict::Continue {
                return Ok(true);
            }
            let catalog = self.catalog();
            evict::evict(self.client, &catalog, &mut self.state, verdict).await?;
            if !self.state.is_idle() {
                return Ok(true);
            }
        }
    }

    async fn known_hashes(&self) -> Result<HashSet<String>, ClientError> {
        Ok(self
            .client
            .jobs(&JobFilter::all())
            .await?
            .into_iter()
            .map(|j| j.hash.to_ascii_lowercase())
            .collect())
    }

    async fn pending(&self) -> usize {
        match self.known_hashes().await {
            Ok(known) => self.catalog().pending_count(&known),
            Err(err) => {
                tracing::debug!(%err, "control: pending count unavailable");
                0
            }
        }
    }

    /// Average upload rate in KB/s over the sampling window. Failed samples
    /// are skipped; no successful sample reads as zero.
    pub async fn sample_upload_kb(&self) -> Result<f64, ClientError> {
        let interval = self.cfg.upload_sample_interval_secs.max(1);
        let count = (self.cfg.upload_sample_secs / interval).max(1);
        let mut total = 0u64;
        let mut taken = 0u64;
        for i in 0..count {
            match self.client.transfer_info().await {
                Ok(info) => {
                    total = total.saturating_add(info.up_info_speed);
                    taken += 1;
                }
                Err(err) if err.is_connectivity_lost() => return Err(err),
                Err(err) => tracing::debug!(%err, "control: upload sample failed"),
            }
            if i + 1 < count {
                sleep(Duration::from_secs(interval)).await;
            }
        }
        if taken == 0 {
            return Ok(0.0);
        }
        Ok(total as f64 / taken as f64 / 1024.0)
    }

    fn upload_is_high(&self, avg_kb: f64) -> bool {
        avg_kb > self.cfg.upload_threshold_kb
    }

    /// Holds off new work while the client is busy uploading.
    async fn protect_uploads(&mut self) -> Result<(), ClientError> {
        loop {
            let avg = self.sample_upload_kb().await?;
            if !self.upload_is_high(avg) {
                tracing::info!(avg_kb = avg, threshold_kb = self.cfg.upload_threshold_kb, "control: upload rate low, proceeding");
                return Ok(());
            }
            tracing::info!(
                avg_kb = avg,
                threshold_kb = self.cfg.upload_threshold_kb,
                wait_secs = self.cfg.upload_protect_secs,
                "control: upload rate high, protecting"
            );
            sleep(Duration::from_secs(self.cfg.upload_protect_secs)).await;
        }
    }

    pub async fn admission_step(&mut self) -> Result<Step, ClientError> {
        let known = match self.known_hashes().await {
            Ok(k) => {
                self.note_success();
                k
            }
            Err(err) => {
                self.note_failure("listing jobs", err)?;
                return Ok(Step::Wait(Duration::from_secs(self.cfg.wait_disk_secs)));
            }
        };

        let selection = self.catalog().select(&known, &self.gate);
        match selection {
            Selection::Admitted {
                candidate,
                free_bytes,
            } => {
                tracing::info!(
                    file = %candidate.file_name(),
                    hash = %candidate.descriptor.info_hash,
                    category = %candidate.category,
                    size_gb = bytes_to_gb(candidate.descriptor.total_size),
                    free_gb = bytes_to_gb(free_bytes),
                    priority = candidate.priority,
                    "control: admitting"
                );
                let bytes = match std::fs::read(&candidate.path) {
                    Ok(b) => b,
                    Err(err) => {
                        tracing::warn!(%err, path = %candidate.path.display(), "control: descriptor vanished before adding");
                        return Ok(Step::Wait(Duration::ZERO));
                    }
                };
                let add = AddJob {
                    file_name: candidate.file_name(),
                    bytes,
                    save_path: self.cfg.save_path.clone(),
                    tag: self.cfg.tags.tag_for(candidate.category).to_string(),
                };
                if let Err(err) = self.client.add_job(add).await {
                    self.note_failure("adding job", err)?;
                    return Ok(Step::Wait(Duration::from_secs(self.cfg.wait_disk_secs)));
                }
                sleep(Duration::from_secs(self.cfg.wait_after_add_secs)).await;

                if self.confirm_added(&candidate.descriptor.info_hash).await? {
                    self.note_success();
                    self.window.reset();
                    self.blocked_since = None;
                    tracing::info!(hash = %candidate.descriptor.info_hash, "control: job added and confirmed");
                    Ok(Step::Admitted)
                } else {
                    tracing::error!(
                        hash = %candidate.descriptor.info_hash,
                        deadline_secs = self.cfg.verify_add_secs,
                        "control: added job never showed up"
                    );
                    Ok(Step::Wait(Duration::from_secs(self.cfg.wait_disk_secs)))
                }
            }
            Selection::Blocked {
                category,
                candidates,
                smallest_rejected,
                free_bytes,
            } => {
                tracing::warn!(
                    %category,
                    candidates,
                    smallest_gb = bytes_to_gb(smallest_rejected),
                    free_gb = bytes_to_gb(free_bytes),
                    reserve_gb = bytes_to_gb(self.cfg.disk_reserve_bytes),
                    "control: not enough disk space for any candidate"
                );
                self.on_blocked().await
            }
            Selection::Empty => {
                tracing::info!(wait_secs = self.cfg.wait_no_torrent_secs, "control: no candidate descriptors");
                self.window.reset();
                self.blocked_since = None;
                Ok(Step::Wait(Duration::from_secs(self.cfg.wait_no_torrent_secs)))
            }
        }
    }

    /// Deadlock bookkeeping while admission is blocked.
    async fn on_blocked(&mut self) -> Result<Step, ClientError> {
        let avg = self.sample_upload_kb().await?;
        if self.upload_is_high(avg) {
            tracing::info!(avg_kb = avg, "control: blocked but uploading, resetting deadlock timer");
            self.blocked_since = None;
            self.window.reset();
            return Ok(Step::Wait(Duration::from_secs(self.cfg.upload_protect_secs)));
        }

        let since = *self.blocked_since.get_or_insert_with(Instant::now);
        let elapsed = since.elapsed();
        let threshold = Duration::from_secs(self.cfg.disk_deadlock_secs);
        if elapsed <= threshold {
            tracing::info!(
                blocked_secs = elapsed.as_secs(),
                deadlock_secs = self.cfg.disk_deadlock_secs,
                avg_kb = avg,
                "control: waiting for disk space"
            );
            return Ok(Step::Wait(Duration::from_secs(self.cfg.wait_disk_secs)));
        }

        tracing::warn!(
            blocked_secs = elapsed.as_secs(),
            avg_kb = avg,
            "control: disk deadlock, kickstarting completed jobs"
        );
        let settle = Duration::from_secs(self.cfg.kickstart_settle_secs);
        match kickstart::kickstart(self.client, &self.cfg.tags, &mut self.window, settle).await {
            Ok(_) => {
                self.note_success();
                self.blocked_since = Some(Instant::now());
            }
            Err(err) => self.note_failure("kickstart", err)?,
        }
        Ok(Step::Wait(Duration::from_secs(self.cfg.wait_disk_secs)))
    }

    /// Polls once per second until the client reports `hash` or the deadline passes.
    async fn confirm_added(&mut self, hash: &str) -> Result<bool, ClientError> {
        let deadline = Instant::now() + Duration::from_secs(self.cfg.verify_add_secs);
        loop {
            match self.client.job(hash).await {
                Ok(Some(_)) => return Ok(true),
                Ok(None) => {}
                Err(err) => self.note_failure("confirming add", err)?,
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    #[cfg(test)]
    fn window(&self) -> &KickstartWindow {
        &self.window
    }
}

/// Connects, runs the controller until the session is lost, backs off and
/// reconnects. Tracker state is rebuilt from the client after every reconnect.
pub async fn run(cfg: &Config) {
    let backoff = Duration::from_secs(cfg.reconnect_secs.max(1));
    for queue in &cfg.queues {
        if let Err(err) = std::fs::create_dir_all(&queue.dir) {
            tracing::warn!(%err, dir = %queue.dir.display(), "control: cannot create source queue");
        }
    }

    loop {
        let client = match QbClient::connect(cfg).await {
            Ok(c) => c,
            Err(err) => {
                tracing::error!(%err, url = %cfg.qb_url, retry_secs = backoff.as_secs(), "control: connecting to client failed");
                sleep(backoff).await;
                continue;
            }
        };
        match client.version().await {
            Ok(version) => tracing::info!(%version, url = %cfg.qb_url, "control: connected to client"),
            Err(err) => {
                tracing::error!(%err, retry_secs = backoff.as_secs(), "control: client version check failed");
                sleep(backoff).await;
                continue;
            }
        }

        let peer_host = cfg
            .sim_peer_host
            .clone()
            .or_else(|| client.host().map(str::to_string))
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let gate = DiskGate::new(
            FsProbe {
                path: cfg.disk_path.clone(),
            },
            cfg.disk_reserve_bytes,
        );
        let mut controller = Controller::new(cfg, &client, gate, peer_host);
        let err = controller.run().await;
        tracing::error!(%err, retry_secs = backoff.as_secs(), "control: lost connection to client, reconnecting");
        sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Category;
    use crate::client::fake::{FakeClient, job};
    use crate::config::{SourceQueue, gb_to_bytes, test_config};
    use crate::descriptor::{self, fixtures::single_file};
    use crate::disk::FixedProbe;
    use crate::testutil::temp_dir;

    fn config_with_queue(dir: &std::path::Path) -> Config {
        let mut cfg = test_config();
        cfg.sim_enabled = false;
        cfg.disk_reserve_bytes = 0;
        cfg.queues = vec![SourceQueue {
            category: Category::Keep,
            dir: dir.to_path_buf(),
        }];
        cfg
    }

    fn write_descriptor(dir: &std::path::Path, name: &str, size: u64) -> String {
        let raw = single_file(name, size, "http://t.example/announce");
        std::fs::write(dir.join(format!("{name}.torrent")), &raw).unwrap();
        descriptor::decode(&raw).unwrap().info_hash
    }

    #[tokio::test(start_paused = true)]
    async fn idle_client_admits_one_job_with_category_tag() {
        let dir = temp_dir("control-admit");
        let hash = write_descriptor(&dir, "next", 1 << 20);
        let cfg = config_with_queue(&dir);
        let client = FakeClient::default();
        let gate = DiskGate::new(FixedProbe(Some(gb_to_bytes(100.0))), 0);
        let mut controller = Controller::new(&cfg, &client, gate, "127.0.0.1".to_string());

        controller.run_once().await.unwrap();

        assert_eq!(client.calls(), vec![format!("add:{hash}")]);
        let jobs = client.jobs.lock().unwrap().clone();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].has_tag("auto-keep"));
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_admission_kickstarts_after_deadlock() {
        let dir = temp_dir("control-deadlock");
        write_descriptor(&dir, "huge", gb_to_bytes(50.0));
        let mut cfg = config_with_queue(&dir);
        cfg.disk_deadlock_secs = 30;
        cfg.kickstart_batch = 2;
        let done: Vec<_> = (0..3)
            .map(|i| {
                let mut j = job(&format!("done{i}"), "auto-add", 1.0);
                j.completion_on = 100 + i;
                j
            })
            .collect();
        let client = FakeClient::with_jobs(done);
        let gate = DiskGate::new(FixedProbe(Some(gb_to_bytes(10.0))), 0);
        let mut controller = Controller::new(&cfg, &client, gate, "127.0.0.1".to_string());

        // First block starts the timer.
        let wait = controller.admission_step().await.unwrap();
        assert_eq!(wait, Step::Wait(Duration::from_secs(cfg.wait_disk_secs)));
        assert!(client.calls().is_empty());

        sleep(wait.duration()).await;
        controller.admission_step().await.unwrap();
        assert_eq!(
            client.calls(),
            vec!["pause:done2|done1", "resume:done2|done1", "reannounce:done2|done1"]
        );
        assert_eq!(controller.window().multiplier(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn high_upload_resets_deadlock_and_window() {
        let dir = temp_dir("control-upload");
        write_descriptor(&dir, "huge", gb_to_bytes(50.0));
        let mut cfg = config_with_queue(&dir);
        cfg.disk_deadlock_secs = 0;
        cfg.upload_sample_secs = 2;
        cfg.upload_sample_interval_secs = 2;
        let client = FakeClient::with_jobs(vec![job("done", "auto-add", 1.0)]);
        client.upload_speeds.lock().unwrap().push_back(500 * 1024);
        let gate = DiskGate::new(FixedProbe(Some(gb_to_bytes(10.0))), 0);
        let mut controller = Controller::new(&cfg, &client, gate, "127.0.0.1".to_string());

        let step = controller.admission_step().await.unwrap();
        assert_eq!(step, Step::Wait(Duration::from_secs(cfg.upload_protect_secs)));
        assert!(controller.blocked_since.is_none());
        assert!(client.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_download_is_evicted_before_admission() {
        let dir = temp_dir("control-evict");
        let stuck = write_descriptor(&dir, "stuck", 1 << 20);
        let next = write_descriptor(&dir, "zz-next", 1 << 20);
        let cfg = config_with_queue(&dir);
        let mut running = job(&stuck, "auto-add", 0.0);
        // Added long ago, never received a byte.
        running.added_on = now_unix() - 10 * 3600;
        let client = FakeClient::with_jobs(vec![running]);
        let gate = DiskGate::new(FixedProbe(Some(gb_to_bytes(100.0))), 0);
        let mut controller = Controller::new(&cfg, &client, gate, "127.0.0.1".to_string());

        controller.run_once().await.unwrap();

        assert_eq!(
            client.calls(),
            vec![format!("delete:{stuck}"), format!("add:{next}")]
        );
        assert!(dir.join("stuck.torrent.dead").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_rechecks_for_other_downloads_before_admitting() {
        let dir = temp_dir("control-evict-two");
        let stuck = write_descriptor(&dir, "stuck", 1 << 20);
        let next = write_descriptor(&dir, "zz-next", 1 << 20);
        let cfg = config_with_queue(&dir);
        let mut stalled = job(&stuck, "auto-add", 0.0);
        stalled.added_on = now_unix() - 10 * 3600;
        let mut healthy = job("bbbb", "auto-add", 0.5);
        healthy.added_on = now_unix();
        let client = FakeClient::with_jobs(vec![stalled, healthy]);
        let gate = DiskGate::new(FixedProbe(Some(gb_to_bytes(100.0))), 0);
        let mut controller = Controller::new(&cfg, &client, gate, "127.0.0.1".to_string());

        assert!(controller.tick().await.unwrap());
        assert_eq!(client.calls(), vec![format!("delete:{stuck}")]);
        assert_eq!(controller.state.tracked().map(|t| t.hash.as_str()), Some("bbbb"));

        // Only once the second download finishes is a new job admitted.
        for j in client.jobs.lock().unwrap().iter_mut() {
            j.progress = 1.0;
        }
        controller.run_once().await.unwrap();
        assert_eq!(
            client.calls(),
            vec![format!("delete:{stuck}"), format!("add:{next}")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn listing_success_clears_transient_failures() {
        let dir = temp_dir("control-blocked-failures");
        write_descriptor(&dir, "huge", gb_to_bytes(50.0));
        let mut cfg = config_with_queue(&dir);
        cfg.max_transient_failures = 2;
        let client = FakeClient::default();
        let gate = DiskGate::new(FixedProbe(Some(gb_to_bytes(10.0))), 0);
        let mut controller = Controller::new(&cfg, &client, gate, "127.0.0.1".to_string());

        let listing_error = || ClientError::Status {
            endpoint: "torrents/info".to_string(),
            status: 502,
        };
        client.fail_next(listing_error());
        controller.admission_step().await.unwrap();
        // Blocked on disk, but the listing itself went through.
        controller.admission_step().await.unwrap();
        client.fail_next(listing_error());
        controller.admission_step().await.unwrap();
        assert_eq!(controller.failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_transient_failures_escalate() {
        let cfg = config_with_queue(&temp_dir("control-fail"));
        let client = FakeClient::default();
        for _ in 0..cfg.max_transient_failures {
            client.fail_next(ClientError::Status {
                endpoint: "torrents/info".to_string(),
                status: 502,
            });
        }
        let gate = DiskGate::new(FixedProbe(Some(0)), 0);
        let mut controller = Controller::new(&cfg, &client, gate, "127.0.0.1".to_string());
        let err = controller.run_once().await.unwrap_err();
        assert!(matches!(err, ClientError::Status { status: 502, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn auth_loss_escalates_immediately() {
        let cfg = config_with_queue(&temp_dir("control-auth"));
        let client = FakeClient::default();
        client.fail_next(ClientError::Forbidden);
        let gate = DiskGate::new(FixedProbe(Some(0)), 0);
        let mut controller = Controller::new(&cfg, &client, gate, "127.0.0.1".to_string());
        assert!(matches!(
            controller.run_once().await,
            Err(ClientError::Forbidden)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn upload_average_skips_failed_samples() {
        let mut cfg = test_config();
        cfg.upload_sample_secs = 6;
        cfg.upload_sample_interval_secs = 2;
        let client = FakeClient::default();
        client
            .upload_speeds
            .lock()
            .unwrap()
            .extend([100 * 1024, 300 * 1024]);
        client.fail_next(ClientError::Status {
            endpoint: "transfer/info".to_string(),
            status: 500,
        });
        let gate = DiskGate::new(FixedProbe(Some(0)), 0);
        let controller = Controller::new(&cfg, &client, gate, "127.0.0.1".to_string());
        // One failure, then 100 and 300 KB/s.
        assert_eq!(controller.sample_upload_kb().await.unwrap(), 200.0);
    }

    impl Step {
        fn duration(self) -> Duration {
            match self {
                Step::Admitted => Duration::ZERO,
                Step::Wait(d) => d,
            }
        }
    }
}
