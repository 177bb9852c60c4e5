use crate::client::{Category, JobFilter, JobInfo, TorrentClient};
use crate::config::{Config, Tags};
use crate::wire;
use anyhow::Context;
use rand::Rng;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, timeout};

/// Why the worker stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    Error(String),
    Stalled,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Bytes received during the last second.
    Speed(u64),
    Finished(Termination),
}

/// What the control loop learns once a session is over.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionOutcome {
    RatioReached { ratio: f64, target: f64 },
    Stalled,
    Error(String),
    Cancelled,
    JobGone,
}

#[derive(Clone, Debug)]
pub struct PeerSettings {
    pub host: String,
    pub port: u16,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub idle_samples: u32,
}

impl PeerSettings {
    pub fn from_config(cfg: &Config, host: &str, port: u16, info_hash: [u8; 20]) -> Self {
        Self {
            host: host.to_string(),
            port,
            info_hash,
            peer_id: wire::peer_id(&cfg.sim_peer_id_prefix),
            connect_timeout: Duration::from_secs(cfg.sim_connect_timeout_secs.max(1)),
            read_timeout: Duration::from_millis(cfg.sim_read_timeout_ms.max(10)),
            idle_samples: cfg.sim_idle_samples.max(1),
        }
    }
}

/// Per-second throughput accounting for one session.
#[derive(Debug)]
pub struct SpeedMeter {
    window_bytes: u64,
    zero_run: u32,
    idle_samples: u32,
}

impl SpeedMeter {
    pub fn new(idle_samples: u32) -> Self {
        Self {
            window_bytes: 0,
            zero_run: 0,
            idle_samples,
        }
    }

    pub fn record(&mut self, n: usize) {
        self.window_bytes = self.window_bytes.saturating_add(n as u64);
    }

    /// Closes the current one-second window. Returns the sample and whether
    /// the session has now gone idle for too long.
    pub fn close_window(&mut self) -> (u64, bool) {
        let sample = std::mem::take(&mut self.window_bytes);
        if sample == 0 {
            self.zero_run += 1;
        } else {
            self.zero_run = 0;
        }
        (sample, self.zero_run >= self.idle_samples)
    }
}

/// Worker task body: downloads from the client's own listening port until
/// stopped, stalled or broken, then reports why.
pub async fn run_worker(
    settings: PeerSettings,
    events: mpsc::Sender<SessionEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let termination = match connect(&settings).await {
        Ok(mut stream) => {
            let t = pump(&mut stream, &settings, &events, &mut stop).await;
            let _ = stream.shutdown().await;
            t
        }
        Err(err) => Termination::Error(format!("{err:#}")),
    };
    let _ = events.send(SessionEvent::Speed(0)).await;
    let _ = events.send(SessionEvent::Finished(termination)).await;
}

async fn connect(settings: &PeerSettings) -> anyhow::Result<TcpStream> {
    let addr = format!("{}:{}", settings.host, settings.port);
    let mut stream = timeout(settings.connect_timeout, TcpStream::connect(&addr))
        .await
        .with_context(|| format!("connect to {addr} timed out"))?
        .with_context(|| format!("connect to {addr}"))?;
    stream.set_nodelay(true).ok();

    stream
        .write_all(&wire::handshake(&settings.info_hash, &settings.peer_id))
        .await
        .context("send handshake")?;
    let mut resp = [0u8; wire::HANDSHAKE_LEN];
    timeout(settings.connect_timeout, stream.read_exact(&mut resp))
        .await
        .context("handshake reply timed out")?
        .context("read handshake reply")?;
    wire::validate_handshake(&resp, &settings.info_hash)?;

    stream
        .write_all(&wire::interested())
        .await
        .context("send interested")?;
    Ok(stream)
}

async fn pump(
    stream: &mut TcpStream,
    settings: &PeerSettings,
    events: &mpsc::Sender<SessionEvent>,
    stop: &mut watch::Receiver<bool>,
) -> Termination {
    let request = wire::request(0, 0, wire::BLOCK_LEN);
    let mut buf = vec![0u8; wire::MAX_PIECE_FRAME];
    let mut meter = SpeedMeter::new(settings.idle_samples);
    let mut window_start = Instant::now();

    loop {
        if *stop.borrow() {
            return Termination::Cancelled;
        }
        if let Err(err) = stream.write_all(&request).await {
            return Termination::Error(format!("send request: {err}"));
        }

        let read = tokio::select! {
            // A dropped sender also means nobody is waiting for us.
            _ = stop.changed() => return Termination::Cancelled,
            r = timeout(settings.read_timeout, stream.read(&mut buf)) => r,
        };
        match read {
            Ok(Ok(0)) => return Termination::Error("peer closed the connection".to_string()),
            Ok(Ok(n)) => meter.record(n),
            Ok(Err(err)) => return Termination::Error(format!("read: {err}")),
            Err(_) => {}
        }

        if window_start.elapsed() >= Duration::from_secs(1) {
            window_start = Instant::now();
            let (sample, idle) = meter.close_window();
            if events.send(SessionEvent::Speed(sample)).await.is_err() {
                return Termination::Cancelled;
            }
            if idle {
                return Termination::Stalled;
            }
        }
    }
}

/// Most recently finished simulate-tagged job, if any.
pub fn latest_finished(jobs: Vec<JobInfo>, tags: &Tags) -> Option<JobInfo> {
    jobs.into_iter()
        .filter(|j| j.is_complete() && j.category(tags) == Some(Category::UploadSimulation))
        .max_by_key(|j| j.completion_on)
}

pub fn draw_target_ratio(cfg: &Config) -> f64 {
    if cfg.sim_ratio_max <= cfg.sim_ratio_min {
        return cfg.sim_ratio_min;
    }
    rand::rng().random_range(cfg.sim_ratio_min..=cfg.sim_ratio_max)
}

/// Runs one session against the most recently finished simulate job.
/// Returns `None` when there was nothing to do.
pub async fn run_session(
    client: &dyn TorrentClient,
    cfg: &Config,
    peer_host: &str,
) -> Option<SessionOutcome> {
    let jobs = match client.jobs(&JobFilter::completed()).await {
        Ok(jobs) => jobs,
        Err(err) => {
            tracing::warn!(%err, "simulate: listing completed jobs failed");
            return None;
        }
    };
    let job = latest_finished(jobs, &cfg.tags)?;
    let target = draw_target_ratio(cfg);
    if job.ratio >= target {
        tracing::debug!(hash = %job.hash, ratio = job.ratio, target, "simulate: job already at target ratio");
        return None;
    }

    let info_hash = match wire::info_hash_bytes(&job.hash) {
        Ok(h) => h,
        Err(err) => return Some(SessionOutcome::Error(err.to_string())),
    };
    let port = match client.listen_port().await {
        Ok(p) => p,
        Err(err) => {
            tracing::warn!(%err, "simulate: reading client listen port failed");
            return Some(SessionOutcome::Error(err.to_string()));
        }
    };
    let settings = PeerSettings::from_config(cfg, peer_host, port, info_hash);
    Some(drive(client, cfg, &job, target, settings).await)
}

/// Spawns the worker and watches the job's ratio until the session ends.
pub async fn drive(
    client: &dyn TorrentClient,
    cfg: &Config,
    job: &JobInfo,
    target: f64,
    settings: PeerSettings,
) -> SessionOutcome {
    tracing::info!(
        hash = %job.hash,
        name = %job.name,
        ratio = job.ratio,
        target,
        peer = %format!("{}:{}", settings.host, settings.port),
        "simulate: session starting"
    );

    let (events_tx, mut events) = mpsc::channel(64);
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut worker = tokio::spawn(run_worker(settings, events_tx, stop_rx));

    let mut poll = tokio::time::interval(Duration::from_secs(cfg.sim_poll_secs.max(1)));
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut speed = 0u64;

    let outcome = loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Some(SessionEvent::Speed(bytes)) => {
                    speed = bytes;
                    tracing::debug!(hash = %job.hash, speed_kb = bytes as f64 / 1024.0, "simulate: speed sample");
                }
                Some(SessionEvent::Finished(Termination::Stalled)) => break SessionOutcome::Stalled,
                Some(SessionEvent::Finished(Termination::Cancelled)) => break SessionOutcome::Cancelled,
                Some(SessionEvent::Finished(Termination::Error(e))) => break SessionOutcome::Error(e),
                None => break SessionOutcome::Error("worker exited without a reason".to_string()),
            },
            _ = poll.tick() => match client.job(&job.hash).await {
                Ok(Some(current)) if current.ratio >= target => {
                    tracing::info!(hash = %job.hash, ratio = current.ratio, target, hold_secs = cfg.sim_hold_secs, "simulate: target ratio reached, holding");
                    hold(&mut events, Duration::from_secs(cfg.sim_hold_secs)).await;
                    break SessionOutcome::RatioReached { ratio: current.ratio, target };
                }
                Ok(Some(current)) => {
                    tracing::debug!(hash = %job.hash, ratio = current.ratio, target, speed_kb = speed as f64 / 1024.0, "simulate: progress");
                }
                Ok(None) => break SessionOutcome::JobGone,
                Err(err) => tracing::warn!(%err, "simulate: ratio poll failed"),
            },
        }
    };

    let _ = stop_tx.send(true);
    let join = Duration::from_secs(cfg.sim_join_timeout_secs.max(1));
    if timeout(join, &mut worker).await.is_err() {
        tracing::warn!(hash = %job.hash, "simulate: worker did not stop in time, aborting");
        worker.abort();
    }
    tracing::info!(hash = %job.hash, ?outcome, "simulate: session ended");
    outcome
}

/// Keeps draining samples while holding so the worker never blocks on a full channel.
async fn hold(events: &mut mpsc::Receiver<SessionEvent>, dur: Duration) {
    let deadline = tokio::time::sleep(dur);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return,
            ev = events.recv() => if ev.is_none() {
                (&mut deadline).await;
                return;
            },
        }
    }
}
