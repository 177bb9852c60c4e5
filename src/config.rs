use crate::client::Category;
use std::path::PathBuf;
use std::time::Duration;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One early-abandonment checkpoint: once `time_fraction` of the timeout has
/// elapsed the job must have reached `min_progress`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Checkpoint {
    pub time_fraction: f64,
    pub min_progress: f64,
}

#[derive(Clone, Debug)]
pub struct SourceQueue {
    pub category: Category,
    pub dir: PathBuf,
}

#[derive(Clone, Debug)]
pub struct Tags {
    pub standard: String,
    pub keep: String,
    pub simulate: String,
}

impl Tags {
    pub fn tag_for(&self, category: Category) -> &str {
        match category {
            Category::Standard => &self.standard,
            Category::Keep => &self.keep,
            Category::UploadSimulation => &self.simulate,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    // Client
    pub qb_url: String,
    pub qb_username: String,
    pub qb_password: String,
    pub qb_timeout_secs: u64,
    pub save_path: String,
    pub tags: Tags,

    // Catalog + admission
    pub queues: Vec<SourceQueue>,
    pub tracker_priority: Vec<String>,
    pub disk_path: PathBuf,
    pub disk_reserve_bytes: u64,

    // Waits
    pub poll_download_secs: u64,
    pub wait_disk_secs: u64,
    pub wait_no_torrent_secs: u64,
    pub wait_after_add_secs: u64,
    pub verify_add_secs: u64,
    pub reconnect_secs: u64,
    pub max_transient_failures: u32,

    // Upload protection
    pub upload_threshold_kb: f64,
    pub upload_protect_secs: u64,
    pub upload_sample_secs: u64,
    pub upload_sample_interval_secs: u64,

    // Tracker
    pub gb_per_hour: f64,
    pub timeout_floor_gb: f64,
    pub stall_secs: u64,
    pub keep_stall_secs: u64,
    pub checkpoints: Vec<Checkpoint>,

    // Kickstart
    pub disk_deadlock_secs: u64,
    pub kickstart_batch: usize,
    pub kickstart_settle_secs: u64,

    // Simulated peer
    pub sim_enabled: bool,
    pub sim_ratio_min: f64,
    pub sim_ratio_max: f64,
    pub sim_idle_samples: u32,
    pub sim_hold_secs: u64,
    pub sim_poll_secs: u64,
    pub sim_read_timeout_ms: u64,
    pub sim_connect_timeout_secs: u64,
    pub sim_join_timeout_secs: u64,
    pub sim_peer_host: Option<String>,
    pub sim_peer_id_prefix: String,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // If a .env file exists, load it. If not, keep going.
        // Precedence: process env > .env > code defaults.
        let _ = dotenvy::dotenv();
        let cfg = Self::from_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_env() -> anyhow::Result<Self> {
        let qb_url = env_string("SEEDWARDEN_QB_URL", "http://127.0.0.1:8084");
        let qb_username = env_string("SEEDWARDEN_QB_USERNAME", "admin");
        let qb_password = env_string("SEEDWARDEN_QB_PASSWORD", "");
        let qb_timeout_secs = env_u64("SEEDWARDEN_QB_TIMEOUT_SECS", 30);
        let save_path = env_string("SEEDWARDEN_SAVE_PATH", "/downloads");
        let tags = Tags {
            standard: env_string("SEEDWARDEN_TAG_STANDARD", "auto-add"),
            keep: env_string("SEEDWARDEN_TAG_KEEP", "auto-keep"),
            simulate: env_string("SEEDWARDEN_TAG_SIMULATE", "auto-sim"),
        };

        let queues = parse_queues(&env_string("SEEDWARDEN_QUEUES", "standard=./torrent-lib"))?;
        let tracker_priority = env_csv_strings("SEEDWARDEN_TRACKER_PRIORITY", &[])
            .into_iter()
            .map(|h| h.to_ascii_lowercase())
            .collect();
        let disk_path = env_pathbuf("SEEDWARDEN_DISK_PATH", ".");
        let disk_reserve_bytes = gb_to_bytes(env_f64("SEEDWARDEN_DISK_RESERVE_GB", 2.0));

        let poll_download_secs = env_u64("SEEDWARDEN_POLL_DOWNLOAD_SECS", 60);
        let wait_disk_secs = env_u64("SEEDWARDEN_WAIT_DISK_SECS", 60);
        let wait_no_torrent_secs = env_u64("SEEDWARDEN_WAIT_NO_TORRENT_SECS", 120);
        let wait_after_add_secs = env_u64("SEEDWARDEN_WAIT_AFTER_ADD_SECS", 5);
        let verify_add_secs = env_u64("SEEDWARDEN_VERIFY_ADD_SECS", 30);
        let reconnect_secs = env_u64("SEEDWARDEN_RECONNECT_SECS", 10);
        let max_transient_failures = env_u32("SEEDWARDEN_MAX_TRANSIENT_FAILURES", 5);

        let upload_threshold_kb = env_f64("SEEDWARDEN_UPLOAD_THRESHOLD_KB", 200.0);
        let upload_protect_secs = env_u64("SEEDWARDEN_UPLOAD_PROTECT_SECS", 5 * 60);
        let upload_sample_secs = env_u64("SEEDWARDEN_UPLOAD_SAMPLE_SECS", 30);
        let upload_sample_interval_secs = env_u64("SEEDWARDEN_UPLOAD_SAMPLE_INTERVAL_SECS", 2);

        let gb_per_hour = env_f64("SEEDWARDEN_GB_PER_HOUR", 10.0);
        let timeout_floor_gb = env_f64("SEEDWARDEN_TIMEOUT_FLOOR_GB", 10.0);
        let stall_secs = env_u64("SEEDWARDEN_STALL_SECS", 30 * 60);
        let keep_stall_secs = env_u64("SEEDWARDEN_KEEP_STALL_SECS", 2 * 60 * 60);
        let checkpoints = parse_checkpoints(&env_string(
            "SEEDWARDEN_CHECKPOINTS",
            "0.2:0.15,0.4:0.35,0.6:0.55,0.8:0.75",
        ))?;

        let disk_deadlock_secs = env_u64("SEEDWARDEN_DISK_DEADLOCK_SECS", 5 * 60);
        let kickstart_batch = env_usize("SEEDWARDEN_KICKSTART_BATCH", 5);
        let kickstart_settle_secs = env_u64("SEEDWARDEN_KICKSTART_SETTLE_SECS", 20);

        let sim_enabled = env_enabled("SEEDWARDEN_SIM", true);
        let sim_ratio_min = env_f64("SEEDWARDEN_SIM_RATIO_MIN", 1.0);
        let sim_ratio_max = env_f64("SEEDWARDEN_SIM_RATIO_MAX", 1.5);
        let sim_idle_samples = env_u32("SEEDWARDEN_SIM_IDLE_SAMPLES", 3);
        let sim_hold_secs = env_u64("SEEDWARDEN_SIM_HOLD_SECS", 30);
        let sim_poll_secs = env_u64("SEEDWARDEN_SIM_POLL_SECS", 5);
        let sim_read_timeout_ms = env_u64("SEEDWARDEN_SIM_READ_TIMEOUT_MS", 500);
        let sim_connect_timeout_secs = env_u64("SEEDWARDEN_SIM_CONNECT_TIMEOUT_SECS", 10);
        let sim_join_timeout_secs = env_u64("SEEDWARDEN_SIM_JOIN_TIMEOUT_SECS", 10);
        let sim_peer_host = env_opt_string("SEEDWARDEN_SIM_PEER_HOST");
        let sim_peer_id_prefix = env_string("SEEDWARDEN_SIM_PEER_ID_PREFIX", "-qB4650-");

        Ok(Self {
            qb_url,
            qb_username,
            qb_password,
            qb_timeout_secs,
            save_path,
            tags,

            queues,
            tracker_priority,
            disk_path,
            disk_reserve_bytes,

            poll_download_secs,
            wait_disk_secs,
            wait_no_torrent_secs,
            wait_after_add_secs,
            verify_add_secs,
            reconnect_secs,
            max_transient_failures,

            upload_threshold_kb,
            upload_protect_secs,
            upload_sample_secs,
            upload_sample_interval_secs,

            gb_per_hour,
            timeout_floor_gb,
            stall_secs,
            keep_stall_secs,
            checkpoints,

            disk_deadlock_secs,
            kickstart_batch,
            kickstart_settle_secs,

            sim_enabled,
            sim_ratio_min,
            sim_ratio_max,
            sim_idle_samples,
            sim_hold_secs,
            sim_poll_secs,
            sim_read_timeout_ms,
            sim_connect_timeout_secs,
            sim_join_timeout_secs,
            sim_peer_host,
            sim_peer_id_prefix,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queues.is_empty() {
            anyhow::bail!("SEEDWARDEN_QUEUES must name at least one source queue");
        }
        if !(self.gb_per_hour > 0.0) {
            anyhow::bail!("SEEDWARDEN_GB_PER_HOUR must be positive, got {}", self.gb_per_hour);
        }
        if self.kickstart_batch == 0 {
            anyhow::bail!("SEEDWARDEN_KICKSTART_BATCH must be at least 1");
        }
        if !(self.sim_ratio_min > 0.0) || self.sim_ratio_max < self.sim_ratio_min {
            anyhow::bail!(
                "invalid simulated-peer ratio range {}..{}",
                self.sim_ratio_min,
                self.sim_ratio_max
            );
        }
        if self.sim_idle_samples == 0 {
            anyhow::bail!("SEEDWARDEN_SIM_IDLE_SAMPLES must be at least 1");
        }
        if self.sim_peer_id_prefix.len() >= 20 {
            anyhow::bail!("SEEDWARDEN_SIM_PEER_ID_PREFIX must be shorter than 20 bytes");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_download_secs.max(1))
    }
}

pub fn gb_to_bytes(gb: f64) -> u64 {
    (gb.max(0.0) * GIB) as u64
}

pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / GIB
}

/// Parses `category=dir` pairs separated by commas, in precedence order.
pub fn parse_queues(raw: &str) -> anyhow::Result<Vec<SourceQueue>> {
    let mut out = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((category, dir)) = entry.split_once('=') else {
            anyhow::bail!("queue entry {entry:?} is not of the form category=dir");
        };
        let category = Category::parse(category.trim())
            .ok_or_else(|| anyhow::anyhow!("unknown queue category {:?}", category.trim()))?;
        let dir = dir.trim();
        if dir.is_empty() {
            anyhow::bail!("queue entry {entry:?} has an empty directory");
        }
        out.push(SourceQueue {
            category,
            dir: PathBuf::from(dir),
        });
    }
    Ok(out)
}

/// Parses `fraction:min_progress` pairs; fractions must be ascending in (0, 1].
pub fn parse_checkpoints(raw: &str) -> anyhow::Result<Vec<Checkpoint>> {
    let mut out: Vec<Checkpoint> = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((t, p)) = entry.split_once(':') else {
            anyhow::bail!("checkpoint {entry:?} is not of the form fraction:min_progress");
        };
        let time_fraction: f64 = t
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("checkpoint {entry:?}: {e}"))?;
        let min_progress: f64 = p
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("checkpoint {entry:?}: {e}"))?;
        if !(time_fraction > 0.0 && time_fraction <= 1.0) {
            anyhow::bail!("checkpoint {entry:?}: time fraction must be in (0, 1]");
        }
        if !(0.0..=1.0).contains(&min_progress) {
            anyhow::bail!("checkpoint {entry:?}: min progress must be in [0, 1]");
        }
        if out.last().is_some_and(|prev| prev.time_fraction >= time_fraction) {
            anyhow::bail!("checkpoints must be listed in ascending time order");
        }
        out.push(Checkpoint {
            time_fraction,
            min_progress,
        });
    }
    Ok(out)
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_string(name: &str, default: &str) -> String {
    env_opt_string(name).unwrap_or_else(|| default.to_string())
}

fn env_pathbuf(name: &str, default: &str) -> PathBuf {
    PathBuf::from(env_string(name, default))
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn env_csv_strings(name: &str, defaults: &[&str]) -> Vec<String> {
    if let Some(s) = env_opt_string(name) {
        let v: Vec<String> = s
            .split(',')
            .map(|x| x.trim().to_string())
            .filter(|x| !x.is_empty())
            .collect();
        if !v.is_empty() {
            return v;
        }
    }
    defaults.iter().map(|s| s.to_string()).collect()
}

fn env_enabled(name: &str, default: bool) -> bool {
    match env_opt_string(name) {
        None => default,
        Some(v) => {
            let v = v.to_ascii_lowercase();
            if matches!(v.as_str(), "0" | "false" | "off" | "no") {
                return false;
            }
            if matches!(v.as_str(), "1" | "true" | "on" | "yes") {
                return true;
            }
            default
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        qb_url: "http://127.0.0.1:8084".to_string(),
        qb_username: "admin".to_string(),
        qb_password: String::new(),
        qb_timeout_secs: 5,
        save_path: "/downloads".to_string(),
        tags: Tags {
            standard: "auto-add".to_string(),
            keep: "auto-keep".to_string(),
            simulate: "auto-sim".to_string(),
        },
        queues: vec![SourceQueue {
            category: Category::Standard,
            dir: PathBuf::from("./torrent-lib"),
        }],
        tracker_priority: Vec::new(),
        disk_path: PathBuf::from("."),
        disk_reserve_bytes: gb_to_bytes(2.0),
        poll_download_secs: 60,
        wait_disk_secs: 60,
        wait_no_torrent_secs: 120,
        wait_after_add_secs: 5,
        verify_add_secs: 30,
        reconnect_secs: 10,
        max_transient_failures: 5,
        upload_threshold_kb: 200.0,
        upload_protect_secs: 300,
        upload_sample_secs: 30,
        upload_sample_interval_secs: 2,
        gb_per_hour: 10.0,
        timeout_floor_gb: 10.0,
        stall_secs: 1800,
        keep_stall_secs: 7200,
        checkpoints: parse_checkpoints("0.2:0.15,0.4:0.35,0.6:0.55,0.8:0.75")
            .unwrap_or_default(),
        disk_deadlock_secs: 300,
        kickstart_batch: 5,
        kickstart_settle_secs: 20,
        sim_enabled: true,
        sim_ratio_min: 1.0,
        sim_ratio_max: 1.5,
        sim_idle_samples: 3,
        sim_hold_secs: 30,
        sim_poll_secs: 5,
        sim_read_timeout_ms: 500,
        sim_connect_timeout_secs: 10,
        sim_join_timeout_secs: 10,
        sim_peer_host: None,
        sim_peer_id_prefix: "-qB4650-".to_string(),
    }
}
