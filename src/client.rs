use crate::config::Tags;
use async_trait::async_trait;
use serde::Deserialize;

/// Job category, carried on the client side as a tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    Standard,
    Keep,
    UploadSimulation,
}

impl Category {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Some(Self::Standard),
            "keep" => Some(Self::Keep),
            "simulate" | "upload-simulation" => Some(Self::UploadSimulation),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Keep => "keep",
            Self::UploadSimulation => "simulate",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as reported by `torrents/info`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobInfo {
    pub hash: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub added_on: i64,
    #[serde(default)]
    pub completion_on: i64,
    #[serde(default)]
    pub ratio: f64,
    #[serde(default)]
    pub tags: String,
}

impl JobInfo {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.split(',').map(str::trim).any(|t| t == tag)
    }

    /// Keep wins over simulate, simulate over standard.
    pub fn category(&self, tags: &Tags) -> Option<Category> {
        if self.has_tag(&tags.keep) {
            Some(Category::Keep)
        } else if self.has_tag(&tags.simulate) {
            Some(Category::UploadSimulation)
        } else if self.has_tag(&tags.standard) {
            Some(Category::Standard)
        } else {
            None
        }
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= 1.0
    }

    pub fn short_hash(&self) -> &str {
        self.hash.get(..10).unwrap_or(&self.hash)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateFilter {
    Downloading,
    Completed,
}

impl StateFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Downloading => "downloading",
            Self::Completed => "completed",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct JobFilter {
    pub state: Option<StateFilter>,
    pub hashes: Vec<String>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn downloading() -> Self {
        Self {
            state: Some(StateFilter::Downloading),
            ..Self::default()
        }
    }

    pub fn completed() -> Self {
        Self {
            state: Some(StateFilter::Completed),
            ..Self::default()
        }
    }

    pub fn hash(hash: &str) -> Self {
        Self {
            hashes: vec![hash.to_string()],
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct AddJob {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub save_path: String,
    pub tag: String,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct TransferInfo {
    #[serde(default)]
    pub up_info_speed: u64,
    #[serde(default)]
    pub dl_info_speed: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("login rejected by client")]
    AuthRejected,
    #[error("session no longer authorized (HTTP 403)")]
    Forbidden,
    #[error("HTTP {status} from {endpoint}")]
    Status { endpoint: String, status: u16 },
    #[error("malformed response from {endpoint}: {message}")]
    Malformed { endpoint: String, message: String },
}

impl ClientError {
    /// Errors after which the session handle must be rebuilt from scratch.
    pub fn is_connectivity_lost(&self) -> bool {
        matches!(self, Self::AuthRejected | Self::Forbidden)
    }
}

/// Job-control surface of the external torrent client.
#[async_trait]
pub trait TorrentClient: Send + Sync {
    async fn version(&self) -> Result<String, ClientError>;

    async fn jobs(&self, filter: &JobFilter) -> Result<Vec<JobInfo>, ClientError>;

    async fn job(&self, hash: &str) -> Result<Option<JobInfo>, ClientError> {
        let mut jobs = self.jobs(&JobFilter::hash(hash)).await?;
        Ok(jobs
            .iter()
            .position(|j| j.hash.eq_ignore_ascii_case(hash))
            .map(|i| jobs.swap_remove(i)))
    }

    async fn add_job(&self, job: AddJob) -> Result<(), ClientError>;

    async fn delete_jobs(&self, hashes: &[String], delete_files: bool) -> Result<(), ClientError>;

    async fn pause_jobs(&self, hashes: &[String]) -> Result<(), ClientError>;

    async fn resume_jobs(&self, hashes: &[String]) -> Result<(), ClientError>;

    async fn reannounce_jobs(&self, hashes: &[String]) -> Result<(), ClientError>;

    async fn transfer_info(&self) -> Result<TransferInfo, ClientError>;

    async fn listen_port(&self) -> Result<u16, ClientError>;
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// In-memory client. Added jobs appear immediately at zero progress.
    #[derive(Default)]
    pub(crate) struct FakeClient {
        pub jobs: Mutex<Vec<JobInfo>>,
        pub calls: Mutex<Vec<String>>,
        pub upload_speeds: Mutex<VecDeque<u64>>,
        pub failures: Mutex<VecDeque<ClientError>>,
        /// Remaining forced failures per job-control verb.
        pub verb_failures: Mutex<HashMap<&'static str, u32>>,
        pub listen_port: u16,
    }

    impl FakeClient {
        pub fn with_jobs(jobs: Vec<JobInfo>) -> Self {
            Self {
                jobs: Mutex::new(jobs),
                ..Self::default()
            }
        }

        pub fn fail_next(&self, err: ClientError) {
            self.failures.lock().unwrap().push_back(err);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn hashes(&self) -> Vec<String> {
            self.jobs.lock().unwrap().iter().map(|j| j.hash.clone()).collect()
        }

        pub fn set_ratio(&self, hash: &str, ratio: f64) {
            for j in self.jobs.lock().unwrap().iter_mut() {
                if j.hash == hash {
                    j.ratio = ratio;
                }
            }
        }

        /// Makes the next `times` calls of `verb` (e.g. "resume") fail.
        pub fn fail_verb(&self, verb: &'static str, times: u32) {
            self.verb_failures.lock().unwrap().insert(verb, times);
        }

        fn take_verb_failure(&self, verb: &'static str) -> Result<(), ClientError> {
            let mut failures = self.verb_failures.lock().unwrap();
            match failures.get_mut(verb) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    Err(ClientError::Status {
                        endpoint: format!("torrents/{verb}"),
                        status: 500,
                    })
                }
                _ => Ok(()),
            }
        }

        fn take_failure(&self) -> Result<(), ClientError> {
            match self.failures.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn record(&self, verb: &str, hashes: &[String]) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{verb}:{}", hashes.join("|")));
        }
    }

    pub(crate) fn job(hash: &str, tag: &str, progress: f64) -> JobInfo {
        JobInfo {
            hash: hash.to_string(),
            name: format!("job-{hash}"),
            state: if progress >= 1.0 { "uploading" } else { "downloading" }.to_string(),
            progress,
            size: 1 << 30,
            added_on: 1_700_000_000,
            completion_on: if progress >= 1.0 { 1_700_000_000 } else { 0 },
            ratio: 0.0,
            tags: tag.to_string(),
        }
    }

    #[async_trait]
    impl TorrentClient for FakeClient {
        async fn version(&self) -> Result<String, ClientError> {
            self.take_failure()?;
            Ok("v4.6.5".to_string())
        }

        async fn jobs(&self, filter: &JobFilter) -> Result<Vec<JobInfo>, ClientError> {
            self.take_failure()?;
            let jobs = self.jobs.lock().unwrap();
            Ok(jobs
                .iter()
                .filter(|j| match filter.state {
                    Some(StateFilter::Downloading) => !j.is_complete(),
                    Some(StateFilter::Completed) => j.is_complete(),
                    None => true,
                })
                .filter(|j| filter.hashes.is_empty() || filter.hashes.contains(&j.hash))
                .cloned()
                .collect())
        }

        async fn add_job(&self, add: AddJob) -> Result<(), ClientError> {
            self.take_failure()?;
            let descriptor = crate::descriptor::decode(&add.bytes).map_err(|e| {
                ClientError::Malformed {
                    endpoint: "torrents/add".to_string(),
                    message: e.to_string(),
                }
            })?;
            self.record("add", std::slice::from_ref(&descriptor.info_hash));
            let mut added = job(&descriptor.info_hash, &add.tag, 0.0);
            added.size = descriptor.total_size as i64;
            added.name = add.file_name;
            self.jobs.lock().unwrap().push(added);
            Ok(())
        }

        async fn delete_jobs(&self, hashes: &[String], _delete_files: bool) -> Result<(), ClientError> {
            self.take_failure()?;
            self.take_verb_failure("delete")?;
            self.record("delete", hashes);
            self.jobs.lock().unwrap().retain(|j| !hashes.contains(&j.hash));
            Ok(())
        }

        async fn pause_jobs(&self, hashes: &[String]) -> Result<(), ClientError> {
            self.take_failure()?;
            self.take_verb_failure("pause")?;
            self.record("pause", hashes);
            Ok(())
        }

        async fn resume_jobs(&self, hashes: &[String]) -> Result<(), ClientError> {
            self.take_failure()?;
            self.take_verb_failure("resume")?;
            self.record("resume", hashes);
            Ok(())
        }

        async fn reannounce_jobs(&self, hashes: &[String]) -> Result<(), ClientError> {
            self.take_failure()?;
            self.take_verb_failure("reannounce")?;
            self.record("reannounce", hashes);
            Ok(())
        }

        async fn transfer_info(&self) -> Result<TransferInfo, ClientError> {
            self.take_failure()?;
            let up = self.upload_speeds.lock().unwrap().pop_front().unwrap_or(0);
            Ok(TransferInfo {
                up_info_speed: up,
                dl_info_speed: 0,
            })
        }

        async fn listen_port(&self) -> Result<u16, ClientError> {
            self.take_failure()?;
            Ok(self.listen_port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    #[test]
    fn tag_matching_splits_on_commas() {
        let mut job = JobInfo::default();
        job.tags = "auto-add, other".to_string();
        assert!(job.has_tag("auto-add"));
        assert!(job.has_tag("other"));
        assert!(!job.has_tag("auto"));
    }

    #[test]
    fn keep_tag_takes_precedence() {
        let cfg = test_config();
        let mut job = JobInfo::default();
        job.tags = "auto-add,auto-keep".to_string();
        assert_eq!(job.category(&cfg.tags), Some(Category::Keep));

        job.tags = "auto-sim".to_string();
        assert_eq!(job.category(&cfg.tags), Some(Category::UploadSimulation));

        job.tags = "manual".to_string();
        assert_eq!(job.category(&cfg.tags), None);
    }

    #[test]
    fn job_info_deserializes_from_client_json() {
        let raw = r#"[{"hash":"abc","name":"x","state":"stalledDL","progress":0.5,
            "size":1024,"added_on":10,"completion_on":-1,"ratio":0.25,"tags":"auto-add","eta":8640000}]"#;
        let jobs: Vec<JobInfo> = serde_json::from_str(raw).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, "stalledDL");
        assert_eq!(jobs[0].completion_on, -1);
        assert!(!jobs[0].is_complete());
    }

    #[test]
    fn only_auth_failures_count_as_connectivity_loss() {
        assert!(ClientError::AuthRejected.is_connectivity_lost());
        assert!(ClientError::Forbidden.is_connectivity_lost());
        let transient = ClientError::Status {
            endpoint: "torrents/info".to_string(),
            status: 502,
        };
        assert!(!transient.is_connectivity_lost());
    }
}
