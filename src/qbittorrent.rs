use crate::client::{AddJob, ClientError, JobFilter, JobInfo, TorrentClient, TransferInfo};
use crate::config::Config;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

/// Cookie-authenticated session against the qBittorrent Web API (v2).
pub struct QbClient {
    http: Client,
    base: Url,
}

#[derive(Deserialize)]
struct Preferences {
    #[serde(default)]
    listen_port: u16,
}

impl QbClient {
    /// Builds a fresh HTTP client and logs in. A rejected login is reported
    /// as connectivity loss so the caller backs off before retrying.
    pub async fn connect(cfg: &Config) -> Result<Self, ClientError> {
        let base = parse_base(&cfg.qb_url)?;
        let http = Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(cfg.qb_timeout_secs.max(1)))
            .build()?;

        let client = Self { http, base };
        let resp = client
            .http
            .post(client.endpoint("auth/login")?)
            .header(reqwest::header::REFERER, client.base.as_str())
            .form(&[
                ("username", cfg.qb_username.as_str()),
                ("password", cfg.qb_password.as_str()),
            ])
            .send()
            .await?;

        if resp.status() == StatusCode::FORBIDDEN {
            return Err(ClientError::AuthRejected);
        }
        let resp = check_status("auth/login", resp)?;
        let body = resp.text().await?;
        if body.trim() != "Ok." {
            return Err(ClientError::AuthRejected);
        }
        Ok(client)
    }

    pub fn host(&self) -> Option<&str> {
        self.base.host_str()
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(&format!("api/v2/{path}"))
            .map_err(|e| ClientError::Malformed {
                endpoint: path.to_string(),
                message: e.to_string(),
            })
    }

    async fn post_hashes(&self, path: &str, hashes: &[String]) -> Result<(), ClientError> {
        let joined = hashes.join("|");
        let resp = self
            .http
            .post(self.endpoint(path)?)
            .form(&[("hashes", joined.as_str())])
            .send()
            .await?;
        check_status(path, resp)?;
        Ok(())
    }

    /// qBittorrent 5 renamed `pause`/`resume` to `stop`/`start`.
    async fn post_hashes_with_fallback(
        &self,
        path: &str,
        fallback: &str,
        hashes: &[String],
    ) -> Result<(), ClientError> {
        match self.post_hashes(path, hashes).await {
            Err(ClientError::Status { status: 404, .. }) => {
                tracing::debug!(path, fallback, "qbittorrent: endpoint missing, using fallback");
                self.post_hashes(fallback, hashes).await
            }
            other => other,
        }
    }
}

fn parse_base(raw: &str) -> Result<Url, ClientError> {
    let mut raw = raw.trim().to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).map_err(|e| ClientError::Malformed {
        endpoint: "SEEDWARDEN_QB_URL".to_string(),
        message: e.to_string(),
    })
}

fn check_status(endpoint: &str, resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status == StatusCode::FORBIDDEN {
        return Err(ClientError::Forbidden);
    }
    if !status.is_success() {
        return Err(ClientError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(resp)
}

pub(crate) fn info_query(filter: &JobFilter) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(state) = filter.state {
        query.push(("filter", state.as_str().to_string()));
    }
    if !filter.hashes.is_empty() {
        query.push(("hashes", filter.hashes.join("|")));
    }
    query
}

#[async_trait]
impl TorrentClient for QbClient {
    async fn version(&self) -> Result<String, ClientError> {
        let resp = self.http.get(self.endpoint("app/version")?).send().await?;
        Ok(check_status("app/version", resp)?.text().await?)
    }

    async fn jobs(&self, filter: &JobFilter) -> Result<Vec<JobInfo>, ClientError> {
        let resp = self
            .http
            .get(self.endpoint("torrents/info")?)
            .query(&info_query(filter))
            .send()
            .await?;
        let body = check_status("torrents/info", resp)?.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| ClientError::Malformed {
            endpoint: "torrents/info".to_string(),
            message: e.to_string(),
        })
    }

    async fn add_job(&self, job: AddJob) -> Result<(), ClientError> {
        let part = Part::bytes(job.bytes)
            .file_name(job.file_name)
            .mime_str("application/x-bittorrent")?;
        let form = Form::new()
            .part("torrents", part)
            .text("savepath", job.save_path)
            .text("tags", job.tag);
        let resp = self
            .http
            .post(self.endpoint("torrents/add")?)
            .multipart(form)
            .send()
            .await?;
        let body = check_status("torrents/add", resp)?.text().await?;
        if body.trim() == "Fails." {
            return Err(ClientError::Malformed {
                endpoint: "torrents/add".to_string(),
                message: "client refused the torrent".to_string(),
            });
        }
        Ok(())
    }

    async fn delete_jobs(&self, hashes: &[String], delete_files: bool) -> Result<(), ClientError> {
        let joined = hashes.join("|");
        let resp = self
            .http
            .post(self.endpoint("torrents/delete")?)
            .form(&[
                ("hashes", joined.as_str()),
                ("deleteFiles", if delete_files { "true" } else { "false" }),
            ])
            .send()
            .await?;
        check_status("torrents/delete", resp)?;
        Ok(())
    }

    async fn pause_jobs(&self, hashes: &[String]) -> Result<(), ClientError> {
        self.post_hashes_with_fallback("torrents/pause", "torrents/stop", hashes)
            .await
    }

    async fn resume_jobs(&self, hashes: &[String]) -> Result<(), ClientError> {
        self.post_hashes_with_fallback("torrents/resume", "torrents/start", hashes)
            .await
    }

    async fn reannounce_jobs(&self, hashes: &[String]) -> Result<(), ClientError> {
        self.post_hashes("torrents/reannounce", hashes).await
    }

    async fn transfer_info(&self) -> Result<TransferInfo, ClientError> {
        let resp = self.http.get(self.endpoint("transfer/info")?).send().await?;
        let body = check_status("transfer/info", resp)?.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| ClientError::Malformed {
            endpoint: "transfer/info".to_string(),
            message: e.to_string(),
        })
    }

    async fn listen_port(&self) -> Result<u16, ClientError> {
        let resp = self
            .http
            .get(self.endpoint("app/preferences")?)
            .send()
            .await?;
        let body = check_status("app/preferences", resp)?.bytes().await?;
        let prefs: Preferences =
            serde_json::from_slice(&body).map_err(|e| ClientError::Malformed {
                endpoint: "app/preferences".to_string(),
                message: e.to_string(),
            })?;
        if prefs.listen_port == 0 {
            return Err(ClientError::Malformed {
                endpoint: "app/preferences".to_string(),
                message: "listen_port is 0".to_string(),
            });
        }
        Ok(prefs.listen_port)
    }
}
