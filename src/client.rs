use anyhow::{Context, Result, bail};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use reqwest::StatusCode;
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, LOCATION, RANGE, USER_AGENT};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::config::load_config;
use crate::error::{ApiErrorResponse, format_api_error};
use crate::progress::{ProgressReply, ProgressView};
use crate::util::{backoff, guess_filename_from_url, retriable_status, urljoin};

/// How the session authenticates against the API.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Personal API key, sent as a bearer token.
    ApiKey(String),
    /// Username and password, sent as HTTP basic auth.
    Login { username: String, password: String },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base API URL, typically `https://your-domain.crunch.io/api`.
    pub url: String,
    /// Session credentials. An API key wins over a username/password pair
    /// when both are configured.
    pub credentials: Credentials,
    /// Whether to verify TLS certificates. Disable only against local
    /// test servers.
    pub verify: bool,
}

/// A connection to the Crunch API: owns the HTTP session and the remote
/// identity every wrapper object ([`crate::Dataset`], [`crate::Variable`],
/// [`crate::VariableOrder`]) speaks through.
#[derive(Debug, Clone)]
pub struct Client {
    base_url: String,
    credentials: Credentials,

    timeout: Duration,
    retry_max: usize,
    sleep_max: Duration,
    progress: bool,

    http: HttpClient,
}

impl Client {
    /// Creates a client using environment variables and/or `crunch.ini`.
    ///
    /// This is equivalent to `Client::new(None, None, None)`.
    pub fn from_env() -> Result<Self> {
        Self::new(None, None, None)
    }

    /// Creates a client using (in order of precedence):
    /// - explicit `url`/`credentials` arguments
    /// - environment variables `CRUNCH_URL`, `CRUNCH_API_KEY` or
    ///   `CRUNCH_USERNAME`/`CRUNCH_PASSWORD`
    /// - config file from `CRUNCH_INI`, `./crunch.ini` or `~/.crunch.ini`
    pub fn new(
        url: Option<String>,
        credentials: Option<Credentials>,
        verify: Option<bool>,
    ) -> Result<Self> {
        let cfg = load_config(url, credentials, verify)?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("scrunch-rs/{}", env!("CARGO_PKG_VERSION")))
                .unwrap_or(HeaderValue::from_static("scrunch-rs")),
        );

        let mut builder = HttpClient::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(60));

        if !cfg.verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder.build().context("failed to build HTTP client")?;

        Ok(Self {
            base_url: cfg.url.trim_end_matches('/').to_string(),
            credentials: cfg.credentials,
            timeout: Duration::from_secs(60),
            retry_max: 500,
            sleep_max: Duration::from_secs(120),
            progress: true,
            http,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_max(mut self, retry_max: usize) -> Self {
        self.retry_max = retry_max;
        self
    }

    pub fn with_sleep_max(mut self, sleep_max: Duration) -> Self {
        self.sleep_max = sleep_max;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// The configured API base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL of a top-level API catalog, e.g. `datasets`.
    pub(crate) fn site_catalog(&self, name: &str) -> String {
        format!("{}/{}/", self.base_url, name)
    }

    pub(crate) fn get_json<TResp: DeserializeOwned>(&self, url: &str) -> Result<TResp> {
        let resp = self.send_api::<Value>("GET", url, None)?;
        parse_json(resp, url)
    }

    pub(crate) fn patch(&self, url: &str, body: &Value) -> Result<()> {
        self.send_api("PATCH", url, Some(body)).map(drop)
    }

    pub(crate) fn put(&self, url: &str, body: &Value) -> Result<()> {
        self.send_api("PUT", url, Some(body)).map(drop)
    }

    pub(crate) fn delete(&self, url: &str) -> Result<()> {
        self.send_api::<Value>("DELETE", url, None).map(drop)
    }

    /// POSTs a document to a catalog or view and tracks the reply: a 202
    /// response carrying a progress resource is polled to completion, and
    /// the `Location` header (the created entity or the produced file) is
    /// returned when present.
    pub(crate) fn post_tracked(&self, url: &str, body: &Value) -> Result<Option<String>> {
        let resp = self.send_api("POST", url, Some(body))?;
        let status = resp.status();
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|loc| urljoin(&self.base_url, loc));

        if status == StatusCode::ACCEPTED {
            let text = resp.text().unwrap_or_default();
            if let Ok(reply) = serde_json::from_str::<ProgressReply>(&text) {
                if let Some(progress_url) = reply.progress_url() {
                    self.wait_progress(&urljoin(&self.base_url, &progress_url))?;
                }
            }
        }

        Ok(location)
    }

    /// Polls a progress resource until the remote job completes. Progress
    /// runs 0..=100; a negative value is a failure carrying the server's
    /// reason.
    pub(crate) fn wait_progress(&self, url: &str) -> Result<()> {
        let mut sleep = Duration::from_secs(1);
        let mut last_reported: Option<i64> = None;
        let mut tries = 0usize;

        loop {
            let view: ProgressView = self.get_json(url)?;
            let status = view.value;

            if status.is_failed() {
                bail!(
                    "remote job failed: {}",
                    status.message.unwrap_or_else(|| "no reason given".into())
                );
            }
            if status.is_complete() {
                return Ok(());
            }

            let pct = status.progress as i64;
            if last_reported != Some(pct) {
                last_reported = Some(pct);
                info!("job progress: {}%", pct);
            }

            tries += 1;
            if tries >= self.retry_max {
                bail!("timed out waiting for remote job completion at {}%", pct);
            }
            thread::sleep(sleep);
            sleep = backoff(sleep, self.sleep_max);
        }
    }

    /// Downloads a produced file (e.g. a dataset export) to `target`,
    /// resuming with a Range request when the transfer is interrupted.
    pub(crate) fn download(&self, location: &str, target: &Path) -> Result<PathBuf> {
        let target = if target.as_os_str().is_empty() {
            guess_filename_from_url(location)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("download"))
        } else {
            target.to_path_buf()
        };

        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create directory {}", parent.display()))?;
            }
        }

        let mut downloaded: u64 = 0;
        let mut range_from: Option<u64> = None;
        let mut pb: Option<ProgressBar> = None;

        let mut tries = 0usize;
        'download_attempt: while tries < self.retry_max {
            let resp = self.robust_request(|| {
                let mut req = self.http.get(location);
                if let Some(from) = range_from {
                    req = req.header(RANGE, format!("bytes={}-", from));
                }
                self.apply_auth(req).send()
            })?;

            let mut resp = resp.error_for_status().context("download request failed")?;

            if pb.is_none() && self.progress {
                if let Some(total) = resp.content_length() {
                    let bar = ProgressBar::new(total);
                    bar.set_style(
                        ProgressStyle::with_template(
                            "{spinner:.green} {bytes}/{total_bytes} ({bytes_per_sec}) {wide_bar} {eta}",
                        )
                        .unwrap()
                        .progress_chars("=>-"),
                    );
                    pb = Some(bar);
                }
            }

            let resume = range_from.is_some();
            let mut out = OpenOptions::new()
                .create(true)
                .write(true)
                .append(resume)
                .truncate(!resume)
                .open(&target)
                .with_context(|| format!("failed to open {}", target.display()))?;

            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = match resp.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        tries += 1;
                        if tries >= self.retry_max {
                            return Err(e).context("download interrupted")?;
                        }

                        // resume
                        out.flush().ok();
                        downloaded = std::fs::metadata(&target)?.len();
                        range_from = Some(downloaded);
                        if let Some(pb) = &pb {
                            pb.set_position(downloaded);
                        }
                        thread::sleep(self.sleep_max);
                        continue 'download_attempt;
                    }
                };

                out.write_all(&buf[..n])?;
                downloaded += n as u64;
                if let Some(pb) = &pb {
                    pb.inc(n as u64);
                }
            }

            out.flush()?;
            if let Some(pb) = &pb {
                pb.finish_and_clear();
            }
            return Ok(target);
        }

        bail!(
            "download failed: gave up after {} attempt(s), {} byte(s) written",
            tries,
            downloaded
        )
    }

    fn apply_auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Credentials::ApiKey(key) => {
                req.header(AUTHORIZATION, format!("Bearer {}", key.trim()))
            }
            Credentials::Login { username, password } => req.basic_auth(username, Some(password)),
        }
    }

    fn send_api<TReq: Serialize>(
        &self,
        method: &str,
        url: &str,
        request: Option<&TReq>,
    ) -> Result<Response> {
        debug!("{} {}", method, url);

        let resp = self.robust_request(|| {
            let req = match method {
                "GET" => self.http.get(url),
                "PUT" => self.http.put(url),
                "PATCH" => self.http.patch(url),
                "DELETE" => self.http.delete(url),
                _ => self.http.post(url),
            };
            let req = self.apply_auth(req).timeout(self.timeout);
            match request {
                Some(body) => req.json(body).send(),
                None => req.send(),
            }
        })?;

        let status = resp.status();
        debug!("{} {} -> HTTP {}", method, url, status);

        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            // Try to parse server error payloads for actionable messages.
            if let Ok(err_json) = serde_json::from_str::<ApiErrorResponse>(&text) {
                return Err(format_api_error(status, url, &err_json));
            }

            bail!(
                "API request failed: HTTP {} for url ({})\n{}",
                status,
                url,
                text
            );
        }

        Ok(resp)
    }

    fn robust_request<F>(&self, mut f: F) -> Result<Response>
    where
        F: FnMut() -> std::result::Result<Response, reqwest::Error>,
    {
        let mut tries = 0usize;
        loop {
            let result = f();

            match result {
                Ok(resp) => {
                    if retriable_status(resp.status().as_u16()) {
                        tries += 1;
                        if tries >= self.retry_max {
                            return Ok(resp);
                        }
                        thread::sleep(self.sleep_max);
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    tries += 1;
                    if tries >= self.retry_max {
                        return Err(err).context("could not connect")?;
                    }
                    // timeouts / transient connection errors
                    thread::sleep(self.sleep_max);
                }
            }
        }
    }
}

fn parse_json<TResp: DeserializeOwned>(resp: Response, url: &str) -> Result<TResp> {
    let status = resp.status();
    let text = resp.text().unwrap_or_default();
    serde_json::from_str::<TResp>(&text)
        .with_context(|| format!("failed to parse API JSON (url={}, status={})", url, status))
}
