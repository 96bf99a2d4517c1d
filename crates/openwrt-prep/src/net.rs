use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE};

use crate::error::{Error, Result};
use crate::run::RunCtx;

pub const DEFAULT_RETRIES: usize = 6;

const TEXT_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(3600);

/// Browser-like defaults; some of the filter-list hosts reject obvious
/// non-browser agents.
const BROWSER_HEADERS: &[(&str, &str)] = &[
    (
        "user-agent",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36",
    ),
    ("accept-language", "en-US,en;q=0.9"),
    ("cache-control", "no-cache"),
];

pub fn browser_headers() -> HeaderMap {
    let mut map = HeaderMap::new();
    for (k, v) in BROWSER_HEADERS {
        let name = HeaderName::from_static(k);
        let value = HeaderValue::from_static(v);
        map.insert(name, value);
    }
    map
}

fn github_headers(token: Option<&str>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    map.insert("accept", HeaderValue::from_static("application/vnd.github+json"));
    map.insert("x-github-api-version", HeaderValue::from_static("2022-11-28"));
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| Error::config(format!("invalid GitHub token: {e}")))?;
        map.insert("authorization", value);
    }
    Ok(map)
}

/// An in-flight download. The result only surfaces when the task is
/// awaited; a task that is never awaited fails silently.
pub struct DownloadTask {
    pub url: String,
    pub dest: PathBuf,
    handle: JoinHandle<Result<()>>,
}

impl DownloadTask {
    pub fn wait(self) -> Result<()> {
        match self.handle.join() {
            Ok(res) => res,
            Err(_) => Err(Error::network(format!(
                "download worker for {} panicked",
                self.url
            ))),
        }
    }
}

#[derive(Clone)]
pub struct Http {
    client: Client,
}

impl Http {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// GET with a bounded retry budget. Exhausting the budget logs the
    /// final error and degrades to `None`; the call site decides whether
    /// the content was required.
    pub fn get_text(&self, ctx: &RunCtx, url: &str, retries: usize) -> Option<String> {
        self.get_text_with(ctx, url, retries, None)
    }

    pub fn get_text_with(
        &self,
        ctx: &RunCtx,
        url: &str,
        retries: usize,
        headers: Option<HeaderMap>,
    ) -> Option<String> {
        let mut last_err = String::new();
        for attempt in 1..=retries.max(1) {
            let mut req = self.client.get(url).timeout(TEXT_TIMEOUT);
            if let Some(h) = headers.clone() {
                req = req.headers(h);
            }
            match req.send().and_then(|r| r.error_for_status()) {
                Ok(resp) => match resp.text() {
                    Ok(text) => return Some(text),
                    Err(e) => last_err = e.to_string(),
                },
                Err(e) => last_err = e.to_string(),
            }
            ctx.log(&format!("request to {url} failed, attempt {attempt}/{retries}"));
        }
        ctx.log(&format!("request to {url} failed permanently: {last_err}"));
        None
    }

    /// Latest-release metadata for `owner/repo`; `None` on any response
    /// that is not a JSON object.
    pub fn latest_release(
        &self,
        ctx: &RunCtx,
        api_base: &str,
        repo: &str,
        token: Option<&str>,
    ) -> Option<serde_json::Value> {
        let url = format!("{}/repos/{repo}/releases/latest", api_base.trim_end_matches('/'));
        let headers = match github_headers(token) {
            Ok(h) => h,
            Err(e) => {
                ctx.log(&format!("skipping release lookup: {e}"));
                return None;
            }
        };
        let body = self.get_text_with(ctx, &url, DEFAULT_RETRIES, Some(headers))?;
        let value: serde_json::Value = serde_json::from_str(&body).ok()?;
        value.is_object().then_some(value)
    }

    /// Starts an asynchronous download with a bounded retry budget.
    /// Failures surface when the task is awaited.
    pub fn fetch(
        &self,
        ctx: &RunCtx,
        url: &str,
        dest: &Path,
        retries: usize,
        headers: Option<HeaderMap>,
    ) -> DownloadTask {
        let client = self.client.clone();
        let ctx = ctx.clone();
        let url_owned = url.to_string();
        let dest_owned = dest.to_path_buf();
        let headers = headers.unwrap_or_else(browser_headers);

        let thread_url = url_owned.clone();
        let thread_dest = dest_owned.clone();
        let handle = std::thread::spawn(move || {
            download_with_retry(&client, &ctx, &thread_url, &thread_dest, retries, &headers)
        });

        DownloadTask {
            url: url_owned,
            dest: dest_owned,
            handle,
        }
    }

    /// Waits for every task. Each success is logged; the first failure is
    /// logged and aborts the batch (tasks after it keep running detached).
    pub fn await_all(&self, ctx: &RunCtx, tasks: Vec<DownloadTask>) -> Result<()> {
        for task in tasks {
            let url = task.url.clone();
            match task.wait() {
                Ok(()) => ctx.log(&format!("downloaded {url}")),
                Err(e) => {
                    ctx.log(&format!("download of {url} failed: {e}"));
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Splits the target into `num_threads` byte ranges and downloads them
    /// concurrently into a pre-sized file. Ranges are disjoint, so the
    /// writers need no coordination. A chunk response that is neither 200
    /// nor 206 fails the download instead of leaving a hole in the file.
    pub fn fetch_chunked(
        &self,
        ctx: &RunCtx,
        url: &str,
        dest: &Path,
        headers: Option<HeaderMap>,
        num_threads: usize,
    ) -> Result<()> {
        let headers = headers.unwrap_or_else(browser_headers);
        let resp = self
            .client
            .head(url)
            .headers(headers.clone())
            .timeout(Duration::from_secs(120))
            .send()
            .map_err(|e| Error::network(format!("HEAD {url} failed: {e}")))?;
        let size = resp
            .content_length()
            .ok_or_else(|| Error::network(format!("{url} did not declare a content length")))?;

        if let Some(parent) = dest.parent() {
            crate::util::ensure_dir(parent)?;
        }
        let file = fs::File::create(dest)
            .map_err(|e| Error::filesystem(format!("failed to create {}: {e}", dest.display())))?;
        file.set_len(size)
            .map_err(|e| Error::filesystem(format!("failed to presize {}: {e}", dest.display())))?;
        drop(file);

        if size == 0 {
            return Ok(());
        }

        let num_threads = num_threads.clamp(1, size as usize);
        let chunk = size / num_threads as u64;
        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let start = i as u64 * chunk;
            let end = if i == num_threads - 1 {
                size - 1
            } else {
                start + chunk - 1
            };
            let client = self.client.clone();
            let url = url.to_string();
            let dest = dest.to_path_buf();
            let headers = headers.clone();
            workers.push(std::thread::spawn(move || {
                download_chunk(&client, &url, &dest, start, end, headers)
            }));
        }

        let mut first_err = None;
        for worker in workers {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    ctx.log(&format!("chunk download of {url} failed: {e}"));
                    first_err.get_or_insert(e);
                }
                Err(_) => {
                    first_err.get_or_insert(Error::network("chunk worker panicked".to_string()));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn download_with_retry(
    client: &Client,
    ctx: &RunCtx,
    url: &str,
    dest: &Path,
    retries: usize,
    headers: &HeaderMap,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        crate::util::ensure_dir(parent)?;
    }
    let mut last_err = String::new();
    for attempt in 1..=retries.max(1) {
        let result = client
            .get(url)
            .headers(headers.clone())
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .and_then(|r| r.error_for_status());
        match result {
            Ok(mut resp) => {
                let mut file = fs::File::create(dest).map_err(|e| {
                    Error::filesystem(format!("failed to create {}: {e}", dest.display()))
                })?;
                match resp.copy_to(&mut file) {
                    Ok(_) => return Ok(()),
                    Err(e) => last_err = e.to_string(),
                }
            }
            Err(e) => last_err = e.to_string(),
        }
        ctx.log(&format!("download {url} failed, attempt {attempt}/{retries}"));
    }
    Err(Error::network(format!(
        "download of {url} failed after {retries} attempts: {last_err}"
    )))
}

fn download_chunk(
    client: &Client,
    url: &str,
    dest: &Path,
    start: u64,
    end: u64,
    mut headers: HeaderMap,
) -> Result<()> {
    let range = HeaderValue::from_str(&format!("bytes={start}-{end}"))
        .map_err(|e| Error::network(format!("invalid range header: {e}")))?;
    headers.insert(RANGE, range);

    let resp = client
        .get(url)
        .headers(headers)
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .map_err(|e| Error::network(format!("chunk {start}-{end} of {url} failed: {e}")))?;
    let status = resp.status().as_u16();
    if status != 200 && status != 206 {
        return Err(Error::network(format!(
            "chunk {start}-{end} of {url} returned status {status}"
        )));
    }
    let bytes = resp
        .bytes()
        .map_err(|e| Error::network(format!("chunk {start}-{end} body read failed: {e}")))?;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(dest)
        .map_err(|e| Error::filesystem(format!("failed to open {}: {e}", dest.display())))?;
    file.seek(SeekFrom::Start(start))
        .map_err(|e| Error::filesystem(format!("seek in {} failed: {e}", dest.display())))?;
    file.write_all(&bytes)
        .map_err(|e| Error::filesystem(format!("write to {} failed: {e}", dest.display())))?;
    Ok(())
}
