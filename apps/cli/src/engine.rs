//! HTTP transfer engine
//!
//! The reqwest-backed [`TransferEngine`] implementation the CLI plugs into
//! the core: streaming GET with breakpoint resume via `Range`, per-block
//! silence timeout, and a retry loop for transient failures.

use async_trait::async_trait;
use downkit_core::{DownloadTask, EngineError, TransferControl, TransferEngine, TransferOutcome};
use downkit_types::TransferConfig;
use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub struct HttpEngine {
    max_retries: u32,
    retry_delay: Duration,
}

impl HttpEngine {
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }

    async fn attempt(
        &self,
        client: &Client,
        task: &DownloadTask,
        ctrl: &TransferControl,
        config: &TransferConfig,
        target: &Path,
    ) -> Result<TransferOutcome, EngineError> {
        let url = task.url();
        let (path, mut downloaded) = resolve_destination(target, config).await;

        let mut request = client.get(&url);
        for (key, value) in &config.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if downloaded > 0 {
            request = request.header(RANGE, format!("bytes={downloaded}-"));
        }

        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        if downloaded > 0 && status == StatusCode::OK {
            // Server ignored the range; start over.
            debug!(%url, "range request not honored, restarting from zero");
            downloaded = 0;
        } else if !status.is_success() {
            return Err(EngineError::Server {
                status: status.as_u16(),
            });
        }

        let total = response.content_length().map(|len| len + downloaded);
        ctrl.mark_connected();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(downloaded == 0)
            .append(downloaded > 0)
            .open(&path)
            .await
            .map_err(io_error)?;

        let mut stream = response.bytes_stream();
        loop {
            if ctrl.is_stopped() {
                file.flush().await.map_err(io_error)?;
                return Ok(TransferOutcome::Stopped);
            }
            let chunk = match tokio::time::timeout(config.block_timeout, stream.next()).await {
                Err(_) => return Err(EngineError::Timeout),
                Ok(None) => break,
                Ok(Some(chunk)) => chunk.map_err(request_error)?,
            };
            file.write_all(&chunk).await.map_err(io_error)?;
            downloaded += chunk.len() as u64;
            ctrl.report_progress(downloaded, total);
        }
        file.flush().await.map_err(io_error)?;

        Ok(TransferOutcome::Completed(path))
    }
}

impl Default for HttpEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferEngine for HttpEngine {
    async fn transfer(
        &self,
        task: Arc<DownloadTask>,
        ctrl: TransferControl,
    ) -> Result<TransferOutcome, EngineError> {
        let config = task.config();
        let target = task
            .target()
            .ok_or_else(|| EngineError::Io("task has no destination path".into()))?;

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(request_error)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            ctrl.record_connect_attempt();

            let run = self.attempt(&client, &task, &ctrl, &config, &target);
            let result = match config.transfer_timeout {
                Some(limit) => tokio::time::timeout(limit, run)
                    .await
                    .unwrap_or(Err(EngineError::Timeout)),
                None => run.await,
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(cause)
                    if cause.is_retryable() && attempt <= self.max_retries && !ctrl.is_stopped() =>
                {
                    warn!(url = %task.url(), %cause, attempt, "transfer attempt failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(cause) => return Err(cause),
            }
        }
    }
}

/// Pick the on-disk destination and the byte offset to resume from.
async fn resolve_destination(target: &Path, config: &TransferConfig) -> (PathBuf, u64) {
    match tokio::fs::metadata(target).await {
        Err(_) => (target.to_path_buf(), 0),
        Ok(_) if config.force_redownload => (target.to_path_buf(), 0),
        Ok(meta) if config.breakpoint_resume => (target.to_path_buf(), meta.len()),
        Ok(_) if config.unique_target => (unique_path(target).await, 0),
        Ok(_) => (target.to_path_buf(), 0),
    }
}

/// Derive a non-clobbering sibling path: `file.bin` -> `file (1).bin`.
async fn unique_path(target: &Path) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let extension = target.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = target.parent().unwrap_or_else(|| Path::new("."));

    for n in 1.. {
        let name = match &extension {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = parent.join(name);
        if tokio::fs::metadata(&candidate).await.is_err() {
            return candidate;
        }
    }
    unreachable!()
}

fn request_error(error: reqwest::Error) -> EngineError {
    if error.is_timeout() {
        EngineError::Timeout
    } else if error.is_builder() {
        EngineError::InvalidUrl(error.to_string())
    } else {
        EngineError::Network(error.to_string())
    }
}

fn io_error(error: std::io::Error) -> EngineError {
    EngineError::Io(error.to_string())
}
