//! Artwork retrieval with bounded retries and a hard timeout.

use std::future::Future;
use std::io::Read;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::artwork::image_pipeline::decode_image_from_memory_with_fallback;
use crate::config::{ArtworkConfig, TimingConfig};
use crate::errors::FetchError;
use crate::snapshot::ArtworkHandle;

pub type TransportFuture =
    Pin<Box<dyn Future<Output = Result<Vec<u8>, FetchError>> + Send + 'static>>;

/// Byte source for artwork URLs.
pub trait ArtworkTransport: Send + Sync {
    fn get_bytes(&self, url: &str) -> TransportFuture;
}

/// HTTP transport backed by a blocking `ureq` agent on the blocking pool.
pub struct UreqTransport {
    agent: ureq::Agent,
    max_bytes: u64,
}

impl UreqTransport {
    pub fn new(config: &ArtworkConfig, request_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(request_timeout)
            .timeout_read(request_timeout)
            .user_agent(&config.user_agent)
            .build();
        Self {
            agent,
            max_bytes: config.max_download_bytes,
        }
    }

    fn get_blocking(agent: &ureq::Agent, url: &str, max_bytes: u64) -> Result<Vec<u8>, FetchError> {
        let response = match agent.get(url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => return Err(FetchError::Status(code)),
            Err(ureq::Error::Transport(transport)) => {
                return Err(FetchError::Network(transport.to_string()))
            }
        };
        debug!("ArtworkFetcher: HTTP {} for {}", response.status(), url);
        read_capped(response.into_reader(), max_bytes)
    }
}

/// Reads a response body, failing once it grows past `max_bytes`.
fn read_capped(reader: impl Read, max_bytes: u64) -> Result<Vec<u8>, FetchError> {
    let mut bytes = Vec::new();
    reader
        .take(max_bytes.saturating_add(1))
        .read_to_end(&mut bytes)
        .map_err(|err| FetchError::Network(format!("failed to read response: {err}")))?;
    if bytes.len() as u64 > max_bytes {
        return Err(FetchError::TooLarge(max_bytes));
    }
    if bytes.is_empty() {
        return Err(FetchError::EmptyBody);
    }
    Ok(bytes)
}

impl ArtworkTransport for UreqTransport {
    fn get_bytes(&self, url: &str) -> TransportFuture {
        let agent = self.agent.clone();
        let url = url.to_string();
        let max_bytes = self.max_bytes;
        Box::pin(async move {
            tokio::task::spawn_blocking(move || Self::get_blocking(&agent, &url, max_bytes))
                .await
                .map_err(|err| FetchError::Network(format!("download task failed: {err}")))?
        })
    }
}

/// Fetches and decodes artwork, retrying transient failures.
#[derive(Clone)]
pub struct ArtworkFetcher {
    transport: Arc<dyn ArtworkTransport>,
    max_retries: u32,
    retry_step: Duration,
    timeout: Duration,
}

impl ArtworkFetcher {
    pub fn new(transport: Arc<dyn ArtworkTransport>, timing: &TimingConfig) -> Self {
        Self {
            transport,
            max_retries: timing.fetch_max_retries,
            retry_step: timing.fetch_retry_step(),
            timeout: timing.fetch_timeout(),
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_step.saturating_mul(attempt.max(1))
    }

    fn validate_url(url: &str) -> Result<(), FetchError> {
        let lowered = url.trim().to_ascii_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            Ok(())
        } else {
            Err(FetchError::InvalidUrl(url.to_string()))
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<ArtworkHandle, FetchError> {
        let bytes = self.transport.get_bytes(url).await?;
        if bytes.is_empty() {
            return Err(FetchError::EmptyBody);
        }
        let image = decode_image_from_memory_with_fallback(&bytes)
            .ok_or(FetchError::Undecodable(bytes.len()))?;
        Ok(ArtworkHandle::new(url, image))
    }

    /// Up to `max_retries + 1` attempts with linearly growing delays.
    pub async fn fetch(&self, url: &str) -> Result<ArtworkHandle, FetchError> {
        Self::validate_url(url)?;
        let max_attempts = self.max_retries.saturating_add(1);
        let mut attempt = 1u32;
        loop {
            match self.fetch_once(url).await {
                Ok(handle) => {
                    if attempt > 1 {
                        info!(
                            "ArtworkFetcher: {} succeeded on attempt {}/{}",
                            url, attempt, max_attempts
                        );
                    }
                    return Ok(handle);
                }
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry_delay(attempt);
                    warn!(
                        "ArtworkFetcher: attempt {}/{} for {} failed ({}), retrying in {:?}",
                        attempt, max_attempts, url, error, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) if error.is_retryable() => {
                    return Err(FetchError::Exhausted {
                        attempts: attempt,
                        last: Box::new(error),
                    });
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Races [`Self::fetch`] against the configured timeout.
    ///
    /// The losing fetch is dropped; a blocking download that is already
    /// running finishes on the blocking pool and its result is discarded.
    pub async fn fetch_with_timeout(&self, url: &str) -> Result<ArtworkHandle, FetchError> {
        match tokio::time::timeout(self.timeout, self.fetch(url)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::TimedOut(self.timeout)),
        }
    }
}
