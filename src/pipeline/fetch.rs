use crate::config::ResearchConfig;
use crate::error::PipelineError;
use crate::model::{PageOutcome, PageResult};
use crate::pipeline::extraction::extract_content;
use backoff::future::retry_notify;
use backoff::{Error as BackoffError, ExponentialBackoff};
use futures::stream::{self, StreamExt};
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

fn retry_notify_handler<E>(err: E, duration: Duration)
where
    E: std::fmt::Display,
{
    tracing::debug!(
        "Request failed: {}. Retrying in {:.1}s...",
        err,
        duration.as_secs_f32()
    );
}

/// Bounded-concurrency worker pool that turns selected URLs into
/// `PageResult`s.
///
/// One page's failure never cancels its siblings; URLs whose turn comes
/// after the phase deadline (or a cancellation) are marked skipped and
/// never fetched.
pub struct FetchPool {
    client: Client,
    concurrency: usize,
    page_timeout: Duration,
    sufficiency_threshold: usize,
}

impl FetchPool {
    pub fn new(client: Client, config: &ResearchConfig) -> Self {
        Self {
            client,
            concurrency: config.fetch_concurrency,
            page_timeout: config.page_timeout(),
            sufficiency_threshold: config.sufficiency_threshold,
        }
    }

    /// Fetch and extract every URL, respecting the phase `deadline` and the
    /// job's cancellation flag. Returns exactly one result per input URL,
    /// in input order.
    #[tracing::instrument(skip_all, fields(urls = urls.len()))]
    pub async fn fetch_all(
        &self,
        urls: Vec<String>,
        deadline: Instant,
        cancelled: Arc<AtomicBool>,
    ) -> Vec<PageResult> {
        let mut results: Vec<(usize, PageResult)> = stream::iter(
            urls.into_iter()
                .enumerate()
                .map(|(index, url)| {
                    let cancelled = Arc::clone(&cancelled);
                    async move {
                        // Checked when the pool actually gets to this URL,
                        // not when the batch was submitted.
                        if cancelled.load(Ordering::Relaxed) || Instant::now() >= deadline {
                            return (index, PageResult::skipped(url));
                        }
                        (index, self.fetch_one(url, deadline).await)
                    }
                }),
        )
        .buffer_unordered(self.concurrency)
        .collect()
        .await;

        results.sort_by_key(|(index, _)| *index);
        let results: Vec<PageResult> = results.into_iter().map(|(_, result)| result).collect();

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let skipped = results
            .iter()
            .filter(|r| r.outcome == PageOutcome::Skipped)
            .count();
        tracing::info!(
            total = results.len(),
            succeeded,
            skipped,
            "fetch phase finished"
        );
        results
    }

    /// Fetch one page and run extraction. The per-page timeout also bounds
    /// transient retries, and is clipped to whatever remains of the phase.
    #[tracing::instrument(skip(self, deadline), fields(url = %url))]
    async fn fetch_one(&self, url: String, deadline: Instant) -> PageResult {
        let started = Instant::now();
        let budget = self
            .page_timeout
            .min(deadline.saturating_duration_since(started));

        let outcome = tokio::time::timeout(budget, self.fetch_and_extract(&url)).await;
        let fetch_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                tracing::debug!("page failed: {}", e);
                PageResult::failed(url, fetch_ms, e.to_string())
            }
            Err(_) => PageResult::failed(
                url,
                fetch_ms,
                format!("page timed out after {:.0?}", budget),
            ),
        }
    }

    async fn fetch_and_extract(&self, url: &str) -> Result<PageResult, PipelineError> {
        let started = Instant::now();
        let parsed = Url::parse(url)
            .map_err(|e| PipelineError::TransientNetwork(format!("bad URL {}: {}", url, e)))?;

        let html = self.fetch_with_retry(url).await?;
        let fetch_ms = started.elapsed().as_millis() as u64;

        let threshold = self.sufficiency_threshold;
        let owned_url = url.to_string();
        let extracted = tokio::task::spawn_blocking(move || {
            extract_content(&html, &parsed, threshold)
        })
        .await
        .map_err(|e| PipelineError::TransientNetwork(format!("extraction task failed: {}", e)))?;

        match extracted {
            Ok(content) => Ok(PageResult {
                url: owned_url,
                outcome: PageOutcome::Success,
                content_length: content.text.len(),
                text: content.text,
                method: Some(content.method),
                fetch_ms,
                error: None,
            }),
            Err(e) => Err(e),
        }
    }

    /// GET with browser-like headers, a rotating user agent and a
    /// transient/permanent retry split: 5xx plus connect/timeout errors
    /// retry; bot-block statuses (403, 429, 503) and other client errors
    /// fail the page immediately.
    async fn fetch_with_retry(&self, url: &str) -> Result<String, PipelineError> {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_elapsed_time: Some(self.page_timeout / 2),
            ..ExponentialBackoff::default()
        };

        let response = retry_notify(
            backoff,
            || async {
                let request = self
                    .client
                    .get(url)
                    .header("User-Agent", ua_generator::ua::spoof_ua())
                    .header(
                        "Accept",
                        "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                    )
                    .header("Accept-Language", "en-US,en;q=0.9")
                    .timeout(self.page_timeout);

                match request.send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            Ok(resp)
                        } else {
                            match classify_status(status.as_u16()) {
                                // A bot block does not clear up on retry
                                // within the same job.
                                e @ PipelineError::BlockedOrForbidden(_) => {
                                    tracing::debug!("Blocked by status {}, not retrying", status);
                                    Err(BackoffError::permanent(e))
                                }
                                e if status.is_server_error() => {
                                    tracing::debug!("Retrying on status: {}", status);
                                    Err(BackoffError::transient(e))
                                }
                                e => {
                                    tracing::debug!("Permanent error status: {}", status);
                                    Err(BackoffError::permanent(e))
                                }
                            }
                        }
                    }
                    Err(err) => {
                        if err.is_timeout() || err.is_connect() || err.is_request() {
                            tracing::debug!("Retrying on reqwest error: {}", err);
                            Err(BackoffError::transient(PipelineError::TransientNetwork(
                                err.to_string(),
                            )))
                        } else {
                            tracing::debug!("Permanent reqwest error: {}", err);
                            Err(BackoffError::permanent(PipelineError::TransientNetwork(
                                err.to_string(),
                            )))
                        }
                    }
                }
            },
            retry_notify_handler,
        )
        .await?;

        response
            .text()
            .await
            .map_err(|e| PipelineError::TransientNetwork(e.to_string()))
    }
}

/// Map an HTTP status to the error recorded on the page result.
fn classify_status(status: u16) -> PipelineError {
    match status {
        403 | 429 | 503 => PipelineError::BlockedOrForbidden(status),
        _ => PipelineError::TransientNetwork(format!(
            "server returned non-retryable status: {}",
            status
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn blocked_status_fails_without_retrying() {
        let hits = Arc::new(AtomicUsize::new(0));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counter = Arc::clone(&hits);
        let app = axum::Router::new().route(
            "/blocked",
            axum::routing::get(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::TOO_MANY_REQUESTS
                }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut config = ResearchConfig::default();
        config.page_timeout_secs = 5;
        let pool = FetchPool::new(Client::new(), &config);

        let err = pool
            .fetch_with_retry(&format!("http://{}/blocked", addr))
            .await
            .expect_err("429 is a hard failure");
        assert!(matches!(err, PipelineError::BlockedOrForbidden(429)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocked_statuses_are_classified() {
        assert!(matches!(
            classify_status(403),
            PipelineError::BlockedOrForbidden(403)
        ));
        assert!(matches!(
            classify_status(429),
            PipelineError::BlockedOrForbidden(429)
        ));
        assert!(matches!(
            classify_status(503),
            PipelineError::BlockedOrForbidden(503)
        ));
        assert!(matches!(
            classify_status(404),
            PipelineError::TransientNetwork(_)
        ));
    }
}
