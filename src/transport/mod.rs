//! HTTP retrieval transport.
//!
//! One [`HttpTransport`] performs one logical retrieval transaction: issue
//! the GET, surface redirects to the caller, inflate the payload, decode the
//! JSON and filter it against the window. The transaction is guarded by a
//! 60-second watchdog and can be cancelled from another task at any time;
//! cancellation and timeout both complete the transaction with zero points.

mod decompress;
mod error;
mod parser;
mod url;

pub use error::TransportError;
pub use parser::{ParseContext, ParsedSeries};
pub use url::UrlBuilder;

use crate::config::ResolvedRequest;
use reqwest::header::{ACCEPT, ACCEPT_ENCODING, CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Phases of one retrieval transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Requesting,
    Redirected,
    Parsed,
    Failed,
    Aborted,
    TimedOut,
    Done,
}

/// Terminal outcome of one fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Parsed, window-filtered samples.
    Data(ParsedSeries),
    /// Server redirected; caller re-issues against the new endpoint with the
    /// original window semantics.
    Redirect { location: String },
    /// Cancelled from outside.
    Aborted,
    /// Network or protocol failure; zero points plus an error string.
    Failed(TransportError),
}

/// Outcome plus transfer accounting for the performance record.
#[derive(Debug, Clone)]
pub struct FetchReport {
    pub outcome: FetchOutcome,
    /// Compressed payload size as received.
    pub response_bytes: usize,
}

/// Performs one retrieval transaction against the archiver.
pub struct HttpTransport {
    client: reqwest::Client,
    cancel: CancellationToken,
    state: Mutex<TransportState>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            client,
            cancel: CancellationToken::new(),
            state: Mutex::new(TransportState::Idle),
            timeout,
        }
    }

    /// Build the shared HTTP client. Redirects stay with the engine (the
    /// caller re-targets explicitly) and compressed bodies pass through raw
    /// so the fallback decompression path owns them.
    pub fn build_client(accept_invalid_certs: bool) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
    }

    /// Request cancellation. Safe to call from another task; the in-flight
    /// transaction completes with zero points at its next suspension point,
    /// not necessarily immediately.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock().expect("transport state lock poisoned")
    }

    /// Mark the transaction consumed once its result has been delivered.
    pub fn mark_done(&self) {
        self.set_state(TransportState::Done);
    }

    /// Run one transaction against `url`.
    pub async fn fetch(&self, url: &str, request: &ResolvedRequest) -> FetchReport {
        self.set_state(TransportState::Requesting);

        let result = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.set_state(TransportState::Aborted);
                return FetchReport {
                    outcome: FetchOutcome::Aborted,
                    response_bytes: 0,
                };
            }
            result = tokio::time::timeout(self.timeout, self.run_transaction(url, request)) => result,
        };

        match result {
            Ok(report) => report,
            Err(_elapsed) => {
                // Watchdog fired: same cancellation path as an abort, with an
                // explicit timeout error.
                self.cancel.cancel();
                self.set_state(TransportState::TimedOut);
                FetchReport {
                    outcome: FetchOutcome::Failed(TransportError::Timeout),
                    response_bytes: 0,
                }
            }
        }
    }

    async fn run_transaction(&self, url: &str, request: &ResolvedRequest) -> FetchReport {
        let response = match self
            .client
            .get(url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT_ENCODING, "gzip, deflate")
            .header(ACCEPT, "*/*")
            .header("Timeout", "86400")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return self.fail(TransportError::from_reqwest(e), 0),
        };

        let status = response.status();
        if is_redirect(status) {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return match location {
                Some(location) => {
                    tracing::debug!(
                        status = status.as_u16(),
                        location = %location,
                        "redirect from {url}"
                    );
                    self.set_state(TransportState::Redirected);
                    FetchReport {
                        outcome: FetchOutcome::Redirect { location },
                        response_bytes: 0,
                    }
                }
                None => self.fail(
                    TransportError::RedirectWithoutLocation {
                        status: status.as_u16(),
                        url: url.to_string(),
                    },
                    0,
                ),
            };
        }

        if status != StatusCode::OK {
            return self.fail(
                TransportError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                },
                0,
            );
        }

        let raw = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(TransportError::from_reqwest(e), 0),
        };
        if raw.is_empty() {
            return self.fail(TransportError::EmptyBody(url.to_string()), 0);
        }

        let decoded = decompress::decode_body(&raw);
        let body = String::from_utf8_lossy(&decoded);

        let ctx = ParseContext {
            seconds_past: request.seconds_past,
            binned: request.bin_count > 0,
            absolute_time_axis: request.absolute_time_axis,
            now: epoch_seconds_now(),
            url: url.to_string(),
            backend: request
                .backend
                .as_ref()
                .map(|b| b.as_str().to_string())
                .unwrap_or_default(),
        };

        match parser::parse_response(&body, &ctx) {
            Ok(series) => {
                self.set_state(TransportState::Parsed);
                FetchReport {
                    outcome: FetchOutcome::Data(series),
                    response_bytes: raw.len(),
                }
            }
            Err(e) => self.fail(e, raw.len()),
        }
    }

    fn fail(&self, error: TransportError, response_bytes: usize) -> FetchReport {
        self.set_state(TransportState::Failed);
        FetchReport {
            outcome: FetchOutcome::Failed(error),
            response_bytes,
        }
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock().expect("transport state lock poisoned") = state;
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// Wall time as fractional epoch seconds.
pub(crate) fn epoch_seconds_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
