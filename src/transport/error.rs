//! Error types for the retrieval transport.

use thiserror::Error;

/// Errors that can occur during one retrieval transaction.
///
/// None of these are fatal to the engine: every variant is reported to the
/// coordinator as a result event carrying zero points plus this error's text.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The 60-second watchdog fired.
    #[error("http request timeout")]
    Timeout,

    /// Connection-level failure (refused, unreachable host, TLS, proxy).
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Server answered with a status other than 200.
    #[error("unexpected http status code {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// A redirect status arrived without a usable `location` header.
    #[error("redirect status {status} without location header from {url}")]
    RedirectWithoutLocation { status: u16, url: String },

    /// Server answered 200 with an empty body.
    #[error("HTTP response was empty from {0}")]
    EmptyBody(String),

    /// Body survived decompression fallback but is not parseable JSON.
    #[error("could not parse json string left={left} right={right}")]
    Parse { left: String, right: String },

    /// Response parsed but carried no data points.
    #[error("no data from {url} : {backend}")]
    NoData { url: String, backend: String },

    /// The retrieval was cancelled from outside.
    #[error("retrieval was aborted")]
    Aborted,
}

impl TransportError {
    /// Classify a reqwest error. The watchdog covers slow responses, so a
    /// client-side timeout here is the connect timeout.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::ConnectionFailed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        assert_eq!(TransportError::Timeout.to_string(), "http request timeout");
    }

    #[test]
    fn test_status_display() {
        let err = TransportError::HttpStatus {
            status: 503,
            url: "https://data-api.psi.ch/".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "unexpected http status code 503 from https://data-api.psi.ch/"
        );
    }

    #[test]
    fn test_parse_display_carries_both_ends() {
        let err = TransportError::Parse {
            left: "<html><body>".to_string(),
            right: "</body></html>".to_string(),
        };
        assert!(err.to_string().contains("left=<html><body>"));
        assert!(err.to_string().contains("right=</body></html>"));
    }
}
