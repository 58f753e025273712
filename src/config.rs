//! Engine and per-channel configuration.
//!
//! The host supplies a [`ChannelConfig`] with every update batch; the
//! dispatcher resolves it once per submission into a [`ResolvedRequest`] that
//! is passed by value into the worker, so nothing downstream consults host
//! state again.
//!
//! # Endpoint precedence
//!
//! 1. Per-channel override (highest priority)
//! 2. Environment variable (`ARCHIVER_HTTP_URL`)
//! 3. Built-in default (lowest priority)

use crate::key::{ChannelKey, RetrievalKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Built-in retrieval endpoint used when nothing else is configured.
pub const DEFAULT_ENDPOINT: &str = "https://data-api.psi.ch/";

/// Environment variable consulted for the endpoint base URL.
pub const ENDPOINT_ENV_VAR: &str = "ARCHIVER_HTTP_URL";

/// Server-side backend a channel's data should be read from.
///
/// Unknown names are passed through to the server unchanged; the dispatcher
/// warns about them once per channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendHint {
    ArchiverAppliance,
    DataBuffer,
    Other(String),
}

impl BackendHint {
    /// Parse a backend name as supplied by the host. Matching is
    /// case-insensitive; unrecognized names become [`BackendHint::Other`].
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "archiver-appliance" | "sf-archiverappliance" => Self::ArchiverAppliance,
            "data-buffer" | "sf-databuffer" => Self::DataBuffer,
            _ => Self::Other(name.trim().to_string()),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ArchiverAppliance => "archiver-appliance",
            Self::DataBuffer => "data-buffer",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for BackendHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-key retrieval parameters supplied by the host with each update.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Trailing window length in seconds.
    pub seconds_past: u64,
    /// Server-side bin count; `-1` requests unbinned data.
    pub bin_count: i32,
    /// Backend to query, if the host configured one.
    pub backend: Option<BackendHint>,
    /// Endpoint base URL override for this channel, if any.
    pub endpoint_override: Option<String>,
    /// Absolute (epoch milliseconds) vs relative (hours-ago) time axis.
    pub absolute_time_axis: bool,
    /// First request for this channel; configuration warnings are emitted
    /// only when set.
    pub init: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            seconds_past: 3600,
            bin_count: -1,
            backend: None,
            endpoint_override: None,
            absolute_time_axis: true,
            init: false,
        }
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Endpoint base URL used when neither a per-channel override nor the
    /// environment variable is set.
    pub default_endpoint: String,
    /// Watchdog timeout for one HTTP transaction, in seconds.
    pub request_timeout_seconds: u64,
    /// Skip TLS peer verification (some archiver deployments run with
    /// self-signed certificates).
    pub accept_invalid_certs: bool,
    /// Maximum `continueAt` continuation fetches chased per retrieval.
    pub max_continuations: u32,
    /// Depth of the worker-to-coordinator event queue.
    pub event_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_endpoint: DEFAULT_ENDPOINT.to_string(),
            request_timeout_seconds: 60,
            accept_invalid_certs: false,
            max_continuations: 8,
            event_queue_depth: 64,
        }
    }
}

/// Effective parameters for one retrieval, resolved once per submission.
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub key: RetrievalKey,
    /// Endpoint base URL after precedence resolution.
    pub endpoint: String,
    pub channel: String,
    /// Window length including any accumulated extension.
    pub seconds_past: u64,
    pub bin_count: i32,
    pub backend: Option<BackendHint>,
    pub absolute_time_axis: bool,
}

/// Resolve the endpoint base URL for a channel.
///
/// Warnings about missing configuration are emitted only on the channel's
/// first request.
pub fn resolve_endpoint(key: &ChannelKey, config: &ChannelConfig, engine: &EngineConfig) -> String {
    if let Some(url) = &config.endpoint_override {
        if config.init {
            tracing::warn!(
                channel = %key.channel,
                widget = %key.widget,
                endpoint = %url,
                "endpoint override configured for widget"
            );
        }
        return url.clone();
    }

    match std::env::var(ENDPOINT_ENV_VAR) {
        Ok(url) if !url.is_empty() => {
            if config.init {
                tracing::warn!(
                    channel = %key.channel,
                    endpoint = %url,
                    "archiver URL taken from environment variable {}",
                    ENDPOINT_ENV_VAR
                );
            }
            url
        }
        _ => {
            if config.init {
                tracing::warn!(
                    channel = %key.channel,
                    endpoint = %engine.default_endpoint,
                    "no {} set and no endpoint override configured, using default",
                    ENDPOINT_ENV_VAR
                );
            }
            engine.default_endpoint.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.request_timeout_seconds, 60);
        assert!(!config.accept_invalid_certs);
        assert_eq!(config.max_continuations, 8);
    }

    #[test]
    fn test_engine_config_partial_toml() {
        let toml = r#"
            request_timeout_seconds = 10
        "#;
        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.request_timeout_seconds, 10);
        assert_eq!(config.default_endpoint, DEFAULT_ENDPOINT); // default
    }

    #[test]
    fn test_backend_hint_parse_known() {
        assert_eq!(
            BackendHint::parse("Archiver-Appliance"),
            BackendHint::ArchiverAppliance
        );
        assert_eq!(BackendHint::parse("sf-databuffer"), BackendHint::DataBuffer);
        assert!(BackendHint::parse("data-buffer").is_known());
    }

    #[test]
    fn test_backend_hint_passthrough() {
        let hint = BackendHint::parse("my-local-backend");
        assert!(!hint.is_known());
        assert_eq!(hint.as_str(), "my-local-backend");
    }

    #[test]
    fn test_channel_config_defaults_unbinned() {
        let config = ChannelConfig::default();
        assert_eq!(config.bin_count, -1);
        assert_eq!(config.seconds_past, 3600);
    }
}
