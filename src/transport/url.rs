//! Retrieval URL assembly.
//!
//! Builds the query URL from the endpoint base, channel name, time window
//! and bin count. The builder is re-targetable: a redirect replaces the base
//! while the window semantics carry over, and a `continueAt` continuation
//! advances only the window's begin time.

use crate::config::ResolvedRequest;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

#[derive(Debug, Clone)]
pub struct UrlBuilder {
    base: String,
    channel: String,
    backend: Option<String>,
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
    bin_count: Option<u32>,
}

impl UrlBuilder {
    /// Build from a resolved request, anchoring the window at `now` (epoch
    /// seconds).
    pub fn from_request(request: &ResolvedRequest, now: f64) -> Self {
        let end = epoch_to_datetime(now);
        let begin = epoch_to_datetime(now - request.seconds_past as f64);
        Self {
            base: request.endpoint.clone(),
            channel: request.channel.clone(),
            backend: request.backend.as_ref().map(|b| b.as_str().to_string()),
            begin,
            end,
            bin_count: u32::try_from(request.bin_count).ok().filter(|&n| n > 0),
        }
    }

    /// Re-target the builder at a new endpoint base, keeping the window.
    pub fn set_base(&mut self, base: impl Into<String>) {
        self.base = base.into();
    }

    /// Advance the window's begin time (continuation follow-up).
    pub fn set_begin(&mut self, begin: DateTime<Utc>) {
        self.begin = begin;
    }

    pub fn begin(&self) -> DateTime<Utc> {
        self.begin
    }

    pub fn assemble(&self) -> String {
        let mut url = format!(
            "{}api/v1/query?channelName={}&begDate={}&endDate={}",
            normalized_base(&self.base),
            self.channel,
            self.begin.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.end.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        if let Some(bins) = self.bin_count {
            url.push_str(&format!("&binCount={}", bins));
        }
        if let Some(backend) = &self.backend {
            url.push_str(&format!("&backend={}", backend));
        }
        url
    }
}

fn normalized_base(base: &str) -> String {
    if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{}/", base)
    }
}

fn epoch_to_datetime(seconds: f64) -> DateTime<Utc> {
    let millis = (seconds * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}
