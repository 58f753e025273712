//! Response decoding for the two archiver JSON schemas.
//!
//! The current ("flat") schema is one object with a `tsAnchor` epoch-seconds
//! base and either `values`/`tsMs` (unbinned) or `avgs`/`mins`/`maxs` with
//! `ts1Ms`/`ts2Ms` bin bounds. The legacy ("nested") schema is an array of
//! channel blocks, each carrying a `data` array of
//! `{value: {mean}, globalSeconds}` entries and the serving backend's name.
//!
//! Samples are filtered against the trailing window while decoding: a sample
//! survives only if it is younger than `seconds_past`. The time axis is
//! projected per the channel's mode: relative mode stores negative
//! hours-ago, absolute mode stores epoch milliseconds.

use super::error::TransportError;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// Decoding parameters for one response.
#[derive(Debug, Clone)]
pub struct ParseContext {
    /// Trailing window length in seconds.
    pub seconds_past: u64,
    /// Whether the request asked for server-side binning.
    pub binned: bool,
    /// Absolute (epoch ms) vs relative (hours-ago) time axis.
    pub absolute_time_axis: bool,
    /// Wall time at response receipt, epoch seconds.
    pub now: f64,
    /// Request URL, for error texts.
    pub url: String,
    /// Backend name from the request, overridden by the nested schema.
    pub backend: String,
}

/// Decoded, window-filtered samples.
///
/// `min` and `max` are populated only for binned responses; all populated
/// arrays share the length of `x`.
#[derive(Debug, Clone, Default)]
pub struct ParsedSeries {
    pub x: Vec<f64>,
    pub mean: Vec<f64>,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    /// Backend that served the data.
    pub backend: String,
    /// Server hint that more data follows from this instant.
    pub continue_at: Option<DateTime<Utc>>,
}

impl ParsedSeries {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FlatResponse {
    #[serde(rename = "tsAnchor")]
    ts_anchor: f64,
    values: Vec<f64>,
    #[serde(rename = "tsMs")]
    ts_ms: Vec<f64>,
    avgs: Vec<f64>,
    mins: Vec<f64>,
    maxs: Vec<f64>,
    #[serde(rename = "ts1Ms")]
    ts1_ms: Vec<f64>,
    #[serde(rename = "ts2Ms")]
    ts2_ms: Vec<f64>,
    #[serde(rename = "continueAt")]
    continue_at: Option<String>,
}

#[derive(Deserialize)]
struct NestedBlock {
    channel: Option<NestedChannel>,
    #[serde(default)]
    data: Option<Vec<NestedPoint>>,
}

#[derive(Deserialize)]
struct NestedChannel {
    backend: Option<String>,
}

#[derive(Deserialize)]
struct NestedPoint {
    value: Option<NestedValue>,
    #[serde(rename = "globalSeconds")]
    global_seconds: Option<String>,
}

#[derive(Deserialize)]
struct NestedValue {
    mean: Option<f64>,
}

/// Decode a (decompressed) response body.
pub fn parse_response(body: &str, ctx: &ParseContext) -> Result<ParsedSeries, TransportError> {
    let root: Value = serde_json::from_str(body).map_err(|_| parse_error(body))?;

    match root {
        Value::Object(_) => parse_flat(root, ctx).ok_or_else(|| parse_error(body)),
        Value::Array(_) => parse_nested(root, ctx, body),
        _ => Err(parse_error(body)),
    }
}

fn parse_flat(root: Value, ctx: &ParseContext) -> Option<ParsedSeries> {
    // An object carrying none of the schema keys is garbage, not an empty
    // window.
    let obj = root.as_object()?;
    if !obj.contains_key("tsAnchor") && !obj.contains_key("values") && !obj.contains_key("avgs") {
        return None;
    }

    let flat: FlatResponse = serde_json::from_value(root).ok()?;

    let continue_at = flat.continue_at.as_deref().and_then(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                tracing::debug!(value = s, error = %e, "unparseable continueAt, ignoring");
                e
            })
            .ok()
    });

    let mut series = ParsedSeries {
        backend: ctx.backend.clone(),
        continue_at,
        ..Default::default()
    };

    if ctx.binned {
        let n = flat
            .avgs
            .len()
            .min(flat.ts1_ms.len())
            .min(flat.ts2_ms.len());
        for i in 0..n {
            // Bin timestamp is the anchor plus the midpoint of the bounds.
            let archive_time =
                flat.ts_anchor + (flat.ts1_ms[i] + flat.ts2_ms[i]) * 0.0005;
            if let Some(x) = project_time(ctx, archive_time) {
                series.x.push(x);
                series.mean.push(flat.avgs[i]);
                series.min.push(flat.mins.get(i).copied().unwrap_or(flat.avgs[i]));
                series.max.push(flat.maxs.get(i).copied().unwrap_or(flat.avgs[i]));
            }
        }
    } else {
        let n = flat.values.len().min(flat.ts_ms.len());
        for i in 0..n {
            let archive_time = flat.ts_anchor + flat.ts_ms[i] * 0.001;
            if let Some(x) = project_time(ctx, archive_time) {
                series.x.push(x);
                series.mean.push(flat.values[i]);
            }
        }
    }

    Some(series)
}

fn parse_nested(
    root: Value,
    ctx: &ParseContext,
    body: &str,
) -> Result<ParsedSeries, TransportError> {
    let blocks: Vec<NestedBlock> =
        serde_json::from_value(root).map_err(|_| parse_error(body))?;

    let mut series = ParsedSeries {
        backend: ctx.backend.clone(),
        ..Default::default()
    };

    for block in blocks {
        if let Some(backend) = block.channel.and_then(|c| c.backend) {
            series.backend = backend;
        }
        let Some(data) = block.data else { continue };
        if data.is_empty() {
            return Err(TransportError::NoData {
                url: ctx.url.clone(),
                backend: series.backend.clone(),
            });
        }
        for point in data {
            let Some(mean) = point.value.and_then(|v| v.mean) else {
                continue;
            };
            let Some(archive_time) = point
                .global_seconds
                .as_deref()
                .and_then(|s| s.parse::<f64>().ok())
            else {
                continue;
            };
            if let Some(x) = project_time(ctx, archive_time) {
                series.x.push(x);
                series.mean.push(mean);
            }
        }
    }

    Ok(series)
}

/// Window filter plus time-axis projection. Zero timestamps are padding from
/// partially filled server buffers and are dropped.
fn project_time(ctx: &ParseContext, archive_time: f64) -> Option<f64> {
    if archive_time == 0.0 {
        return None;
    }
    let age = ctx.now - archive_time;
    if age >= ctx.seconds_past as f64 {
        return None;
    }
    if ctx.absolute_time_axis {
        Some(archive_time * 1000.0)
    } else {
        Some(-age / 3600.0)
    }
}

fn parse_error(body: &str) -> TransportError {
    TransportError::Parse {
        left: body.chars().take(20).collect(),
        right: {
            let chars: Vec<char> = body.chars().collect();
            chars[chars.len().saturating_sub(20)..].iter().collect()
        },
    }
}
