//! Diagnostic CLI: one-shot retrieval of a channel's trailing window.

use anyhow::Context;
use archiver::{
    ArchiveEngine, AxisRole, BufferRef, BufferStore, ChannelConfig, ChannelKey, EngineConfig,
    MemoryBufferStore, UpdateRequest, WidgetId,
};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Fetch archived channel data and print the samples plus the retrieval
/// performance report.
#[derive(Parser, Debug)]
#[command(name = "archiver", version, about = "Archived channel data retrieval")]
struct Cli {
    /// Channel (PV) name to retrieve.
    channel: String,

    /// Endpoint base URL. Falls back to ARCHIVER_HTTP_URL, then the
    /// built-in default.
    #[arg(long, env = "ARCHIVER_HTTP_URL")]
    url: Option<String>,

    /// Trailing window length in seconds.
    #[arg(long, default_value_t = 3600)]
    seconds: u64,

    /// Server-side bin count; omit for unbinned data.
    #[arg(long)]
    bins: Option<u32>,

    /// Backend to query (archiver-appliance or data-buffer).
    #[arg(long)]
    backend: Option<String>,

    /// Skip TLS peer verification.
    #[arg(long)]
    insecure: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let store = Arc::new(MemoryBufferStore::new());
    store.insert(0, Default::default());
    store.insert(1, Default::default());

    let engine_config = EngineConfig {
        accept_invalid_certs: cli.insecure,
        ..Default::default()
    };
    let engine = ArchiveEngine::new(engine_config, store.clone())
        .context("failed to build HTTP client")?;

    let key = ChannelKey::new(cli.channel.clone(), 0, WidgetId::new("cli"), AxisRole::Primary);
    let config = ChannelConfig {
        seconds_past: cli.seconds,
        bin_count: cli.bins.map(|n| n as i32).unwrap_or(-1),
        backend: cli.backend.as_deref().map(archiver::config::BackendHint::parse),
        endpoint_override: cli.url.clone(),
        absolute_time_axis: true,
        init: true,
    };

    let retrieval_key = key.retrieval_key();
    engine.submit(vec![UpdateRequest {
        key,
        config,
        buffer: BufferRef::new(0, 1),
    }]);
    engine.drain().await;

    let x = store.read(0).map(|s| s.data).unwrap_or_default();
    let y = store.read(1).map(|s| s.data).unwrap_or_default();
    println!("{} points in window", x.len());
    for (t, v) in x.iter().zip(y.iter()) {
        println!("{t:.0}\t{v}");
    }

    if let Some(report) = engine.generate_report(&retrieval_key) {
        println!("\n{report}");
    }

    engine.shutdown().await;
    Ok(())
}
