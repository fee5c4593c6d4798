use anyhow::Context;
use clap::Parser;
use tokio::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aya::maps::{MapData, RingBuf};

mod btf;
mod config;
mod ksyms;
mod netns;
mod probe;
mod report;

use config::{CliArgs, Config, OutputFormat};
use ksyms::SymbolCache;
use probe::{DropProbe, Params};
use report::DropReport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);

    // Logging. Events go to stdout, logs to stderr.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    // ── Probe configuration ──────────────────────────────────────────
    let ns_probe = btf::detect_namespace_probe(&config.btf);
    let params = Params {
        fallback_ns: netns::fallback_namespace().unwrap_or_else(|e| {
            tracing::warn!("cannot determine fallback namespace, reporting 0: {:#}", e);
            0
        }),
        filter_ns: config.filter_namespace()?,
    };
    if params.filter_ns != 0 {
        tracing::info!("Reporting drops in network namespace {}", params.filter_ns);
    }

    let symbols = SymbolCache::load(&config.kallsyms)
        .context("failed to load kernel symbols")?;

    // ── eBPF setup ────────────────────────────────────────────────────
    let mut probe = DropProbe::attach(&config.object, ns_probe, params)?;
    let ring_buf = probe.events()?;

    // ── RingBuf Poller ────────────────────────────────────────────────
    let format = config.format;
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    tokio::spawn(async move {
        poll_ring_buf(ring_buf, symbols, format, poll_interval).await;
    });

    tracing::info!("Listening for drop events, press Ctrl-C to exit");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Got an interrupt, detaching");

    drop(probe);
    Ok(())
}

/// Continuously poll the eBPF RingBuf for DropEvent entries, symbolize
/// their stacks and print them.
async fn poll_ring_buf(
    mut ring_buf: RingBuf<MapData>,
    symbols: SymbolCache,
    format: OutputFormat,
    poll_interval: Duration,
) {
    loop {
        while let Some(item) = ring_buf.next() {
            let Some(event) = report::decode(&item) else {
                tracing::warn!(
                    "Malformed event: expected {} bytes, got {} bytes - skipping",
                    dropsnoop_common::DropEvent::LEN,
                    item.len()
                );
                continue;
            };
            let report = DropReport::from_ebpf(&event, &symbols);
            match format {
                OutputFormat::Text => println!("{}", report.to_text()),
                OutputFormat::Json => match report.to_json() {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::error!("failed to encode event: {}", e),
                },
            }
        }

        // Yield briefly to avoid busy-spinning when the ring buffer is empty.
        tokio::time::sleep(poll_interval).await;
    }
}
