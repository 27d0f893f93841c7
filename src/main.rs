use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use slp_scan::favicon::FaviconExporter;
use slp_scan::hosts;
use slp_scan::protocol::DEFAULT_PORT;
use slp_scan::sink::JsonLinesSink;
use slp_scan::{ScanConfig, ScanSummary, Scanner};

/// slp-scan — probe a list of hosts for game servers and record their Server List Ping status.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "slp-scan",
    version,
    about = "Probe a list of hosts for game servers and record their Server List Ping status.",
    long_about = None
)]
struct Cli {
    /// File with one host per line (`host`, `host:port` or `[v6]:port`).
    hosts: PathBuf,

    /// File that successful results are appended to, one JSON object per line.
    output: PathBuf,

    /// Port for hosts that do not name one.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Bound on each connect, send and read wait, in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 30_000)]
    timeout_ms: u64,

    /// Max concurrent probes.
    #[arg(long, default_value_t = 20)]
    concurrency: usize,

    /// Also write each server's favicon to `<dir>/<n>.png`.
    #[arg(long, value_name = "DIR")]
    favicons: Option<PathBuf>,

    /// Log more (-v info, -vv debug, -vvv trace). Hides the progress bar.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    println!("slp-scan configuration:");
    println!("  hosts        : {}", cli.hosts.display());
    println!("  output       : {}", cli.output.display());
    println!("  port         : {}", cli.port);
    println!("  timeout_ms   : {}", cli.timeout_ms);
    println!("  concurrency  : {}", cli.concurrency);
    println!(
        "  favicons     : {}",
        cli.favicons
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );

    let config = ScanConfig {
        port: cli.port,
        timeout: Duration::from_millis(cli.timeout_ms),
        concurrency: cli.concurrency,
    };

    let targets = hosts::load_hosts_from_path(&cli.hosts, config.port)?;
    if targets.is_empty() {
        bail!("no hosts found in {}", cli.hosts.display());
    }
    println!("Loaded {} hosts", targets.len());

    // Ctrl-C stops dispatching new hosts; probes already running finish.
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_ctrlc.cancel();
    });

    let scanner = Scanner::new(config).with_cancel(cancel);
    let mut sink = JsonLinesSink::open(&cli.output)?;
    let mut favicons = cli.favicons.as_deref().map(FaviconExporter::new).transpose()?;

    let verbose = cli.verbose > 0;
    let bar = progress_bar(targets.len() as u64, verbose);
    let summary = scanner
        .run(targets, &mut sink, |result, progress| {
            if let Some(exporter) = favicons.as_mut() {
                if let Err(e) = exporter.export(result) {
                    warn!(error = %format!("{e:#}"), "failed to export favicon");
                }
            }
            if verbose {
                info!(
                    "{:.1}% done ({} of {}), {} found",
                    progress.percent(),
                    progress.completed,
                    progress.total,
                    progress.succeeded
                );
            }
            bar.set_position(progress.completed);
            bar.set_message(format!("{} found", progress.succeeded));
        })
        .await?;
    bar.finish_and_clear();

    print_summary(&summary);
    println!("Wrote {} results to {}", sink.written(), sink.path().display());
    if let (Some(exporter), Some(dir)) = (&favicons, &cli.favicons) {
        println!("Wrote {} favicons to {}", exporter.written(), dir.display());
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("slp_scan={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn progress_bar(total: u64, hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total);
    let style = ProgressStyle::with_template("Scanning {bar:40} {pos}/{len} ({percent}%) {msg} [{elapsed_precise}]")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar
}

fn print_summary(summary: &ScanSummary) {
    println!(
        "\nScanned {} of {} hosts: {} servers found, {} failed ({:.1}s)",
        summary.scanned_done,
        summary.scanned_total,
        summary.found_count,
        summary.failed_count,
        summary.elapsed_ms as f64 / 1000.0
    );
    if summary.scanned_done < summary.scanned_total {
        println!("Scan was interrupted before every host was probed.");
    }
}
