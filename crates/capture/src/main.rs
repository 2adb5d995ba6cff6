use anyhow::{Context, Result, anyhow};
use capture::{CaptureConfig, SampleWriter, open_output};
use clap::Parser;
use common::{MetricsSnapshot, setup_logging};
use driver::{FlashReport, SamplePacket, Source, flash_unprogrammed, list_devices};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// How long to wait for a full packet before checking for shutdown again
const READY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "gn3s-capture")]
#[command(
    author,
    version,
    about = "GN3S capture - Record complex samples from a GN3S GPS front end"
)]
#[command(long_about = "
Streams samples from a SiGe GN3S sampler over USB and writes them as
interleaved little-endian 16-bit I/Q pairs. An unprogrammed device is
flashed with the configured firmware image first.

EXAMPLES:
    # Capture until Ctrl+C to stdout
    gn3s-capture > samples.bin

    # Capture 1000 packets to a file
    gn3s-capture --packets 1000 --output samples.bin

    # List USB devices
    gn3s-capture --list-devices

    # Only load firmware into an unprogrammed device
    gn3s-capture --flash-only

CONFIGURATION:
    The configuration is looked up in the following order:
    1. Path specified with --config
    2. ~/.config/gn3s/capture.toml
    3. /etc/gn3s/capture.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Flash firmware into an unprogrammed device and exit
    #[arg(long)]
    flash_only: bool,

    /// Number of packets to capture (0 = until interrupted)
    #[arg(short, long, value_name = "N")]
    packets: Option<u64>,

    /// Output file (default: stdout)
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = CaptureConfig::default();
        let path = CaptureConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        CaptureConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        CaptureConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.general.log_level.clone());
    setup_logging(&log_level).context("Failed to setup logging")?;

    info!("gn3s-capture v{}", env!("CARGO_PKG_VERSION"));

    if args.list_devices {
        return list_devices_mode();
    }

    if args.flash_only {
        let report = flash_only_mode(&config)?;
        println!(
            "Flashed {} records ({} bytes), {} skipped, {} failed",
            report.records_uploaded,
            report.bytes_written,
            report.records_skipped,
            report.records_failed
        );
        return Ok(());
    }

    if let Some(packets) = args.packets {
        config.capture.packets = packets;
    }
    if let Some(output) = args.output {
        config.capture.output = Some(output);
    }
    config.validate()?;

    let stop = Arc::new(AtomicBool::new(false));
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping capture");
            signal_stop.store(true, Ordering::Release);
        }
    });

    let result = tokio::task::spawn_blocking(move || run_capture(&config, &stop)).await;

    let snapshot = result.context("Capture task failed")??;
    report_summary(&snapshot);
    Ok(())
}

/// List USB devices and exit
fn list_devices_mode() -> Result<()> {
    let context = rusb::Context::new().context("Failed to initialize libusb")?;
    let devices = list_devices(&context).context("Failed to list devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        let marker = if device.id == protocol::GN3S_ID {
            "  <- GN3S"
        } else if device.id == protocol::FX2_UNPROGRAMMED_ID {
            "  <- GN3S (needs firmware)"
        } else {
            ""
        };
        println!("  {}{}", device, marker);
    }
    Ok(())
}

fn flash_only_mode(config: &CaptureConfig) -> Result<FlashReport> {
    let context = rusb::Context::new().context("Failed to initialize libusb")?;
    let path = config.device.firmware_path();
    flash_unprogrammed(&context, &path, config.device.selection())
        .with_context(|| format!("Failed to flash {}", path.display()))
}

/// Blocking capture loop; returns the final stream metrics
fn run_capture(config: &CaptureConfig, stop: &AtomicBool) -> Result<MetricsSnapshot> {
    let options = config.open_options();
    let samples = config.capture.samples_per_packet;
    let limit = config.capture.packets;

    let mut source = Source::open(&options).context("Failed to open GN3S")?;
    let sink = open_output(config.capture.output.as_deref()).context("Failed to open output")?;
    let mut writer = SampleWriter::new(sink);
    let mut packet = SamplePacket::new(samples);

    source.start().context("Failed to start streaming")?;
    info!(
        "Capturing {} samples per packet{}",
        samples,
        if limit == 0 {
            String::new()
        } else {
            format!(", {} packets", limit)
        }
    );

    while !stop.load(Ordering::Acquire) && (limit == 0 || source.packets() < limit) {
        if !source.wait_ready(samples, READY_TIMEOUT) {
            warn!("No samples received for {:?}", READY_TIMEOUT);
            if source.metrics().slots_retired() as usize >= options.stream.transfers {
                return Err(anyhow!("All transfers have been retired"));
            }
            continue;
        }

        source.read(&mut packet)?;
        writer
            .write_samples(&packet.samples)
            .context("Failed to write samples")?;
    }

    writer.flush().context("Failed to flush output")?;
    let snapshot = source.metrics().snapshot();
    if let Err(e) = source.close() {
        error!("Error closing device: {}", e);
    }
    Ok(snapshot)
}

fn report_summary(snapshot: &MetricsSnapshot) {
    info!(
        "Captured {} packets, {} bytes in {:.1?} ({})",
        snapshot.packets_delivered,
        snapshot.bytes_received,
        snapshot.uptime.unwrap_or_default(),
        snapshot.format_throughput()
    );
    if snapshot.overruns > 0 || snapshot.short_reads > 0 {
        warn!(
            "{} overruns, {} short reads",
            snapshot.overruns, snapshot.short_reads
        );
    }
    if snapshot.transfers_failed > 0 || snapshot.slots_retired > 0 {
        warn!(
            "{} transfers failed, {} resubmitted, {} slots retired",
            snapshot.transfers_failed, snapshot.resubmissions, snapshot.slots_retired
        );
    }
}
