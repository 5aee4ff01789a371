use std::process::exit;

use anyhow::{Context, Result};
use clap::Parser;

use ppk_stream::logging;
use ppk_stream::{DecoderConfig, DecoderEvent, PpkDevice, Sample, SampleSink};

#[derive(Parser, Debug)]
#[command(name = "ppk-stream", about = "Stream current samples from a power profiler")]
struct Args {
    /// Serial port of the instrument (e.g., /dev/ttyACM0)
    port: String,
    /// Stop after this many samples (100k samples = 1 s)
    #[arg(long, default_value_t = 100_000)]
    samples: u64,
    /// Regulator output in millivolts
    #[arg(long)]
    vdd: Option<u16>,
    /// Run in source-meter mode instead of ampere-meter mode
    #[arg(long)]
    source_meter: bool,
}

/// Running summary; keeps no per-sample data.
#[derive(Default)]
struct Summary {
    samples: u64,
    placeholders: u64,
    sum_ua: f64,
    max_ua: Option<f64>,
    data_loss_reported: bool,
    link_closed: Option<String>,
}

impl SampleSink for Summary {
    fn on_sample(&mut self, sample: Sample) {
        self.samples += 1;
        match sample.current_ua {
            Some(ua) => {
                self.sum_ua += ua;
                self.max_ua = Some(self.max_ua.map_or(ua, |m| m.max(ua)));
            }
            None => self.placeholders += 1,
        }
    }

    fn on_event(&mut self, event: DecoderEvent) {
        match event {
            DecoderEvent::Metadata(meta) => println!("Metadata: {} keys", meta.len()),
            DecoderEvent::DataLoss { lost_samples } => {
                self.data_loss_reported = true;
                eprintln!("Warning: data loss, {lost_samples} samples missing");
            }
            DecoderEvent::LinkClosed(reason) => self.link_closed = Some(reason),
        }
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    logging::init_rust_logging();
    let args = Args::parse();

    println!("--- Connecting to {} ---", args.port);
    let mut device = PpkDevice::connect_serial(&args.port, DecoderConfig::default())
        .with_context(|| format!("Failed to open serial port at {}", args.port))?;
    let mut summary = Summary::default();

    let metadata = device
        .start(&mut summary)
        .context("Failed to read instrument metadata")?;
    if let Some(hw) = metadata.hardware() {
        println!("Hardware: {hw}");
    }

    device
        .set_power_mode(args.source_meter)
        .context("Failed to set power mode")?;
    if let Some(vdd) = args.vdd {
        device
            .update_regulator(vdd)
            .with_context(|| format!("Failed to set VDD to {vdd} mV"))?;
    }
    println!("VDD: {} mV", device.decoder().vdd_mv());

    println!("Sampling {} samples...", args.samples);
    device.average_start().context("Failed to start sampling")?;
    while summary.samples < args.samples {
        if let Err(e) = device.pump(&mut summary) {
            eprintln!("Read error: {e}");
            break;
        }
    }
    if summary.link_closed.is_none() {
        device.average_stop().context("Failed to stop sampling")?;
    }
    device.stop();

    let real = summary.samples - summary.placeholders;
    let mean = if real > 0 {
        summary.sum_ua / real as f64
    } else {
        0.0
    };
    println!("Samples: {} ({} lost)", summary.samples, summary.placeholders);
    println!("Mean: {:.3} uA, max: {:.3} uA", mean, summary.max_ua.unwrap_or(0.0));
    println!("Loss counter: {}", device.decoder().loss_count());
    if summary.data_loss_reported {
        println!("Data loss exceeded the reporting threshold");
    }
    if let Some(reason) = summary.link_closed {
        anyhow::bail!("link closed: {reason}");
    }
    println!("Done.");
    Ok(())
}
