use anyhow::{Context, Result};
use clap::Parser;
use confique::Config;
use crossbeam_channel::unbounded;
use log::{info, LevelFilter};
use scopeio::{Acquisition, Conf, DeviceContext, LogSession, UdpTransport};
use simplelog::{ColorChoice, Config as LogConfig, TermLogger, TerminalMode};
use std::{io::BufRead, thread, time::Duration};

#[derive(Parser)]
#[command(about = "Stream waveform samples from a ScopeIO instrument")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "scopeio.toml")]
    config: String,
    /// Override the instrument address from the config file
    #[arg(short, long)]
    addr: Option<String>,
    /// Log debug output (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(
        level,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;

    let mut conf = Conf::builder()
        .file(&args.config)
        .load()
        .with_context(|| format!("loading {}", args.config))?;
    if let Some(addr) = args.addr {
        conf.device_settings.addr = addr;
    }

    let device = DeviceContext::scan(&conf)?;
    info!(
        "ScopeIO device at {}: {} analog channels, {} Hz",
        conf.device_settings.addr, device.num_analog_channels, device.cur_samplerate
    );

    let transport = UdpTransport::open(
        &conf.device_settings.addr,
        Duration::from_millis(conf.device_settings.fetch_timeout_ms),
    )
    .context("opening instrument socket")?;

    let mut acq = Acquisition::new(device, LogSession::default(), transport);

    // Enter 'q' to stop an unbounded acquisition.
    let (tx_stop, rx_stop) = unbounded();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines().map_while(|l| l.ok()) {
            if line.trim() == "q" {
                let _ = tx_stop.send(());
                break;
            }
        }
    });

    info!("acquisition running; enter 'q' to stop");
    acq.run(
        Duration::from_millis(conf.run_settings.tick_interval_ms),
        rx_stop,
    )?;

    info!(
        "done: {} passes, {} samples, {:.2} MB/s average",
        acq.stats().n_passes,
        acq.stats().total_samples,
        acq.stats().average_rate()
    );
    Ok(())
}
