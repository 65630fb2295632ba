use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::{path::PathBuf, time::Duration};
use tagcheck::{
    Completion, DeviceAddress, Orchestrator,
    ble::BleTransport,
    config::{ConfigurationSnapshot, Timings},
    prefs::{JsonStore, PreferenceStore},
    session,
};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tag address (e.g. `AA:BB:CC:DD:EE:FF`), defaults to the stored target
    #[arg(short, long)]
    address: Option<DeviceAddress>,

    /// Preferences file, defaults to the platform configuration directory
    #[arg(short, long)]
    prefs: Option<PathBuf>,

    /// Session deadline in seconds
    #[arg(short, long, default_value_t = 150)]
    deadline: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let store = match args.prefs {
        Some(path) => JsonStore::new(path),
        None => JsonStore::open_default().context("Failed to locate preferences")?,
    };
    let prefs = store.load().context("Failed to load preferences")?;
    let address = match args.address {
        Some(addr) => addr,
        None => prefs
            .target_mac
            .parse()
            .context("No valid target address stored, pass --address")?,
    };
    let snapshot = ConfigurationSnapshot::capture(&prefs).await;
    let transport = BleTransport::open()
        .await
        .context("Failed to open Bluetooth adapter")?;
    let timings = Timings {
        deadline: Duration::from_secs(args.deadline),
        ..Timings::default()
    };
    let mut orchestrator = Orchestrator::new(transport, timings);
    let (handle, cancel) = session::cancellation();

    println!("Place the tag close to this computer, connecting to {address}");

    let session = orchestrator.configure(address, snapshot, cancel);

    tokio::pin!(session);

    let report = tokio::select! {
        report = &mut session => report,
        res = signal::ctrl_c() => {
            res.context("Failed to listen for Ctrl-C")?;
            info!("Cancelling session");
            handle.cancel();
            session.await
        }
    };

    print!("{}", report.journal);

    match report.result.context("Configuration failed")? {
        Completion::Configured { written, skipped } => {
            println!("Configuration complete: {written} attributes written, {skipped} skipped");
        }
        Completion::FirmwareUpdated => println!("Firmware updated"),
    }

    Ok(())
}
