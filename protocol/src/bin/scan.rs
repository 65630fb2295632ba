use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tagcheck::ble;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scan duration in seconds
    #[arg(short, long, default_value_t = 6)]
    duration: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let adapter = ble::default_adapter()
        .await
        .context("Failed to open Bluetooth adapter")?;

    println!("Scanning for {} seconds...", args.duration);

    let mut devices = ble::scan(&adapter, Duration::from_secs(args.duration))
        .await
        .context("Failed to scan")?;

    // Strongest signal first
    devices.sort_by_key(|dev| std::cmp::Reverse(dev.rssi.unwrap_or(i16::MIN)));

    for dev in &devices {
        let rssi = dev
            .rssi
            .map_or_else(|| "?".to_string(), |rssi| rssi.to_string());

        println!(
            "{}  {:>4} dBm  {:<7}  {}",
            dev.address,
            rssi,
            dev.kind,
            dev.name.as_deref().unwrap_or("")
        );
    }

    println!("{} devices found", devices.len());

    Ok(())
}
