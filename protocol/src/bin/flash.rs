use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::{path::PathBuf, time::Duration};
use tagcheck::{
    DeviceAddress, Orchestrator,
    ble::BleTransport,
    config::{Timings, UpgradeMode, UploadSettings},
    external::CommandUploadTransport,
    prefs::{JsonStore, PreferenceStore},
    session,
    upload::FileImage,
};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Firmware image to upload
    image: PathBuf,

    /// Tag address (e.g. `AA:BB:CC:DD:EE:FF`), defaults to the stored target
    #[arg(short, long)]
    address: Option<DeviceAddress>,

    /// Unlock password, defaults to the stored password
    #[arg(long)]
    password: Option<String>,

    /// Preferences file, defaults to the platform configuration directory
    #[arg(short, long)]
    prefs: Option<PathBuf>,

    /// Upgrade mode (`confirm-only`, `test-and-confirm` or `test-only`)
    #[arg(short, long, default_value = "confirm-only")]
    mode: UpgradeMode,

    /// Preferred MTU
    #[arg(long, default_value_t = 247)]
    mtu: u16,

    /// Session deadline in seconds
    #[arg(short, long, default_value_t = 150)]
    deadline: u64,

    /// Upload program, defaults to `mcumgr` over BLE
    #[arg(long)]
    program: Option<String>,

    /// Upload program arguments, supports the placeholders
    /// `{address}`, `{image}`, `{mtu}`, `{mode}` and `{timeout}`
    #[arg(last = true)]
    program_args: Vec<String>,
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
    let password = args.password.unwrap_or(prefs.password);
    let mut upload = match args.program {
        Some(program) => CommandUploadTransport::new(program, args.program_args),
        None => CommandUploadTransport::mcumgr(),
    };
    let mut image = FileImage::new(args.image);
    let settings = UploadSettings {
        mode: args.mode,
        mtu: args.mtu,
        ..UploadSettings::default()
    };
    let transport = BleTransport::open()
        .await
        .context("Failed to open Bluetooth adapter")?;
    let timings = Timings {
        deadline: Duration::from_secs(args.deadline),
        ..Timings::default()
    };
    let mut orchestrator = Orchestrator::new(transport, timings);
    let (handle, cancel) = session::cancellation();

    println!("Place the tag close to this computer, updating {address}");

    let session = orchestrator.update_firmware(
        address,
        &password,
        &mut upload,
        &mut image,
        settings,
        cancel,
    );

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

    if let Some((sent, total)) = report.progress {
        println!("Last progress: {sent}/{total}");
    }

    report.result.context("Firmware update failed")?;

    println!("Firmware updated");

    Ok(())
}
