use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tagcheck::{
    DeviceAddress,
    codec::{self, format_mac},
    config::Preferences,
    prefs::{JsonStore, PreferenceStore},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Preferences file, defaults to the platform configuration directory
    #[arg(short, long)]
    prefs: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print the stored preferences
    Show,
    /// Store a field value
    Set { field: Field, value: String },
    /// Enable or disable writing a field during the next session
    Apply {
        field: Field,
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },
    /// Select a keyfile and request its update
    Keyfile { path: PathBuf },
    /// Print the path of the preferences file
    Path,
}

#[derive(ValueEnum, PartialEq, Eq, Copy, Clone, Debug)]
enum Field {
    TargetMac,
    Password,
    TxPower,
    BroadcastAirtag,
    BroadcastFmdn,
    Keyfile,
    Status,
    KeyInterval,
    AccelThreshold,
    BroadcastPeriod,
    FmdnKey,
    ConfigMac,
    NewPassword,
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "1" | "on" | "true" => Ok(true),
        "0" | "off" | "false" => Ok(false),
        _ => bail!("Expected on/off, got {value:?}"),
    }
}

fn set(prefs: &mut Preferences, field: Field, value: &str) -> Result<()> {
    match field {
        Field::TargetMac => {
            let mac = format_mac(value);

            mac.parse::<DeviceAddress>().context("Invalid MAC address")?;
            prefs.target_mac = mac;
        }
        Field::ConfigMac => {
            let mac = format_mac(value);

            codec::encode_mac_bytes(&mac).context("Invalid MAC address")?;
            prefs.config_mac.value = mac;
        }
        Field::Password => {
            codec::encode_password(value).context("Invalid password")?;
            prefs.password = value.to_string();
        }
        Field::NewPassword => {
            codec::encode_password(value).context("Invalid password")?;
            prefs.new_password.value = value.to_string();
        }
        Field::TxPower => prefs.tx_power.value = value.parse().context("Invalid number")?,
        Field::KeyInterval => prefs.key_interval.value = value.parse().context("Invalid number")?,
        Field::AccelThreshold => {
            prefs.accel_threshold.value = value.parse().context("Invalid number")?;
        }
        Field::BroadcastPeriod => {
            prefs.broadcast_period.value = value.parse().context("Invalid number")?;
        }
        Field::BroadcastAirtag => prefs.broadcast_airtag.value = parse_bool(value)?,
        Field::BroadcastFmdn => prefs.broadcast_fmdn.value = parse_bool(value)?,
        Field::Status => prefs.status.value = value.trim().to_string(),
        Field::FmdnKey => {
            codec::decode_hex(value).context("Invalid hex key")?;
            prefs.fmdn_key.value = value.trim().to_string();
        }
        Field::Keyfile => bail!("Use the keyfile subcommand to select a keyfile"),
    }

    Ok(())
}

fn apply_flag(prefs: &mut Preferences, field: Field) -> Option<&mut bool> {
    Some(match field {
        Field::TargetMac | Field::Password => return None,
        Field::TxPower => &mut prefs.tx_power.apply,
        Field::BroadcastAirtag => &mut prefs.broadcast_airtag.apply,
        Field::BroadcastFmdn => &mut prefs.broadcast_fmdn.apply,
        Field::Keyfile => &mut prefs.keyfile.apply,
        Field::Status => &mut prefs.status.apply,
        Field::KeyInterval => &mut prefs.key_interval.apply,
        Field::AccelThreshold => &mut prefs.accel_threshold.apply,
        Field::BroadcastPeriod => &mut prefs.broadcast_period.apply,
        Field::FmdnKey => &mut prefs.fmdn_key.apply,
        Field::ConfigMac => &mut prefs.config_mac.apply,
        Field::NewPassword => &mut prefs.new_password.apply,
    })
}

fn show(prefs: &Preferences) {
    let flag = |apply: bool| if apply { "[x]" } else { "[ ]" };

    println!("    target-mac        {}", prefs.target_mac);
    println!("    password          {}", "*".repeat(prefs.password.len()));

    let rows = [
        ("tx-power", prefs.tx_power.apply, prefs.tx_power.value.to_string()),
        (
            "broadcast-airtag",
            prefs.broadcast_airtag.apply,
            prefs.broadcast_airtag.value.to_string(),
        ),
        (
            "broadcast-fmdn",
            prefs.broadcast_fmdn.apply,
            prefs.broadcast_fmdn.value.to_string(),
        ),
        (
            "keyfile",
            prefs.keyfile.apply,
            prefs
                .keyfile
                .value
                .as_ref()
                .map_or_else(String::new, |path| path.display().to_string()),
        ),
        ("status", prefs.status.apply, prefs.status.value.clone()),
        (
            "key-interval",
            prefs.key_interval.apply,
            prefs.key_interval.value.to_string(),
        ),
        (
            "accel-threshold",
            prefs.accel_threshold.apply,
            prefs.accel_threshold.value.to_string(),
        ),
        (
            "broadcast-period",
            prefs.broadcast_period.apply,
            prefs.broadcast_period.value.to_string(),
        ),
        ("fmdn-key", prefs.fmdn_key.apply, prefs.fmdn_key.value.clone()),
        ("config-mac", prefs.config_mac.apply, prefs.config_mac.value.clone()),
        (
            "new-password",
            prefs.new_password.apply,
            "*".repeat(prefs.new_password.value.len()),
        ),
    ];

    for (name, apply, value) in rows {
        println!("{} {name:<17} {value}", flag(apply));
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let mut store = match args.prefs {
        Some(path) => JsonStore::new(path),
        None => JsonStore::open_default().context("Failed to locate preferences")?,
    };
    let mut prefs = store.load().context("Failed to load preferences")?;

    match args.command.unwrap_or(Cmd::Show) {
        Cmd::Show => {
            show(&prefs);

            return Ok(());
        }
        Cmd::Path => {
            println!("{}", store.path().display());

            return Ok(());
        }
        Cmd::Set { field, value } => set(&mut prefs, field, &value)?,
        Cmd::Apply { field, enabled } => {
            if enabled && field == Field::Keyfile && prefs.keyfile.value.is_none() {
                bail!("No keyfile selected");
            }

            *apply_flag(&mut prefs, field).context("Field is always written")? = enabled;
        }
        Cmd::Keyfile { path } => {
            let len = std::fs::metadata(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?
                .len();
            let records = usize::try_from(len)
                .map_err(|_| codec::Error::InvalidKeyfileSize(usize::MAX))
                .and_then(codec::validate_keyfile_len)
                .context("Keyfile must be 28 * n + 1 bytes long with n in 1..=39")?;

            println!("Keyfile holds {records} keys");

            prefs.keyfile.value = Some(path);
            prefs.keyfile.apply = true;
        }
    }

    store.store(&prefs).context("Failed to store preferences")?;
    show(&prefs);

    Ok(())
}
