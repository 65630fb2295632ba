//! Session configuration.
//!
//! [`Preferences`] is the durable, user-edited form persisted by a
//! [`PreferenceStore`](crate::prefs::PreferenceStore). At session start it is
//! captured into an immutable [`ConfigurationSnapshot`], which is the sole
//! input of the [plan builder](crate::plan).

use log::warn;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// A configurable value paired with its "apply this field" flag.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Default, Debug)]
pub struct Setting<T> {
    /// Stored value.
    pub value: T,
    /// Whether the value should be written during the next session.
    #[serde(default)]
    pub apply: bool,
}

impl<T> Setting<T> {
    /// Constructs a setting that is not applied.
    pub const fn new(value: T) -> Self {
        Self {
            value,
            apply: false,
        }
    }

    /// Constructs a setting that is applied.
    pub const fn applied(value: T) -> Self {
        Self { value, apply: true }
    }
}

/// Durable user preferences.
///
/// Missing keys fall back to the defaults below when deserializing.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[serde(default)]
pub struct Preferences {
    /// Address of the tag to connect to, in `AA:BB:CC:DD:EE:FF` form.
    pub target_mac: String,
    /// Password unlocking the tag.
    pub password: String,
    /// Transmit power level.
    pub tx_power: Setting<i32>,
    /// Apple Find My broadcasts.
    pub broadcast_airtag: Setting<bool>,
    /// Google FMDN broadcasts.
    pub broadcast_fmdn: Setting<bool>,
    /// Path of the selected keyfile, if any.
    pub keyfile: Setting<Option<PathBuf>>,
    /// Status byte behavior, as flexible hex/decimal text.
    pub status: Setting<String>,
    /// Key rotation interval in seconds.
    pub key_interval: Setting<i32>,
    /// Accelerometer threshold.
    pub accel_threshold: Setting<i32>,
    /// Broadcast period multiplier.
    pub broadcast_period: Setting<i32>,
    /// FMDN key as hex text.
    pub fmdn_key: Setting<String>,
    /// Settings-mode MAC address as text.
    pub config_mac: Setting<String>,
    /// Replacement password.
    pub new_password: Setting<String>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            target_mac: String::new(),
            password: String::new(),
            tx_power: Setting::new(1),
            broadcast_airtag: Setting::new(false),
            broadcast_fmdn: Setting::new(false),
            keyfile: Setting::new(None),
            status: Setting::new("458000".to_string()),
            key_interval: Setting::new(600),
            accel_threshold: Setting::new(800),
            broadcast_period: Setting::new(0),
            fmdn_key: Setting::new(String::new()),
            config_mac: Setting::new(String::new()),
            new_password: Setting::new(String::new()),
        }
    }
}

/// Contents of the keyfile selection at the time the snapshot was taken.
#[derive(PartialEq, Eq, Clone, Default, Debug)]
pub enum Keyfile {
    /// No file selected.
    #[default]
    NotSelected,
    /// File contents.
    Loaded(Vec<u8>),
    /// The selected file could not be read.
    Unreadable(String),
}

/// Immutable configuration captured once per session.
#[derive(PartialEq, Eq, Clone, Default, Debug)]
pub struct ConfigurationSnapshot {
    /// Password unlocking the tag.
    pub password: String,
    /// Transmit power level.
    pub tx_power: Setting<i32>,
    /// Apple Find My broadcasts.
    pub broadcast_airtag: Setting<bool>,
    /// Google FMDN broadcasts.
    pub broadcast_fmdn: Setting<bool>,
    /// Keyfile contents.
    pub keyfile: Setting<Keyfile>,
    /// Status byte behavior.
    pub status: Setting<String>,
    /// Key rotation interval in seconds.
    pub key_interval: Setting<i32>,
    /// Accelerometer threshold.
    pub accel_threshold: Setting<i32>,
    /// Broadcast period multiplier.
    pub broadcast_period: Setting<i32>,
    /// FMDN key as hex text.
    pub fmdn_key: Setting<String>,
    /// Settings-mode MAC address as text.
    pub config_mac: Setting<String>,
    /// Replacement password.
    pub new_password: Setting<String>,
}

impl ConfigurationSnapshot {
    /// Captures a snapshot from preferences.
    ///
    /// The keyfile is read from disk only if its update is requested.
    pub async fn capture(prefs: &Preferences) -> Self {
        let keyfile = match (&prefs.keyfile.value, prefs.keyfile.apply) {
            (Some(path), true) => match tokio::fs::read(path).await {
                Ok(data) => Keyfile::Loaded(data),
                Err(err) => {
                    warn!("Failed to read keyfile {}: {err}", path.display());

                    Keyfile::Unreadable(err.to_string())
                }
            },
            _ => Keyfile::NotSelected,
        };

        Self {
            password: prefs.password.clone(),
            tx_power: prefs.tx_power.clone(),
            broadcast_airtag: prefs.broadcast_airtag.clone(),
            broadcast_fmdn: prefs.broadcast_fmdn.clone(),
            keyfile: Setting {
                value: keyfile,
                apply: prefs.keyfile.apply,
            },
            status: prefs.status.clone(),
            key_interval: prefs.key_interval.clone(),
            accel_threshold: prefs.accel_threshold.clone(),
            broadcast_period: prefs.broadcast_period.clone(),
            fmdn_key: prefs.fmdn_key.clone(),
            config_mac: prefs.config_mac.clone(),
            new_password: prefs.new_password.clone(),
        }
    }

    /// Constructs a snapshot carrying only a password, with nothing to apply.
    #[must_use]
    pub fn with_password(password: &str) -> Self {
        Self {
            password: password.to_string(),
            ..Self::default()
        }
    }
}

/// Timing parameters of the link state machine.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct Timings {
    /// Overall session deadline, measured from session start.
    pub deadline: Duration,
    /// Fixed delay before every retry.
    pub backoff: Duration,
    /// How long a scan may run without finding the peer.
    pub scan_timeout: Duration,
    /// Delay between stopping the scan and connecting.
    pub connect_settle: Duration,
    /// Upper bound for a connect request.
    pub connect_timeout: Duration,
    /// Upper bound for discovery and single writes.
    pub operation_timeout: Duration,
    /// Delay after unlocking before scanning for the upload.
    pub unlock_settle: Duration,
    /// Delay between seeing the peer and starting the upload.
    pub upload_settle: Duration,
    /// Window in which the upload must report any activity.
    pub upload_watchdog: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(150),
            backoff: Duration::from_millis(1200),
            scan_timeout: Duration::from_secs(6),
            connect_settle: Duration::from_millis(400),
            connect_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(10),
            unlock_settle: Duration::from_millis(2500),
            upload_settle: Duration::from_millis(1500),
            upload_watchdog: Duration::from_secs(25),
        }
    }
}

/// Firmware upgrade mode requested from the upload transport.
#[derive(strum::Display, strum::EnumString, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "kebab-case")]
pub enum UpgradeMode {
    /// Upload, then confirm the image without a test boot.
    ConfirmOnly,
    /// Upload, mark for test boot, then confirm.
    TestAndConfirm,
    /// Upload and mark for test boot only.
    TestOnly,
}

/// Settings passed to the upload transport.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct UploadSettings {
    /// Upgrade mode.
    pub mode: UpgradeMode,
    /// Connection timeout of the upload transport.
    pub connection_timeout: Duration,
    /// Per-operation timeout of the upload transport.
    pub operation_timeout: Duration,
    /// Preferred MTU.
    pub mtu: u16,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            mode: UpgradeMode::ConfirmOnly,
            connection_timeout: Duration::from_secs(15),
            operation_timeout: Duration::from_secs(30),
            mtu: 247,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preference_defaults() {
        let prefs: Preferences = serde_json::from_str("{}").expect("empty object should parse");

        assert_eq!(prefs, Preferences::default(), "missing keys should use defaults");
        assert_eq!(prefs.status.value, "458000", "status default");
        assert!(!prefs.broadcast_fmdn.apply, "apply flags should default off");
    }

    #[test]
    fn partial_setting() {
        let prefs: Preferences =
            serde_json::from_str(r#"{"tx_power": {"value": 2}}"#).expect("should parse");

        assert_eq!(prefs.tx_power, Setting::new(2), "missing apply flag should be off");
    }

    #[test]
    fn upgrade_mode_names() {
        assert_eq!(UpgradeMode::TestAndConfirm.to_string(), "test-and-confirm", "display");
        assert_eq!(
            "confirm-only".parse::<UpgradeMode>(),
            Ok(UpgradeMode::ConfirmOnly),
            "mode should parse"
        );
    }

    #[tokio::test]
    async fn capture_skips_unrequested_keyfile() {
        let prefs = Preferences {
            keyfile: Setting::new(Some(PathBuf::from("/nonexistent/keyfile"))),
            ..Preferences::default()
        };
        let snapshot = ConfigurationSnapshot::capture(&prefs).await;

        assert_eq!(
            snapshot.keyfile.value,
            Keyfile::NotSelected,
            "keyfile should not be read"
        );
    }

    #[tokio::test]
    async fn capture_reports_unreadable_keyfile() {
        let prefs = Preferences {
            keyfile: Setting::applied(Some(PathBuf::from("/nonexistent/keyfile"))),
            ..Preferences::default()
        };
        let snapshot = ConfigurationSnapshot::capture(&prefs).await;

        assert!(
            matches!(snapshot.keyfile.value, Keyfile::Unreadable(_)),
            "keyfile should be unreadable"
        );
        assert!(snapshot.keyfile.apply, "apply flag should be kept");
    }
}
