//! Durable preference storage.

use crate::config::Preferences;
use core::fmt::{Display, Formatter};
use log::debug;
use std::{fs, io, path::PathBuf};

/// Error type for [`PreferenceStore`] operations.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// No configuration directory is available on this platform.
    NoConfigDir,
    /// Reading or writing the backing file failed.
    Io(io::Error),
    /// The backing file contains malformed data.
    Format(serde_json::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoConfigDir => write!(f, "no configuration directory available"),
            Self::Io(err) => write!(f, "input/output error: {err}"),
            Self::Format(err) => write!(f, "malformed preferences: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NoConfigDir => None,
            Self::Io(err) => Some(err),
            Self::Format(err) => Some(err),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Format(err)
    }
}

/// Synchronous, last-write-wins preference storage.
pub trait PreferenceStore {
    /// Loads the stored preferences, or defaults if nothing was stored yet.
    fn load(&self) -> Result<Preferences, Error>;

    /// Replaces the stored preferences.
    fn store(&mut self, prefs: &Preferences) -> Result<(), Error>;
}

/// Preferences persisted as a JSON file.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Constructs a store backed by the given file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Constructs a store at the platform's default location,
    /// e.g. `~/.config/tagcheck/settings.json` on Linux.
    pub fn open_default() -> Result<Self, Error> {
        let dir = dirs::config_dir().ok_or(Error::NoConfigDir)?;

        Ok(Self::new(dir.join("tagcheck").join("settings.json")))
    }

    /// Returns the path of the backing file.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl PreferenceStore for JsonStore {
    fn load(&self) -> Result<Preferences, Error> {
        match fs::read_to_string(&self.path) {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("No preferences at {}, using defaults", self.path.display());

                Ok(Preferences::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn store(&mut self, prefs: &Preferences) -> Result<(), Error> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        // Replace atomically via a sibling file
        let tmp = self.path.with_extension("json.tmp");

        fs::write(&tmp, serde_json::to_string_pretty(prefs)?)?;
        fs::rename(&tmp, &self.path)?;

        debug!("Stored preferences at {}", self.path.display());

        Ok(())
    }
}

/// Preferences kept in memory only.
#[derive(Default, Debug)]
pub struct MemoryStore(Preferences);

impl MemoryStore {
    /// Constructs a store holding the given preferences.
    #[must_use]
    pub fn new(prefs: Preferences) -> Self {
        Self(prefs)
    }
}

impl PreferenceStore for MemoryStore {
    fn load(&self) -> Result<Preferences, Error> {
        Ok(self.0.clone())
    }

    fn store(&mut self, prefs: &Preferences) -> Result<(), Error> {
        self.0 = prefs.clone();

        Ok(())
    }
}
