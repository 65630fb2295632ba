//! Chronological session diagnostics.

use core::fmt::{Display, Formatter};
use log::Level;
use std::time::Duration;

/// A single journal record.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Entry {
    /// Offset from the session start.
    pub at: Duration,
    /// Severity.
    pub level: Level,
    /// Human-readable message.
    pub message: String,
}

impl Display for Entry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "[{:>4}.{:03}] {:<5} {}",
            self.at.as_secs(),
            self.at.subsec_millis(),
            self.level,
            self.message
        )
    }
}

/// Append-only log of every state transition and decision of a session.
///
/// Each record is also forwarded to the [`log`] facade.
#[derive(PartialEq, Eq, Clone, Default, Debug)]
pub struct Journal {
    entries: Vec<Entry>,
}

impl Journal {
    /// Constructs an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record.
    pub fn record(&mut self, at: Duration, level: Level, message: impl Into<String>) {
        let message = message.into();

        log::log!(level, "{message}");

        self.entries.push(Entry { at, level, message });
    }

    /// Returns all records in order.
    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Returns whether any record contains `needle`.
    #[must_use]
    pub fn mentions(&self, needle: &str) -> bool {
        self.entries.iter().any(|e| e.message.contains(needle))
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the journal is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Display for Journal {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{entry}")?;
        }

        Ok(())
    }
}
