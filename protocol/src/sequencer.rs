//! Ordered delivery of a [`CommandPlan`] over a live link.

use crate::{
    attribute::{AttributeId, AttributeTable},
    plan::{CommandPlan, PlanEntry},
};
use log::{debug, warn};

/// Next action decided by [`WriteSequencer::advance`].
#[derive(PartialEq, Eq, Debug)]
pub enum Step<'a> {
    /// Issue this write and wait for its acknowledgment.
    Write(&'a PlanEntry),
    /// The plan is exhausted.
    Done,
}

/// Drains a command plan one write at a time.
///
/// The sequencer owns its plan and consumes it by index. It never issues a
/// write itself: the caller performs the write returned by [`advance`] and
/// calls [`advance`] again only after the write was acknowledged.
///
/// [`advance`]: WriteSequencer::advance
#[derive(Debug)]
pub struct WriteSequencer {
    entries: Vec<PlanEntry>,
    next: usize,
    in_flight: bool,
    written: usize,
    skipped: Vec<AttributeId>,
}

impl WriteSequencer {
    /// Constructs a sequencer for the given plan.
    #[must_use]
    pub fn new(plan: CommandPlan) -> Self {
        Self {
            entries: plan.into_entries(),
            next: 0,
            in_flight: false,
            written: 0,
            skipped: Vec::new(),
        }
    }

    /// Returns the next write to perform against a peer exposing `table`.
    ///
    /// Entries whose attribute is missing on the peer are skipped. Each call
    /// also counts the previously returned write as acknowledged.
    pub fn advance(&mut self, table: &AttributeTable) -> Step<'_> {
        if self.in_flight {
            self.in_flight = false;
            self.written += 1;
        }

        while let Some(entry) = self.entries.get(self.next) {
            self.next += 1;

            if table.contains(entry.attribute) {
                debug!(
                    "Writing {} ({} bytes), step {}/{}",
                    entry.attribute,
                    entry.payload.len(),
                    self.next,
                    self.entries.len()
                );

                self.in_flight = true;

                return Step::Write(entry);
            }

            warn!("Peer does not expose {}, skipping", entry.attribute);

            self.skipped.push(entry.attribute);
        }

        Step::Done
    }

    /// Returns the attribute of the write awaiting acknowledgment.
    #[must_use]
    pub fn pending(&self) -> Option<AttributeId> {
        self.in_flight
            .then(|| self.next.checked_sub(1))
            .flatten()
            .and_then(|idx| self.entries.get(idx))
            .map(|entry| entry.attribute)
    }

    /// Returns the number of acknowledged writes.
    #[must_use]
    pub fn written(&self) -> usize {
        self.written
    }

    /// Returns the attributes skipped because the peer lacks them.
    #[must_use]
    pub fn skipped(&self) -> &[AttributeId] {
        &self.skipped
    }

    /// Returns the number of entries not yet handed out.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.entries.len() - self.next
    }
}
