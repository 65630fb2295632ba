//! Command plan construction.
//!
//! A [`CommandPlan`] is the ordered list of attribute writes derived from a
//! [`ConfigurationSnapshot`]. The password is always written first since it
//! unlocks the device. The remaining fields follow in a fixed order and
//! only if their apply flag is set.
//!
//! Building a plan performs no I/O.

use crate::{
    attribute::AttributeId,
    codec::{self, chunk_keyfile, decode_hex, encode_i32_le, encode_mac_bytes, encode_password},
    config::{ConfigurationSnapshot, Keyfile, Setting},
};
use core::fmt::{Display, Formatter};
use log::{debug, warn};

/// A single attribute write.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct PlanEntry {
    /// Attribute to write.
    pub attribute: AttributeId,
    /// Raw payload.
    pub payload: Vec<u8>,
}

/// Reason an optional field was left out of the plan.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum SkipReason {
    /// The value failed validation.
    Invalid(codec::Error),
    /// The keyfile update was requested without a file.
    NoFileSelected,
    /// The selected keyfile could not be read.
    Unreadable(String),
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Invalid(err) => write!(f, "{err}"),
            Self::NoFileSelected => write!(f, "no file selected"),
            Self::Unreadable(msg) => write!(f, "unreadable file: {msg}"),
        }
    }
}

/// An optional field that was requested but left out of the plan.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct SkippedField {
    /// Attribute the field would have been written to.
    pub attribute: AttributeId,
    /// Why it was skipped.
    pub reason: SkipReason,
}

/// Ordered sequence of attribute writes for one session attempt.
#[derive(PartialEq, Eq, Clone, Default, Debug)]
pub struct CommandPlan {
    entries: Vec<PlanEntry>,
    skipped: Vec<SkippedField>,
}

impl CommandPlan {
    /// Builds the plan for a configuration session.
    ///
    /// # Errors
    ///
    /// Returns the password validation error if the snapshot's password is
    /// not exactly 8 printable ASCII characters. No plan is produced in that
    /// case, regardless of the other fields.
    pub fn build(snapshot: &ConfigurationSnapshot) -> Result<Self, codec::Error> {
        let mut plan = Self::unlock(&snapshot.password)?;

        plan.push_with(AttributeId::TxPower, &snapshot.tx_power, |&v| {
            Ok(encode_i32_le(v).to_vec())
        });
        plan.push_with(AttributeId::BroadcastAirtag, &snapshot.broadcast_airtag, |&v| {
            Ok(encode_i32_le(v.into()).to_vec())
        });
        plan.push_with(AttributeId::BroadcastFmdn, &snapshot.broadcast_fmdn, |&v| {
            Ok(encode_i32_le(v.into()).to_vec())
        });
        plan.push_keyfile(&snapshot.keyfile);
        plan.push_with(AttributeId::Status, &snapshot.status, |v| {
            Ok(encode_i32_le(codec::parse_flexible_int(v)).to_vec())
        });
        plan.push_with(AttributeId::KeyInterval, &snapshot.key_interval, |&v| {
            Ok(encode_i32_le(v).to_vec())
        });
        plan.push_with(AttributeId::AccelThreshold, &snapshot.accel_threshold, |&v| {
            Ok(encode_i32_le(v).to_vec())
        });
        plan.push_with(AttributeId::BroadcastPeriod, &snapshot.broadcast_period, |&v| {
            Ok(encode_i32_le(v).to_vec())
        });
        plan.push_with(AttributeId::FmdnKey, &snapshot.fmdn_key, |v| decode_hex(v.trim()));
        plan.push_with(AttributeId::ConfigMac, &snapshot.config_mac, |v| {
            encode_mac_bytes(v).map(|mac| mac.to_vec())
        });
        plan.push_with(AttributeId::NewPassword, &snapshot.new_password, |v| {
            encode_password(v).map(|pw| pw.to_vec())
        });

        debug!(
            "Built plan with {} writes, {} fields skipped",
            plan.entries.len(),
            plan.skipped.len()
        );

        Ok(plan)
    }

    /// Builds a plan that only writes the password.
    ///
    /// Used to unlock the device before a firmware upload.
    ///
    /// # Errors
    ///
    /// Returns the password validation error.
    pub fn unlock(password: &str) -> Result<Self, codec::Error> {
        let password = encode_password(password)?;

        Ok(Self {
            entries: vec![PlanEntry {
                attribute: AttributeId::Password,
                payload: password.to_vec(),
            }],
            skipped: Vec::new(),
        })
    }

    /// Returns the planned writes in order.
    #[must_use]
    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    /// Returns the requested fields that were left out.
    #[must_use]
    pub fn skipped(&self) -> &[SkippedField] {
        &self.skipped
    }

    /// Returns the number of planned writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether no writes are planned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consumes the plan, returning its writes.
    #[must_use]
    pub fn into_entries(self) -> Vec<PlanEntry> {
        self.entries
    }

    fn push_with<T>(
        &mut self,
        attribute: AttributeId,
        setting: &Setting<T>,
        encode: impl FnOnce(&T) -> Result<Vec<u8>, codec::Error>,
    ) {
        if !setting.apply {
            return;
        }

        match encode(&setting.value) {
            Ok(payload) => self.entries.push(PlanEntry { attribute, payload }),
            Err(err) => self.skip(attribute, SkipReason::Invalid(err)),
        }
    }

    fn push_keyfile(&mut self, setting: &Setting<Keyfile>) {
        if !setting.apply {
            return;
        }

        match &setting.value {
            Keyfile::NotSelected => self.skip(AttributeId::Keyfile, SkipReason::NoFileSelected),
            Keyfile::Unreadable(msg) => {
                self.skip(AttributeId::Keyfile, SkipReason::Unreadable(msg.clone()));
            }
            Keyfile::Loaded(raw) => match codec::validate_keyfile_len(raw.len()) {
                Ok(records) => {
                    debug!("Keyfile holds {records} key records");

                    self.entries
                        .extend(chunk_keyfile(raw).into_iter().map(|payload| PlanEntry {
                            attribute: AttributeId::Keyfile,
                            payload,
                        }));
                }
                Err(err) => self.skip(AttributeId::Keyfile, SkipReason::Invalid(err)),
            },
        }
    }

    fn skip(&mut self, attribute: AttributeId, reason: SkipReason) {
        warn!("Skipping {attribute}: {reason}");

        self.skipped.push(SkippedField { attribute, reason });
    }
}
