//! Configure and update firmware on BLE tracking tags.
//!
//! # Overview
//!
//! The `tagcheck` crate drives a battery-powered BLE tag from a host acting
//! as the central. It discovers the tag by address, (re-)establishes the
//! GATT link across transient failures, delivers a set of configuration
//! writes as one ordered transaction, and supervises firmware uploads with a
//! liveness watchdog.
//!
//! The crate is organized in layers:
//!
//! - [`codec`] encodes the primitive payloads understood by the tag.
//! - [`plan`] turns a [`ConfigurationSnapshot`](config::ConfigurationSnapshot)
//!   into an ordered [`CommandPlan`](plan::CommandPlan).
//! - [`sequencer`] drains a plan one acknowledged write at a time.
//! - [`link`] is the pure link state machine.
//! - [`upload`] supervises firmware uploads.
//! - [`session`] composes all of the above on top of a
//!   [`Transport`](transport::Transport).
//!
//! If you enable the `native-ble` feature, the [`ble`] module provides a
//! transport for the host's Bluetooth adapter.
//!
//! # Examples
//!
//! ## Building a command plan
//!
//! Plans are built without any I/O:
//!
//! ```
//! use tagcheck::{
//!     attribute::AttributeId,
//!     config::{ConfigurationSnapshot, Setting},
//!     plan::CommandPlan,
//! };
//!
//! let snapshot = ConfigurationSnapshot {
//!     tx_power: Setting::applied(2),
//!     ..ConfigurationSnapshot::with_password("ABCDEFGH")
//! };
//! let plan = CommandPlan::build(&snapshot)?;
//!
//! assert_eq!(plan.entries()[0].attribute, AttributeId::Password);
//! assert_eq!(plan.entries()[1].payload, [0x02, 0x00, 0x00, 0x00]);
//! # Ok::<(), tagcheck::codec::Error>(())
//! ```
//!
//! ## Running a configuration session
//!
//! ```no_run
//! # #[cfg(feature = "native-ble")]
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use tagcheck::{
//!     ble::BleTransport,
//!     config::{ConfigurationSnapshot, Timings},
//!     session::{Orchestrator, cancellation},
//! };
//!
//! let transport = BleTransport::open().await?;
//! let mut orchestrator = Orchestrator::new(transport, Timings::default());
//! let (_handle, cancel) = cancellation();
//! let report = orchestrator
//!     .configure(
//!         "AA:BB:CC:DD:EE:FF".parse()?,
//!         ConfigurationSnapshot::with_password("ABCDEFGH"),
//!         cancel,
//!     )
//!     .await;
//!
//! print!("{}", report.journal);
//! println!("Result: {:?}", report.result);
//!
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "native-ble"))]
//! # fn main() {}
//! ```
//!
//! # Protocol details
//!
//! Every attribute lives in the tag's control service. The password
//! attribute must be written first: it unlocks all other attributes for the
//! lifetime of the connection. Writing it again later replaces the password.
//!
//! Integers are sent as 32-bit little-endian values. MAC addresses are sent
//! least-significant byte first, and keyfiles are split into 14-byte chunks
//! followed by two all-zero chunks.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod address;
pub mod advert;
pub mod attribute;
pub mod codec;
pub mod config;
pub mod external;
pub mod journal;
pub mod link;
pub mod plan;
pub mod prefs;
pub mod sequencer;
pub mod session;
pub mod transport;
pub mod upload;

#[cfg(feature = "native-ble")]
#[cfg_attr(docsrs, doc(cfg(feature = "native-ble")))]
pub mod ble;

pub use address::DeviceAddress;
pub use link::Completion;
pub use session::{Orchestrator, Report};

use core::fmt::{Display, Formatter};

/// A specialized [`Result`] type for session outcomes.
pub type Result<T> = core::result::Result<T, Error>;

/// Terminal session error.
///
/// Transient link failures never surface here: they are retried until the
/// session deadline passes.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Error {
    /// The password is not 8 printable ASCII characters.
    InvalidPassword(codec::Error),
    /// The session deadline passed before the session completed.
    DeadlineExceeded {
        /// Number of scan attempts made.
        attempts: u32,
    },
    /// The upload transport canceled the upload.
    UploadCanceled,
    /// The upload transport reported a failure.
    UploadFailed(String),
    /// The firmware image could not be read.
    ImageUnreadable(String),
    /// The session was cancelled by the caller.
    Cancelled,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::InvalidPassword(err) => write!(f, "invalid password: {err}"),
            Self::DeadlineExceeded { attempts } => {
                write!(f, "deadline exceeded after {attempts} attempts")
            }
            Self::UploadCanceled => write!(f, "upload canceled"),
            Self::UploadFailed(reason) => write!(f, "upload failed: {reason}"),
            Self::ImageUnreadable(reason) => write!(f, "firmware image unreadable: {reason}"),
            Self::Cancelled => write!(f, "session cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidPassword(err) => Some(err),
            _ => None,
        }
    }
}
