//! Firmware upload supervision.
//!
//! The upload protocol itself is opaque: an [`UploadTransport`] pushes the
//! image and reports its lifecycle through [`UploadEvent`]s. The
//! [`UploadSupervisor`] only tracks whether the transport shows any sign of
//! life within the watchdog window.

use crate::{
    address::DeviceAddress,
    config::{UpgradeMode, UploadSettings},
    transport::{Notifier, TransportError},
};
use core::fmt::{Display, Formatter};
use log::{debug, trace};
use std::{io, path::PathBuf, time::Duration};

/// Lifecycle notification of an upload.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum UploadEvent {
    /// The transport started the upload.
    Started,
    /// The transport entered a new internal state.
    StateChanged(String),
    /// Image bytes were sent.
    Progress {
        /// Bytes sent so far.
        sent: u64,
        /// Total image size.
        total: u64,
    },
    /// The upload finished successfully.
    Completed,
    /// The upload was canceled.
    Canceled,
    /// The upload failed.
    Failed(String),
}

impl UploadEvent {
    /// Returns whether this is a final outcome.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Failed(_))
    }
}

impl Display for UploadEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Started => write!(f, "upload started"),
            Self::StateChanged(state) => write!(f, "upload state: {state}"),
            Self::Progress { sent, total } => write!(f, "upload progress: {sent}/{total} bytes"),
            Self::Completed => write!(f, "upload completed"),
            Self::Canceled => write!(f, "upload canceled"),
            Self::Failed(reason) => write!(f, "upload failed: {reason}"),
        }
    }
}

/// Outcome of a watchdog expiry.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Verdict {
    /// No notification arrived within the window.
    Hung,
    /// At least one notification arrived.
    Alive,
}

/// Liveness tracking of one upload.
///
/// The watchdog is armed once per upload and never re-armed. Activity only
/// needs to be seen once for the upload to be considered alive.
#[derive(Default, Debug)]
pub struct UploadSupervisor {
    activity_seen: bool,
    notifications: usize,
    progress: Option<(u64, u64)>,
}

impl UploadSupervisor {
    /// Constructs a supervisor for a freshly started upload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a notification from the upload transport.
    pub fn observe(&mut self, event: &UploadEvent) {
        self.activity_seen = true;
        self.notifications += 1;

        if let UploadEvent::Progress { sent, total } = *event {
            self.progress = Some((sent, total));
        }

        trace!("Observed {event}");
    }

    /// Decides what an expired watchdog means.
    #[must_use]
    pub fn watchdog_expired(&self) -> Verdict {
        if self.activity_seen {
            Verdict::Alive
        } else {
            Verdict::Hung
        }
    }

    /// Returns the number of notifications observed.
    #[must_use]
    pub fn notifications(&self) -> usize {
        self.notifications
    }

    /// Returns the last reported progress as `(sent, total)`.
    #[must_use]
    pub fn progress(&self) -> Option<(u64, u64)> {
        self.progress
    }
}

/// Handle to a running upload.
#[async_trait::async_trait(?Send)]
pub trait UploadController {
    /// Requests cancellation of the upload.
    async fn cancel(&mut self) -> Result<(), TransportError>;
}

/// Firmware upload transport.
///
/// The `set_*` methods are optional capabilities. Transports that cannot
/// honor a setting keep the default no-op.
#[async_trait::async_trait(?Send)]
pub trait UploadTransport {
    /// Sets the connection timeout.
    fn set_connection_timeout(&mut self, _timeout: Duration) {}

    /// Sets the per-operation timeout.
    fn set_operation_timeout(&mut self, _timeout: Duration) {}

    /// Sets the preferred MTU.
    fn set_mtu(&mut self, _mtu: u16) {}

    /// Sets the upgrade mode.
    fn set_mode(&mut self, _mode: UpgradeMode) {}

    /// Applies every capability setting.
    fn configure(&mut self, settings: &UploadSettings) {
        debug!(
            "Upload settings: mode {}, connection timeout {:?}, operation timeout {:?}, MTU {}",
            settings.mode, settings.connection_timeout, settings.operation_timeout, settings.mtu
        );

        self.set_connection_timeout(settings.connection_timeout);
        self.set_operation_timeout(settings.operation_timeout);
        self.set_mtu(settings.mtu);
        self.set_mode(settings.mode);
    }

    /// Starts uploading `image` to the peer.
    ///
    /// Returns `None` if the transport declined to start. Lifecycle
    /// notifications are delivered through `notifier`.
    async fn start(
        &mut self,
        address: DeviceAddress,
        image: Vec<u8>,
        notifier: Notifier,
    ) -> Result<Option<Box<dyn UploadController>>, TransportError>;

    /// Releases resources held by the transport.
    async fn release(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Provider of the firmware image.
#[async_trait::async_trait(?Send)]
pub trait ImageSource {
    /// Reads the complete image.
    async fn read(&mut self) -> io::Result<Vec<u8>>;
}

/// Image stored in a file.
#[derive(Debug)]
pub struct FileImage(PathBuf);

impl FileImage {
    /// Constructs an image source reading the given file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }
}

#[async_trait::async_trait(?Send)]
impl ImageSource for FileImage {
    async fn read(&mut self) -> io::Result<Vec<u8>> {
        let data = tokio::fs::read(&self.0).await?;

        debug!("Read {} byte image from {}", data.len(), self.0.display());

        Ok(data)
    }
}

#[async_trait::async_trait(?Send)]
impl ImageSource for Vec<u8> {
    async fn read(&mut self) -> io::Result<Vec<u8>> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_upload_is_hung() {
        let supervisor = UploadSupervisor::new();

        assert_eq!(
            supervisor.watchdog_expired(),
            Verdict::Hung,
            "no notifications should be a hang"
        );
    }

    #[test]
    fn single_notification_is_enough() {
        let mut supervisor = UploadSupervisor::new();

        supervisor.observe(&UploadEvent::Progress {
            sent: 128,
            total: 4096,
        });

        assert_eq!(
            supervisor.watchdog_expired(),
            Verdict::Alive,
            "any notification should count as activity"
        );
        assert_eq!(supervisor.progress(), Some((128, 4096)), "progress recorded");
        // A stall afterwards still counts as alive
        assert_eq!(supervisor.watchdog_expired(), Verdict::Alive, "verdict is sticky");
        assert_eq!(supervisor.notifications(), 1, "one notification seen");
    }

    #[test]
    fn terminal_events() {
        assert!(UploadEvent::Completed.is_terminal(), "completed");
        assert!(UploadEvent::Failed("x".to_string()).is_terminal(), "failed");
        assert!(!UploadEvent::Started.is_terminal(), "started");
        assert_eq!(
            UploadEvent::Progress { sent: 1, total: 2 }.to_string(),
            "upload progress: 1/2 bytes",
            "display"
        );
    }

    #[derive(Default)]
    struct Probe {
        mtu: Option<u16>,
        mode: Option<UpgradeMode>,
    }

    #[async_trait::async_trait(?Send)]
    impl UploadTransport for Probe {
        fn set_mtu(&mut self, mtu: u16) {
            self.mtu = Some(mtu);
        }

        fn set_mode(&mut self, mode: UpgradeMode) {
            self.mode = Some(mode);
        }

        async fn start(
            &mut self,
            _address: DeviceAddress,
            _image: Vec<u8>,
            _notifier: Notifier,
        ) -> Result<Option<Box<dyn UploadController>>, TransportError> {
            Ok(None)
        }
    }

    #[test]
    fn capabilities() {
        let mut probe = Probe::default();

        probe.configure(&UploadSettings::default());

        assert_eq!(probe.mtu, Some(247), "MTU should be applied");
        assert_eq!(probe.mode, Some(UpgradeMode::ConfirmOnly), "mode should be applied");
    }

    #[tokio::test]
    async fn image_sources() {
        let mut image = vec![1, 2, 3];

        assert_eq!(image.read().await.ok(), Some(vec![1, 2, 3]), "memory image");
        assert!(
            FileImage::new("/nonexistent/image.bin").read().await.is_err(),
            "missing file should fail"
        );
    }
}
