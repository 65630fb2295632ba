//! Platform BLE primitives consumed by the orchestrator.
//!
//! Transports report asynchronous outcomes through a [`Notifier`], which tags
//! every notification with the generation of the attempt it belongs to.

use crate::{
    address::DeviceAddress,
    attribute::AttributeTable,
    link::{Event, Generation, Input},
    upload::UploadEvent,
};
use core::fmt::{Display, Formatter};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Opaque, retryable transport failure.
///
/// The orchestrator never interprets transport-specific error codes,
/// so this only carries a message for the journal.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct TransportError(String);

impl TransportError {
    /// Constructs an error with the given message.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for TransportError {}

#[cfg(feature = "native-ble")]
impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        Self(err.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self(err.to_string())
    }
}

/// Sender of generation-tagged notifications.
///
/// Notifications sent after the session has ended are silently dropped.
#[derive(Clone, Debug)]
pub struct Notifier {
    generation: Generation,
    tx: mpsc::UnboundedSender<Input>,
}

impl Notifier {
    pub(crate) fn new(generation: Generation, tx: mpsc::UnboundedSender<Input>) -> Self {
        Self { generation, tx }
    }

    /// Returns the generation this notifier is bound to.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub(crate) fn send(&self, event: Event) {
        let _ = self.tx.send(Input::Event {
            generation: self.generation,
            event,
        });
    }

    /// Reports that the target peer was seen while scanning.
    pub fn peer_found(&self, rssi: Option<i16>) {
        self.send(Event::PeerFound { rssi });
    }

    /// Reports that the scan failed.
    pub fn scan_failed(&self, err: &TransportError) {
        self.send(Event::ScanFailed(err.to_string()));
    }

    /// Reports that the link was lost.
    pub fn disconnected(&self) {
        self.send(Event::Disconnected);
    }

    /// Reports an upload notification.
    pub fn upload(&self, event: UploadEvent) {
        self.send(Event::Upload(event));
    }
}

/// Scan and connect primitives of a BLE central.
#[async_trait::async_trait(?Send)]
pub trait Transport {
    /// Connection handle returned by [`Transport::connect`].
    type Link: Link;

    /// Starts scanning for the peer with the given address.
    ///
    /// The transport calls [`Notifier::peer_found`] when the peer is seen
    /// and [`Notifier::scan_failed`] if the scan breaks down later.
    async fn start_scan(
        &mut self,
        address: DeviceAddress,
        notifier: Notifier,
    ) -> Result<(), TransportError>;

    /// Stops a running scan. Stopping an idle scan is not an error.
    async fn stop_scan(&mut self) -> Result<(), TransportError>;

    /// Connects to the peer.
    ///
    /// The transport calls [`Notifier::disconnected`] if the returned link
    /// is lost.
    async fn connect(
        &mut self,
        address: DeviceAddress,
        notifier: Notifier,
    ) -> Result<Self::Link, TransportError>;
}

/// A live GATT connection.
#[async_trait::async_trait(?Send)]
pub trait Link {
    /// Discovers the attributes exposed by the peer.
    async fn discover(&mut self) -> Result<AttributeTable, TransportError>;

    /// Writes an attribute and waits for the acknowledgment.
    async fn write(&mut self, attribute: Uuid, payload: &[u8]) -> Result<(), TransportError>;

    /// Requests a disconnect.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Releases the connection handle.
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}
