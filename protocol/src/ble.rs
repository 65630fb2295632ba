//! BLE transport backed by the host's Bluetooth adapter.

use crate::{
    address::DeviceAddress,
    advert::{TagKind, classify},
    attribute::AttributeTable,
    transport::{Link, Notifier, Transport, TransportError},
};
use btleplug::{
    api::{BDAddr, Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::StreamExt;
use log::{debug, trace};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Returns the first Bluetooth adapter of the host.
pub async fn default_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await?;

    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::new("no Bluetooth adapter found"))
}

/// Nearby advertising device.
#[derive(Clone, Debug)]
pub struct Advertiser {
    /// Hardware address.
    pub address: DeviceAddress,
    /// Advertised name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Device classification.
    pub kind: TagKind,
}

/// Scans for `duration` and returns every classified advertiser.
///
/// The scan is stopped even if collecting the results fails.
pub async fn scan(adapter: &Adapter, duration: Duration) -> Result<Vec<Advertiser>, TransportError> {
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let devices = advertisers(adapter).await;
    let stopped = adapter.stop_scan().await.map_err(TransportError::from);

    settle_scan(devices, stopped)
}

async fn advertisers(adapter: &Adapter) -> Result<Vec<Advertiser>, TransportError> {
    let mut devices = Vec::new();

    for peripheral in adapter.peripherals().await? {
        let Some(props) = peripheral.properties().await? else {
            continue;
        };

        if let Some(kind) = classify(&props.manufacturer_data, None) {
            devices.push(Advertiser {
                address: DeviceAddress::new(peripheral.address().into_inner()),
                name: props.local_name,
                rssi: props.rssi,
                kind,
            });
        }
    }

    Ok(devices)
}

/// Merges the collected results with the outcome of stopping the scan.
fn settle_scan<T>(
    collected: Result<T, TransportError>,
    stopped: Result<(), TransportError>,
) -> Result<T, TransportError> {
    match (collected, stopped) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(err), Err(stop)) => {
            debug!("Failed to stop scan: {stop}");

            Err(err)
        }
        (Err(err), Ok(())) | (Ok(_), Err(err)) => Err(err),
    }
}

/// [`Transport`] implementation using the platform BLE stack.
#[derive(Debug)]
pub struct BleTransport {
    adapter: Adapter,
    scanner: Option<JoinHandle<()>>,
}

impl BleTransport {
    /// Constructs a transport using the given adapter.
    #[must_use]
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            scanner: None,
        }
    }

    /// Constructs a transport using the host's first adapter.
    pub async fn open() -> Result<Self, TransportError> {
        Ok(Self::new(default_adapter().await?))
    }

    async fn find(&self, target: BDAddr) -> Result<Peripheral, TransportError> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address() == target {
                return Ok(peripheral);
            }
        }

        Err(TransportError::new(format!("{target} is not known to the adapter")))
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        if let Some(scanner) = self.scanner.take() {
            scanner.abort();
        }
    }
}

#[async_trait::async_trait(?Send)]
impl Transport for BleTransport {
    type Link = BleLink;

    async fn start_scan(
        &mut self,
        address: DeviceAddress,
        notifier: Notifier,
    ) -> Result<(), TransportError> {
        if let Some(scanner) = self.scanner.take() {
            scanner.abort();
        }

        let target = BDAddr::from(address.bytes());
        let mut events = self.adapter.events().await?;
        let adapter = self.adapter.clone();

        adapter.start_scan(ScanFilter::default()).await?;

        self.scanner = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let (CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) = event
                else {
                    continue;
                };

                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };

                if peripheral.address() != target {
                    continue;
                }

                let rssi = peripheral
                    .properties()
                    .await
                    .ok()
                    .flatten()
                    .and_then(|props| props.rssi);

                trace!("Target {target} advertised, RSSI {rssi:?}");

                notifier.peer_found(rssi);

                return;
            }

            notifier.scan_failed(&TransportError::new("adapter event stream ended"));
        }));

        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), TransportError> {
        if let Some(scanner) = self.scanner.take() {
            scanner.abort();
        }

        self.adapter.stop_scan().await?;

        Ok(())
    }

    async fn connect(
        &mut self,
        address: DeviceAddress,
        notifier: Notifier,
    ) -> Result<BleLink, TransportError> {
        let peripheral = self.find(BDAddr::from(address.bytes())).await?;
        let id = peripheral.id();
        let mut events = self.adapter.events().await?;

        peripheral.connect().await?;

        debug!("Connected to {address}");

        let watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if matches!(&event, CentralEvent::DeviceDisconnected(lost) if *lost == id) {
                    notifier.disconnected();

                    return;
                }
            }
        });

        Ok(BleLink {
            peripheral,
            watcher: Some(watcher),
        })
    }
}

/// Live connection to a peripheral.
#[derive(Debug)]
pub struct BleLink {
    peripheral: Peripheral,
    watcher: Option<JoinHandle<()>>,
}

impl BleLink {
    /// Returns the platform identifier of the peer.
    #[must_use]
    pub fn id(&self) -> PeripheralId {
        self.peripheral.id()
    }

    fn stop_watching(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

#[async_trait::async_trait(?Send)]
impl Link for BleLink {
    async fn discover(&mut self) -> Result<AttributeTable, TransportError> {
        self.peripheral.discover_services().await?;

        Ok(self
            .peripheral
            .characteristics()
            .into_iter()
            .map(|c| c.uuid)
            .collect())
    }

    async fn write(&mut self, attribute: Uuid, payload: &[u8]) -> Result<(), TransportError> {
        let characteristic = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == attribute)
            .ok_or_else(|| TransportError::new(format!("characteristic {attribute} not found")))?;

        self.peripheral
            .write(&characteristic, payload, WriteType::WithResponse)
            .await?;

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        // Our own disconnect must not be reported as a lost link
        self.stop_watching();
        self.peripheral.disconnect().await?;

        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stop_watching();

        Ok(())
    }
}
