//! `btleplug`-backed [`DfuTransport`] implementation.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;

use crate::error::DfuError;
use crate::transport::{DfuTransport, DfuTransportManager, NotificationHandler};
use crate::uuids;

/// `ATT_MTU_DEFAULT(23) - 3` bytes of ATT header, per spec.
const DEFAULT_PACKET_SIZE: usize = 20;

fn transport_err(err: impl std::fmt::Display) -> DfuError {
    DfuError::Transport(err.to_string())
}

async fn first_adapter() -> Result<Adapter, DfuError> {
    let manager = Manager::new().await.map_err(transport_err)?;
    let adapters = manager.adapters().await.map_err(transport_err)?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| DfuError::Transport("no Bluetooth adapter found".into()))
}

async fn find_peripheral<P>(central: &Adapter, timeout: Duration, predicate: P) -> Result<Peripheral, DfuError>
where
    P: Fn(&PeripheralProperties) -> bool,
{
    central.start_scan(ScanFilter::default()).await.map_err(transport_err)?;
    let mut events = central.events().await.map_err(transport_err)?;
    let found = tokio::time::timeout(timeout, async {
        while let Some(event) = events.next().await {
            if let CentralEvent::DeviceDiscovered(id) = event {
                let peripheral = central.peripheral(&id).await.ok()?;
                if let Ok(Some(properties)) = peripheral.properties().await {
                    if predicate(&properties) {
                        return Some(peripheral);
                    }
                }
            }
        }
        None
    })
    .await;
    let _ = central.stop_scan().await;
    match found {
        Ok(Some(peripheral)) => Ok(peripheral),
        Ok(None) => Err(DfuError::Transport("scan ended without a match".into())),
        Err(_) => Err(DfuError::Transport(format!(
            "no matching peripheral found within {timeout:?}"
        ))),
    }
}

fn log_discovery(properties: &PeripheralProperties) {
    let name = properties.local_name.as_deref().unwrap_or("<unknown>");
    let rssi = properties.rssi.unwrap_or(-99);
    log::trace!("rssi {rssi} addr {} name {name}", properties.address);
}

#[cfg(target_os = "macos")]
async fn find_peripheral_by_address(_central: &Adapter, _addr: &BDAddr, _timeout: Duration) -> Result<Peripheral, DfuError> {
    Err(DfuError::Transport(
        "BLE MAC addresses are not supported on macOS".into(),
    ))
}

#[cfg(not(target_os = "macos"))]
async fn find_peripheral_by_address(
    central: &Adapter,
    addr: &BDAddr,
    timeout: Duration,
) -> Result<Peripheral, DfuError> {
    log::info!("searching for {addr} by address...");
    find_peripheral(central, timeout, |props| {
        log_discovery(props);
        props.address == *addr
    })
    .await
}

async fn find_peripheral_by_name(central: &Adapter, name: &str, timeout: Duration) -> Result<Peripheral, DfuError> {
    log::info!("searching for {name} by name...");
    find_peripheral(central, timeout, |props| {
        log_discovery(props);
        props.local_name.as_deref() == Some(name)
    })
    .await
}

fn find_characteristic(peripheral: &Peripheral, uuid: uuid::Uuid) -> Result<Characteristic, DfuError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| DfuError::Transport(format!("characteristic {uuid} not found")))
}

/// A live connection to one DFU peripheral's control-point and data-point
/// characteristics.
pub struct BtleplugTransport {
    peripheral: Peripheral,
    control_point: Characteristic,
    data_point: Characteristic,
    packet_size: AtomicUsize,
}

impl DfuTransport for BtleplugTransport {
    async fn write_control_point(&self, bytes: &[u8]) -> Result<(), DfuError> {
        self.peripheral
            .write(&self.control_point, bytes, WriteType::WithResponse)
            .await
            .map_err(transport_err)
    }

    async fn write_data_point(&self, bytes: &[u8]) -> Result<(), DfuError> {
        // Each fragment write completes (write-with-response) before the next
        // is issued, so the device's offset/crc are predictable at checkpoint
        // time. Callers are responsible for pre-chunking to `packet_size`;
        // this additionally guards against an oversized single call.
        for chunk in bytes.chunks(self.packet_size()) {
            self.peripheral
                .write(&self.data_point, chunk, WriteType::WithResponse)
                .await
                .map_err(transport_err)?;
        }
        Ok(())
    }

    async fn subscribe_control_point(&self, handler: NotificationHandler) -> Result<(), DfuError> {
        self.peripheral
            .subscribe(&self.control_point)
            .await
            .map_err(transport_err)?;
        let mut notifications = self.peripheral.notifications().await.map_err(transport_err)?;
        let control_point = self.control_point.uuid;
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == control_point {
                    handler(notification.value);
                } else {
                    log::warn!(
                        "ignoring notification from unexpected characteristic {}",
                        notification.uuid
                    );
                }
            }
        });
        Ok(())
    }

    fn packet_size(&self) -> usize {
        self.packet_size.load(Ordering::Relaxed)
    }

    fn set_packet_size(&self, size: usize) {
        self.packet_size.store(size, Ordering::Relaxed);
    }
}

/// Owns discovery/connect/disconnect lifecycle for one [`BtleplugTransport`].
pub struct BtleplugManager {
    peripheral: Option<Peripheral>,
    transport: Option<Arc<BtleplugTransport>>,
}

impl Default for BtleplugManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BtleplugManager {
    pub fn new() -> Self {
        Self {
            peripheral: None,
            transport: None,
        }
    }
}

impl DfuTransportManager for BtleplugManager {
    type Transport = BtleplugTransport;

    async fn connect(&mut self, target: &str, timeout: Duration) -> Result<(), DfuError> {
        let central = first_adapter().await?;

        let peripheral = if let Ok(addr) = BDAddr::from_str(target) {
            find_peripheral_by_address(&central, &addr, timeout).await?
        } else {
            find_peripheral_by_name(&central, target, timeout).await?
        };

        peripheral.connect().await.map_err(transport_err)?;
        peripheral.discover_services().await.map_err(transport_err)?;

        let control_point = find_characteristic(&peripheral, uuids::CONTROL_POINT)?;
        let data_point = find_characteristic(&peripheral, uuids::DATA_POINT)?;

        self.transport = Some(Arc::new(BtleplugTransport {
            peripheral: peripheral.clone(),
            control_point,
            data_point,
            packet_size: AtomicUsize::new(DEFAULT_PACKET_SIZE),
        }));
        self.peripheral = Some(peripheral);
        Ok(())
    }

    fn transport(&self) -> Arc<Self::Transport> {
        self.transport
            .clone()
            .expect("connect() must succeed before transport() is called")
    }

    async fn disconnect(&mut self) -> Result<(), DfuError> {
        if let Some(peripheral) = self.peripheral.take() {
            peripheral.disconnect().await.map_err(transport_err)?;
        }
        self.transport = None;
        Ok(())
    }
}

/// A peripheral discovered by [`scan`].
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub address: BDAddr,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub reason: &'static str,
}

/// List nearby peripherals advertising the Nordic DFU service or either
/// buttonless characteristic. Mirrors the reference tool's
/// `scan_dfu_devices`.
pub async fn scan(timeout: Duration) -> Result<Vec<DiscoveredDevice>, DfuError> {
    let central = first_adapter().await?;
    central.start_scan(ScanFilter::default()).await.map_err(transport_err)?;
    tokio::time::sleep(timeout).await;
    let peripherals = central.peripherals().await.map_err(transport_err)?;
    central.stop_scan().await.map_err(transport_err)?;

    let mut devices = Vec::new();
    for peripheral in peripherals {
        let Ok(Some(properties)) = peripheral.properties().await else {
            continue;
        };
        let reason = if properties.services.contains(&uuids::SERVICE) {
            Some("nordic semi asa")
        } else if properties.services.contains(&uuids::BUTTONLESS_BONDED) {
            Some("DFU bonded")
        } else if properties.services.contains(&uuids::BUTTONLESS_UNBONDED) {
            Some("DFU unbonded")
        } else {
            None
        };
        if let Some(reason) = reason {
            devices.push(DiscoveredDevice {
                address: properties.address,
                name: properties.local_name,
                rssi: properties.rssi,
                reason,
            });
        } else {
            log::debug!("ignoring non-DFU device {}", properties.address);
        }
    }
    Ok(devices)
}

/// Ask a peripheral not yet in DFU mode to reboot into the bootloader, via
/// the Buttonless DFU service. Prefers the bonded characteristic, falling
/// back to the unbonded one. This is outside the object transfer engine's
/// scope: it only gets a not-yet-DFU peripheral into DFU mode, it does not
/// speak the object transfer protocol itself.
pub async fn trigger_buttonless(target: &str, timeout: Duration) -> Result<(), DfuError> {
    let central = first_adapter().await?;
    let peripheral = if let Ok(addr) = BDAddr::from_str(target) {
        find_peripheral_by_address(&central, &addr, timeout).await?
    } else {
        find_peripheral_by_name(&central, target, timeout).await?
    };

    peripheral.connect().await.map_err(transport_err)?;
    peripheral.discover_services().await.map_err(transport_err)?;

    let characteristic = find_characteristic(&peripheral, uuids::BUTTONLESS_BONDED)
        .or_else(|_| find_characteristic(&peripheral, uuids::BUTTONLESS_UNBONDED))?;

    peripheral.subscribe(&characteristic).await.map_err(transport_err)?;
    let mut notifications = peripheral.notifications().await.map_err(transport_err)?;
    peripheral
        .write(&characteristic, &[0x01], WriteType::WithResponse)
        .await
        .map_err(transport_err)?;

    while let Some(notification) = notifications.next().await {
        if notification.uuid == characteristic.uuid {
            return if notification.value == [0x20, 0x01, 0x01] {
                Ok(())
            } else {
                Err(DfuError::Transport(format!(
                    "buttonless trigger rejected: {:02X?}",
                    notification.value
                )))
            };
        }
        log::warn!("ignoring notification from unexpected characteristic {}", notification.uuid);
    }
    Err(DfuError::Transport("buttonless trigger: connection closed with no response".into()))
}
