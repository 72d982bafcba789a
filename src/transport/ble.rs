//! `bluest`-backed transport implementation.
//!
//! Scan and notification streams from `bluest` borrow the adapter or
//! characteristic they came from, so each is pumped through a task that owns
//! a clone of its source and feeds an mpsc channel; dropping the consumer
//! side ends the pump and with it the underlying scan/subscription.

use super::{
    notify_characteristic_uuid, service_uuid, write_characteristic_uuid, DiscoveredDevice, Link,
    LinkEndpoints, Transport, WriteTarget,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// BLE transport over the system Bluetooth adapter.
pub struct BleTransport {
    adapter: Adapter,
    // Devices seen by the most recent scan, keyed by the id handed out in
    // `DiscoveredDevice`. `bluest` devices cannot be reconstructed from an
    // id alone, so connect() resolves through this map.
    discovered: Arc<Mutex<HashMap<String, Device>>>,
}

impl BleTransport {
    /// Open the default system adapter.
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default().await.ok_or(Error::AdapterUnavailable)?;
        Ok(Self {
            adapter,
            discovered: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

fn device_key(device: &Device) -> String {
    format!("{:?}", device.id())
}

#[async_trait]
impl Transport for BleTransport {
    async fn ready(&self) -> Result<()> {
        self.adapter
            .wait_available()
            .await
            .map_err(|_| Error::AdapterUnavailable)
    }

    async fn scan(&self) -> Result<BoxStream<'static, DiscoveredDevice>> {
        let adapter = self.adapter.clone();
        let discovered = Arc::clone(&self.discovered);
        let (tx, mut rx) = mpsc::channel::<DiscoveredDevice>(32);
        let (started_tx, started_rx) = oneshot::channel::<Result<()>>();

        tokio::spawn(async move {
            let mut scan = match adapter.scan(&[]).await {
                Ok(scan) => {
                    let _ = started_tx.send(Ok(()));
                    scan
                }
                Err(err) => {
                    let _ = started_tx.send(Err(Error::ScanFailed(err.to_string())));
                    return;
                }
            };
            while let Some(adv) = scan.next().await {
                let id = device_key(&adv.device);
                let name = match adv.device.name_async().await {
                    Ok(name) => name,
                    Err(_) => adv.adv_data.local_name.clone().unwrap_or_default(),
                };
                discovered.lock().unwrap().insert(id.clone(), adv.device);
                let device = DiscoveredDevice {
                    id,
                    name,
                    rssi: adv.rssi.unwrap_or(0),
                };
                if tx.send(device).await.is_err() {
                    // Consumer dropped the stream; stop scanning.
                    break;
                }
            }
            debug!("scan pump finished");
        });

        started_rx
            .await
            .map_err(|_| Error::ScanFailed("scan task failed".into()))??;

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|device| (device, rx))
        })
        .boxed())
    }

    async fn connect(&self, device_id: &str) -> Result<Box<dyn Link>> {
        let device = self
            .discovered
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::ConnectFailed(format!("unknown device {device_id}")))?;

        self.adapter
            .connect_device(&device)
            .await
            .map_err(|err| Error::ConnectFailed(err.to_string()))?;

        Ok(Box::new(BleLink {
            adapter: self.adapter.clone(),
            device,
        }))
    }
}

struct BleLink {
    adapter: Adapter,
    device: Device,
}

#[async_trait]
impl Link for BleLink {
    async fn endpoints(&self) -> Result<LinkEndpoints> {
        let service = self
            .device
            .discover_services_with_uuid(service_uuid())
            .await?
            .first()
            .cloned()
            .ok_or(Error::ServiceNotFound(service_uuid()))?;

        let write = service
            .discover_characteristics_with_uuid(write_characteristic_uuid())
            .await?
            .first()
            .cloned()
            .ok_or(Error::CharacteristicNotFound(write_characteristic_uuid()))?;

        let notify = service
            .discover_characteristics_with_uuid(notify_characteristic_uuid())
            .await?
            .first()
            .cloned()
            .ok_or(Error::CharacteristicNotFound(notify_characteristic_uuid()))?;

        let notifications = subscribe(notify).await?;

        Ok(LinkEndpoints {
            write: Arc::new(BleWriteTarget(write)),
            notifications,
        })
    }

    async fn disconnect(&self) -> Result<()> {
        self.adapter.disconnect_device(&self.device).await?;
        Ok(())
    }
}

/// Subscribe to the notify characteristic, or fall back to a one-shot read
/// when the device only exposes read on it.
async fn subscribe(characteristic: Characteristic) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
    let properties = characteristic.properties().await?;

    if properties.notify {
        let (tx, rx) = mpsc::channel::<Result<Vec<u8>>>(32);
        tokio::spawn(async move {
            let mut notifications = match characteristic.notify().await {
                Ok(notifications) => notifications,
                Err(err) => {
                    let _ = tx.send(Err(err.into())).await;
                    return;
                }
            };
            while let Some(item) = notifications.next().await {
                if tx.send(item.map_err(Error::from)).await.is_err() {
                    break;
                }
            }
            debug!("notification pump finished");
        });
        return Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed());
    }

    if properties.read {
        warn!("notify unsupported on characteristic; falling back to one-shot read");
        return Ok(stream::once(async move {
            characteristic.read().await.map_err(Error::from)
        })
        .boxed());
    }

    Err(Error::CharacteristicNotFound(notify_characteristic_uuid()))
}

struct BleWriteTarget(Characteristic);

#[async_trait]
impl WriteTarget for BleWriteTarget {
    async fn write(&self, payload: &[u8]) -> Result<()> {
        self.0
            .write(payload)
            .await
            .map_err(|err| Error::WriteFailed(err.to_string()))
    }
}
