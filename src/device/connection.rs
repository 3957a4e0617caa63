use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use futures::StreamExt;
use futures::channel::mpsc::UnboundedSender;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::io::ConfigIO;
use crate::device::accessory::{AccessoryEvent, AccessoryRegistry, PickerDescriptor};
use crate::device::constants::WRITE_DEADLINE;
use crate::device::transport::Transport;
use crate::device::types::{AccessoryIdentity, CharacteristicRef, ConnectOptions, DiscoveredPeripheral, PeripheralId, TransportEvent};
use crate::error::{AccessoryError, TransportError};

type PeripheralCache = Arc<Mutex<HashMap<PeripheralId, Peripheral>>>;

fn peripheral_key(id: &btleplug::platform::PeripheralId) -> PeripheralId {
    PeripheralId(format!("{:?}", id))
}

/// Look at a peripheral the adapter told us about and keep it if it looks like the ring.
async fn match_peripheral(adapter: &Adapter, id: &btleplug::platform::PeripheralId, descriptor: &PickerDescriptor) -> Option<(Peripheral, DiscoveredPeripheral)> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            debug!("Peripheral went away before it could be inspected: {}", err);
            return None;
        },
    };

    match peripheral.properties().await {
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            None
        },
        Ok(None) => {
            warn!("Peripheral has no properties");
            None
        },
        Ok(Some(properties)) => {
            // Some environments ignore the filter, so make sure to check the service uuid again
            let by_service = descriptor.services.iter().any(|uuid| properties.services.contains(uuid));
            let by_company = properties.manufacturer_data.contains_key(&descriptor.company_identifier);
            if !by_service && !by_company {
                return None;
            }

            info!(
                "Found peripheral {} {:?} {} {:?}",
                properties.address,
                properties.address_type,
                properties.local_name.as_deref().unwrap_or("NONE"),
                properties.services,
            );
            let discovered = DiscoveredPeripheral { id: peripheral_key(id), local_name: properties.local_name };
            Some((peripheral, discovered))
        },
    }
}

async fn scan_task(
    cancel: CancellationToken,
    adapter: Adapter,
    descriptor: PickerDescriptor,
    cache: PeripheralCache,
    events: UnboundedSender<TransportEvent>,
) -> Result<(), TransportError> {
    let mut central_events = adapter.events().await?;
    info!("Scanning using adapter {}...", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
    adapter.start_scan(ScanFilter { services: descriptor.services.clone() }).await?;

    let mut reported = HashSet::new();
    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            event = central_events.next() => match event {
                Some(CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) => {
                    if let Some((peripheral, discovered)) = match_peripheral(&adapter, &id, &descriptor).await {
                        if reported.insert(discovered.id.clone()) {
                            cache.lock().unwrap_or_else(PoisonError::into_inner).insert(discovered.id.clone(), peripheral);
                            let _ = events.unbounded_send(TransportEvent::Discovered(discovered));
                        }
                    }
                },
                Some(_) => {},
                None => break 'mainloop,
            },
        }
    }

    info!("Stopping scan");
    adapter.stop_scan().await?;
    Ok(())
}

/// Reports links that dropped without us asking.
fn watch_disconnects_task(cancel: CancellationToken, adapter: Adapter, cache: PeripheralCache, events: UnboundedSender<TransportEvent>) -> JoinHandle<()> {
    spawn(async move {
        let mut central_events = match adapter.events().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to watch adapter events: {}", err);
                return;
            },
        };

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                event = central_events.next() => match event {
                    Some(CentralEvent::DeviceDisconnected(id)) => {
                        let peripheral = peripheral_key(&id);
                        if cache.lock().unwrap_or_else(PoisonError::into_inner).contains_key(&peripheral) {
                            let _ = events.unbounded_send(TransportEvent::Disconnected { peripheral, reason: None });
                        }
                    },
                    Some(_) => {},
                    None => break 'mainloop,
                },
            }
        }
    })
}

fn read_notifications_task(cancel: CancellationToken, peripheral: &Peripheral, events: UnboundedSender<TransportEvent>) -> JoinHandle<()> {
    let peripheral_clone = peripheral.clone();

    spawn(async move {
        if let Err(err) = read_notifications(cancel, peripheral_clone, events).await {
            warn!("Reading notifications failed: {}", err);
        }
    })
}

async fn read_notifications(cancel: CancellationToken, peripheral: Peripheral, events: UnboundedSender<TransportEvent>) -> Result<(), TransportError> {
    let mut notification_stream = peripheral.notifications().await?;

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            data = notification_stream.next() => {
                let Some(data) = data else {
                    break 'mainloop;
                };

                let service = peripheral
                    .characteristics()
                    .iter()
                    .find(|characteristic| characteristic.uuid == data.uuid)
                    .map(|characteristic| characteristic.service_uuid);

                match service {
                    Some(service) => {
                        let characteristic = CharacteristicRef { service, uuid: data.uuid };
                        let _ = events.unbounded_send(TransportEvent::ValueUpdate { characteristic, value: data.value });
                    },
                    None => debug!("Notification from undiscovered characteristic {}", data.uuid),
                }
            }
        }
    }

    Ok(())
}

fn find_characteristic(peripheral: &Peripheral, characteristic: &CharacteristicRef) -> Result<Characteristic, TransportError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service)
        .ok_or(TransportError::MissingCharacteristic(characteristic.uuid))
}

/// [`Transport`] on top of btleplug. Every operation is spawned on the tokio runtime and reports
/// back through the event sender.
pub struct BtleTransport {
    adapter: Option<Adapter>,
    events: UnboundedSender<TransportEvent>,
    peripherals: PeripheralCache,
    cancel: CancellationToken,
    scan_cancel: Option<CancellationToken>,
    link_cancel: Option<CancellationToken>,
}

impl BtleTransport {
    /// Picks the first adapter. Without one the transport stays powered off.
    pub async fn new(events: UnboundedSender<TransportEvent>, cancel: CancellationToken) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?.into_iter().next();
        let peripherals: PeripheralCache = Arc::default();

        match &adapter {
            Some(adapter) => {
                info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

                match adapter.peripherals().await {
                    Ok(known) => {
                        let mut cache = peripherals.lock().unwrap_or_else(PoisonError::into_inner);
                        for peripheral in known {
                            cache.insert(peripheral_key(&peripheral.id()), peripheral);
                        }
                    },
                    Err(err) => warn!("Failed to query BLE adapter for peripherals: {}", err),
                }

                watch_disconnects_task(cancel.child_token(), adapter.clone(), peripherals.clone(), events.clone());
                let _ = events.unbounded_send(TransportEvent::PoweredOn);
            },
            None => {
                warn!("No bluetooth adapter found");
                let _ = events.unbounded_send(TransportEvent::PoweredOff);
            },
        }

        Ok(BtleTransport { adapter, events, peripherals, cancel, scan_cancel: None, link_cancel: None })
    }

    pub fn adapter(&self) -> Option<&Adapter> {
        self.adapter.as_ref()
    }

    /// A registry that picks with this transport's adapter and shares its peripheral cache.
    pub fn registry(&self, config_io: ConfigIO, events: UnboundedSender<AccessoryEvent>, picker_timeout: Duration) -> BtleAccessoryRegistry {
        BtleAccessoryRegistry {
            config_io,
            adapter: self.adapter.clone(),
            peripherals: self.peripherals.clone(),
            events,
            picker_timeout,
        }
    }

    fn peripheral(&self, id: &PeripheralId) -> Option<Peripheral> {
        self.peripherals.lock().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    fn cancel_link(&mut self) {
        if let Some(link) = self.link_cancel.take() {
            link.cancel();
        }
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Transport for BtleTransport {
    fn is_powered(&self) -> bool {
        self.adapter.is_some()
    }

    fn retrieve_known(&mut self, identity: &AccessoryIdentity) -> Option<PeripheralId> {
        self.peripheral(&identity.id).map(|_| identity.id.clone())
    }

    fn scan(&mut self, service_filter: &[Uuid]) {
        let Some(adapter) = self.adapter.clone() else {
            return;
        };

        self.stop_scan();
        let cancel = self.cancel.child_token();
        self.scan_cancel = Some(cancel.clone());

        let descriptor = PickerDescriptor { services: service_filter.to_vec(), ..PickerDescriptor::ring() };
        let cache = self.peripherals.clone();
        let events = self.events.clone();
        spawn(async move {
            if let Err(err) = scan_task(cancel, adapter, descriptor, cache, events).await {
                warn!("Scanning failed: {}", err);
            }
        });
    }

    fn stop_scan(&mut self) {
        if let Some(scan) = self.scan_cancel.take() {
            scan.cancel();
        }
    }

    fn connect(&mut self, id: &PeripheralId, options: ConnectOptions) {
        let Some(peripheral) = self.peripheral(id) else {
            let reason = TransportError::UnknownPeripheral(id.to_string()).to_string();
            let _ = self.events.unbounded_send(TransportEvent::ConnectFailed { peripheral: id.clone(), reason });
            return;
        };

        self.cancel_link();
        let link = self.cancel.child_token();
        self.link_cancel = Some(link.clone());

        let id = id.clone();
        let events = self.events.clone();
        let cache = self.peripherals.clone();
        spawn(async move {
            let cancelled = || TransportEvent::ConnectFailed { peripheral: id.clone(), reason: "connect cancelled".to_string() };

            tokio::select! {
                _ = link.cancelled() => {
                    let _ = events.unbounded_send(cancelled());
                    return;
                },
                _ = sleep(options.start_delay) => {},
            }

            let result = tokio::select! {
                _ = link.cancelled() => {
                    let _ = events.unbounded_send(cancelled());
                    return;
                },
                result = peripheral.connect() => result,
            };

            match result {
                Ok(()) => {
                    read_notifications_task(link, &peripheral, events.clone());
                    let _ = events.unbounded_send(TransportEvent::Connected(id));
                },
                Err(err) => {
                    // If a peripheral fails to connect it might be because of the error:
                    //   Btle { source: Other("Error { code: HRESULT(0x80000013), message: \"The object has been closed.\" }") }
                    // In which case we have to obtain a new Peripheral, so forget this one and let the session scan
                    cache.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
                    let _ = events.unbounded_send(TransportEvent::ConnectFailed { peripheral: id, reason: err.to_string() });
                },
            }
        });
    }

    fn disconnect(&mut self, id: &PeripheralId) {
        self.cancel_link();
        let Some(peripheral) = self.peripheral(id) else {
            return;
        };

        let id = id.clone();
        let events = self.events.clone();
        spawn(async move {
            match peripheral.disconnect().await {
                Ok(()) => {
                    let _ = events.unbounded_send(TransportEvent::Disconnected { peripheral: id, reason: Some("disconnected by host".to_string()) });
                },
                Err(err) => warn!("Failed to disconnect from peripheral {}: {}", id, err),
            }
        });
    }

    fn discover_services(&mut self, id: &PeripheralId, services: &[Uuid]) {
        let Some(peripheral) = self.peripheral(id) else {
            return;
        };

        let id = id.clone();
        let wanted = services.to_vec();
        let events = self.events.clone();
        spawn(async move {
            let services = match peripheral.discover_services().await {
                Ok(()) => Ok(peripheral
                    .services()
                    .into_iter()
                    .map(|service| service.uuid)
                    .filter(|uuid| wanted.is_empty() || wanted.contains(uuid))
                    .collect()),
                Err(err) => Err(err.to_string()),
            };
            let _ = events.unbounded_send(TransportEvent::ServicesDiscovered { peripheral: id, services });
        });
    }

    fn discover_characteristics(&mut self, id: &PeripheralId, service: Uuid, characteristics: &[Uuid]) {
        let Some(peripheral) = self.peripheral(id) else {
            return;
        };

        // btleplug resolves characteristics together with services
        let found = peripheral
            .services()
            .into_iter()
            .find(|candidate| candidate.uuid == service)
            .map(|service| {
                service
                    .characteristics
                    .iter()
                    .filter(|c| characteristics.is_empty() || characteristics.contains(&c.uuid))
                    .map(|c| CharacteristicRef { service: c.service_uuid, uuid: c.uuid })
                    .collect()
            })
            .ok_or_else(|| format!("service {} not discovered", service));

        let _ = self.events.unbounded_send(TransportEvent::CharacteristicsDiscovered { peripheral: id.clone(), service, characteristics: found });
    }

    fn set_notify(&mut self, id: &PeripheralId, characteristic: &CharacteristicRef, enabled: bool) {
        let Some(peripheral) = self.peripheral(id) else {
            return;
        };

        let characteristic = match find_characteristic(&peripheral, characteristic) {
            Ok(characteristic) => characteristic,
            Err(err) => {
                warn!("Cannot change notifications: {}", err);
                return;
            },
        };

        spawn(async move {
            info!("Subscribing to characteristic {:?} {:?}", characteristic.service_uuid, characteristic.uuid);
            let result = if enabled {
                peripheral.subscribe(&characteristic).await
            } else {
                peripheral.unsubscribe(&characteristic).await
            };
            if let Err(err) = result {
                warn!("Failed to change notifications for characteristic {}: {}", characteristic.uuid, err);
            }
        });
    }

    fn write(&mut self, id: &PeripheralId, characteristic: &CharacteristicRef, bytes: &[u8], with_response: bool) {
        let Some(peripheral) = self.peripheral(id) else {
            return;
        };

        let reference = *characteristic;
        let characteristic = match find_characteristic(&peripheral, characteristic) {
            Ok(characteristic) => characteristic,
            Err(err) => {
                let _ = self.events.unbounded_send(TransportEvent::WriteAck { characteristic: reference, result: Err(err.to_string()) });
                return;
            },
        };

        let bytes = bytes.to_vec();
        let write_type = if with_response { WriteType::WithResponse } else { WriteType::WithoutResponse };
        let events = self.events.clone();
        spawn(async move {
            let fut = peripheral.write(&characteristic, &bytes, write_type);

            let result = tokio::select! {
                _ = sleep(Duration::from_millis(WRITE_DEADLINE)) => {
                    Err("Sending to write characteristic took too long".to_string())
                }
                result = fut => result.map_err(|err| err.to_string()),
            };
            let _ = events.unbounded_send(TransportEvent::WriteAck { characteristic: reference, result });
        });
    }

    fn release(&mut self) {
        info!("Releasing bluetooth transport");
        self.stop_scan();
        self.cancel_link();
        self.peripherals.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Remembers the ring in the config file and picks a new one by scanning.
pub struct BtleAccessoryRegistry {
    config_io: ConfigIO,
    adapter: Option<Adapter>,
    peripherals: PeripheralCache,
    events: UnboundedSender<AccessoryEvent>,
    picker_timeout: Duration,
}

impl BtleAccessoryRegistry {
    async fn pick(&self, adapter: &Adapter, descriptor: &PickerDescriptor) -> Result<AccessoryIdentity, AccessoryError> {
        let mut central_events = adapter.events().await.map_err(TransportError::from)?;
        info!("Looking for {}...", descriptor.name);
        adapter.start_scan(ScanFilter { services: descriptor.services.clone() }).await.map_err(TransportError::from)?;

        let search = async {
            while let Some(event) = central_events.next().await {
                if let CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) = event {
                    if let Some((peripheral, discovered)) = match_peripheral(adapter, &id, descriptor).await {
                        self.peripherals.lock().unwrap_or_else(PoisonError::into_inner).insert(discovered.id.clone(), peripheral);
                        return Some(AccessoryIdentity {
                            id: discovered.id,
                            display_name: discovered.local_name.unwrap_or_else(|| descriptor.name.clone()),
                        });
                    }
                }
            }
            None
        };
        let found = timeout(self.picker_timeout, search).await.ok().flatten();

        if let Err(err) = adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", err);
        }
        found.ok_or(AccessoryError::NotFound)
    }
}

impl AccessoryRegistry for BtleAccessoryRegistry {
    async fn accessories(&self) -> Result<Vec<AccessoryIdentity>, AccessoryError> {
        Ok(self.config_io.read().await?.accessory.into_iter().collect())
    }

    async fn present_picker(&self, descriptor: &PickerDescriptor) -> Result<AccessoryIdentity, AccessoryError> {
        let adapter = self.adapter.as_ref().ok_or(TransportError::NoAdapter)?;

        let _ = self.events.unbounded_send(AccessoryEvent::PickerPresented);
        let picked = self.pick(adapter, descriptor).await;
        let _ = self.events.unbounded_send(AccessoryEvent::PickerDismissed);
        let identity = picked?;

        let previous = self.config_io.read().await?.accessory;
        self.config_io.update(|config| config.accessory = Some(identity.clone())).await?;
        info!("Paired with {} ({})", identity.display_name, identity.id);

        let event = match previous {
            Some(previous) if previous.id == identity.id => AccessoryEvent::Changed(identity.clone()),
            _ => AccessoryEvent::Added(identity.clone()),
        };
        let _ = self.events.unbounded_send(event);
        Ok(identity)
    }

    async fn remove_accessory(&self, identity: &AccessoryIdentity) -> Result<(), AccessoryError> {
        let config = self.config_io.read().await?;
        if config.accessory.as_ref().map(|current| &current.id) != Some(&identity.id) {
            return Err(AccessoryError::NoAccessory);
        }

        self.config_io.update(|config| config.accessory = None).await?;
        self.peripherals.lock().unwrap_or_else(PoisonError::into_inner).remove(&identity.id);
        info!("Forgot {} ({})", identity.display_name, identity.id);
        let _ = self.events.unbounded_send(AccessoryEvent::Removed(identity.clone()));
        Ok(())
    }
}
