use btleplug::{
    api::{Central as _, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{collections::HashMap, future::Future, sync::Arc};
use tokio::{
    runtime::Handle,
    sync::{watch, Mutex},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Activ5Error, Result},
    transport::{ChannelHandle, EventSink, Transport, TransportEvent},
    types::{PeripheralKey, RadioState},
};

type PeripheralMap = Arc<Mutex<HashMap<PeripheralKey, Peripheral>>>;

/// [`Transport`] backed by the first Bluetooth adapter btleplug finds
///
/// Requests run as tasks on the current tokio runtime. Central events and
/// characteristic notifications are pumped into the [`EventSink`] given at
/// construction.
pub struct BtleplugTransport {
    central: Adapter,
    sink: EventSink,
    radio: watch::Sender<RadioState>,
    peripherals: PeripheralMap,
}

impl BtleplugTransport {
    /// Open the first adapter and start pumping its events into `sink`
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::RadioUnavailable`] if no Bluetooth adapter is
    /// present, or [`Activ5Error::Ble`] if the adapter cannot be initialized.
    pub async fn new(sink: EventSink) -> Result<Arc<Self>> {
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Activ5Error::RadioUnavailable)?;

        let state = central
            .adapter_state()
            .await
            .map(RadioState::from)
            .unwrap_or_default();
        info!("Using Bluetooth adapter, radio {}", state);

        let events = central.events().await?;
        let (radio, _) = watch::channel(state);
        let transport = Arc::new(Self {
            central,
            sink,
            radio,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        });

        let pump = transport.clone();
        tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.next().await {
                pump.handle_central_event(event).await;
            }
            debug!("Central event stream ended");
        });

        Ok(transport)
    }

    async fn handle_central_event(&self, event: CentralEvent) {
        match event {
            CentralEvent::StateUpdate(state) => {
                let state = RadioState::from(state);
                self.radio.send_replace(state);
                self.sink.publish(TransportEvent::RadioStateChanged(state));
            }
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let peripheral = match self.central.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(e) => {
                        debug!("Discovered peripheral vanished: {}", e);
                        return;
                    }
                };
                let properties = peripheral.properties().await.ok().flatten();
                let key = peripheral_key(&id);
                self.peripherals.lock().await.insert(key.clone(), peripheral);

                self.sink.publish(TransportEvent::Discovered {
                    peripheral: key,
                    name: properties.as_ref().and_then(|p| p.local_name.clone()),
                    rssi: properties.and_then(|p| p.rssi),
                });
            }
            CentralEvent::DeviceDisconnected(id) => {
                self.sink.publish(TransportEvent::Disconnected {
                    peripheral: peripheral_key(&id),
                    reason: None,
                });
            }
            _ => {}
        }
    }

    fn spawn_central<F, Fut>(&self, operation: &'static str, f: F) -> Result<()>
    where
        F: FnOnce(Adapter) -> Fut + Send + 'static,
        Fut: Future<Output = btleplug::Result<()>> + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|e| Activ5Error::Transport(e.to_string()))?;
        let central = self.central.clone();
        runtime.spawn(async move {
            if let Err(e) = f(central).await {
                warn!("{} failed: {}", operation, e);
            }
        });
        Ok(())
    }

    /// Run a request against a known peripheral
    ///
    /// If the peripheral is unknown or the request fails, `on_failure` maps
    /// the key and reason to the event published in its place.
    fn spawn_peripheral<F, Fut, E>(
        &self,
        key: &PeripheralKey,
        operation: &'static str,
        f: F,
        on_failure: E,
    ) -> Result<()>
    where
        F: FnOnce(Peripheral, PeripheralKey, EventSink) -> Fut + Send + 'static,
        Fut: Future<Output = btleplug::Result<()>> + Send + 'static,
        E: FnOnce(PeripheralKey, String) -> Option<TransportEvent> + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|e| Activ5Error::Transport(e.to_string()))?;
        let peripherals = self.peripherals.clone();
        let sink = self.sink.clone();
        let key = key.clone();
        runtime.spawn(async move {
            let found = peripherals.lock().await.get(&key).cloned();
            settle(found, key, operation, sink, f, on_failure).await;
        });
        Ok(())
    }
}

/// Run `f` on the looked-up peripheral and publish `on_failure`'s event if
/// the lookup or the request fails
async fn settle<P, F, Fut, E>(
    found: Option<P>,
    key: PeripheralKey,
    operation: &'static str,
    sink: EventSink,
    f: F,
    on_failure: E,
) where
    F: FnOnce(P, PeripheralKey, EventSink) -> Fut,
    Fut: Future<Output = btleplug::Result<()>>,
    E: FnOnce(PeripheralKey, String) -> Option<TransportEvent>,
{
    let outcome = match found {
        Some(peripheral) => f(peripheral, key.clone(), sink.clone())
            .await
            .map_err(|e| e.to_string()),
        None => Err(format!("unknown peripheral {key}")),
    };
    if let Err(reason) = outcome {
        warn!("{} on {} failed: {}", operation, key, reason);
        if let Some(event) = on_failure(key, reason) {
            sink.publish(event);
        }
    }
}

impl Transport for BtleplugTransport {
    fn radio_state(&self) -> RadioState {
        *self.radio.borrow()
    }

    fn start_discovery(&self, services: &[Uuid]) -> Result<()> {
        let filter = ScanFilter {
            services: services.to_vec(),
        };
        self.spawn_central("start scan", move |central| async move { central.start_scan(filter).await })
    }

    fn stop_discovery(&self) -> Result<()> {
        self.spawn_central("stop scan", |central| async move { central.stop_scan().await })
    }

    fn connect(&self, peripheral: &PeripheralKey) -> Result<()> {
        self.spawn_peripheral(
            peripheral,
            "connect",
            |peripheral, key, sink| async move {
                peripheral.connect().await?;
                sink.publish(TransportEvent::Connected { peripheral: key });
                Ok(())
            },
            |peripheral, reason| Some(connect_failed(peripheral, reason)),
        )
    }

    fn disconnect(&self, peripheral: &PeripheralKey) -> Result<()> {
        self.spawn_peripheral(
            peripheral,
            "disconnect",
            |peripheral, _, _| async move { peripheral.disconnect().await },
            |_, _| None,
        )
    }

    fn discover_services(&self, peripheral: &PeripheralKey) -> Result<()> {
        self.spawn_peripheral(
            peripheral,
            "service discovery",
            |peripheral, key, sink| async move {
                peripheral.discover_services().await?;

                let services = peripheral.services();
                sink.publish(TransportEvent::ServicesDiscovered {
                    peripheral: key.clone(),
                    services: services.iter().map(|service| service.uuid).collect(),
                });

                let characteristics: Vec<ChannelHandle> = peripheral.characteristics().iter().map(channel_handle).collect();
                let owners: HashMap<Uuid, Uuid> = characteristics
                    .iter()
                    .map(|handle| (handle.uuid, handle.service_uuid))
                    .collect();
                sink.publish(TransportEvent::CharacteristicsDiscovered {
                    peripheral: key.clone(),
                    characteristics,
                });

                let mut notifications = peripheral.notifications().await?;
                tokio::spawn(async move {
                    while let Some(notification) = notifications.next().await {
                        let Some(&service_uuid) = owners.get(&notification.uuid) else {
                            debug!("Notification from undiscovered characteristic {}", notification.uuid);
                            continue;
                        };
                        sink.publish(TransportEvent::ValueUpdated {
                            peripheral: key.clone(),
                            channel: ChannelHandle::new(notification.uuid, service_uuid),
                            value: Some(Bytes::from(notification.value)),
                        });
                    }
                    debug!("Notification stream for {} ended", key);
                });
                Ok(())
            },
            |_, _| None,
        )
    }

    fn read(&self, peripheral: &PeripheralKey, channel: &ChannelHandle) -> Result<()> {
        let channel = *channel;
        self.spawn_peripheral(
            peripheral,
            "read",
            move |peripheral, key, sink| async move {
                let characteristic = find_characteristic(&peripheral, &channel)?;
                let value = peripheral.read(&characteristic).await?;
                sink.publish(TransportEvent::ValueUpdated {
                    peripheral: key,
                    channel,
                    value: Some(Bytes::from(value)),
                });
                Ok(())
            },
            // A failed read still reaches the manager, without a value
            move |peripheral, _| {
                Some(TransportEvent::ValueUpdated {
                    peripheral,
                    channel,
                    value: None,
                })
            },
        )
    }

    fn write(&self, peripheral: &PeripheralKey, channel: &ChannelHandle, data: Bytes) -> Result<()> {
        let channel = *channel;
        self.spawn_peripheral(
            peripheral,
            "write",
            move |peripheral, _, _| async move {
                let characteristic = find_characteristic(&peripheral, &channel)?;
                debug!("Writing {:02X?} to {}", &data[..], channel.uuid);
                peripheral.write(&characteristic, &data, WriteType::WithResponse).await
            },
            move |peripheral, reason| Some(write_failed(peripheral, channel, reason)),
        )
    }

    fn set_notify(&self, peripheral: &PeripheralKey, channel: &ChannelHandle, enabled: bool) -> Result<()> {
        let channel = *channel;
        self.spawn_peripheral(
            peripheral,
            "notify toggle",
            move |peripheral, _, _| async move {
                let characteristic = find_characteristic(&peripheral, &channel)?;
                if enabled {
                    peripheral.subscribe(&characteristic).await
                } else {
                    peripheral.unsubscribe(&characteristic).await
                }
            },
            move |peripheral, reason| Some(write_failed(peripheral, channel, reason)),
        )
    }
}

fn peripheral_key(id: &PeripheralId) -> PeripheralKey {
    PeripheralKey(format!("{id:?}"))
}

fn connect_failed(peripheral: PeripheralKey, reason: String) -> TransportEvent {
    TransportEvent::ConnectFailed {
        peripheral,
        reason: Some(reason),
    }
}

fn write_failed(peripheral: PeripheralKey, channel: ChannelHandle, reason: String) -> TransportEvent {
    TransportEvent::WriteFailed {
        peripheral,
        channel,
        reason,
    }
}

fn channel_handle(characteristic: &Characteristic) -> ChannelHandle {
    ChannelHandle::new(characteristic.uuid, characteristic.service_uuid)
}

fn find_characteristic(peripheral: &Peripheral, channel: &ChannelHandle) -> btleplug::Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|characteristic| channel_handle(characteristic) == *channel)
        .ok_or(btleplug::Error::NoSuchCharacteristic)
}
