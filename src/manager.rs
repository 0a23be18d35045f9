use crate::{
    error::{Activ5Error, Result},
    events::{DeviceEvent, DeviceObserver, EventEmitter, MainQueue, ObserverSlot, SIGNAL_CAPACITY},
    protocol::{decode, Channel, Command, MessageKind},
    session::DeviceSession,
    squeeze::{SqueezeDetector, SqueezeSignal},
    transport::{ChannelHandle, EventSink, Inbox, Input, Transport, TransportEvent},
    types::{
        ConnectionState, DeviceInfo, ManagerConnectionState, ManagerOptions, PeripheralKey, RadioState, ReconnectPolicy,
        SqueezeState,
    },
};
use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::{broadcast, oneshot, Mutex, RwLock},
    task::JoinHandle,
    time,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Registry of Activ5 device sessions driven by transport events
///
/// The manager consumes [`Input`]s on one background task ([`Self::run`]) and
/// emits [`DeviceEvent`]s into the [`MainQueue`] returned by [`Self::new`].
/// Public methods may be called from any task; registry mutation is
/// serialized behind a single lock.
pub struct SessionManager<T: Transport> {
    transport: Arc<T>,
    sink: EventSink,
    emitter: EventEmitter,
    observer: ObserverSlot,
    signals: broadcast::Sender<DeviceEvent>,
    registry: Mutex<Registry>,
}

struct Registry {
    sessions: HashMap<String, DeviceSession>,
    options: ManagerOptions,
    scan: Option<Scan>,
    scan_generation: u64,
}

struct Scan {
    generation: u64,
    timer: JoinHandle<()>,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Registry {
    fn session_mut(&mut self, peripheral: &PeripheralKey) -> Option<&mut DeviceSession> {
        self.sessions
            .values_mut()
            .find(|session| session.peripheral() == peripheral)
    }

    fn name_of(&self, peripheral: &PeripheralKey) -> Option<String> {
        self.sessions
            .values()
            .find(|session| session.peripheral() == peripheral)
            .map(|session| session.name().to_string())
    }

    fn detector(&self) -> SqueezeDetector {
        SqueezeDetector::new(
            self.options.squeeze_threshold,
            Duration::from_millis(self.options.squeeze_timeout_ms),
        )
    }
}

impl<T: Transport> SessionManager<T> {
    /// Create a manager and the queue that delivers its events
    ///
    /// `sink` must feed the [`Inbox`] later passed to [`Self::run`]; it is
    /// also the sink the transport publishes into.
    #[must_use]
    pub fn new(transport: Arc<T>, options: ManagerOptions, sink: EventSink) -> (Arc<Self>, MainQueue) {
        let observer: ObserverSlot = Arc::new(RwLock::new(None));
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        let (emitter, queue) = MainQueue::channel(observer.clone(), signals.clone());

        let manager = Arc::new(Self {
            transport,
            sink,
            emitter,
            observer,
            signals,
            registry: Mutex::new(Registry {
                sessions: HashMap::new(),
                options,
                scan: None,
                scan_generation: 0,
            }),
        });
        (manager, queue)
    }

    /// Process inputs until every sink is dropped
    pub async fn run(self: Arc<Self>, mut inbox: Inbox) {
        while let Some(input) = inbox.recv().await {
            self.process(input).await;
        }
        debug!("Manager inbox closed");
    }

    /// Handle a single work item
    pub async fn process(&self, input: Input) {
        match input {
            Input::Transport(event) => self.handle_transport(event).await,
            Input::ScanTimeout { generation } => self.handle_scan_timeout(generation).await,
            Input::KeepAlive { device } => {
                let mut registry = self.registry.lock().await;
                let Some(session) = registry.sessions.get_mut(&device) else {
                    debug!("Keep-alive for untracked device {}", device);
                    return;
                };
                if let Err(e) = session.keep_alive_tick(&*self.transport) {
                    warn!("Keep-alive for {} failed: {}", device, e);
                }
            }
            Input::SqueezeTimeout { device } => {
                if let Some(session) = self.registry.lock().await.sessions.get_mut(&device) {
                    session.expire_squeeze();
                }
            }
        }
    }

    /// Register the observer; only a weak reference is kept
    pub async fn set_observer<O: DeviceObserver + 'static>(&self, observer: &Arc<O>) {
        let observer: Weak<dyn DeviceObserver> = Arc::downgrade(observer) as Weak<O>;
        *self.observer.write().await = Some(observer);
    }

    /// Remove the observer
    pub async fn clear_observer(&self) {
        *self.observer.write().await = None;
    }

    /// Receive every event after the observer has seen it
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.signals.subscribe()
    }

    /// Current configuration
    pub async fn options(&self) -> ManagerOptions {
        self.registry.lock().await.options.clone()
    }

    /// Services discovery is filtered by
    pub async fn services(&self) -> Vec<Uuid> {
        self.registry.lock().await.options.services.clone()
    }

    /// Replace the configuration
    ///
    /// Squeeze thresholds and window apply to every tracked session at once.
    pub async fn set_options(&self, options: ManagerOptions) {
        let mut registry = self.registry.lock().await;
        let window = Duration::from_millis(options.squeeze_timeout_ms);
        for session in registry.sessions.values_mut() {
            session.set_squeeze_threshold(options.squeeze_threshold, window);
        }
        registry.options = options;
    }

    /// Start discovery
    ///
    /// The returned receiver resolves once the scan timeout elapses. Calling
    /// this while a scan is active restarts the timeout without restarting
    /// discovery; every pending receiver resolves together.
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::RadioUnavailable`] if the radio is not powered
    /// on; observers are told through `radio_switched_off` as well.
    pub async fn scan(&self) -> Result<oneshot::Receiver<()>> {
        let (waiter, completed) = oneshot::channel();
        let mut registry = self.registry.lock().await;
        self.start_scan(&mut registry, Some(waiter))?;
        Ok(completed)
    }

    /// Cancel discovery and its timeout; idempotent
    ///
    /// # Errors
    ///
    /// Returns an error if the stop request cannot be queued.
    pub async fn stop_scan(&self) -> Result<()> {
        if let Some(scan) = self.registry.lock().await.scan.take() {
            info!("Scan cancelled");
            scan.timer.abort();
        }
        self.transport.stop_discovery()
    }

    /// Whether a scan is active
    pub async fn is_scanning(&self) -> bool {
        self.registry.lock().await.scan.is_some()
    }

    /// Whether the radio is powered on
    #[must_use]
    pub fn is_radio_on(&self) -> bool {
        self.transport.radio_state() == RadioState::PoweredOn
    }

    /// Radio power state as last reported by the transport
    #[must_use]
    pub fn radio_state(&self) -> RadioState {
        self.transport.radio_state()
    }

    /// Aggregate state: searching wins over connected
    pub async fn connection_state(&self) -> ManagerConnectionState {
        let registry = self.registry.lock().await;
        if registry.scan.is_some() {
            ManagerConnectionState::Searching
        } else if registry.sessions.values().any(DeviceSession::is_connected) {
            ManagerConnectionState::Connected
        } else {
            ManagerConnectionState::Disconnected
        }
    }

    /// Snapshots of every tracked session
    pub async fn devices(&self) -> Vec<DeviceInfo> {
        let registry = self.registry.lock().await;
        let mut devices: Vec<_> = registry.sessions.values().map(DeviceSession::info).collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    /// Snapshots of every connected session
    pub async fn connected_devices(&self) -> Vec<DeviceInfo> {
        let mut devices = self.devices().await;
        devices.retain(DeviceInfo::connected);
        devices
    }

    /// Snapshot of one session
    pub async fn device(&self, name: &str) -> Option<DeviceInfo> {
        self.registry.lock().await.sessions.get(name).map(DeviceSession::info)
    }

    /// Request a connection to a peripheral
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be queued.
    pub async fn connect(&self, peripheral: &PeripheralKey) -> Result<()> {
        let mut registry = self.registry.lock().await;
        self.transport.connect(peripheral)?;
        if let Some(session) = registry.session_mut(peripheral) {
            info!("Connecting to {}", session.name());
            session.set_state(ConnectionState::Connecting);
        }
        Ok(())
    }

    /// Request a connection to a tracked device by name
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::DeviceNotFound`] for unknown names.
    pub async fn connect_device(&self, name: &str) -> Result<()> {
        let peripheral = self
            .registry
            .lock()
            .await
            .sessions
            .get(name)
            .map(|session| session.peripheral().clone())
            .ok_or_else(|| Activ5Error::DeviceNotFound(name.to_string()))?;
        self.connect(&peripheral).await
    }

    /// Disconnect every connected device and forget it once the link closes
    pub async fn disconnect_all(&self) {
        let mut registry = self.registry.lock().await;
        for session in registry.sessions.values_mut().filter(|session| session.is_connected()) {
            session.set_forget_after_disconnect();
            if let Err(e) = self.transport.disconnect(session.peripheral()) {
                warn!("Failed to disconnect {}: {}", session.name(), e);
            }
        }
    }

    /// Disconnect one device; it is not reconnected automatically
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::DeviceNotFound`] for unknown names.
    pub async fn disconnect_device(&self, name: &str) -> Result<()> {
        self.with_session(name, |session, transport| session.disconnect(transport))
            .await
    }

    /// Send a text command to a device
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::DeviceNotFound`] for unknown names.
    pub async fn send_command(&self, name: &str, command: Command) -> Result<()> {
        self.with_session(name, |session, transport| session.issue_command(transport, command))
            .await
    }

    /// Start force streaming on a device
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::DeviceNotFound`] for unknown names.
    pub async fn start_force_streaming(&self, name: &str) -> Result<()> {
        self.with_session(name, |session, transport| session.start_force_streaming(transport))
            .await
    }

    /// Stop force streaming on a device
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::DeviceNotFound`] for unknown names.
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.with_session(name, |session, transport| session.stop(transport))
            .await
    }

    /// Start IMU streaming on a device
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::DeviceNotFound`] for unknown names and
    /// [`Activ5Error::Unsupported`] without a motion channel.
    pub async fn start_motion_streaming(&self, name: &str) -> Result<()> {
        self.with_session(name, |session, transport| session.start_motion_streaming(transport))
            .await
    }

    /// Stop IMU streaming on a device
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::DeviceNotFound`] for unknown names and
    /// [`Activ5Error::Unsupported`] without a motion channel.
    pub async fn stop_motion_streaming(&self, name: &str) -> Result<()> {
        self.with_session(name, |session, transport| session.stop_motion_streaming(transport))
            .await
    }

    /// Last battery percentage of a device
    ///
    /// # Errors
    ///
    /// See [`DeviceSession::read_battery_level`].
    pub async fn read_battery_level(&self, name: &str) -> Result<u64> {
        self.with_session(name, |session, transport| session.read_battery_level(transport))
            .await
    }

    /// Serial number of a device
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::DeviceNotFound`] for unknown names.
    pub async fn read_serial_number(&self, name: &str) -> Result<Option<String>> {
        self.with_session(name, |session, _| Ok(session.read_serial_number()))
            .await
    }

    /// Set the sample interval of a device
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::DeviceNotFound`] for unknown names.
    pub async fn set_sample_rate(&self, name: &str, interval_ms: i16) -> Result<()> {
        self.with_session(name, |session, transport| session.set_sample_rate(transport, interval_ms))
            .await
    }

    /// Toggle the evergreen keep-alive of a device
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::DeviceNotFound`] for unknown names.
    pub async fn set_evergreen(&self, name: &str, enabled: bool) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let period = Duration::from_millis(registry.options.keep_alive_interval_ms);
        let session = registry
            .sessions
            .get_mut(name)
            .ok_or_else(|| Activ5Error::DeviceNotFound(name.to_string()))?;
        session.set_keep_alive(enabled, &self.sink, period);
        Ok(())
    }

    async fn with_session<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut DeviceSession, &dyn Transport) -> Result<R>,
    ) -> Result<R> {
        let mut registry = self.registry.lock().await;
        let session = registry
            .sessions
            .get_mut(name)
            .ok_or_else(|| Activ5Error::DeviceNotFound(name.to_string()))?;
        f(session, &*self.transport)
    }

    fn start_scan(&self, registry: &mut Registry, waiter: Option<oneshot::Sender<()>>) -> Result<()> {
        if self.transport.radio_state() != RadioState::PoweredOn {
            warn!("Scan requested while the radio is off");
            self.emitter.emit(DeviceEvent::RadioSwitchedOff);
            return Err(Activ5Error::RadioUnavailable);
        }

        match registry.scan.as_ref() {
            Some(scan) => {
                debug!("Scan already active, restarting timeout");
                scan.timer.abort();
            }
            None => {
                info!("Starting scan for Activ5 devices...");
                self.transport.start_discovery(&registry.options.services)?;
            }
        }

        registry.scan_generation += 1;
        let generation = registry.scan_generation;
        let timeout = Duration::from_millis(registry.options.scan_timeout_ms);
        let sink = self.sink.clone();
        let timer = tokio::spawn(async move {
            time::sleep(timeout).await;
            sink.post(Input::ScanTimeout { generation });
        });

        let mut waiters = registry.scan.take().map(|scan| scan.waiters).unwrap_or_default();
        waiters.extend(waiter);
        registry.scan = Some(Scan {
            generation,
            timer,
            waiters,
        });
        Ok(())
    }

    async fn handle_scan_timeout(&self, generation: u64) {
        let mut registry = self.registry.lock().await;
        let Some(scan) = registry.scan.take_if(|scan| scan.generation == generation) else {
            debug!("Ignoring stale scan timeout");
            return;
        };
        drop(registry);

        if let Err(e) = self.transport.stop_discovery() {
            warn!("Failed to stop discovery: {}", e);
        }
        info!("Scan completed");
        self.emitter.emit(DeviceEvent::SearchCompleted);
        for waiter in scan.waiters {
            // Receiver may have been dropped
            let _ = waiter.send(());
        }
    }

    async fn handle_transport(&self, event: TransportEvent) {
        match event {
            TransportEvent::RadioStateChanged(state) => self.handle_radio_state(state).await,
            TransportEvent::Discovered { peripheral, name, rssi } => {
                let Some(name) = name else {
                    return;
                };
                self.handle_discovered(peripheral, name, rssi.map_or(0.0, f64::from))
                    .await;
            }
            TransportEvent::Connected { peripheral } => self.handle_connected(&peripheral).await,
            TransportEvent::ConnectFailed { peripheral, reason } => {
                let mut registry = self.registry.lock().await;
                if let Some(session) = registry.session_mut(&peripheral) {
                    warn!("Failed to connect to {}: {:?}", session.name(), reason);
                    // A failed attempt must not pin the session in Connecting
                    if session.state() == ConnectionState::Connecting {
                        session.set_state(ConnectionState::Disconnected);
                    }
                    self.emitter.emit(DeviceEvent::ConnectFailed {
                        device: session.info(),
                        reason,
                    });
                }
            }
            TransportEvent::Disconnected { peripheral, reason } => {
                self.handle_disconnected(&peripheral, reason.as_deref()).await;
            }
            TransportEvent::ServicesDiscovered { peripheral, services } => {
                if let Some(session) = self.registry.lock().await.session_mut(&peripheral) {
                    session.set_services(&services);
                }
            }
            TransportEvent::CharacteristicsDiscovered {
                peripheral,
                characteristics,
            } => self.handle_characteristics(&peripheral, characteristics).await,
            TransportEvent::WriteFailed {
                peripheral,
                channel,
                reason,
            } => {
                if let Some(session) = self.registry.lock().await.session_mut(&peripheral) {
                    warn!("Write to {} on {} failed: {}", channel.channel(), session.name(), reason);
                    self.emitter.emit(DeviceEvent::WriteFailed {
                        device: session.info(),
                        reason,
                    });
                }
            }
            TransportEvent::ValueUpdated {
                peripheral,
                channel,
                value,
            } => self.handle_value(&peripheral, channel, value).await,
        }
    }

    async fn handle_radio_state(&self, state: RadioState) {
        info!("Radio state changed: {}", state);
        self.emitter.emit(DeviceEvent::RadioStateChanged(state));
        if state != RadioState::PoweredOff {
            return;
        }

        let mut registry = self.registry.lock().await;
        let connected: Vec<String> = registry
            .sessions
            .values()
            .filter(|session| session.is_connected())
            .map(|session| session.name().to_string())
            .collect();
        for name in connected {
            if let Some(mut session) = registry.sessions.remove(&name) {
                session.mark_disconnected();
                self.emitter.emit(DeviceEvent::DeviceDisconnected(session.info()));
            }
        }
    }

    async fn handle_discovered(&self, peripheral: PeripheralKey, name: String, rssi: f64) {
        let mut registry = self.registry.lock().await;

        if let Some(existing) = registry.sessions.get_mut(&name) {
            // A pending connection keeps its session
            if existing.is_connected() || existing.state() == ConnectionState::Connecting {
                existing.set_rssi(rssi);
                self.emitter.emit(DeviceEvent::DeviceFound(existing.info()));
                return;
            }
        }

        // A disconnected placeholder hands its reconnect intent to the new session
        let intent = registry.sessions.get(&name).is_some_and(DeviceSession::should_reconnect);
        let reconnect = intent && registry.options.reconnect_policy == ReconnectPolicy::Automatic;

        let mut session = DeviceSession::new(name.clone(), peripheral, registry.detector());
        session.set_rssi(rssi);
        session.set_should_reconnect(intent);
        if reconnect {
            info!("Reconnecting to {}", name);
            match self.transport.connect(session.peripheral()) {
                Ok(()) => session.set_state(ConnectionState::Connecting),
                Err(e) => warn!("Failed to reconnect to {}: {}", name, e),
            }
        } else {
            info!("Found Activ5 device: {}", name);
        }

        let info = session.info();
        registry.sessions.insert(name, session);
        self.emitter.emit(DeviceEvent::DeviceFound(info));
    }

    async fn handle_connected(&self, peripheral: &PeripheralKey) {
        let mut registry = self.registry.lock().await;
        let Some(session) = registry.session_mut(peripheral) else {
            debug!("Connected peripheral {} is not tracked", peripheral);
            return;
        };

        info!("Connected to {}", session.name());
        session.set_state(ConnectionState::Connected);
        session.set_should_reconnect(true);
        if let Err(e) = self.transport.discover_services(peripheral) {
            warn!("Service discovery on {} failed: {}", session.name(), e);
        }
        self.emitter.emit(DeviceEvent::DeviceConnected(session.info()));
    }

    async fn handle_disconnected(&self, peripheral: &PeripheralKey, reason: Option<&str>) {
        let mut registry = self.registry.lock().await;
        let Some(name) = registry.name_of(peripheral) else {
            return;
        };

        let manual = registry.options.reconnect_policy == ReconnectPolicy::Manual;
        let Some(session) = registry.sessions.get_mut(&name) else {
            return;
        };
        session.mark_disconnected();
        let info = session.info();
        let forget = session.forget_after_disconnect() || (!session.should_reconnect() && manual);

        match reason {
            Some(reason) => info!("Disconnected from {}: {}", name, reason),
            None => info!("Disconnected from {}", name),
        }

        if forget {
            registry.sessions.remove(&name);
        } else if let Err(e) = self.start_scan(&mut registry, None) {
            warn!("Unable to rescan for {}: {}", name, e);
        }
        self.emitter.emit(DeviceEvent::DeviceDisconnected(info));
    }

    async fn handle_characteristics(&self, peripheral: &PeripheralKey, characteristics: Vec<ChannelHandle>) {
        let mut registry = self.registry.lock().await;
        let Some(session) = registry.session_mut(peripheral) else {
            return;
        };

        for handle in characteristics {
            let request = match session.bind_channel(handle) {
                Channel::Read => self.transport.set_notify(peripheral, &handle, true),
                Channel::SerialNumber | Channel::Uuid1 | Channel::Uuid2 => self.transport.read(peripheral, &handle),
                _ => Ok(()),
            };
            if let Err(e) = request {
                warn!("Request on {} for {} failed: {}", handle.channel(), session.name(), e);
            }
        }
    }

    async fn handle_value(&self, peripheral: &PeripheralKey, handle: ChannelHandle, value: Option<Bytes>) {
        let mut registry = self.registry.lock().await;
        let auto_handshake = registry.options.auto_handshake;
        let Some(session) = registry.session_mut(peripheral) else {
            return;
        };

        let channel = handle.channel();
        session.store_value(channel, value.as_ref());
        let message = decode(channel, value.as_deref());
        debug!("{} on {}: {:?}", channel, session.name(), message);

        if let Err(e) = session.apply(&message, &*self.transport, auto_handshake) {
            warn!("Handshake with {} failed: {}", session.name(), e);
        }
        if session.mark_initialized_if_ready() {
            self.emitter.emit(DeviceEvent::DeviceInitialized(session.info()));
        }

        let device = session.info();
        let text = message.as_text().unwrap_or_default().to_string();
        self.emitter.emit(DeviceEvent::MessageReceived {
            device: device.clone(),
            message: text.clone(),
            kind: message.kind,
        });

        match message.kind {
            MessageKind::Isometric => {
                let Ok(force) = text.parse::<f64>() else {
                    return;
                };
                self.emitter.emit(DeviceEvent::IsometricReceived {
                    device: device.clone(),
                    value: force,
                });
                for signal in session.evaluate_squeeze(force, &self.sink) {
                    let event = match signal {
                        SqueezeSignal::Pressed => session
                            .set_squeeze_state(SqueezeState::Squeezed)
                            .then(|| DeviceEvent::SqueezeStateChanged {
                                device: device.clone(),
                                state: SqueezeState::Squeezed,
                            }),
                        SqueezeSignal::Depressed => session
                            .set_squeeze_state(SqueezeState::Depressed)
                            .then(|| DeviceEvent::SqueezeStateChanged {
                                device: device.clone(),
                                state: SqueezeState::Depressed,
                            }),
                        SqueezeSignal::DoubleSqueeze => {
                            info!("Double squeeze on {}", device.name);
                            Some(DeviceEvent::DoubleSqueezeDetected(device.clone()))
                        }
                    };
                    if let Some(event) = event {
                        self.emitter.emit(event);
                    }
                }
            }
            MessageKind::Imu => {
                if let Some(sample) = message.as_imu() {
                    self.emitter.emit(DeviceEvent::ImuReceived { device, sample: *sample });
                }
            }
            MessageKind::Sn1 | MessageKind::Sn2 | MessageKind::SerialNumber => {
                self.emitter.emit(DeviceEvent::SerialNumberReceived { device, value: text });
            }
            MessageKind::Battery => {
                self.emitter.emit(DeviceEvent::BatteryReceived {
                    device,
                    value: message.as_integer().unwrap_or_default(),
                });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::recording::RecordingObserver,
        transport::{
            inbox,
            mock::{MockTransport, Request},
        },
    };
    use btleplug::api::bleuuid::uuid_from_u16;

    const NAME: &str = "A5-1";
    const PERIPHERAL: &str = "peripheral-1";

    struct Harness {
        manager: Arc<SessionManager<MockTransport>>,
        transport: Arc<MockTransport>,
        queue: MainQueue,
        inbox: Inbox,
        observer: Arc<RecordingObserver>,
    }

    impl Harness {
        async fn new(options: ManagerOptions) -> Self {
            let transport = Arc::new(MockTransport::powered_on());
            let (sink, inbox) = inbox();
            let (manager, queue) = SessionManager::new(transport.clone(), options, sink);
            let observer = Arc::new(RecordingObserver::default());
            manager.set_observer(&observer).await;
            Self {
                manager,
                transport,
                queue,
                inbox,
                observer,
            }
        }

        async fn publish(&mut self, event: TransportEvent) -> Vec<DeviceEvent> {
            self.manager.process(Input::Transport(event)).await;
            self.pump().await
        }

        async fn pump(&mut self) -> Vec<DeviceEvent> {
            while let Some(input) = self.inbox.try_recv() {
                self.manager.process(input).await;
            }
            self.queue.dispatch_pending().await
        }

        async fn discover(&mut self) -> Vec<DeviceEvent> {
            self.publish(TransportEvent::Discovered {
                peripheral: PeripheralKey::from(PERIPHERAL),
                name: Some(NAME.to_string()),
                rssi: Some(-60),
            })
            .await
        }

        async fn connect(&mut self) {
            self.discover().await;
            self.manager.connect(&key()).await.unwrap();
            self.publish(TransportEvent::Connected { peripheral: key() }).await;
        }

        async fn value(&mut self, short: u16, value: &'static [u8]) -> Vec<DeviceEvent> {
            self.publish(TransportEvent::ValueUpdated {
                peripheral: key(),
                channel: handle(short),
                value: Some(Bytes::from_static(value)),
            })
            .await
        }

        async fn state(&self) -> Option<ConnectionState> {
            self.manager.device(NAME).await.map(|device| device.state)
        }
    }

    fn key() -> PeripheralKey {
        PeripheralKey::from(PERIPHERAL)
    }

    fn handle(short: u16) -> ChannelHandle {
        ChannelHandle::new(uuid_from_u16(short), uuid_from_u16(0x5000))
    }

    fn names(events: &[DeviceEvent]) -> Vec<&'static str> {
        events.iter().map(DeviceEvent::signal_name).collect()
    }

    #[tokio::test]
    async fn test_unnamed_advertisement_is_ignored() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        let events = harness
            .publish(TransportEvent::Discovered {
                peripheral: key(),
                name: None,
                rssi: Some(-40),
            })
            .await;

        assert!(events.is_empty());
        assert!(harness.manager.devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_lifecycle() {
        let mut harness = Harness::new(ManagerOptions::default()).await;

        harness.discover().await;
        let found = harness.manager.device(NAME).await.unwrap();
        assert!((found.rssi + 60.0).abs() < f64::EPSILON);

        harness.manager.connect(&key()).await.unwrap();
        assert_eq!(harness.state().await, Some(ConnectionState::Connecting));

        harness.publish(TransportEvent::Connected { peripheral: key() }).await;
        assert_eq!(harness.state().await, Some(ConnectionState::Connected));
        assert_eq!(
            harness.manager.connection_state().await,
            ManagerConnectionState::Connected
        );
        assert_eq!(
            harness.transport.take_requests(),
            vec![Request::Connect(key()), Request::DiscoverServices(key())]
        );
        assert_eq!(
            harness.observer.calls(),
            vec!["found:A5-1".to_string(), "connected:A5-1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_rediscovery_while_connected_refreshes_rssi() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        harness.connect().await;

        let events = harness
            .publish(TransportEvent::Discovered {
                peripheral: key(),
                name: Some(NAME.to_string()),
                rssi: Some(-42),
            })
            .await;

        assert_eq!(names(&events), vec!["activ5.device_found"]);
        let device = harness.manager.device(NAME).await.unwrap();
        assert!(device.connected());
        assert!((device.rssi + 42.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_rediscovery_while_connecting_keeps_session() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        harness.discover().await;
        harness.manager.connect(&key()).await.unwrap();
        harness.transport.take_requests();

        harness.discover().await;
        assert!(harness.transport.take_requests().is_empty());
        assert_eq!(harness.state().await, Some(ConnectionState::Connecting));
    }

    #[tokio::test]
    async fn test_characteristics_enable_notify_and_identity_reads() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        harness.connect().await;
        harness.transport.take_requests();

        harness
            .publish(TransportEvent::CharacteristicsDiscovered {
                peripheral: key(),
                characteristics: vec![
                    handle(0x5A01),
                    handle(0x5A02),
                    handle(0x2A25),
                    handle(0xF0F7),
                    handle(0xF0F8),
                    handle(0x1234),
                ],
            })
            .await;

        assert_eq!(
            harness.transport.take_requests(),
            vec![
                Request::SetNotify(key(), handle(0x5A01), true),
                Request::Read(key(), handle(0x2A25)),
                Request::Read(key(), handle(0xF0F7)),
                Request::Read(key(), handle(0xF0F8)),
            ]
        );
    }

    #[tokio::test]
    async fn test_handshake_and_initialization() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        harness.connect().await;
        harness
            .publish(TransportEvent::ServicesDiscovered {
                peripheral: key(),
                services: vec![uuid_from_u16(0x5000), uuid_from_u16(0xF0F0)],
            })
            .await;
        harness
            .publish(TransportEvent::CharacteristicsDiscovered {
                peripheral: key(),
                characteristics: vec![
                    handle(0x5A01),
                    handle(0x5A02),
                    handle(0x2A25),
                    handle(0xF0F7),
                    handle(0xF0F8),
                ],
            })
            .await;
        harness.transport.take_requests();

        let events = harness.value(0x5A01, b"\x12TC5k;1.00;04;BATOK\x13").await;
        assert_eq!(names(&events), vec!["activ5.message_received"]);
        assert_eq!(harness.state().await, Some(ConnectionState::Stopped));
        assert_eq!(harness.transport.writes(), vec![Command::Handshake.to_frame()]);

        harness.value(0xF0F7, b"0011").await;
        harness.value(0xF0F8, b"2233\0").await;
        let events = harness.value(0x2A25, b"A5-0042").await;
        assert_eq!(
            names(&events),
            vec![
                "activ5.device_initialized",
                "activ5.message_received",
                "activ5.serial_number_received",
            ]
        );

        let device = harness.manager.device(NAME).await.unwrap();
        assert_eq!(device.device_version.as_deref(), Some("1.00"));
        assert_eq!(device.uuid().as_deref(), Some("00112233"));
        assert!(device.initialized);

        harness.value(0x2A25, b"A5-0042").await;
        let initialized = harness
            .observer
            .calls()
            .iter()
            .filter(|call| call.starts_with("initialized:"))
            .count();
        assert_eq!(initialized, 1);
    }

    #[tokio::test]
    async fn test_legacy_device_initializes_on_first_message() {
        let mut harness = Harness::new(ManagerOptions {
            auto_handshake: false,
            ..ManagerOptions::default()
        })
        .await;
        harness.connect().await;

        let events = harness.value(0x5A01, b"\x12IS9/IS\x13").await;
        assert_eq!(
            names(&events),
            vec![
                "activ5.device_initialized",
                "activ5.message_received",
                "activ5.isometric_received",
            ]
        );
        assert_eq!(harness.state().await, Some(ConnectionState::Isometric));
        assert!(harness.observer.calls().contains(&"isometric:A5-1:9.8".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_stream_detects_double_squeeze() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        harness.connect().await;

        // 100 raw units is about 27 N, 10 units about 2.7 N
        let payloads: [&'static [u8]; 4] = [&[100, 0], &[10, 0], &[100, 0], &[10, 0]];
        let mut events = Vec::new();
        for payload in payloads {
            events.extend(harness.value(0xF0FE, payload).await);
        }

        let squeeze: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                DeviceEvent::SqueezeStateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            squeeze,
            vec![
                SqueezeState::Squeezed,
                SqueezeState::Depressed,
                SqueezeState::Squeezed,
                SqueezeState::Depressed,
            ]
        );
        assert!(harness.observer.calls().contains(&"double_squeeze:A5-1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_squeeze_window_expires() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        harness.connect().await;

        harness.value(0xF0FE, &[100, 0]).await;
        harness.value(0xF0FE, &[10, 0]).await;
        time::sleep(Duration::from_secs(6)).await;
        harness.pump().await;

        harness.value(0xF0FE, &[100, 0]).await;
        harness.value(0xF0FE, &[10, 0]).await;
        assert!(!harness
            .observer
            .calls()
            .iter()
            .any(|call| call.starts_with("double_squeeze")));
    }

    #[tokio::test]
    async fn test_battery_value_flows_to_observer() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        harness.connect().await;
        harness
            .publish(TransportEvent::CharacteristicsDiscovered {
                peripheral: key(),
                characteristics: vec![handle(0x2A19)],
            })
            .await;

        let pending = harness.manager.read_battery_level(NAME).await.unwrap_err();
        assert!(pending.is_recoverable());

        let events = harness.value(0x2A19, &[0x64]).await;
        assert!(events.contains(&DeviceEvent::BatteryReceived {
            device: harness.manager.device(NAME).await.unwrap(),
            value: 100,
        }));
        assert_eq!(harness.manager.read_battery_level(NAME).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_unexpected_disconnect_rescans_and_reconnects() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        harness.connect().await;
        harness.transport.take_requests();

        let events = harness
            .publish(TransportEvent::Disconnected {
                peripheral: key(),
                reason: Some("link lost".to_string()),
            })
            .await;
        assert_eq!(names(&events), vec!["activ5.device_disconnected"]);
        assert_eq!(harness.state().await, Some(ConnectionState::Disconnected));
        assert!(harness.manager.is_scanning().await);
        assert_eq!(
            harness.transport.take_requests(),
            vec![Request::StartDiscovery(vec![uuid_from_u16(0x5000)])]
        );

        harness.discover().await;
        assert_eq!(harness.transport.take_requests(), vec![Request::Connect(key())]);
        assert_eq!(harness.state().await, Some(ConnectionState::Connecting));
    }

    #[tokio::test]
    async fn test_disconnect_all_forgets_devices() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        harness.connect().await;
        harness.transport.take_requests();

        harness.manager.disconnect_all().await;
        assert_eq!(harness.transport.take_requests(), vec![Request::Disconnect(key())]);

        harness
            .publish(TransportEvent::Disconnected {
                peripheral: key(),
                reason: None,
            })
            .await;
        assert!(harness.manager.devices().await.is_empty());
        assert!(!harness.manager.is_scanning().await);
        assert!(harness.observer.calls().contains(&"disconnected:A5-1".to_string()));
    }

    #[tokio::test]
    async fn test_manual_policy_forgets_user_disconnect() {
        let mut harness = Harness::new(ManagerOptions {
            reconnect_policy: ReconnectPolicy::Manual,
            ..ManagerOptions::default()
        })
        .await;
        harness.connect().await;

        harness.manager.disconnect_device(NAME).await.unwrap();
        assert_eq!(harness.state().await, Some(ConnectionState::Disconnected));

        harness
            .publish(TransportEvent::Disconnected {
                peripheral: key(),
                reason: None,
            })
            .await;
        assert_eq!(harness.manager.device(NAME).await, None);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_reason() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        harness.discover().await;

        let events = harness
            .publish(TransportEvent::ConnectFailed {
                peripheral: key(),
                reason: Some("timeout".to_string()),
            })
            .await;
        match events.as_slice() {
            [DeviceEvent::ConnectFailed { device, reason }] => {
                assert_eq!(device.name, NAME);
                assert_eq!(reason.as_deref(), Some("timeout"));
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert!(harness.manager.device(NAME).await.is_some());
        assert!(harness.observer.calls().contains(&"connect_failed:A5-1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_completes_after_timeout() {
        let mut harness = Harness::new(ManagerOptions::default()).await;

        let mut completed = harness.manager.scan().await.unwrap();
        assert_eq!(
            harness.manager.connection_state().await,
            ManagerConnectionState::Searching
        );

        time::sleep(Duration::from_secs(29)).await;
        harness.pump().await;
        assert!(completed.try_recv().is_err());

        time::sleep(Duration::from_secs(2)).await;
        let events = harness.pump().await;
        assert_eq!(names(&events), vec!["activ5.search_completed"]);
        tokio_test::assert_ok!(completed.try_recv());
        assert!(!harness.manager.is_scanning().await);
        assert_eq!(
            harness.transport.take_requests(),
            vec![
                Request::StartDiscovery(vec![uuid_from_u16(0x5000)]),
                Request::StopDiscovery,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_restarts_timeout() {
        let mut harness = Harness::new(ManagerOptions::default()).await;

        let mut first = harness.manager.scan().await.unwrap();
        time::sleep(Duration::from_secs(20)).await;
        let mut second = harness.manager.scan().await.unwrap();

        time::sleep(Duration::from_secs(20)).await;
        harness.pump().await;
        assert!(harness.manager.is_scanning().await);

        time::sleep(Duration::from_secs(11)).await;
        harness.pump().await;
        tokio_test::assert_ok!(first.try_recv());
        tokio_test::assert_ok!(second.try_recv());

        let starts = harness
            .transport
            .take_requests()
            .into_iter()
            .filter(|request| matches!(request, Request::StartDiscovery(_)))
            .count();
        assert_eq!(starts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_scan_cancels_timeout() {
        let mut harness = Harness::new(ManagerOptions::default()).await;

        harness.manager.scan().await.unwrap();
        harness.manager.stop_scan().await.unwrap();
        harness.manager.stop_scan().await.unwrap();

        time::sleep(Duration::from_secs(60)).await;
        let events = harness.pump().await;
        assert!(events.is_empty());
        assert_eq!(
            harness.manager.connection_state().await,
            ManagerConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_scan_with_radio_off() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        harness.transport.set_radio(RadioState::PoweredOff);

        let error = harness.manager.scan().await.unwrap_err();
        assert!(matches!(error, Activ5Error::RadioUnavailable));
        harness.pump().await;

        assert_eq!(harness.observer.calls(), vec!["radio_switched_off".to_string()]);
        assert!(harness.transport.take_requests().is_empty());
        assert!(!harness.manager.is_scanning().await);
    }

    #[tokio::test]
    async fn test_radio_power_off_drops_connected_devices() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        harness.connect().await;

        harness.transport.set_radio(RadioState::PoweredOff);
        let events = harness
            .publish(TransportEvent::RadioStateChanged(RadioState::PoweredOff))
            .await;

        assert_eq!(
            names(&events),
            vec!["activ5.radio_state_changed", "activ5.device_disconnected"]
        );
        assert!(!harness.manager.is_radio_on());
        assert!(harness.manager.connected_devices().await.is_empty());
        assert!(harness.manager.devices().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evergreen_sends_stop_while_idle() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        harness.connect().await;
        harness
            .publish(TransportEvent::CharacteristicsDiscovered {
                peripheral: key(),
                characteristics: vec![handle(0x5A02)],
            })
            .await;
        harness.transport.take_requests();

        harness.manager.set_evergreen(NAME, true).await.unwrap();
        time::sleep(Duration::from_millis(60_050)).await;
        harness.pump().await;
        assert_eq!(harness.transport.writes(), vec![Command::Stop.to_frame()]);
        assert_eq!(harness.state().await, Some(ConnectionState::Stopped));

        harness.manager.set_evergreen(NAME, false).await.unwrap();
        harness.transport.take_requests();
        time::sleep(Duration::from_secs(120)).await;
        harness.pump().await;
        assert!(harness.transport.take_requests().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_device_helpers() {
        let harness = Harness::new(ManagerOptions::default()).await;

        let error = harness.manager.send_command("missing", Command::Tare).await.unwrap_err();
        assert!(matches!(error, Activ5Error::DeviceNotFound(ref name) if name == "missing"));
        assert!(harness.manager.set_evergreen("missing", true).await.is_err());
        assert!(harness.manager.connect_device("missing").await.is_err());
        assert!(harness.manager.read_serial_number("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_options_apply_to_tracked_sessions() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        harness.connect().await;

        let mut options = harness.manager.options().await;
        options.squeeze_threshold.pressed = 50.0;
        harness.manager.set_options(options.clone()).await;
        assert_eq!(harness.manager.options().await, options);

        let events = harness.value(0xF0FE, &[100, 0]).await;
        assert!(!events
            .iter()
            .any(|event| matches!(event, DeviceEvent::SqueezeStateChanged { .. })));
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Discover,
        Connect,
        Connected,
        Refused,
        LinkLost,
        UserDisconnect,
        Uuid1,
        Uuid2,
    }

    impl Harness {
        async fn step(&mut self, step: Step) {
            match step {
                Step::Discover => {
                    self.discover().await;
                }
                Step::Connect => self.manager.connect(&key()).await.unwrap(),
                Step::Connected => {
                    self.publish(TransportEvent::Connected { peripheral: key() }).await;
                }
                Step::Refused => {
                    self.publish(TransportEvent::ConnectFailed {
                        peripheral: key(),
                        reason: Some("refused".to_string()),
                    })
                    .await;
                }
                Step::LinkLost => {
                    self.publish(TransportEvent::Disconnected {
                        peripheral: key(),
                        reason: Some("link lost".to_string()),
                    })
                    .await;
                }
                Step::UserDisconnect => self.manager.disconnect_device(NAME).await.unwrap(),
                Step::Uuid1 => {
                    self.value(0xF0F7, b"0011").await;
                }
                Step::Uuid2 => {
                    self.value(0xF0F8, b"2233\0").await;
                }
            }
        }
    }

    type Expectation = (Step, Option<ConnectionState>, Option<&'static str>);

    #[tokio::test]
    async fn test_registry_follows_lifecycle_sequences() {
        use crate::types::ConnectionState::{Connected, Connecting, Disconnected};

        let scenarios: Vec<(&str, ReconnectPolicy, Vec<Expectation>)> = vec![
            (
                "repeated advertisements",
                ReconnectPolicy::Automatic,
                vec![
                    (Step::Discover, Some(Disconnected), None),
                    (Step::Discover, Some(Disconnected), None),
                    (Step::Discover, Some(Disconnected), None),
                ],
            ),
            (
                "link loss reconnects",
                ReconnectPolicy::Automatic,
                vec![
                    (Step::Discover, Some(Disconnected), None),
                    (Step::Connect, Some(Connecting), None),
                    (Step::Connected, Some(Connected), None),
                    (Step::Uuid1, Some(Connected), None),
                    (Step::Uuid2, Some(Connected), Some("00112233")),
                    (Step::LinkLost, Some(Disconnected), Some("00112233")),
                    (Step::Discover, Some(Connecting), None),
                    (Step::Connected, Some(Connected), None),
                ],
            ),
            (
                "user disconnect stays down",
                ReconnectPolicy::Automatic,
                vec![
                    (Step::Discover, Some(Disconnected), None),
                    (Step::Connect, Some(Connecting), None),
                    (Step::Connected, Some(Connected), None),
                    (Step::UserDisconnect, Some(Disconnected), None),
                    (Step::LinkLost, Some(Disconnected), None),
                    (Step::Discover, Some(Disconnected), None),
                    (Step::Discover, Some(Disconnected), None),
                ],
            ),
            (
                "refused connection can be retried",
                ReconnectPolicy::Automatic,
                vec![
                    (Step::Discover, Some(Disconnected), None),
                    (Step::Connect, Some(Connecting), None),
                    (Step::Refused, Some(Disconnected), None),
                    (Step::Discover, Some(Disconnected), None),
                    (Step::Connect, Some(Connecting), None),
                    (Step::Connected, Some(Connected), None),
                ],
            ),
            (
                "manual link loss keeps placeholder",
                ReconnectPolicy::Manual,
                vec![
                    (Step::Discover, Some(Disconnected), None),
                    (Step::Connect, Some(Connecting), None),
                    (Step::Connected, Some(Connected), None),
                    (Step::LinkLost, Some(Disconnected), None),
                    (Step::Discover, Some(Disconnected), None),
                ],
            ),
            (
                "manual user disconnect forgets",
                ReconnectPolicy::Manual,
                vec![
                    (Step::Discover, Some(Disconnected), None),
                    (Step::Connect, Some(Connecting), None),
                    (Step::Connected, Some(Connected), None),
                    (Step::Uuid1, Some(Connected), None),
                    (Step::UserDisconnect, Some(Disconnected), None),
                    (Step::LinkLost, None, None),
                ],
            ),
        ];

        for (label, policy, steps) in scenarios {
            let mut harness = Harness::new(ManagerOptions {
                reconnect_policy: policy,
                ..ManagerOptions::default()
            })
            .await;

            for (index, (step, state, uuid)) in steps.into_iter().enumerate() {
                harness.transport.take_requests();
                harness.step(step).await;
                let context = format!("{label}: step {index} ({step:?})");

                if matches!(step, Step::Discover) {
                    let connects = harness.transport.take_requests().contains(&Request::Connect(key()));
                    assert_eq!(connects, state == Some(Connecting), "{context}");
                }

                let device = harness.manager.device(NAME).await;
                assert_eq!(device.as_ref().map(|device| device.state), state, "{context}");
                let Some(device) = device else {
                    assert!(harness.manager.connected_devices().await.is_empty(), "{context}");
                    continue;
                };

                let connected = state == Some(Connected);
                assert_eq!(device.connected(), connected, "{context}");
                assert_eq!(harness.manager.connected_devices().await.len(), usize::from(connected), "{context}");
                assert_eq!(device.uuid().as_deref(), uuid, "{context}");
                if matches!(step, Step::Uuid1) {
                    assert_eq!(device.uuid1.as_deref(), Some("0011"), "{context}");
                    assert_eq!(device.uuid2, None, "{context}");
                    assert_eq!(device.uuid(), None, "{context}");
                }
            }
        }
    }

    #[tokio::test]
    async fn test_plain_scan_never_connects() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        tokio_test::assert_ok!(harness.manager.scan().await);
        harness.transport.take_requests();

        for rssi in [-70, -65, -60] {
            harness
                .publish(TransportEvent::Discovered {
                    peripheral: key(),
                    name: Some(NAME.to_string()),
                    rssi: Some(rssi),
                })
                .await;
        }

        assert!(harness.transport.take_requests().is_empty());
        let device = harness.manager.device(NAME).await.unwrap();
        assert_eq!(device.state, ConnectionState::Disconnected);
        assert!(!device.should_reconnect);
    }

    #[tokio::test]
    async fn test_user_disconnect_survives_rescan() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        harness.connect().await;
        assert!(harness.manager.device(NAME).await.unwrap().should_reconnect);

        harness.manager.disconnect_device(NAME).await.unwrap();
        harness
            .publish(TransportEvent::Disconnected {
                peripheral: key(),
                reason: None,
            })
            .await;
        harness.transport.take_requests();

        harness.discover().await;
        harness.discover().await;
        assert!(!harness
            .transport
            .take_requests()
            .contains(&Request::Connect(key())));
        let device = harness.manager.device(NAME).await.unwrap();
        assert_eq!(device.state, ConnectionState::Disconnected);
        assert!(!device.should_reconnect);
    }

    #[tokio::test]
    async fn test_write_failure_reaches_observer() {
        let mut harness = Harness::new(ManagerOptions::default()).await;
        harness.connect().await;

        let events = harness
            .publish(TransportEvent::WriteFailed {
                peripheral: key(),
                channel: handle(0x5A02),
                reason: "not connected".to_string(),
            })
            .await;

        assert_eq!(names(&events), vec!["activ5.write_failed"]);
        assert!(harness
            .observer
            .calls()
            .contains(&"write_failed:A5-1:not connected".to_string()));
    }
}
