use crate::{
    error::{Activ5Error, Result},
    protocol::{decode, Channel, Command, Message, MessageKind, NEW_PROTOCOL_SERVICE_UUID},
    squeeze::{SqueezeDetector, SqueezeSignal},
    transport::{ChannelHandle, EventSink, Input, Transport},
    types::{compose_uuid, ConnectionState, DeviceInfo, PeripheralKey, SqueezeState, SqueezeThreshold},
};
use bytes::Bytes;
use std::{collections::HashMap, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MIN_KEEP_ALIVE_PERIOD: Duration = Duration::from_millis(1);

/// Connection and protocol state of one Activ5 peripheral
///
/// A session is created when a named device is first discovered and
/// populated as its channels are found and read. It owns the device's
/// evergreen keep-alive timer and squeeze detector; both timers are
/// cancelled when the session disconnects or is dropped.
#[derive(Debug)]
pub struct DeviceSession {
    name: String,
    peripheral: PeripheralKey,
    rssi: f64,
    uses_new_protocol: bool,
    state: ConnectionState,
    channels: HashMap<Channel, ChannelHandle>,
    last_values: HashMap<Channel, Bytes>,
    device_version: Option<String>,
    serial_number: Option<String>,
    uuid1: Option<String>,
    uuid2: Option<String>,
    initialized: bool,
    evergreen: bool,
    keep_alive: Option<JoinHandle<()>>,
    should_reconnect: bool,
    forget_after_disconnect: bool,
    squeeze: SqueezeDetector,
    squeeze_state: SqueezeState,
    squeeze_timer: Option<JoinHandle<()>>,
}

impl DeviceSession {
    /// Create a disconnected session
    #[must_use]
    pub fn new(name: impl Into<String>, peripheral: PeripheralKey, squeeze: SqueezeDetector) -> Self {
        Self {
            name: name.into(),
            peripheral,
            rssi: 0.0,
            uses_new_protocol: false,
            state: ConnectionState::Disconnected,
            channels: HashMap::new(),
            last_values: HashMap::new(),
            device_version: None,
            serial_number: None,
            uuid1: None,
            uuid2: None,
            initialized: false,
            evergreen: false,
            keep_alive: None,
            should_reconnect: false,
            forget_after_disconnect: false,
            squeeze,
            squeeze_state: SqueezeState::Depressed,
            squeeze_timer: None,
        }
    }

    /// Advertised name, the registry key
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transport handle
    #[must_use]
    pub const fn peripheral(&self) -> &PeripheralKey {
        &self.peripheral
    }

    /// Connection state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Derived from [`Self::state`]
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Both UUID halves concatenated, once both are known
    #[must_use]
    pub fn uuid(&self) -> Option<String> {
        compose_uuid(self.uuid1.as_deref(), self.uuid2.as_deref())
    }

    /// Serial number, if known
    #[must_use]
    pub fn serial_number(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }

    /// Handle of a discovered channel
    #[must_use]
    pub fn channel(&self, channel: Channel) -> Option<&ChannelHandle> {
        self.channels.get(&channel)
    }

    /// Device should be reconnected after an unexpected drop
    #[must_use]
    pub const fn should_reconnect(&self) -> bool {
        self.should_reconnect
    }

    /// Snapshot for observers
    #[must_use]
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name.clone(),
            peripheral: self.peripheral.clone(),
            rssi: self.rssi,
            uses_new_protocol: self.uses_new_protocol,
            state: self.state,
            device_version: self.device_version.clone(),
            serial_number: self.serial_number.clone(),
            uuid1: self.uuid1.clone(),
            uuid2: self.uuid2.clone(),
            evergreen: self.evergreen,
            should_reconnect: self.should_reconnect,
            initialized: self.initialized,
        }
    }

    /// Send a text command on the write channel
    ///
    /// `Stop` moves the session to [`ConnectionState::Stopped`]. `Handshake`
    /// also requests whichever identity fragments have no dedicated channel.
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::Transport`] if the write cannot be queued.
    pub fn issue_command(&mut self, transport: &dyn Transport, command: Command) -> Result<()> {
        if let Some(write) = self.channels.get(&Channel::Write) {
            debug!("Sending {} to {}", command, self.name);
            transport.write(&self.peripheral, write, command.to_frame())?;
        } else {
            debug!("No write channel on {}, dropping {}", self.name, command);
        }

        match command {
            Command::Stop => self.state = ConnectionState::Stopped,
            Command::Handshake => {
                if !self.channels.contains_key(&Channel::Uuid1) && !self.channels.contains_key(&Channel::Uuid2) {
                    self.issue_command(transport, Command::Uuid1)?;
                    self.issue_command(transport, Command::Uuid2)?;
                }
                if !self.channels.contains_key(&Channel::SerialNumber) {
                    self.issue_command(transport, Command::Sn1)?;
                    self.issue_command(transport, Command::Sn2)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Start force streaming
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::Transport`] if the request cannot be queued.
    pub fn start_force_streaming(&mut self, transport: &dyn Transport) -> Result<()> {
        match self.channels.get(&Channel::Force) {
            Some(force) => transport.set_notify(&self.peripheral, force, true),
            None => self.issue_command(transport, Command::StartIsometric),
        }
    }

    /// Stop force streaming
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::Transport`] if the request cannot be queued.
    pub fn stop(&mut self, transport: &dyn Transport) -> Result<()> {
        match self.channels.get(&Channel::Force) {
            Some(force) => transport.set_notify(&self.peripheral, force, false),
            None => self.issue_command(transport, Command::Stop),
        }
    }

    /// Start IMU streaming
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::Unsupported`] if the device has no motion channel.
    pub fn start_motion_streaming(&self, transport: &dyn Transport) -> Result<()> {
        let imu = self.channels.get(&Channel::Imu).ok_or_else(Activ5Error::motion_unsupported)?;
        transport.set_notify(&self.peripheral, imu, true)
    }

    /// Stop IMU streaming
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::Unsupported`] if the device has no motion channel.
    pub fn stop_motion_streaming(&self, transport: &dyn Transport) -> Result<()> {
        let imu = self.channels.get(&Channel::Imu).ok_or_else(Activ5Error::motion_unsupported)?;
        transport.set_notify(&self.peripheral, imu, false)
    }

    /// Last battery percentage reported by the device
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::Unsupported`] without a battery channel, or
    /// [`Activ5Error::NotYetReadable`] after requesting a fresh read when no
    /// value has arrived yet.
    pub fn read_battery_level(&self, transport: &dyn Transport) -> Result<u64> {
        let battery = self
            .channels
            .get(&Channel::Battery)
            .ok_or_else(Activ5Error::battery_unsupported)?;

        if let Some(percentage) = decode(Channel::Battery, self.last_value(Channel::Battery)).as_integer() {
            return Ok(percentage);
        }

        transport.read(&self.peripheral, battery)?;
        Err(Activ5Error::battery_not_readable())
    }

    /// Decode the last serial-number value
    ///
    /// Returns an empty string without a serial-number channel and `None`
    /// when the stored value does not decode as a serial number.
    pub fn read_serial_number(&mut self) -> Option<String> {
        if !self.channels.contains_key(&Channel::SerialNumber) {
            return Some(String::new());
        }

        let message = decode(Channel::SerialNumber, self.last_value(Channel::SerialNumber));
        if message.kind != MessageKind::SerialNumber {
            return None;
        }
        self.serial_number = message.as_text().map(str::to_string);
        self.serial_number.clone()
    }

    /// Write the sample interval; ignored without a sample-rate channel
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::Transport`] if the write cannot be queued.
    pub fn set_sample_rate(&self, transport: &dyn Transport, interval_ms: i16) -> Result<()> {
        let Some(sample_rate) = self.channels.get(&Channel::SampleRate) else {
            return Ok(());
        };
        let data = Bytes::copy_from_slice(&interval_ms.to_le_bytes());
        transport.write(&self.peripheral, sample_rate, data)
    }

    /// Start or cancel the evergreen keep-alive
    ///
    /// While enabled, a `KeepAlive` input is posted to `sink` every `period`;
    /// late ticks are delayed rather than bunched.
    pub fn set_keep_alive(&mut self, enabled: bool, sink: &EventSink, period: Duration) {
        self.evergreen = enabled;
        if let Some(timer) = self.keep_alive.take() {
            timer.abort();
        }
        if !enabled {
            return;
        }

        // interval_at panics on a zero period
        let period = period.max(MIN_KEEP_ALIVE_PERIOD);
        let sink = sink.clone();
        let device = self.name.clone();
        self.keep_alive = Some(tokio::spawn(async move {
            let mut ticks = time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                sink.post(Input::KeepAlive { device: device.clone() });
            }
        }));
    }

    /// Handle one keep-alive tick
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::Transport`] if the stop command cannot be queued.
    pub fn keep_alive_tick(&mut self, transport: &dyn Transport) -> Result<()> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Stopped => self.issue_command(transport, Command::Stop),
            _ => Ok(()),
        }
    }

    /// Disconnect on request
    ///
    /// The session is marked disconnected immediately; the transport's
    /// confirmation reconciles later.
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::Transport`] if the request cannot be queued.
    pub fn disconnect(&mut self, transport: &dyn Transport) -> Result<()> {
        self.should_reconnect = false;
        self.cancel_timers();
        let result = transport.disconnect(&self.peripheral);
        self.state = ConnectionState::Disconnected;
        result
    }

    pub(crate) fn set_rssi(&mut self, rssi: f64) {
        self.rssi = rssi;
    }

    pub(crate) fn set_should_reconnect(&mut self, should_reconnect: bool) {
        self.should_reconnect = should_reconnect;
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub(crate) fn set_forget_after_disconnect(&mut self) {
        self.forget_after_disconnect = true;
    }

    pub(crate) const fn forget_after_disconnect(&self) -> bool {
        self.forget_after_disconnect
    }

    pub(crate) fn set_squeeze_threshold(&mut self, threshold: SqueezeThreshold, window: Duration) {
        self.squeeze.set_threshold(threshold);
        self.squeeze.set_window(window);
    }

    pub(crate) fn set_services(&mut self, services: &[Uuid]) {
        self.uses_new_protocol = services.contains(&NEW_PROTOCOL_SERVICE_UUID);
    }

    /// Record a discovered characteristic and return its channel
    pub(crate) fn bind_channel(&mut self, handle: ChannelHandle) -> Channel {
        let channel = handle.channel();
        if channel != Channel::Unknown {
            self.channels.insert(channel, handle);
        }
        channel
    }

    pub(crate) fn store_value(&mut self, channel: Channel, value: Option<&Bytes>) {
        match value {
            Some(value) => self.last_values.insert(channel, value.clone()),
            None => self.last_values.remove(&channel),
        };
    }

    fn last_value(&self, channel: Channel) -> Option<&[u8]> {
        self.last_values.get(&channel).map(|value| &value[..])
    }

    /// Fold a decoded message into the session
    ///
    /// # Errors
    ///
    /// Returns [`Activ5Error::Transport`] if the automatic handshake cannot be queued.
    pub(crate) fn apply(&mut self, message: &Message, transport: &dyn Transport, auto_handshake: bool) -> Result<()> {
        let text = || message.as_text().unwrap_or_default().to_string();
        match message.kind {
            MessageKind::Handshake => {
                self.state = ConnectionState::Connected;
                self.device_version = Some(text());
                if auto_handshake {
                    self.issue_command(transport, Command::Handshake)?;
                    self.state = ConnectionState::Stopped;
                }
            }
            MessageKind::Isometric => self.state = ConnectionState::Isometric,
            MessageKind::Uuid1 => self.uuid1 = Some(text()),
            MessageKind::Uuid2 => self.uuid2 = Some(text().replace('\0', "")),
            MessageKind::SerialNumber => self.serial_number = Some(text()),
            MessageKind::Imu | MessageKind::Sn1 | MessageKind::Sn2 | MessageKind::Battery => {}
            MessageKind::Timestamp | MessageKind::Unknown => self.state = ConnectionState::Stopped,
        }
        Ok(())
    }

    /// Returns `true` exactly once, when identity first becomes complete
    ///
    /// Devices on the legacy protocol have no identity channels and
    /// complete immediately.
    pub(crate) fn mark_initialized_if_ready(&mut self) -> bool {
        if self.initialized {
            return false;
        }
        let ready = !self.uses_new_protocol || (self.serial_number.is_some() && self.uuid().is_some());
        if ready {
            info!("Device {} initialized", self.name);
            self.initialized = true;
        }
        ready
    }

    /// Feed a force reading into the squeeze detector and re-arm its timer
    pub(crate) fn evaluate_squeeze(&mut self, force: f64, sink: &EventSink) -> Vec<SqueezeSignal> {
        let armed = self.squeeze.deadline();
        let signals = self.squeeze.evaluate(force, Instant::now());
        let deadline = self.squeeze.deadline();
        if deadline == armed {
            return signals;
        }

        if let Some(timer) = self.squeeze_timer.take() {
            timer.abort();
        }
        if let Some(deadline) = deadline {
            let sink = sink.clone();
            let device = self.name.clone();
            self.squeeze_timer = Some(tokio::spawn(async move {
                time::sleep_until(deadline).await;
                sink.post(Input::SqueezeTimeout { device });
            }));
        }
        signals
    }

    pub(crate) fn expire_squeeze(&mut self) {
        if self.squeeze.expire(Instant::now()) {
            debug!("Squeeze window elapsed on {}", self.name);
            self.squeeze_timer = None;
        }
    }

    /// Record a squeeze edge; returns `true` if the state changed
    pub(crate) fn set_squeeze_state(&mut self, state: SqueezeState) -> bool {
        let changed = self.squeeze_state != state;
        self.squeeze_state = state;
        changed
    }

    /// Transport reported the link closed
    pub(crate) fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.initialized = false;
        self.rssi = 0.0;
        self.cancel_timers();
        self.squeeze.reset();
        self.squeeze_state = SqueezeState::Depressed;
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.keep_alive.take() {
            timer.abort();
        }
        if let Some(timer) = self.squeeze_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if self.keep_alive.is_some() || self.squeeze_timer.is_some() {
            warn!("Session {} dropped with live timers, cancelling", self.name);
        }
        self.cancel_timers();
    }
}
