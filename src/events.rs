//! Domain events and their delivery on the observer context.
//!
//! The manager emits [`DeviceEvent`]s from its background context into a
//! single ordered queue. [`MainQueue`] drains that queue on whichever task the
//! host designates as its main context, calls the registered
//! [`DeviceObserver`] and then rebroadcasts the event to every subscriber.

use crate::{
    protocol::MessageKind,
    types::{DeviceInfo, ImuSample, RadioState, SqueezeState},
};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::debug;

/// Capacity of the broadcast signal channel
pub const SIGNAL_CAPACITY: usize = 256;

/// Notification produced by the session manager
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Discovery window elapsed
    SearchCompleted,
    /// A named device advertised
    DeviceFound(DeviceInfo),
    /// Link established
    DeviceConnected(DeviceInfo),
    /// Link closed
    DeviceDisconnected(DeviceInfo),
    /// Identity is fully known
    DeviceInitialized(DeviceInfo),
    /// Any decoded message
    MessageReceived {
        /// Source device
        device: DeviceInfo,
        /// Text value, empty when the message has none
        message: String,
        /// Message tag
        kind: MessageKind,
    },
    /// Force reading in Newtons
    IsometricReceived {
        /// Source device
        device: DeviceInfo,
        /// Force in Newtons
        value: f64,
    },
    /// Motion sample
    ImuReceived {
        /// Source device
        device: DeviceInfo,
        /// Decoded sample
        sample: ImuSample,
    },
    /// Serial number or one of its fragments
    SerialNumberReceived {
        /// Source device
        device: DeviceInfo,
        /// Serial text
        value: String,
    },
    /// Battery percentage
    BatteryReceived {
        /// Source device
        device: DeviceInfo,
        /// Percentage
        value: u64,
    },
    /// Squeeze edge
    SqueezeStateChanged {
        /// Source device
        device: DeviceInfo,
        /// New edge state
        state: SqueezeState,
    },
    /// Double squeeze recognised
    DoubleSqueezeDetected(DeviceInfo),
    /// Connection attempt failed
    ConnectFailed {
        /// Device that failed to connect
        device: DeviceInfo,
        /// Failure reason
        reason: Option<String>,
    },
    /// Write or notify request rejected by the transport
    WriteFailed {
        /// Target device
        device: DeviceInfo,
        /// Failure reason
        reason: String,
    },
    /// Radio power state changed
    RadioStateChanged(RadioState),
    /// Scan requested while the radio is off
    RadioSwitchedOff,
}

impl DeviceEvent {
    /// Name of the broadcast signal for this event
    #[must_use]
    pub const fn signal_name(&self) -> &'static str {
        match self {
            Self::SearchCompleted => "activ5.search_completed",
            Self::DeviceFound(_) => "activ5.device_found",
            Self::DeviceConnected(_) => "activ5.device_connected",
            Self::DeviceDisconnected(_) => "activ5.device_disconnected",
            Self::DeviceInitialized(_) => "activ5.device_initialized",
            Self::MessageReceived { .. } => "activ5.message_received",
            Self::IsometricReceived { .. } => "activ5.isometric_received",
            Self::ImuReceived { .. } => "activ5.imu_received",
            Self::SerialNumberReceived { .. } => "activ5.serial_number_received",
            Self::BatteryReceived { .. } => "activ5.battery_received",
            Self::SqueezeStateChanged { .. } => "activ5.squeeze_state_changed",
            Self::DoubleSqueezeDetected(_) => "activ5.double_squeeze_detected",
            Self::ConnectFailed { .. } => "activ5.connect_failed",
            Self::WriteFailed { .. } => "activ5.write_failed",
            Self::RadioStateChanged(_) => "activ5.radio_state_changed",
            Self::RadioSwitchedOff => "activ5.radio_switched_off",
        }
    }

    /// Device the event concerns, if any
    #[must_use]
    pub const fn device(&self) -> Option<&DeviceInfo> {
        match self {
            Self::DeviceFound(device)
            | Self::DeviceConnected(device)
            | Self::DeviceDisconnected(device)
            | Self::DeviceInitialized(device)
            | Self::DoubleSqueezeDetected(device)
            | Self::MessageReceived { device, .. }
            | Self::IsometricReceived { device, .. }
            | Self::ImuReceived { device, .. }
            | Self::SerialNumberReceived { device, .. }
            | Self::BatteryReceived { device, .. }
            | Self::SqueezeStateChanged { device, .. }
            | Self::ConnectFailed { device, .. }
            | Self::WriteFailed { device, .. } => Some(device),
            Self::SearchCompleted | Self::RadioStateChanged(_) | Self::RadioSwitchedOff => None,
        }
    }
}

/// Receiver of session notifications
///
/// Lifecycle notifications are required; everything else defaults to a no-op.
pub trait DeviceObserver: Send + Sync {
    /// A named device advertised
    fn device_found(&self, device: &DeviceInfo);
    /// Link established
    fn device_connected(&self, device: &DeviceInfo);
    /// Link closed
    fn device_disconnected(&self, device: &DeviceInfo);
    /// Identity is fully known
    fn device_initialized(&self, device: &DeviceInfo);

    /// Discovery window elapsed
    fn search_completed(&self) {}
    /// Any decoded message
    fn message_received(&self, _device: &DeviceInfo, _message: &str, _kind: MessageKind) {}
    /// Force reading in Newtons
    fn isometric_received(&self, _device: &DeviceInfo, _value: f64) {}
    /// Motion sample
    fn imu_received(&self, _device: &DeviceInfo, _sample: &ImuSample) {}
    /// Serial number or fragment
    fn serial_number_received(&self, _device: &DeviceInfo, _value: &str) {}
    /// Battery percentage
    fn battery_received(&self, _device: &DeviceInfo, _value: u64) {}
    /// Squeeze edge
    fn squeeze_state_changed(&self, _device: &DeviceInfo, _state: SqueezeState) {}
    /// Double squeeze recognised
    fn double_squeeze_detected(&self, _device: &DeviceInfo) {}
    /// Connection attempt failed
    fn connect_failed(&self, _device: &DeviceInfo, _reason: Option<&str>) {}
    /// Write or notify request rejected
    fn write_failed(&self, _device: &DeviceInfo, _reason: &str) {}
    /// Radio power state changed
    fn radio_state_changed(&self, _state: RadioState) {}
    /// Scan requested while the radio is off
    fn radio_switched_off(&self) {}
}

/// Route one event to the matching observer method
pub fn deliver(observer: &dyn DeviceObserver, event: &DeviceEvent) {
    match event {
        DeviceEvent::SearchCompleted => observer.search_completed(),
        DeviceEvent::DeviceFound(device) => observer.device_found(device),
        DeviceEvent::DeviceConnected(device) => observer.device_connected(device),
        DeviceEvent::DeviceDisconnected(device) => observer.device_disconnected(device),
        DeviceEvent::DeviceInitialized(device) => observer.device_initialized(device),
        DeviceEvent::MessageReceived { device, message, kind } => {
            observer.message_received(device, message, *kind);
        }
        DeviceEvent::IsometricReceived { device, value } => observer.isometric_received(device, *value),
        DeviceEvent::ImuReceived { device, sample } => observer.imu_received(device, sample),
        DeviceEvent::SerialNumberReceived { device, value } => {
            observer.serial_number_received(device, value);
        }
        DeviceEvent::BatteryReceived { device, value } => observer.battery_received(device, *value),
        DeviceEvent::SqueezeStateChanged { device, state } => {
            observer.squeeze_state_changed(device, *state);
        }
        DeviceEvent::DoubleSqueezeDetected(device) => observer.double_squeeze_detected(device),
        DeviceEvent::ConnectFailed { device, reason } => {
            observer.connect_failed(device, reason.as_deref());
        }
        DeviceEvent::WriteFailed { device, reason } => observer.write_failed(device, reason),
        DeviceEvent::RadioStateChanged(state) => observer.radio_state_changed(*state),
        DeviceEvent::RadioSwitchedOff => observer.radio_switched_off(),
    }
}

/// Weak slot holding the single registered observer
pub(crate) type ObserverSlot = Arc<RwLock<Option<Weak<dyn DeviceObserver>>>>;

/// Background-side handle that enqueues events for the main context
#[derive(Debug, Clone)]
pub(crate) struct EventEmitter {
    sender: mpsc::UnboundedSender<DeviceEvent>,
}

impl EventEmitter {
    pub(crate) fn emit(&self, event: DeviceEvent) {
        debug!("Emitting {}", event.signal_name());
        if self.sender.send(event).is_err() {
            debug!("Main queue dropped, event discarded");
        }
    }
}

/// Single consumer delivering events on the observer context
pub struct MainQueue {
    events: mpsc::UnboundedReceiver<DeviceEvent>,
    observer: ObserverSlot,
    signals: broadcast::Sender<DeviceEvent>,
}

impl MainQueue {
    pub(crate) fn channel(
        observer: ObserverSlot,
        signals: broadcast::Sender<DeviceEvent>,
    ) -> (EventEmitter, Self) {
        let (sender, events) = mpsc::unbounded_channel();
        (
            EventEmitter { sender },
            Self {
                events,
                observer,
                signals,
            },
        )
    }

    /// Deliver events until the manager is dropped
    pub async fn run(mut self) {
        while self.dispatch_next().await.is_some() {}
        debug!("Main queue closed");
    }

    /// Wait for one event, deliver it and return it
    pub async fn dispatch_next(&mut self) -> Option<DeviceEvent> {
        let event = self.events.recv().await?;
        self.dispatch(&event).await;
        Some(event)
    }

    /// Deliver every event already queued, in order
    pub async fn dispatch_pending(&mut self) -> Vec<DeviceEvent> {
        let mut delivered = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            self.dispatch(&event).await;
            delivered.push(event);
        }
        delivered
    }

    async fn dispatch(&self, event: &DeviceEvent) {
        let observer = self.observer.read().await.as_ref().and_then(Weak::upgrade);
        if let Some(observer) = observer {
            deliver(observer.as_ref(), event);
        }
        // No subscribers is not an error
        let _ = self.signals.send(event.clone());
    }
}
