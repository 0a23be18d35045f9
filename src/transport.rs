//! Seam between the session engine and the radio stack.
//!
//! Every [`Transport`] method is a fire-and-forget request: it returns as
//! soon as the request is queued and its outcome arrives later as a
//! [`TransportEvent`] published through an [`EventSink`].

use crate::{
    error::Result,
    protocol::Channel,
    types::{PeripheralKey, RadioState},
};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::error;
use uuid::Uuid;

/// Characteristic reference as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// UUID of the owning service
    pub service_uuid: Uuid,
}

impl ChannelHandle {
    /// Create a handle
    #[must_use]
    pub const fn new(uuid: Uuid, service_uuid: Uuid) -> Self {
        Self { uuid, service_uuid }
    }

    /// Logical channel behind this characteristic
    #[must_use]
    pub fn channel(&self) -> Channel {
        Channel::from_uuid(&self.uuid)
    }
}

/// Requests the session engine issues to the radio stack
pub trait Transport: Send + Sync + 'static {
    /// Last known radio power state
    fn radio_state(&self) -> RadioState;

    /// Start discovery for peripherals advertising any of `services`
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be queued.
    fn start_discovery(&self, services: &[Uuid]) -> Result<()>;

    /// Stop discovery
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be queued.
    fn stop_discovery(&self) -> Result<()>;

    /// Open a connection
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be queued.
    fn connect(&self, peripheral: &PeripheralKey) -> Result<()>;

    /// Close a connection
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be queued.
    fn disconnect(&self, peripheral: &PeripheralKey) -> Result<()>;

    /// Discover services and characteristics of a connected peripheral
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be queued.
    fn discover_services(&self, peripheral: &PeripheralKey) -> Result<()>;

    /// Read a characteristic; the value arrives as [`TransportEvent::ValueUpdated`]
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be queued.
    fn read(&self, peripheral: &PeripheralKey, channel: &ChannelHandle) -> Result<()>;

    /// Write a characteristic with acknowledged delivery
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be queued.
    fn write(&self, peripheral: &PeripheralKey, channel: &ChannelHandle, data: Bytes) -> Result<()>;

    /// Enable or disable notifications on a characteristic
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be queued.
    fn set_notify(&self, peripheral: &PeripheralKey, channel: &ChannelHandle, enabled: bool) -> Result<()>;
}

/// Events delivered by the radio stack
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Radio power state changed
    RadioStateChanged(RadioState),
    /// Advertisement received
    Discovered {
        /// Transport handle
        peripheral: PeripheralKey,
        /// Advertised local name
        name: Option<String>,
        /// Signal strength in dB
        rssi: Option<i16>,
    },
    /// Connection established
    Connected {
        /// Transport handle
        peripheral: PeripheralKey,
    },
    /// Connection attempt failed
    ConnectFailed {
        /// Transport handle
        peripheral: PeripheralKey,
        /// Failure reason
        reason: Option<String>,
    },
    /// Connection closed
    Disconnected {
        /// Transport handle
        peripheral: PeripheralKey,
        /// Failure reason, if the link dropped
        reason: Option<String>,
    },
    /// Services of a connected peripheral
    ServicesDiscovered {
        /// Transport handle
        peripheral: PeripheralKey,
        /// Service UUIDs
        services: Vec<Uuid>,
    },
    /// Characteristics of a connected peripheral
    CharacteristicsDiscovered {
        /// Transport handle
        peripheral: PeripheralKey,
        /// Characteristics across all services
        characteristics: Vec<ChannelHandle>,
    },
    /// Write or notify toggle failed
    WriteFailed {
        /// Transport handle
        peripheral: PeripheralKey,
        /// Target characteristic
        channel: ChannelHandle,
        /// Failure reason
        reason: String,
    },
    /// Characteristic value read or notified
    ValueUpdated {
        /// Transport handle
        peripheral: PeripheralKey,
        /// Source characteristic
        channel: ChannelHandle,
        /// Value, absent when the read failed
        value: Option<Bytes>,
    },
}

/// Work item for the manager's background context
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Radio stack event
    Transport(TransportEvent),
    /// Discovery window elapsed
    ScanTimeout {
        /// Scan the timer was armed for; stale timeouts are ignored
        generation: u64,
    },
    /// Evergreen keep-alive tick
    KeepAlive {
        /// Device name
        device: String,
    },
    /// Squeeze gesture window elapsed
    SqueezeTimeout {
        /// Device name
        device: String,
    },
}

/// Cloneable sender into the manager's inbox
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<Input>,
}

impl EventSink {
    /// Publish a radio stack event
    pub fn publish(&self, event: TransportEvent) {
        self.post(Input::Transport(event));
    }

    pub(crate) fn post(&self, input: Input) {
        if self.sender.send(input).is_err() {
            error!("Manager inbox closed, dropping input");
        }
    }
}

/// Receiving half of the manager's inbox
#[derive(Debug)]
pub struct Inbox {
    receiver: mpsc::UnboundedReceiver<Input>,
}

impl Inbox {
    /// Wait for the next work item
    pub async fn recv(&mut self) -> Option<Input> {
        self.receiver.recv().await
    }

    /// Take the next work item if one is queued
    pub fn try_recv(&mut self) -> Option<Input> {
        self.receiver.try_recv().ok()
    }
}

/// Create a linked sink/inbox pair
#[must_use]
pub fn inbox() -> (EventSink, Inbox) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (EventSink { sender }, Inbox { receiver })
}


#[cfg(test)]
mod tests {
    use super::*;
    use btleplug::api::bleuuid::uuid_from_u16;

    #[test]
    fn test_handle_resolves_channel() {
        let handle = ChannelHandle::new(uuid_from_u16(0xF0FE), uuid_from_u16(0xF0F0));
        assert_eq!(handle.channel(), Channel::Force);
    }

    #[tokio::test]
    async fn test_inbox_preserves_order() {
        let (sink, mut inbox) = inbox();
        sink.publish(TransportEvent::RadioStateChanged(RadioState::PoweredOn));
        sink.post(Input::ScanTimeout { generation: 1 });

        assert_eq!(
            inbox.recv().await,
            Some(Input::Transport(TransportEvent::RadioStateChanged(RadioState::PoweredOn)))
        );
        assert_eq!(inbox.recv().await, Some(Input::ScanTimeout { generation: 1 }));
        assert_eq!(inbox.try_recv(), None);
    }
}
