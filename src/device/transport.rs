//! What the session needs from the host BLE stack.
//!
//! Every method only starts an operation and returns immediately. Outcomes come back later as
//! [`TransportEvent`](crate::device::types::TransportEvent)s, which the owner of the session feeds to
//! [`RingSession::handle_transport_event`](crate::device::session::RingSession::handle_transport_event)
//! one at a time.

use uuid::Uuid;

use crate::device::types::{AccessoryIdentity, CharacteristicRef, ConnectOptions, PeripheralId};

pub trait Transport {
    /// Whether the radio is currently usable.
    fn is_powered(&self) -> bool;

    /// Look up a previously paired peripheral without scanning.
    fn retrieve_known(&mut self, identity: &AccessoryIdentity) -> Option<PeripheralId>;

    /// Results arrive as [`TransportEvent::Discovered`](crate::device::types::TransportEvent::Discovered).
    fn scan(&mut self, service_filter: &[Uuid]);

    fn stop_scan(&mut self);

    /// Results arrive as [`TransportEvent::Connected`](crate::device::types::TransportEvent::Connected) or [`TransportEvent::ConnectFailed`](crate::device::types::TransportEvent::ConnectFailed).
    fn connect(&mut self, peripheral: &PeripheralId, options: ConnectOptions);

    fn disconnect(&mut self, peripheral: &PeripheralId);

    fn discover_services(&mut self, peripheral: &PeripheralId, services: &[Uuid]);

    fn discover_characteristics(&mut self, peripheral: &PeripheralId, service: Uuid, characteristics: &[Uuid]);

    fn set_notify(&mut self, peripheral: &PeripheralId, characteristic: &CharacteristicRef, enabled: bool);

    /// Acknowledged with [`TransportEvent::WriteAck`](crate::device::types::TransportEvent::WriteAck).
    fn write(&mut self, peripheral: &PeripheralId, characteristic: &CharacteristicRef, bytes: &[u8], with_response: bool);

    /// Drop the platform manager. Nothing is scanned or connected until the next accessory is saved.
    fn release(&mut self);
}
