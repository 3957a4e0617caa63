use std::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::commands::{BatteryInfo, RealTimeReading};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Ready,
    Disconnected,
}

impl ConnectionState {
    /// A link is being brought up; the accessory must not be removed now.
    pub fn is_mid_operation(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::DiscoveringServices
                | ConnectionState::DiscoveringCharacteristics
        )
    }

    pub fn is_linked(self) -> bool {
        self.is_mid_operation() || self == ConnectionState::Ready
    }
}

/// Platform handle of a peripheral, stable for as long as the pairing lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(pub String);

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessoryIdentity {
    pub id: PeripheralId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
    pub id: PeripheralId,
    pub local_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub uuid: Uuid,
}

/// Write and notify characteristics. Only complete while `Ready`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharacteristicHandles {
    pub write: Option<CharacteristicRef>,
    pub notify: Option<CharacteristicRef>,
}

impl CharacteristicHandles {
    pub fn is_complete(&self) -> bool {
        self.write.is_some() && self.notify.is_some()
    }

    pub fn clear(&mut self) {
        self.write = None;
        self.notify = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub notify_on_connect: bool,
    pub notify_on_disconnect: bool,
    pub start_delay: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            notify_on_connect: true,
            notify_on_disconnect: true,
            start_delay: Duration::from_millis(crate::device::constants::CONNECT_DELAY),
        }
    }
}

/// Callbacks from the host BLE stack, delivered one at a time to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PoweredOn,
    PoweredOff,
    Discovered(DiscoveredPeripheral),
    Connected(PeripheralId),
    ConnectFailed { peripheral: PeripheralId, reason: String },
    Disconnected { peripheral: PeripheralId, reason: Option<String> },
    ServicesDiscovered { peripheral: PeripheralId, services: Result<Vec<Uuid>, String> },
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: Uuid,
        characteristics: Result<Vec<CharacteristicRef>, String>,
    },
    ValueUpdate { characteristic: CharacteristicRef, value: Vec<u8> },
    WriteAck { characteristic: CharacteristicRef, result: Result<(), String> },
}

/// What subscribers of a session get to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    StateChange(ConnectionState),
    Reading { reading: RealTimeReading, value: u8 },
    Battery(BatteryInfo),
}
