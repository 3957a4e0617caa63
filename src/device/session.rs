//! The connection state machine for one ring.
//!
//! ```text
//! Idle ──powered, nothing known──▶ Scanning ──discovered──▶ Connecting
//! Idle ──powered, known peripheral───────────────────────▶ Connecting
//! Connecting ──connected──▶ DiscoveringServices ──ring service──▶ DiscoveringCharacteristics
//! DiscoveringCharacteristics ──write + notify resolved──▶ Ready
//! any ──disconnected / connect failed──▶ Disconnected ──discovered or known──▶ Connecting
//! any ──powered off──▶ Idle
//! ```
//!
//! All mutation happens through `&mut self` from a single owner (see [`crate::device::driver`]);
//! transport callbacks and caller commands are applied one at a time.

use std::collections::HashMap;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::channel::oneshot;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::config::types::Config;
use crate::device::accessory::AccessoryEvent;
use crate::device::battery::BatteryCoordinator;
use crate::device::constants::{discovery_services, make_device_info_service_uuid, make_ring_service_uuid, make_uart_rx_uuid, make_uart_tx_uuid};
use crate::device::streaming::StreamingController;
use crate::device::transport::Transport;
use crate::device::types::{AccessoryIdentity, CharacteristicHandles, CharacteristicRef, ConnectOptions, ConnectionState, DeviceEvent, DiscoveredPeripheral, PeripheralId, TransportEvent};
use crate::error::{ProtocolError, SessionError};
use crate::protocol::codec::{CodecVersion, Packet, PacketCodec};
use crate::protocol::commands::{BatteryInfo, RealTimeReading, RealTimeSample, StreamAction, CMD_BATTERY, CMD_START_REAL_TIME, CMD_STOP_REAL_TIME};
use crate::timeline::{Timeline, TimelineEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub codec: CodecVersion,
    pub raw_logging: bool,
    pub connect_options: ConnectOptions,
    pub accessory: Option<AccessoryIdentity>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            codec: CodecVersion::default(),
            raw_logging: false,
            connect_options: ConnectOptions::default(),
            accessory: None,
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        SessionSettings {
            codec: config.codec,
            raw_logging: config.raw_logging,
            connect_options: ConnectOptions {
                start_delay: config.connect_delay(),
                ..ConnectOptions::default()
            },
            accessory: config.accessory.clone(),
        }
    }
}

pub struct RingSession<T: Transport> {
    transport: T,
    // false once the accessory was removed, until a new one is saved
    transport_active: bool,
    codec: Box<dyn PacketCodec>,
    connect_options: ConnectOptions,
    raw_logging: bool,

    state: ConnectionState,
    identity: Option<AccessoryIdentity>,
    peripheral: Option<PeripheralId>,
    handles: CharacteristicHandles,
    scan_in_progress: bool,
    picker_dismissed: bool,

    battery: BatteryCoordinator,
    streaming: StreamingController,
    latest: HashMap<RealTimeReading, u8>,
    timeline: Timeline,
    subscribers: Vec<UnboundedSender<DeviceEvent>>,
}

impl<T: Transport> RingSession<T> {
    pub fn new(transport: T, settings: SessionSettings) -> Self {
        RingSession {
            transport,
            transport_active: true,
            codec: settings.codec.codec(),
            connect_options: settings.connect_options,
            raw_logging: settings.raw_logging,
            state: ConnectionState::Idle,
            identity: settings.accessory,
            peripheral: None,
            handles: CharacteristicHandles::default(),
            scan_in_progress: false,
            picker_dismissed: true,
            battery: BatteryCoordinator::new(),
            streaming: StreamingController::new(),
            latest: HashMap::new(),
            timeline: Timeline::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn identity(&self) -> Option<&AccessoryIdentity> {
        self.identity.as_ref()
    }

    pub fn handles(&self) -> &CharacteristicHandles {
        &self.handles
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn latest(&self, reading: RealTimeReading) -> Option<u8> {
        self.latest.get(&reading).copied()
    }

    pub fn latest_heart_rate(&self) -> Option<u8> {
        self.latest(RealTimeReading::HeartRate)
    }

    pub fn latest_spo2(&self) -> Option<u8> {
        self.latest(RealTimeReading::Spo2)
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_in_progress
    }

    pub fn picker_dismissed(&self) -> bool {
        self.picker_dismissed
    }

    pub fn battery_pending(&self) -> bool {
        self.battery.is_pending()
    }

    pub fn active_streams(&self) -> Vec<RealTimeReading> {
        self.streaming.active().collect()
    }

    pub fn raw_logging(&self) -> bool {
        self.raw_logging
    }

    pub fn set_raw_logging(&mut self, enabled: bool) {
        self.raw_logging = enabled;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn subscribe(&mut self) -> UnboundedReceiver<DeviceEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: DeviceEvent) {
        self.subscribers.retain(|subscriber| subscriber.unbounded_send(event.clone()).is_ok());
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("Connection state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.emit(DeviceEvent::StateChange(state));
        }
    }

    fn record_transition(&mut self, transition: &str) {
        self.timeline.append(TimelineEvent::connection(transition));
    }

    // ------------------------------------------------------------------
    // Caller operations
    // ------------------------------------------------------------------

    /// Connect to the known or discovered peripheral. Does nothing unless the transport is powered
    /// and a peripheral is known, or while a link is already up or coming up.
    pub fn connect(&mut self) {
        if !self.transport_active || !self.transport.is_powered() {
            debug!("Not connecting: transport unavailable");
            return;
        }
        if self.state.is_linked() {
            debug!("Not connecting: already {:?}", self.state);
            return;
        }

        if self.peripheral.is_none() {
            if let Some(identity) = &self.identity {
                self.peripheral = self.transport.retrieve_known(identity);
            }
        }

        let Some(peripheral) = self.peripheral.clone() else {
            debug!("Not connecting: no peripheral known");
            return;
        };

        info!("Connecting to peripheral {}...", peripheral);
        self.transport.connect(&peripheral, self.connect_options);
        self.set_state(ConnectionState::Connecting);
    }

    /// Tear down the live link and stop any scan. A live link's state follows when the transport
    /// reports the disconnect; a halted scan returns to `Idle` at once.
    pub fn disconnect(&mut self) {
        if let Some(peripheral) = &self.peripheral {
            info!("Disconnecting from peripheral {}", peripheral);
            self.transport.disconnect(peripheral);
        }
        self.stop_scan_if_needed();
        if self.state == ConnectionState::Scanning {
            self.set_state(ConnectionState::Idle);
        }
    }

    /// Forget the accessory and release the transport. Refused while a link is coming up.
    pub fn remove_accessory(&mut self) -> Result<Option<AccessoryIdentity>, SessionError> {
        if self.state.is_mid_operation() {
            return Err(SessionError::Busy(self.state));
        }

        let Some(identity) = self.identity.take() else {
            return Ok(None);
        };

        info!("Removing accessory {}", identity.display_name);
        if self.state == ConnectionState::Ready {
            self.disconnect();
        }
        self.release_transport();
        Ok(Some(identity))
    }

    pub fn request_battery(&mut self) -> oneshot::Receiver<BatteryInfo> {
        let (tx, rx) = oneshot::channel();
        self.submit_battery_request(tx);
        rx
    }

    /// Send a battery query and park `reply` in the correlation slot. When not `Ready` nothing is
    /// written and `reply` is dropped. Returns whether the query was written.
    pub fn submit_battery_request(&mut self, reply: oneshot::Sender<BatteryInfo>) -> bool {
        let Some((peripheral, write)) = self.ready_link() else {
            warn!("Cannot send battery request. Peripheral or characteristic not ready.");
            return false;
        };

        let frame = match self.codec.encode(CMD_BATTERY, &[]) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Failed to create battery packet: {}", err);
                return false;
            },
        };

        self.transport.write(&peripheral, &write, &frame, true);
        self.battery.arm(reply);
        true
    }

    pub fn start_streaming(&mut self, reading: RealTimeReading) -> bool {
        self.send_stream_action(reading, StreamAction::Start)
    }

    pub fn continue_streaming(&mut self, reading: RealTimeReading) -> bool {
        self.send_stream_action(reading, StreamAction::Continue)
    }

    pub fn pause_streaming(&mut self, reading: RealTimeReading) -> bool {
        self.send_stream_action(reading, StreamAction::Pause)
    }

    pub fn stop_streaming(&mut self, reading: RealTimeReading) -> bool {
        self.send_stream_action(reading, StreamAction::Stop)
    }

    /// Keep every started stream alive. Called on the caller's cadence.
    pub fn continue_active_streams(&mut self) {
        for reading in self.streaming.active().collect::<Vec<_>>() {
            self.continue_streaming(reading);
        }
    }

    fn send_stream_action(&mut self, reading: RealTimeReading, action: StreamAction) -> bool {
        let Some((peripheral, write)) = self.ready_link() else {
            warn!("Cannot send real-time command. Peripheral or characteristic not ready.");
            return false;
        };

        match self.streaming.frame(self.codec.as_ref(), reading, action) {
            Ok(frame) => {
                debug!("Real-time {:?} {}", action, reading);
                self.transport.write(&peripheral, &write, &frame, true);
                true
            },
            Err(err) => {
                warn!("Failed to create real-time packet: {}", err);
                false
            },
        }
    }

    fn ready_link(&self) -> Option<(PeripheralId, CharacteristicRef)> {
        if self.state != ConnectionState::Ready {
            return None;
        }
        Some((self.peripheral.clone()?, self.handles.write?))
    }

    // ------------------------------------------------------------------
    // Accessory events
    // ------------------------------------------------------------------

    pub fn handle_accessory_event(&mut self, event: AccessoryEvent) {
        debug!("Accessory event {:?}", event);
        match event {
            AccessoryEvent::Added(identity) | AccessoryEvent::Changed(identity) => self.save_accessory(identity),
            AccessoryEvent::Activated(Some(identity)) => self.save_accessory(identity),
            AccessoryEvent::Activated(None) => {},
            AccessoryEvent::Removed(identity) => {
                if self.identity.as_ref().is_some_and(|current| current.id == identity.id) {
                    self.identity = None;
                }
                if self.transport_active {
                    self.release_transport();
                }
            },
            AccessoryEvent::PickerPresented => self.picker_dismissed = false,
            AccessoryEvent::PickerDismissed => self.picker_dismissed = true,
        }
    }

    fn save_accessory(&mut self, identity: AccessoryIdentity) {
        info!("Using accessory {} ({})", identity.display_name, identity.id);
        self.identity = Some(identity);

        if !self.transport_active {
            self.transport_active = true;
        }
        if self.transport.is_powered() {
            self.start();
        }
    }

    fn release_transport(&mut self) {
        self.stop_scan_if_needed();
        self.transport_active = false;
        if self.state.is_linked() {
            self.on_link_lost("disconnected");
        }
        self.peripheral = None;
        self.transport.release();
        self.set_state(ConnectionState::Idle);
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    /// Apply one transport callback. Never fails; problems are logged.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        use ConnectionState::*;

        match (self.state, event) {
            (_, TransportEvent::PoweredOn) => {
                info!("Transport powered on");
                self.start();
            },
            (_, TransportEvent::PoweredOff) => {
                info!("Transport powered off");
                self.scan_in_progress = false;
                if self.state.is_linked() {
                    self.on_link_lost("disconnected");
                }
                self.peripheral = None;
                self.set_state(Idle);
            },
            (Idle | Scanning | Disconnected, TransportEvent::Discovered(discovered)) => {
                self.on_discovered(discovered);
            },
            (Connecting, TransportEvent::Connected(peripheral)) if self.is_current(&peripheral) => {
                info!("Connected; Discovering services...");
                self.stop_scan_if_needed();
                self.set_state(DiscoveringServices);
                self.record_transition("connected");
                self.transport.discover_services(&peripheral, &discovery_services());
            },
            (DiscoveringServices, TransportEvent::ServicesDiscovered { peripheral, services }) if self.is_current(&peripheral) => {
                self.on_services(peripheral, services);
            },
            (DiscoveringCharacteristics, TransportEvent::CharacteristicsDiscovered { peripheral, service, characteristics })
                if self.is_current(&peripheral) && service == make_ring_service_uuid() =>
            {
                self.on_characteristics(peripheral, characteristics);
            },
            (_, TransportEvent::ConnectFailed { peripheral, reason }) if self.is_current(&peripheral) => {
                warn!("Failed to connect to peripheral {}: {}", peripheral, reason);
                self.on_link_lost("connect_failed");
                self.start();
            },
            // a link that never came up is reported as ConnectFailed
            (DiscoveringServices | DiscoveringCharacteristics | Ready, TransportEvent::Disconnected { peripheral, reason })
                if self.is_current(&peripheral) =>
            {
                warn!("Disconnected from peripheral {} ({})", peripheral, reason.as_deref().unwrap_or("no reason"));
                self.on_link_lost("disconnected");
                self.start();
            },
            (_, TransportEvent::ValueUpdate { characteristic, value }) => {
                if self.handles.notify == Some(characteristic) {
                    self.on_value(&value);
                } else {
                    debug!("Ignoring value from characteristic {:?}", characteristic.uuid);
                }
            },
            (_, TransportEvent::WriteAck { characteristic, result }) => match result {
                Ok(()) => debug!("Write to characteristic {} successful", characteristic.uuid),
                Err(err) => warn!("Write to characteristic {} failed: {}", characteristic.uuid, err),
            },
            (state, event) => {
                debug!("Ignoring {:?} while {:?}", event, state);
            },
        }
    }

    fn is_current(&self, peripheral: &PeripheralId) -> bool {
        self.peripheral.as_ref() == Some(peripheral)
    }

    /// Reconnect to what we know, or scan for it.
    fn start(&mut self) {
        if !self.transport_active || !self.transport.is_powered() || self.state.is_linked() {
            return;
        }

        if self.peripheral.is_none() {
            if let Some(identity) = &self.identity {
                self.peripheral = self.transport.retrieve_known(identity);
                if self.peripheral.is_some() {
                    info!("Found previously connected peripheral");
                }
            }
        }

        if self.peripheral.is_some() {
            self.connect();
        } else {
            info!("Known peripheral not found, starting scan");
            self.start_scan_if_needed();
        }
    }

    fn start_scan_if_needed(&mut self) {
        if !self.transport_active || !self.transport.is_powered() || self.scan_in_progress || self.peripheral.is_some() {
            return;
        }

        info!("Starting scan for ring...");
        self.transport.scan(&[make_ring_service_uuid()]);
        self.scan_in_progress = true;
        if self.state == ConnectionState::Idle {
            self.set_state(ConnectionState::Scanning);
        }
    }

    fn stop_scan_if_needed(&mut self) {
        if self.scan_in_progress {
            self.transport.stop_scan();
            self.scan_in_progress = false;
        }
    }

    fn on_discovered(&mut self, discovered: DiscoveredPeripheral) {
        if let Some(identity) = &self.identity {
            if identity.id != discovered.id {
                debug!("Ignoring peripheral {} that is not the paired ring", discovered.id);
                return;
            }
        }

        info!("Discovered peripheral {} {}", discovered.id, discovered.local_name.as_deref().unwrap_or("NONE"));
        self.stop_scan_if_needed();
        self.peripheral = Some(discovered.id);
        self.connect();
    }

    fn on_services(&mut self, peripheral: PeripheralId, services: Result<Vec<Uuid>, String>) {
        let services = match services {
            Ok(services) => services,
            Err(err) => {
                warn!("Service discovery failed: {}", err);
                self.transport.disconnect(&peripheral);
                return;
            },
        };

        debug!("Found {} services", services.len());
        let ring_service = make_ring_service_uuid();
        for service in &services {
            if *service == make_device_info_service_uuid() {
                debug!("Found device info service");
            }
        }

        if services.contains(&ring_service) {
            info!("Found ring service, discovering characteristics...");
            self.set_state(ConnectionState::DiscoveringCharacteristics);
            self.transport.discover_characteristics(&peripheral, ring_service, &[make_uart_rx_uuid(), make_uart_tx_uuid()]);
        } else {
            warn!("Peripheral does not offer the ring service");
            self.transport.disconnect(&peripheral);
        }
    }

    fn on_characteristics(&mut self, peripheral: PeripheralId, characteristics: Result<Vec<CharacteristicRef>, String>) {
        let characteristics = match characteristics {
            Ok(characteristics) => characteristics,
            Err(err) => {
                warn!("Characteristic discovery failed: {}", err);
                self.transport.disconnect(&peripheral);
                return;
            },
        };

        let rx = make_uart_rx_uuid();
        let tx = make_uart_tx_uuid();
        for characteristic in characteristics {
            if characteristic.uuid == rx {
                debug!("Found UART RX characteristic");
                self.handles.write = Some(characteristic);
            } else if characteristic.uuid == tx {
                debug!("Found UART TX characteristic");
                self.handles.notify = Some(characteristic);
                self.transport.set_notify(&peripheral, &characteristic, true);
            } else {
                debug!("Found other characteristic: {}", characteristic.uuid);
            }
        }

        if self.handles.is_complete() {
            info!("Peripheral ready for UART communication");
            self.set_state(ConnectionState::Ready);
            self.record_transition("ready");
        } else {
            warn!("Peripheral not ready, missing UART characteristics");
            self.transport.disconnect(&peripheral);
        }
    }

    fn on_link_lost(&mut self, transition: &str) {
        self.handles.clear();
        self.peripheral = None;
        self.battery.discard();
        self.streaming.clear();
        self.set_state(ConnectionState::Disconnected);
        self.record_transition(transition);
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    fn on_value(&mut self, value: &[u8]) {
        let packet = match self.codec.decode(value) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("Dropping packet {:?}: {}", value, ProtocolError::from(err));
                return;
            },
        };

        // only frames that decode reach the raw log
        if self.raw_logging {
            self.timeline.append(TimelineEvent::raw_packet(value));
        }

        if let Err(err) = self.route(&packet) {
            warn!("Dropping packet {:?}: {}", value, err);
        }
    }

    fn route(&mut self, packet: &Packet) -> Result<(), ProtocolError> {
        match packet.command {
            CMD_BATTERY => {
                let info = BatteryInfo::parse(packet)?;
                info!("Battery {}% charging: {}", info.level, info.charging);
                self.timeline.append(TimelineEvent::battery(info.level, info.charging));
                self.emit(DeviceEvent::Battery(info));
                self.battery.resolve(info);
            },
            CMD_START_REAL_TIME => {
                let sample = RealTimeSample::parse(packet)?;
                if sample.is_ok() {
                    self.apply_reading(sample.reading, sample.value);
                } else {
                    warn!("Error in reading - Type: {}, Error Code: {}", sample.reading, sample.error_code);
                }
            },
            CMD_STOP_REAL_TIME => {
                debug!("Real-time stop acknowledged");
            },
            command => return Err(ProtocolError::UnknownCommand(command)),
        }

        Ok(())
    }

    fn apply_reading(&mut self, reading: RealTimeReading, value: u8) {
        debug!("Real-Time Reading - Type: {}, Value: {}", reading, value);
        self.latest.insert(reading, value);

        let event = match reading {
            RealTimeReading::HeartRate => TimelineEvent::heart_rate(value),
            RealTimeReading::Spo2 => TimelineEvent::spo2(value),
            other => TimelineEvent::raw_reading(&other.to_string(), value),
        };
        self.timeline.append(event);
        self.emit(DeviceEvent::Reading { reading, value });
    }
}

#[cfg(test)]
mod tests {
    use futures::channel::oneshot::Canceled;

    use super::*;
    use crate::device::transport::mock::{Call, MockTransport};
    use crate::protocol::codec::FramedCodec;
    use crate::timeline::TimelineKind;

    fn ring_id() -> PeripheralId {
        PeripheralId("ring-1".to_string())
    }

    fn rx() -> CharacteristicRef {
        CharacteristicRef { service: make_ring_service_uuid(), uuid: make_uart_rx_uuid() }
    }

    fn tx() -> CharacteristicRef {
        CharacteristicRef { service: make_ring_service_uuid(), uuid: make_uart_tx_uuid() }
    }

    fn raw_settings() -> SessionSettings {
        SessionSettings { codec: CodecVersion::Raw, ..SessionSettings::default() }
    }

    fn session(settings: SessionSettings) -> RingSession<MockTransport> {
        RingSession::new(MockTransport::powered(), settings)
    }

    fn drive_to_ready(session: &mut RingSession<MockTransport>) {
        session.handle_transport_event(TransportEvent::PoweredOn);
        session.handle_transport_event(TransportEvent::Discovered(DiscoveredPeripheral {
            id: ring_id(),
            local_name: Some("R02_1234".to_string()),
        }));
        session.handle_transport_event(TransportEvent::Connected(ring_id()));
        session.handle_transport_event(TransportEvent::ServicesDiscovered {
            peripheral: ring_id(),
            services: Ok(vec![make_device_info_service_uuid(), make_ring_service_uuid()]),
        });
        session.handle_transport_event(TransportEvent::CharacteristicsDiscovered {
            peripheral: ring_id(),
            service: make_ring_service_uuid(),
            characteristics: Ok(vec![rx(), tx()]),
        });
    }

    fn ready_session() -> RingSession<MockTransport> {
        let mut session = session(raw_settings());
        drive_to_ready(&mut session);
        assert_eq!(session.state(), ConnectionState::Ready);
        session.transport_mut().calls.clear();
        session
    }

    fn notify(session: &mut RingSession<MockTransport>, value: &[u8]) {
        session.handle_transport_event(TransportEvent::ValueUpdate { characteristic: tx(), value: value.to_vec() });
    }

    #[test]
    fn discovery_to_ready() {
        let mut session = session(raw_settings());
        let mut events = session.subscribe();
        drive_to_ready(&mut session);

        assert_eq!(session.state(), ConnectionState::Ready);
        assert!(session.handles().is_complete());
        assert!(!session.is_scanning());

        let calls = &session.transport().calls;
        assert_eq!(calls[0], Call::Scan(vec![make_ring_service_uuid()]));
        assert_eq!(calls[1], Call::StopScan);
        assert!(matches!(&calls[2], Call::Connect(id, options) if *id == ring_id() && options.notify_on_disconnect));
        assert_eq!(calls[3], Call::DiscoverServices(ring_id(), discovery_services()));
        assert_eq!(calls[4], Call::DiscoverCharacteristics(ring_id(), make_ring_service_uuid(), vec![make_uart_rx_uuid(), make_uart_tx_uuid()]));
        assert_eq!(calls[5], Call::SetNotify(tx(), true));

        let states: Vec<_> = std::iter::from_fn(|| events.try_next().ok().flatten())
            .filter_map(|event| match event {
                DeviceEvent::StateChange(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![
            ConnectionState::Scanning,
            ConnectionState::Connecting,
            ConnectionState::DiscoveringServices,
            ConnectionState::DiscoveringCharacteristics,
            ConnectionState::Ready,
        ]);

        let transitions: Vec<_> = session.timeline().snapshot().iter().filter_map(|e| e.get("state").map(str::to_string)).collect();
        assert_eq!(transitions, vec!["connected", "ready"]);
    }

    #[test]
    fn known_peripheral_connects_without_scanning() {
        let identity = AccessoryIdentity { id: ring_id(), display_name: "COLMI R02 Ring".to_string() };
        let mut session = session(SessionSettings { accessory: Some(identity), ..raw_settings() });
        session.transport_mut().known = Some(ring_id());

        session.handle_transport_event(TransportEvent::PoweredOn);

        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(session.transport().count(|c| matches!(c, Call::Scan(_))), 0);
        assert_eq!(session.transport().count(|c| matches!(c, Call::Connect(..))), 1);
    }

    #[test]
    fn foreign_peripheral_is_ignored_when_paired() {
        let identity = AccessoryIdentity { id: ring_id(), display_name: "COLMI R02 Ring".to_string() };
        let mut session = session(SessionSettings { accessory: Some(identity), ..raw_settings() });
        session.handle_transport_event(TransportEvent::PoweredOn);
        assert_eq!(session.state(), ConnectionState::Scanning);

        session.handle_transport_event(TransportEvent::Discovered(DiscoveredPeripheral {
            id: PeripheralId("someone-else".to_string()),
            local_name: None,
        }));
        assert_eq!(session.state(), ConnectionState::Scanning);
        assert!(session.is_scanning());
    }

    #[test]
    fn unpowered_transport_does_nothing() {
        let mut session = RingSession::new(MockTransport::default(), raw_settings());
        session.connect();
        session.handle_transport_event(TransportEvent::Discovered(DiscoveredPeripheral { id: ring_id(), local_name: None }));
        assert_eq!(session.state(), ConnectionState::Idle);
        assert!(session.transport().calls.is_empty());
    }

    #[test]
    fn connect_is_idempotent() {
        let mut session = ready_session();
        session.connect();
        session.connect();
        assert!(session.transport().calls.is_empty());
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[test]
    fn missing_ring_service_drops_link() {
        let mut session = session(raw_settings());
        session.handle_transport_event(TransportEvent::PoweredOn);
        session.handle_transport_event(TransportEvent::Discovered(DiscoveredPeripheral { id: ring_id(), local_name: None }));
        session.handle_transport_event(TransportEvent::Connected(ring_id()));
        session.handle_transport_event(TransportEvent::ServicesDiscovered {
            peripheral: ring_id(),
            services: Ok(vec![make_device_info_service_uuid()]),
        });

        assert_eq!(session.state(), ConnectionState::DiscoveringServices);
        assert_eq!(session.transport().calls.last(), Some(&Call::Disconnect(ring_id())));
    }

    #[test]
    fn battery_request_resolves_once() {
        let mut session = ready_session();
        let mut reply = session.request_battery();

        assert_eq!(session.transport().writes(), vec![vec![CMD_BATTERY]]);
        assert!(session.battery_pending());

        notify(&mut session, &[3, 85, 1]);
        assert_eq!(reply.try_recv(), Ok(Some(BatteryInfo { level: 85, charging: true })));
        assert_eq!(session.timeline().count(TimelineKind::Battery), 1);

        notify(&mut session, &[3, 85, 1]);
        assert_eq!(session.timeline().count(TimelineKind::Battery), 2);
        assert!(!session.battery_pending());
    }

    #[test]
    fn second_battery_request_wins() {
        let mut session = ready_session();
        let mut first = session.request_battery();
        let mut second = session.request_battery();
        assert_eq!(session.transport().writes().len(), 2);

        notify(&mut session, &[3, 85, 1]);

        assert_eq!(second.try_recv(), Ok(Some(BatteryInfo { level: 85, charging: true })));
        // the first caller never gets a value, its receiver is cancelled
        assert_eq!(first.try_recv(), Err(Canceled));
    }

    #[test]
    fn battery_over_framed_codec() {
        let mut session = session(SessionSettings::default());
        drive_to_ready(&mut session);
        session.transport_mut().calls.clear();

        let mut reply = session.request_battery();
        assert_eq!(session.transport().writes(), vec![FramedCodec.encode(CMD_BATTERY, &[]).unwrap()]);

        notify(&mut session, &FramedCodec.encode(CMD_BATTERY, &[40, 0]).unwrap());
        assert_eq!(reply.try_recv(), Ok(Some(BatteryInfo { level: 40, charging: false })));

        // unframed bytes are too short for this codec and change nothing
        let mut reply = session.request_battery();
        notify(&mut session, &[3, 85, 1]);
        assert_eq!(reply.try_recv(), Ok(None));
        assert_eq!(session.timeline().count(TimelineKind::Battery), 1);
    }

    #[test]
    fn heart_rate_sample_is_applied() {
        let mut session = ready_session();
        let mut events = session.subscribe();

        notify(&mut session, &[105, 1, 0, 72]);

        assert_eq!(session.latest_heart_rate(), Some(72));
        assert_eq!(session.timeline().count(TimelineKind::HeartRate), 1);
        assert_eq!(events.try_next().ok().flatten(), Some(DeviceEvent::Reading { reading: RealTimeReading::HeartRate, value: 72 }));
    }

    #[test]
    fn failed_sample_changes_nothing() {
        let mut session = ready_session();
        let before = session.timeline().len();

        notify(&mut session, &[105, 1, 5, 72]);

        assert_eq!(session.latest_heart_rate(), None);
        assert_eq!(session.timeline().len(), before);
    }

    #[test]
    fn spo2_sample_is_applied() {
        let mut session = ready_session();
        notify(&mut session, &[105, 3, 0, 97]);
        assert_eq!(session.latest_spo2(), Some(97));
        let events = session.timeline().snapshot();
        assert_eq!(events.last().and_then(|e| e.get("spo2")), Some("97"));
    }

    #[test]
    fn garbage_is_dropped() {
        let mut session = ready_session();
        let before = session.timeline().len();

        notify(&mut session, &[]);
        notify(&mut session, &[3, 85]);
        notify(&mut session, &[105, 1]);
        notify(&mut session, &[0x42, 1, 2, 3]);

        assert_eq!(session.timeline().len(), before);
        assert_eq!(session.state(), ConnectionState::Ready);
        assert!(session.latest_heart_rate().is_none());
    }

    #[test]
    fn raw_logging_records_every_frame() {
        let mut session = ready_session();
        session.set_raw_logging(true);

        notify(&mut session, &[0x42, 1]);
        notify(&mut session, &[105, 1, 0, 70]);

        assert_eq!(session.timeline().count(TimelineKind::Raw), 2);
        assert_eq!(session.timeline().count(TimelineKind::HeartRate), 1);
    }

    #[test]
    fn raw_logging_skips_frames_that_do_not_decode() {
        let mut session = session(SessionSettings { raw_logging: true, ..SessionSettings::default() });
        drive_to_ready(&mut session);
        let before = session.timeline().len();

        notify(&mut session, &[3, 85, 1]);
        let mut corrupt = FramedCodec.encode(CMD_BATTERY, &[85, 1]).unwrap();
        corrupt[15] ^= 0xFF;
        notify(&mut session, &corrupt);
        assert_eq!(session.timeline().len(), before);

        notify(&mut session, &FramedCodec.encode(CMD_BATTERY, &[85, 1]).unwrap());
        assert_eq!(session.timeline().count(TimelineKind::Raw), 1);
        assert_eq!(session.timeline().count(TimelineKind::Battery), 1);
    }

    #[test]
    fn values_from_other_characteristics_are_ignored() {
        let mut session = ready_session();
        session.handle_transport_event(TransportEvent::ValueUpdate { characteristic: rx(), value: vec![105, 1, 0, 72] });
        assert_eq!(session.latest_heart_rate(), None);
    }

    #[test]
    fn streaming_commands_when_ready() {
        let mut session = ready_session();
        assert!(session.start_streaming(RealTimeReading::HeartRate));
        assert!(session.continue_streaming(RealTimeReading::HeartRate));
        assert!(session.stop_streaming(RealTimeReading::HeartRate));

        assert_eq!(session.transport().writes(), vec![vec![105, 1, 1], vec![105, 1, 3], vec![106, 1, 4]]);
    }

    #[test]
    fn continue_active_streams_keeps_started_streams_alive() {
        let mut session = ready_session();
        session.start_streaming(RealTimeReading::Spo2);
        session.transport_mut().calls.clear();

        session.continue_active_streams();
        assert_eq!(session.transport().writes(), vec![vec![105, 3, 3]]);
    }

    #[test]
    fn paused_stream_is_not_kept_alive() {
        let mut session = ready_session();
        session.start_streaming(RealTimeReading::HeartRate);
        assert!(session.pause_streaming(RealTimeReading::HeartRate));
        assert!(session.active_streams().is_empty());
        session.transport_mut().calls.clear();

        session.continue_active_streams();
        assert!(session.transport().writes().is_empty());

        session.continue_streaming(RealTimeReading::HeartRate);
        assert_eq!(session.transport().writes(), vec![vec![105, 1, 3]]);
        assert_eq!(session.active_streams(), vec![RealTimeReading::HeartRate]);
    }

    #[test]
    fn commands_while_not_ready_are_no_ops() {
        let mut session = session(raw_settings());
        session.handle_transport_event(TransportEvent::PoweredOn);
        let state = session.state();
        let calls = session.transport().calls.len();

        let mut reply = session.request_battery();
        assert!(!session.start_streaming(RealTimeReading::HeartRate));

        assert_eq!(session.transport().calls.len(), calls);
        assert_eq!(session.state(), state);
        assert!(!session.battery_pending());
        assert!(!matches!(reply.try_recv(), Ok(Some(_))));
    }

    #[test]
    fn disconnect_while_ready() {
        let mut session = ready_session();
        session.start_streaming(RealTimeReading::HeartRate);
        let mut reply = session.request_battery();
        let events_before = session.timeline().count(TimelineKind::Connection);

        session.handle_transport_event(TransportEvent::Disconnected { peripheral: ring_id(), reason: None });

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.handles(), &CharacteristicHandles::default());
        assert!(!session.battery_pending());
        assert!(!matches!(reply.try_recv(), Ok(Some(_))));
        assert!(session.active_streams().is_empty());

        let snapshot = session.timeline().snapshot();
        assert_eq!(session.timeline().count(TimelineKind::Connection), events_before + 1);
        assert_eq!(snapshot.last().and_then(|e| e.get("state")), Some("disconnected"));

        // rescan started
        assert!(session.is_scanning());
        assert_eq!(session.transport().calls.last(), Some(&Call::Scan(vec![make_ring_service_uuid()])));

        // and the late response goes nowhere
        notify(&mut session, &[3, 85, 1]);
        assert_eq!(session.timeline().count(TimelineKind::Battery), 0);
    }

    #[test]
    fn reconnects_after_disconnect() {
        let mut session = ready_session();
        session.handle_transport_event(TransportEvent::Disconnected { peripheral: ring_id(), reason: Some("timeout".to_string()) });
        session.handle_transport_event(TransportEvent::Discovered(DiscoveredPeripheral { id: ring_id(), local_name: None }));
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[test]
    fn connect_failure_retries() {
        let mut session = session(raw_settings());
        session.handle_transport_event(TransportEvent::PoweredOn);
        session.handle_transport_event(TransportEvent::Discovered(DiscoveredPeripheral { id: ring_id(), local_name: None }));
        session.handle_transport_event(TransportEvent::ConnectFailed { peripheral: ring_id(), reason: "closed".to_string() });

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.is_scanning());
        let snapshot = session.timeline().snapshot();
        assert_eq!(snapshot.last().and_then(|e| e.get("state")), Some("connect_failed"));
    }

    #[test]
    fn stale_disconnect_is_ignored() {
        let mut session = ready_session();
        session.handle_transport_event(TransportEvent::Disconnected { peripheral: PeripheralId("other".to_string()), reason: None });
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[test]
    fn user_disconnect_stops_scan() {
        let mut session = session(raw_settings());
        session.handle_transport_event(TransportEvent::PoweredOn);
        assert!(session.is_scanning());

        session.disconnect();
        assert!(!session.is_scanning());
        assert_eq!(session.transport().calls.last(), Some(&Call::StopScan));
        assert_eq!(session.state(), ConnectionState::Idle);

        // nothing known, so connect stays put
        session.connect();
        assert_eq!(session.state(), ConnectionState::Idle);
    }

    #[test]
    fn repeated_disconnect_report_is_counted_once() {
        let identity = AccessoryIdentity { id: ring_id(), display_name: "COLMI R02 Ring".to_string() };
        let mut session = session(SessionSettings { accessory: Some(identity), ..raw_settings() });
        session.transport_mut().known = Some(ring_id());
        session.handle_transport_event(TransportEvent::PoweredOn);
        session.handle_transport_event(TransportEvent::Connected(ring_id()));
        session.handle_transport_event(TransportEvent::ServicesDiscovered { peripheral: ring_id(), services: Ok(vec![make_ring_service_uuid()]) });
        session.handle_transport_event(TransportEvent::CharacteristicsDiscovered {
            peripheral: ring_id(),
            service: make_ring_service_uuid(),
            characteristics: Ok(vec![rx(), tx()]),
        });
        assert_eq!(session.state(), ConnectionState::Ready);

        session.disconnect();
        let connects = session.transport().count(|c| matches!(c, Call::Connect(..)));

        // host disconnect and the adapter both report the same drop
        for reason in [Some("disconnected by host".to_string()), None] {
            session.handle_transport_event(TransportEvent::Disconnected { peripheral: ring_id(), reason });
        }

        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(session.transport().count(|c| matches!(c, Call::Connect(..))), connects + 1);
        let disconnects = session.timeline().snapshot().iter().filter(|e| e.get("state") == Some("disconnected")).count();
        assert_eq!(disconnects, 1);
    }

    #[test]
    fn cancelled_connect_retries_once() {
        let identity = AccessoryIdentity { id: ring_id(), display_name: "COLMI R02 Ring".to_string() };
        let mut session = session(SessionSettings { accessory: Some(identity), ..raw_settings() });
        session.transport_mut().known = Some(ring_id());
        session.handle_transport_event(TransportEvent::PoweredOn);
        assert_eq!(session.state(), ConnectionState::Connecting);

        session.handle_transport_event(TransportEvent::Disconnected { peripheral: ring_id(), reason: None });
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(session.timeline().count(TimelineKind::Connection), 0);

        session.handle_transport_event(TransportEvent::ConnectFailed { peripheral: ring_id(), reason: "connect cancelled".to_string() });
        assert_eq!(session.timeline().count(TimelineKind::Connection), 1);
        assert_eq!(session.transport().count(|c| matches!(c, Call::Connect(..))), 2);
    }

    #[test]
    fn powered_off_returns_to_idle() {
        let mut session = ready_session();
        session.handle_transport_event(TransportEvent::PoweredOff);
        assert_eq!(session.state(), ConnectionState::Idle);
        assert!(!session.handles().is_complete());
    }

    #[test]
    fn remove_accessory_refused_mid_operation() {
        let identity = AccessoryIdentity { id: ring_id(), display_name: "COLMI R02 Ring".to_string() };
        let mut session = session(SessionSettings { accessory: Some(identity), ..raw_settings() });
        session.transport_mut().known = Some(ring_id());
        session.handle_transport_event(TransportEvent::PoweredOn);

        assert_eq!(session.remove_accessory(), Err(SessionError::Busy(ConnectionState::Connecting)));
        assert!(session.identity().is_some());
    }

    #[test]
    fn remove_accessory_while_ready() {
        let identity = AccessoryIdentity { id: ring_id(), display_name: "COLMI R02 Ring".to_string() };
        let mut session = session(SessionSettings { accessory: Some(identity.clone()), ..raw_settings() });
        drive_to_ready(&mut session);
        session.transport_mut().calls.clear();

        assert_eq!(session.remove_accessory(), Ok(Some(identity)));
        assert_eq!(session.identity(), None);
        assert_eq!(session.state(), ConnectionState::Idle);
        assert_eq!(session.transport().calls.first(), Some(&Call::Disconnect(ring_id())));
        assert_eq!(session.transport().calls.last(), Some(&Call::Release));

        // released: the late disconnect does not trigger a rescan
        session.handle_transport_event(TransportEvent::Disconnected { peripheral: ring_id(), reason: None });
        session.handle_transport_event(TransportEvent::PoweredOn);
        assert_eq!(session.transport().count(|c| matches!(c, Call::Scan(_))), 0);
    }

    #[test]
    fn accessory_events() {
        let mut session = session(raw_settings());
        let identity = AccessoryIdentity { id: ring_id(), display_name: "COLMI R02 Ring".to_string() };

        session.handle_accessory_event(AccessoryEvent::PickerPresented);
        assert!(!session.picker_dismissed());
        session.handle_accessory_event(AccessoryEvent::PickerDismissed);
        assert!(session.picker_dismissed());

        session.handle_accessory_event(AccessoryEvent::Added(identity.clone()));
        assert_eq!(session.identity(), Some(&identity));
        assert_eq!(session.state(), ConnectionState::Scanning);

        session.handle_accessory_event(AccessoryEvent::Removed(identity));
        assert_eq!(session.identity(), None);
        assert_eq!(session.state(), ConnectionState::Idle);
        assert!(!session.is_scanning());
    }
}
