use std::time::Duration;
use futures::channel::mpsc::{channel, Receiver, Sender, UnboundedReceiver};
use futures::channel::oneshot;
use futures::{SinkExt, Stream, StreamExt};
use log::{debug, info};
use serde::Serialize;
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::device::accessory::{AccessoryEvent, AccessoryRegistry};
use crate::device::session::RingSession;
use crate::device::transport::Transport;
use crate::device::types::{AccessoryIdentity, ConnectionState, DeviceEvent, TransportEvent};
use crate::error::{AccessoryError, SessionError};
use crate::protocol::commands::{BatteryInfo, RealTimeReading, StreamAction};
use crate::timeline::Timeline;

pub enum SessionCommand {
    Connect,
    Disconnect,
    RemoveAccessory(oneshot::Sender<Result<Option<AccessoryIdentity>, SessionError>>),
    RequestBattery(oneshot::Sender<BatteryInfo>),
    Stream(RealTimeReading, StreamAction),
    SetRawLogging(bool),
    Status(oneshot::Sender<SessionStatus>),
    Subscribe(oneshot::Sender<UnboundedReceiver<DeviceEvent>>),
}

impl SessionCommand {
    fn name(&self) -> &'static str {
        match self {
            SessionCommand::Connect => "connect",
            SessionCommand::Disconnect => "disconnect",
            SessionCommand::RemoveAccessory(_) => "remove accessory",
            SessionCommand::RequestBattery(_) => "request battery",
            SessionCommand::Stream(..) => "stream",
            SessionCommand::SetRawLogging(_) => "set raw logging",
            SessionCommand::Status(_) => "status",
            SessionCommand::Subscribe(_) => "subscribe",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub accessory: Option<AccessoryIdentity>,
    pub latest_heart_rate: Option<u8>,
    pub latest_spo2: Option<u8>,
    pub picker_dismissed: bool,
    pub battery_pending: bool,
    pub active_streams: Vec<RealTimeReading>,
}

impl<T: Transport> RingSession<T> {
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state(),
            accessory: self.identity().cloned(),
            latest_heart_rate: self.latest_heart_rate(),
            latest_spo2: self.latest_spo2(),
            picker_dismissed: self.picker_dismissed(),
            battery_pending: self.battery_pending(),
            active_streams: self.active_streams(),
        }
    }

    pub fn handle_command(&mut self, command: SessionCommand) {
        debug!("Session command: {}", command.name());
        match command {
            SessionCommand::Connect => self.connect(),
            SessionCommand::Disconnect => self.disconnect(),
            SessionCommand::RemoveAccessory(reply) => {
                let _ = reply.send(self.remove_accessory());
            },
            SessionCommand::RequestBattery(reply) => {
                self.submit_battery_request(reply);
            },
            SessionCommand::Stream(reading, action) => {
                match action {
                    StreamAction::Start => self.start_streaming(reading),
                    StreamAction::Continue => self.continue_streaming(reading),
                    StreamAction::Stop => self.stop_streaming(reading),
                    StreamAction::Pause => self.pause_streaming(reading),
                };
            },
            SessionCommand::SetRawLogging(enabled) => self.set_raw_logging(enabled),
            SessionCommand::Status(reply) => {
                let _ = reply.send(self.status());
            },
            SessionCommand::Subscribe(reply) => {
                let _ = reply.send(self.subscribe());
            },
        }
    }
}

/// Cloneable front door to a session running in [`run_session`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: Sender<SessionCommand>,
    timeline: Timeline,
}

impl SessionHandle {
    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands.clone().send(command).await.map_err(|_| SessionError::Closed)
    }

    async fn ask<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> SessionCommand) -> Result<R, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn connect(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Disconnect).await
    }

    /// Forget the accessory in this session only. The registry still remembers it; see
    /// [`SessionHandle::forget_accessory`].
    pub async fn remove_accessory(&self) -> Result<Option<AccessoryIdentity>, SessionError> {
        self.ask(SessionCommand::RemoveAccessory).await?
    }

    /// Release the accessory from the session, then remove it from `registry` so it stays
    /// forgotten on the next run.
    pub async fn forget_accessory<R: AccessoryRegistry>(&self, registry: &R) -> Result<Option<AccessoryIdentity>, AccessoryError> {
        let Some(identity) = self.remove_accessory().await? else {
            return Ok(None);
        };

        registry.remove_accessory(&identity).await?;
        Ok(Some(identity))
    }

    /// Resolves when the ring answers. Fails with [`SessionError::Unresolved`] if the session was
    /// not ready, the link dropped, or a newer request took the slot.
    pub async fn request_battery(&self) -> Result<BatteryInfo, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::RequestBattery(tx)).await?;
        rx.await.map_err(|_| SessionError::Unresolved)
    }

    pub async fn start_streaming(&self, reading: RealTimeReading) -> Result<(), SessionError> {
        self.send(SessionCommand::Stream(reading, StreamAction::Start)).await
    }

    pub async fn continue_streaming(&self, reading: RealTimeReading) -> Result<(), SessionError> {
        self.send(SessionCommand::Stream(reading, StreamAction::Continue)).await
    }

    pub async fn pause_streaming(&self, reading: RealTimeReading) -> Result<(), SessionError> {
        self.send(SessionCommand::Stream(reading, StreamAction::Pause)).await
    }

    pub async fn stop_streaming(&self, reading: RealTimeReading) -> Result<(), SessionError> {
        self.send(SessionCommand::Stream(reading, StreamAction::Stop)).await
    }

    pub async fn set_raw_logging(&self, enabled: bool) -> Result<(), SessionError> {
        self.send(SessionCommand::SetRawLogging(enabled)).await
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        self.ask(SessionCommand::Status).await
    }

    pub async fn subscribe(&self) -> Result<UnboundedReceiver<DeviceEvent>, SessionError> {
        self.ask(SessionCommand::Subscribe).await
    }

    /// Wait until the session reaches `Ready`, or give up after `deadline`.
    pub async fn wait_ready(&self, deadline: Duration) -> Result<(), SessionError> {
        let mut events = self.subscribe().await?;
        if self.status().await?.state == ConnectionState::Ready {
            return Ok(());
        }

        let wait = async {
            while let Some(event) = events.next().await {
                if event == DeviceEvent::StateChange(ConnectionState::Ready) {
                    return Ok(());
                }
            }
            Err(SessionError::Closed)
        };

        tokio::time::timeout(deadline, wait).await.map_err(|_| SessionError::NotReady)?
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }
}

/// The session's event loop. Transport callbacks, accessory events, caller commands and the
/// stream keep-alive tick are applied one at a time. Returns the session once cancelled or once
/// every handle is gone.
pub async fn run_session<T, E, A>(
    mut session: RingSession<T>,
    mut transport_events: E,
    mut accessory_events: A,
    mut commands: Receiver<SessionCommand>,
    continue_interval: Duration,
    cancel: CancellationToken,
) -> RingSession<T>
where
    T: Transport,
    E: Stream<Item = TransportEvent> + Unpin,
    A: Stream<Item = AccessoryEvent> + Unpin,
{
    let mut keep_alive = interval(continue_interval);
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            Some(event) = transport_events.next() => {
                session.handle_transport_event(event);
            },
            Some(event) = accessory_events.next() => {
                session.handle_accessory_event(event);
            },
            command = commands.next() => match command {
                Some(command) => session.handle_command(command),
                None => break 'mainloop,
            },
            _ = keep_alive.tick() => {
                session.continue_active_streams();
            },
        }
    }

    info!("Session event loop stopped");
    session
}

pub fn spawn_session<T, E, A>(
    session: RingSession<T>,
    transport_events: E,
    accessory_events: A,
    continue_interval: Duration,
    cancel: CancellationToken,
) -> (SessionHandle, JoinHandle<RingSession<T>>)
where
    T: Transport + Send + 'static,
    E: Stream<Item = TransportEvent> + Unpin + Send + 'static,
    A: Stream<Item = AccessoryEvent> + Unpin + Send + 'static,
{
    let (tx, rx) = channel::<SessionCommand>(64);
    let handle = SessionHandle { commands: tx, timeline: session.timeline().clone() };
    let join = spawn(run_session(session, transport_events, accessory_events, rx, continue_interval, cancel));
    (handle, join)
}
