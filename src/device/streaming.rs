use indexmap::IndexSet;

use crate::error::EncodeError;
use crate::protocol::codec::PacketCodec;
use crate::protocol::commands::{real_time_payload, RealTimeReading, StreamAction, CMD_START_REAL_TIME};

/// Builds real-time control frames and remembers which streams the caller has started.
///
/// The ring does not acknowledge these frames; a call has succeeded once the frame is written.
#[derive(Debug, Default)]
pub struct StreamingController {
    active: IndexSet<RealTimeReading>,
}

impl StreamingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn control_frame(codec: &dyn PacketCodec, reading: RealTimeReading, action: Option<StreamAction>) -> Result<Vec<u8>, EncodeError> {
        let command = action.map(StreamAction::command).unwrap_or(CMD_START_REAL_TIME);
        codec.encode(command, &real_time_payload(reading, action))
    }

    /// Frame for `action`, updating the set of active streams once it was built.
    pub fn frame(&mut self, codec: &dyn PacketCodec, reading: RealTimeReading, action: StreamAction) -> Result<Vec<u8>, EncodeError> {
        let frame = Self::control_frame(codec, reading, Some(action))?;
        match action {
            StreamAction::Start | StreamAction::Continue => {
                self.active.insert(reading);
            },
            // a paused stream is not kept alive until it is continued
            StreamAction::Pause | StreamAction::Stop => {
                self.active.shift_remove(&reading);
            },
        }
        Ok(frame)
    }

    pub fn active(&self) -> impl Iterator<Item = RealTimeReading> + '_ {
        self.active.iter().copied()
    }

    pub fn is_active(&self, reading: RealTimeReading) -> bool {
        self.active.contains(&reading)
    }

    /// The ring forgets streams when the link drops.
    pub fn clear(&mut self) {
        self.active.clear();
    }
}
