use futures::channel::oneshot;
use log::{debug, warn};

use crate::protocol::commands::BatteryInfo;

/// Single correlation slot for battery requests.
///
/// Last writer wins: arming the slot while a request is pending drops the earlier sender, so
/// that caller never gets a `BatteryInfo` (its receiver sees `Canceled`). A disconnect does the
/// same through [`BatteryCoordinator::discard`].
#[derive(Debug, Default)]
pub struct BatteryCoordinator {
    pending: Option<oneshot::Sender<BatteryInfo>>,
}

impl BatteryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|sender| !sender.is_canceled())
    }

    /// Returns `true` if an earlier request was overwritten.
    pub fn arm(&mut self, reply: oneshot::Sender<BatteryInfo>) -> bool {
        let overwritten = self.pending.replace(reply).is_some();
        if overwritten {
            warn!("Battery request overwritten by a newer request; the earlier caller will not be answered");
        }
        overwritten
    }

    /// Hand `info` to the pending caller, if any. Returns whether someone was waiting.
    pub fn resolve(&mut self, info: BatteryInfo) -> bool {
        match self.pending.take() {
            Some(reply) => {
                if reply.send(info).is_err() {
                    debug!("Battery requester went away before the response arrived");
                    return false;
                }
                true
            },
            None => {
                debug!("Unsolicited battery response {:?}", info);
                false
            },
        }
    }

    pub fn discard(&mut self) {
        if self.pending.take().is_some() {
            debug!("Discarding pending battery request");
        }
    }
}
