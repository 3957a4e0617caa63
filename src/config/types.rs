use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::device::constants::{CONNECT_DELAY, CONTINUE_INTERVAL, PICKER_TIMEOUT};
use crate::device::types::AccessoryIdentity;
use crate::protocol::codec::CodecVersion;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// The paired ring, until the user removes it.
    pub accessory: Option<AccessoryIdentity>,
    pub codec: CodecVersion,
    pub raw_logging: bool,
    pub connect_delay_ms: u64,
    pub continue_interval_ms: u64,
    pub picker_timeout_ms: u64,
}

impl Config {
    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }

    pub fn continue_interval(&self) -> Duration {
        // zero would spin the event loop
        Duration::from_millis(self.continue_interval_ms.max(100))
    }

    pub fn picker_timeout(&self) -> Duration {
        Duration::from_millis(self.picker_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            accessory: None,
            codec: CodecVersion::ColmiV1,
            raw_logging: false,
            connect_delay_ms: CONNECT_DELAY,
            continue_interval_ms: CONTINUE_INTERVAL,
            picker_timeout_ms: PICKER_TIMEOUT,
        }
    }
}
