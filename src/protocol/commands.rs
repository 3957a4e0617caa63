use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::protocol::codec::Packet;

pub const CMD_BATTERY: u8 = 3;
pub const CMD_START_REAL_TIME: u8 = 105;
pub const CMD_STOP_REAL_TIME: u8 = 106;

/// Minimum payload bytes of a battery response: level, charging.
pub const BATTERY_PAYLOAD_LEN: usize = 2;

/// Minimum payload bytes of a real-time reading: type, error code, value.
pub const REAL_TIME_PAYLOAD_LEN: usize = 3;

/// Reading types understood by the real-time commands, with their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum RealTimeReading {
    HeartRate,
    BloodPressure,
    Spo2,
    Fatigue,
    HealthCheck,
    Ecg,
    Pressure,
    BloodSugar,
    Hrv,
}

impl RealTimeReading {
    pub fn code(self) -> u8 {
        match self {
            RealTimeReading::HeartRate => 1,
            RealTimeReading::BloodPressure => 2,
            RealTimeReading::Spo2 => 3,
            RealTimeReading::Fatigue => 4,
            RealTimeReading::HealthCheck => 5,
            RealTimeReading::Ecg => 7,
            RealTimeReading::Pressure => 8,
            RealTimeReading::BloodSugar => 9,
            RealTimeReading::Hrv => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<RealTimeReading> {
        let reading = match code {
            1 => RealTimeReading::HeartRate,
            2 => RealTimeReading::BloodPressure,
            3 => RealTimeReading::Spo2,
            4 => RealTimeReading::Fatigue,
            5 => RealTimeReading::HealthCheck,
            7 => RealTimeReading::Ecg,
            8 => RealTimeReading::Pressure,
            9 => RealTimeReading::BloodSugar,
            10 => RealTimeReading::Hrv,
            _ => return None,
        };
        Some(reading)
    }
}

impl std::fmt::Display for RealTimeReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            RealTimeReading::HeartRate => "heartRate",
            RealTimeReading::BloodPressure => "bloodPressure",
            RealTimeReading::Spo2 => "spo2",
            RealTimeReading::Fatigue => "fatigue",
            RealTimeReading::HealthCheck => "healthCheck",
            RealTimeReading::Ecg => "ecg",
            RealTimeReading::Pressure => "pressure",
            RealTimeReading::BloodSugar => "bloodSugar",
            RealTimeReading::Hrv => "hrv",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamAction {
    Start,
    Pause,
    Continue,
    Stop,
}

impl StreamAction {
    pub fn code(self) -> u8 {
        match self {
            StreamAction::Start => 1,
            StreamAction::Pause => 2,
            StreamAction::Continue => 3,
            StreamAction::Stop => 4,
        }
    }

    /// The command byte that carries this action.
    pub fn command(self) -> u8 {
        match self {
            StreamAction::Stop => CMD_STOP_REAL_TIME,
            _ => CMD_START_REAL_TIME,
        }
    }
}

/// Payload of a real-time control frame. Without an action the frame carries two zero bytes.
pub fn real_time_payload(reading: RealTimeReading, action: Option<StreamAction>) -> Vec<u8> {
    let mut payload = vec![reading.code()];
    match action {
        Some(action) => payload.push(action.code()),
        None => payload.extend_from_slice(&[0, 0]),
    }
    payload
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryInfo {
    /// Percentage, 0-100
    pub level: u8,
    pub charging: bool,
}

impl BatteryInfo {
    pub fn parse(packet: &Packet) -> Result<BatteryInfo, ProtocolError> {
        let payload = packet.payload.as_slice();
        if payload.len() < BATTERY_PAYLOAD_LEN {
            return Err(ProtocolError::Truncated {
                command: packet.command,
                len: payload.len(),
                min: BATTERY_PAYLOAD_LEN,
            });
        }

        Ok(BatteryInfo {
            level: payload[0].min(100),
            charging: payload[1] != 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealTimeSample {
    pub reading: RealTimeReading,
    pub error_code: u8,
    pub value: u8,
}

impl RealTimeSample {
    pub fn parse(packet: &Packet) -> Result<RealTimeSample, ProtocolError> {
        let payload = packet.payload.as_slice();
        if payload.len() < REAL_TIME_PAYLOAD_LEN {
            return Err(ProtocolError::Truncated {
                command: packet.command,
                len: payload.len(),
                min: REAL_TIME_PAYLOAD_LEN,
            });
        }

        let reading = RealTimeReading::from_code(payload[0])
            .ok_or(ProtocolError::UnknownReading(payload[0]))?;

        Ok(RealTimeSample {
            reading,
            error_code: payload[1],
            value: payload[2],
        })
    }

    pub fn is_ok(&self) -> bool {
        self.error_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(command: u8, payload: &[u8]) -> Packet {
        Packet { command, payload: payload.to_vec() }
    }

    #[test]
    fn reading_codes_are_stable() {
        for code in 0..=u8::MAX {
            if let Some(reading) = RealTimeReading::from_code(code) {
                assert_eq!(reading.code(), code);
            }
        }
        assert_eq!(RealTimeReading::HeartRate.code(), 1);
        assert_eq!(RealTimeReading::Spo2.code(), 3);
        assert_eq!(RealTimeReading::from_code(6), None);
    }

    #[test]
    fn stop_uses_its_own_command() {
        assert_eq!(StreamAction::Start.command(), CMD_START_REAL_TIME);
        assert_eq!(StreamAction::Continue.command(), CMD_START_REAL_TIME);
        assert_eq!(StreamAction::Stop.command(), CMD_STOP_REAL_TIME);
    }

    #[test]
    fn real_time_payload_without_action_pads_with_zeros() {
        assert_eq!(real_time_payload(RealTimeReading::HeartRate, None), vec![1, 0, 0]);
        assert_eq!(real_time_payload(RealTimeReading::Spo2, Some(StreamAction::Continue)), vec![3, 3]);
    }

    #[test]
    fn battery_parse() {
        let info = BatteryInfo::parse(&packet(CMD_BATTERY, &[85, 1])).unwrap();
        assert_eq!(info, BatteryInfo { level: 85, charging: true });

        let info = BatteryInfo::parse(&packet(CMD_BATTERY, &[140, 0, 0, 0])).unwrap();
        assert_eq!(info, BatteryInfo { level: 100, charging: false });

        assert_eq!(
            BatteryInfo::parse(&packet(CMD_BATTERY, &[85])),
            Err(ProtocolError::Truncated { command: CMD_BATTERY, len: 1, min: 2 }),
        );
    }

    #[test]
    fn real_time_parse() {
        let sample = RealTimeSample::parse(&packet(CMD_START_REAL_TIME, &[1, 0, 72])).unwrap();
        assert_eq!(sample.reading, RealTimeReading::HeartRate);
        assert_eq!(sample.value, 72);
        assert!(sample.is_ok());

        let sample = RealTimeSample::parse(&packet(CMD_START_REAL_TIME, &[1, 5, 72])).unwrap();
        assert!(!sample.is_ok());

        assert_eq!(
            RealTimeSample::parse(&packet(CMD_START_REAL_TIME, &[6, 0, 72])),
            Err(ProtocolError::UnknownReading(6)),
        );
        assert!(matches!(
            RealTimeSample::parse(&packet(CMD_START_REAL_TIME, &[1, 0])),
            Err(ProtocolError::Truncated { .. }),
        ));
    }
}
