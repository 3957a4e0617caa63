use uuid::Uuid;

/**
 * How long (milliseconds) to wait before (re)connecting to a peripheral. Passed as the start delay
 * in the connect options, which also makes it the retry cadence after a lost link.
 */
pub const CONNECT_DELAY: u64 = 1000;

/**
 * How often (milliseconds) active real-time streams are kept alive with a `continue` frame.
 */
pub const CONTINUE_INTERVAL: u64 = 5000;

/**
 * How long (milliseconds) the picker scans before giving up.
 */
pub const PICKER_TIMEOUT: u64 = 30000;

/**
 * How long (milliseconds) a write to a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * The vendor "main" service. Not needed for readiness.
 */
pub const MAIN_SERVICE: &str = "de5bf728-d711-4e47-af26-65e3012a5dc7";
pub const MAIN_WRITE_CHARACTERISTIC: &str = "de5bf72a-d711-4e47-af26-65e3012a5dc7";
pub const MAIN_NOTIFY_CHARACTERISTIC: &str = "de5bf729-d711-4e47-af26-65e3012a5dc7";

/**
 * The Nordic UART style service that carries every command.
 */
pub const RING_SERVICE: &str = "6e40fff0-b5a3-f393-e0a9-e50e24dcca9e";

/**
 * Write characteristic: host to ring.
 */
pub const UART_RX_CHARACTERISTIC: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

/**
 * Notify characteristic: ring to host.
 */
pub const UART_TX_CHARACTERISTIC: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/**
 * Standard device information service, hardware and firmware revision strings. Informational only.
 */
pub const DEVICE_INFO_SERVICE: &str = "0000180a-0000-1000-8000-00805f9b34fb";
pub const DEVICE_HARDWARE_CHARACTERISTIC: &str = "00002a27-0000-1000-8000-00805f9b34fb";
pub const DEVICE_FIRMWARE_CHARACTERISTIC: &str = "00002a26-0000-1000-8000-00805f9b34fb";

/**
 * Bluetooth company identifier advertised by the ring, used by the picker.
 */
pub const RING_COMPANY_IDENTIFIER: u16 = 4660;
pub const RING_DISPLAY_NAME: &str = "COLMI R02 Ring";

fn parse(uuid: &'static str) -> Uuid {
    // all inputs are the literals above
    Uuid::try_parse(uuid).unwrap_or_default()
}

pub fn make_ring_service_uuid() -> Uuid {
    parse(RING_SERVICE)
}

pub fn make_uart_rx_uuid() -> Uuid {
    parse(UART_RX_CHARACTERISTIC)
}

pub fn make_uart_tx_uuid() -> Uuid {
    parse(UART_TX_CHARACTERISTIC)
}

pub fn make_main_service_uuid() -> Uuid {
    parse(MAIN_SERVICE)
}

pub fn make_device_info_service_uuid() -> Uuid {
    parse(DEVICE_INFO_SERVICE)
}

/// Services requested once the link is up.
pub fn discovery_services() -> Vec<Uuid> {
    vec![make_ring_service_uuid(), make_device_info_service_uuid(), make_main_service_uuid()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_parse() {
        for uuid in [
            MAIN_SERVICE, MAIN_WRITE_CHARACTERISTIC, MAIN_NOTIFY_CHARACTERISTIC, RING_SERVICE,
            UART_RX_CHARACTERISTIC, UART_TX_CHARACTERISTIC, DEVICE_INFO_SERVICE,
            DEVICE_HARDWARE_CHARACTERISTIC, DEVICE_FIRMWARE_CHARACTERISTIC,
        ] {
            assert!(!parse(uuid).is_nil(), "{}", uuid);
        }
        assert_ne!(make_uart_rx_uuid(), make_uart_tx_uuid());
    }
}
