use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use uuid::Uuid;
use btleplug;
use serde_json;

use crate::device::types::ConnectionState;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Payload of {len} bytes for command {command} exceeds the maximum of {max} bytes")]
    PayloadTooLarge { command: u8, len: usize, max: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame of {len} bytes is shorter than the minimum of {min} bytes")]
    TooShort { len: usize, min: usize },

    #[error("Frame of {len} bytes is longer than the maximum of {max} bytes")]
    TooLong { len: usize, max: usize },

    #[error("Frame checksum mismatch (expected {expected:#04x}, got {actual:#04x})")]
    Checksum { expected: u8, actual: u8 },
}

/// Problems with an inbound frame. These never leave the session; the frame is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Failed to decode frame: {source}")]
    Decode { #[from] source: DecodeError },

    #[error("Unknown command {0}")]
    UnknownCommand(u8),

    #[error("Payload of {len} bytes for command {command} is shorter than {min} bytes")]
    Truncated { command: u8, len: usize, min: usize },

    #[error("Unknown real-time reading type {0}")]
    UnknownReading(u8),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("Peripheral {0} is not known to the transport")]
    UnknownPeripheral(String),

    #[error("A required bluetooth characteristic is not available: {0}")]
    MissingCharacteristic(Uuid),
}

#[derive(Error, Debug)]
pub enum AccessoryError {
    #[error("Failed to persist accessory: {source}")]
    Config { #[from] source: ConfigError },

    #[error("Failed to scan for accessory: {source}")]
    Transport { #[from] source: TransportError },

    #[error("Session refused to release the accessory: {source}")]
    Session { #[from] source: SessionError },

    #[error("No matching accessory was found")]
    NotFound,

    #[error("No accessory has been paired")]
    NoAccessory,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Operation is not allowed while {0:?}")]
    Busy(ConnectionState),

    #[error("The session event loop has stopped")]
    Closed,

    #[error("The request was dropped without a response")]
    Unresolved,

    #[error("The ring did not become ready in time")]
    NotReady,
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (transport): {source}")]
    TransportError { #[from] source: TransportError },

    #[error("Accessory error: {source}")]
    AccessoryError { #[from] source: AccessoryError },

    #[error("Session error: {source}")]
    SessionError { #[from] source: SessionError },

    #[error("Failed to print output: {source}")]
    JsonError { #[from] source: serde_json::Error },

    #[error("Failed to initialize logger: {source}")]
    LoggerError { #[from] source: fern::InitError },
}
