pub mod accessory;
pub mod battery;
pub mod connection;
pub mod constants;
pub mod driver;
pub mod session;
pub mod streaming;
pub mod transport;
pub mod types;
