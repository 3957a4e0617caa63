pub mod codec;
pub mod commands;
