use std::env;
use std::time::Duration;
use futures::channel::mpsc::unbounded;
use futures::StreamExt;
use log::{info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::cli::{Cli, Command};
use crate::config::io::ConfigIO;
use crate::device::accessory::{AccessoryRegistry, PickerDescriptor};
use crate::device::connection::BtleTransport;
use crate::device::driver::spawn_session;
use crate::device::session::{RingSession, SessionSettings};
use crate::device::types::DeviceEvent;
use crate::error::AppRunError;

pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod protocol;
pub mod timeline;

pub fn init_logging(level: log::LevelFilter) -> Result<(), fern::InitError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(fern::log_file(log_file)?);
    }

    dispatch.apply()?;
    Ok(())
}

pub async fn run(cli: Cli) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync()?;
    let mut locker = config_io.locker()?;
    let _lock = locker.lock()?;
    let config = config_io.read().await?;

    let cancel = CancellationToken::new();
    let (transport_tx, transport_rx) = unbounded();
    let (accessory_tx, accessory_rx) = unbounded();
    let transport = BtleTransport::new(transport_tx, cancel.child_token()).await?;
    let registry = transport.registry(config_io.clone(), accessory_tx, config.picker_timeout());

    if cli.command == Command::Forget {
        match config.accessory {
            Some(identity) => {
                registry.remove_accessory(&identity).await?;
                println!("Forgot {}", identity.display_name);
            },
            None => println!("No ring is paired"),
        }
        return Ok(());
    }

    let session = RingSession::new(transport, SessionSettings::from_config(&config));
    let (handle, join) = spawn_session(session, transport_rx, accessory_rx, config.continue_interval(), cancel.child_token());
    // connecting covers the start delay, the link itself and discovery
    let ready_deadline = config.picker_timeout();

    match cli.command {
        Command::Pair => {
            let identity = registry.present_picker(&PickerDescriptor::ring()).await?;
            handle.wait_ready(ready_deadline).await?;
            println!("Paired with {} ({})", identity.display_name, identity.id);
        },
        Command::Battery => {
            handle.wait_ready(ready_deadline).await?;
            let battery = handle.request_battery().await?;
            println!("{}", serde_json::to_string(&battery)?);
        },
        Command::Stream { reading, seconds } => {
            handle.wait_ready(ready_deadline).await?;
            let mut events = handle.subscribe().await?;
            handle.start_streaming(reading).await?;
            info!("Streaming {} for {} seconds", reading, seconds);

            let deadline = sleep(Duration::from_secs(seconds));
            tokio::pin!(deadline);
            'mainloop: loop {
                tokio::select! {
                    _ = &mut deadline => {
                        break 'mainloop;
                    },
                    event = events.next() => match event {
                        Some(DeviceEvent::Reading { reading: got, value }) if got == reading => println!("{} {}", got, value),
                        Some(DeviceEvent::StateChange(state)) => warn!("Connection state changed to {:?} while streaming", state),
                        Some(_) => {},
                        None => break 'mainloop,
                    },
                }
            }

            handle.stop_streaming(reading).await?;
        },
        Command::Forget => {},
    }

    if cli.timeline {
        println!("{}", serde_json::to_string_pretty(&handle.timeline().snapshot())?);
    }

    handle.disconnect().await?;
    cancel.cancel();
    if join.await.is_err() {
        warn!("Session task did not stop cleanly");
    }
    Ok(())
}
