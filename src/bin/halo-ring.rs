use clap::Parser;
use log::info;
use halo_ring::cli::Cli;
use halo_ring::error::{AppRunError, ConfigError};
use halo_ring::{init_logging, run};

#[tokio::main]
async fn main() -> Result<(), AppRunError> {
    let cli = Cli::parse();
    init_logging(cli.log_level)?;
    info!(concat!("Halo Ring ", env!("CARGO_PKG_VERSION")));

    match run(cli).await {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            eprintln!("Another halo-ring process already owns the ring session");
            Ok(())
        },
        result => result,
    }
}
