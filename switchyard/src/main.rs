use clap::Parser as _;
use tokio_util::sync::CancellationToken;

use args::Args;

mod args;
mod logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logger::init(&args.log_filter);

    let config = match config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            log::error!("configuration error: {err:#}");
            std::process::exit(1);
        }
    };

    let listen_address = match args.listen {
        Some(address) => address,
        None => config.server.listen_address().inspect_err(|err| {
            log::error!("configuration error: {err:#}");
        })?,
    };

    let shutdown_signal = CancellationToken::new();
    let signal = shutdown_signal.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown requested");
            signal.cancel();
        }
    });

    server::serve(server::ServeConfig {
        listen_address,
        config,
        config_path: Some(args.config),
        shutdown_signal,
        version: env!("CARGO_PKG_VERSION").to_string(),
        bound_addr_sender: None,
    })
    .await
}
