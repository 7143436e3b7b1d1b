use clap::Parser;
use replica::{config, server};
use tokio::signal;

/// Runs one replica of the key-value store.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Runtime config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    config::RuntimeConfig::from_toml(&args.config);
    {
        server::instance().lock().await.start().await?;
    }
    shutdown_signal().await;
    {
        server::instance().lock().await.stop().await;
    }
    Ok(())
}
