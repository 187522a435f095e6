use daemon::{stdio, DaemonConfig, Firewalld};
use env_logger::Env;
use log::{error, info};
use std::sync::Arc;
use tokio::io::BufReader;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = match DaemonConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };

    let mut firewalld = match Firewalld::new(config) {
        Ok(firewalld) => firewalld,
        Err(e) => {
            error!("Failed to start: {}", e);
            std::process::exit(1);
        }
    };
    let admin = firewalld.spawn();
    info!("firewalld ready: {:?}", firewalld.engine());

    let served = stdio::serve(
        Arc::clone(firewalld.engine()),
        admin,
        firewalld.notifier().subscribe(),
        firewalld.shutdown_signal(),
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    );

    tokio::select! {
        result = served => {
            if let Err(e) = result {
                error!("stdio transport failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    firewalld.stop().await;
}
