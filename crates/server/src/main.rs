use sotto_server::app::maintenance::MaintenanceTasks;
use sotto_server::app::SottoApp;
use sotto_server::config;
use sotto_server::transport;
use std::env;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

fn main() {
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .json()
        .init();

    let config_path = env::var("SOTTO_CONFIG").unwrap_or_else(|_| "sotto.toml".to_string());
    let config = config::load_configuration(Path::new(&config_path)).expect("configuration");

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(run(config)).expect("server");
}

async fn run(config: config::ServerConfig) -> Result<(), Box<dyn Error>> {
    let app = SottoApp::init(&config).await?;
    let state = Arc::clone(&app.state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = MaintenanceTasks::spawn(Arc::clone(&state), shutdown_rx.clone());

    let listener = TcpListener::bind(&config.bind).await?;
    info!(address = %config.bind, "sotto listening");
    let mut accept = tokio::spawn(transport::run_listener(state, listener, shutdown_rx));

    tokio::select! {
        result = &mut accept => {
            if let Err(err) = result {
                error!(error = %err, "listener task failed");
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            let _ = accept.await;
        }
    }
    maintenance.shutdown().await;
    Ok(())
}
