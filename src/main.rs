use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod handler;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("rbi_core", log::LevelFilter::Debug)
        .filter_module("lite_rbi", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = config::config();
    let rbi = rbi_core::SessionManager::from_config(config.core())
        .await
        .unwrap_or_else(|e| {
            eprintln!("Error starting session manager: {:#}", e);
            std::process::exit(1);
        });

    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    api::start_api_server(config.listen().to_string(), rbi.clone(), cancel_clone);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    rbi.shutdown().await;
    std::process::exit(0);
}
