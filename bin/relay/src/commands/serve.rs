use relay_agent::ChatRuntime;
use relay_hub::{HeartbeatService, Hub};
use relay_providers::{OpenAIProvider, Provider};
use relay_storage::Store;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::load_config;
use crate::server::{build_router, AppState};

pub async fn run(
    config_path: Option<PathBuf>,
    cli_host: Option<String>,
    cli_port: Option<u16>,
) -> anyhow::Result<()> {
    let (paths, mut config, config_file) = load_config(config_path)?;
    if let Some(host) = cli_host {
        config.server.host = host;
    }
    if let Some(port) = cli_port {
        config.server.port = port;
    }

    paths.ensure_dirs()?;
    let store = Store::open(&paths.database_file())?;
    info!(db = %paths.database_file().display(), config = %config_file.display(), "Store opened");

    if let (Some(username), Some(password)) = (&config.auth.default_username, &config.auth.default_password) {
        match store.ensure_user(username, password) {
            Ok(true) => info!(username = %username, "Default user created"),
            Ok(false) => debug!(username = %username, "Default user already exists"),
            Err(e) => warn!(username = %username, error = %e, "Failed to create default user"),
        }
    }

    if config.llm.api_key.trim().is_empty() {
        warn!("No LLM API key configured (llm.apiKey or OPENAI_API_KEY); chat messages will fail");
    }

    let hub = Arc::new(Hub::new(Arc::new(store.clone()), config.hub.clone()));
    let provider: Arc<dyn Provider> = Arc::new(OpenAIProvider::from_config(&config.llm));
    let runtime = Arc::new(ChatRuntime::new(hub.clone(), provider, config.chat.clone()));
    info!(model = %config.llm.model, "LLM provider ready");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let heartbeat = Arc::new(HeartbeatService::new(hub.clone(), store.clone()));
    let heartbeat_handle = tokio::spawn(heartbeat.run_loop(shutdown_tx.subscribe()));

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState {
        hub,
        store,
        runtime,
        config: Arc::new(config),
    };
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "Relay server listening");

    let mut http_shutdown_rx = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown_rx.recv().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "HTTP server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());

    let handles = vec![("http_server", http_handle), ("heartbeat", heartbeat_handle)];
    for (name, handle) in handles {
        match tokio::time::timeout(Duration::from_secs(10), handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(task = name, error = %e, "Task failed during shutdown"),
            Err(_) => warn!(task = name, "Task did not exit in graceful window"),
        }
    }

    info!("Relay server stopped");
    Ok(())
}
