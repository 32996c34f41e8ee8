mod clock;
mod config;
mod engine;
mod models;
mod providers;

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clock::SystemClock;
use config::{Config, ProviderKind};
use engine::quota::QuotaStore;
use engine::{Command, Engine};
use providers::stop_monitoring::StopMonitoringClient;
use providers::transport_api::TransportApiClient;
use providers::Provider;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    // Load config
    let config = Config::load("config.yaml").expect("Failed to load config");
    tracing::info!(
        provider = ?config.provider.kind,
        outbound_stops = config.directions.outbound.stops.len(),
        inbound_stops = config.directions.inbound.stops.len(),
        daily_limit = config.quota.daily_limit,
        "Loaded configuration"
    );

    // Initialize SQLite database for the persisted quota record
    let cwd = std::env::current_dir().expect("Failed to get current directory");
    let db_path = cwd.join("database");
    if let Err(e) = std::fs::create_dir_all(&db_path) {
        tracing::warn!("Could not create database directory: {}", e);
    }
    let db_url = format!("sqlite:{}?mode=rwc", db_path.join("data.db").display());
    let pool = SqlitePool::connect(&db_url)
        .await
        .expect("Failed to connect to SQLite database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    // Select the upstream client at construction time
    let provider: Arc<dyn Provider> = match config.provider.kind {
        ProviderKind::TransportApi => Arc::new(
            TransportApiClient::new(
                &config.provider.base_url,
                &config.provider.app_id,
                &config.provider.app_key,
            )
            .expect("Failed to build provider client"),
        ),
        ProviderKind::StopMonitoring => Arc::new(
            StopMonitoringClient::new(&config.provider.base_url)
                .expect("Failed to build provider client"),
        ),
    };
    tracing::info!(provider = provider.name(), "Provider ready");

    let store = QuotaStore::new(pool);
    let (engine, mut board_rx) = Engine::new(config, provider, Arc::new(SystemClock), store);
    let (command_tx, command_rx) = tokio::sync::mpsc::channel(8);

    // Render-sink boundary: the real display pipeline is a separate system;
    // here every published board lands in the log.
    tokio::spawn(async move {
        while board_rx.changed().await.is_ok() {
            let board = board_rx.borrow_and_update().clone();
            if board.placeholder {
                tracing::info!(
                    direction = %board.direction_label,
                    reason = board.failure.as_deref().unwrap_or("no data yet"),
                    "Board empty"
                );
            } else {
                for (slot, departure) in board.departures.iter().enumerate() {
                    tracing::info!(
                        slot = slot + 1,
                        direction = %board.direction_label,
                        route = %departure.route,
                        stop = %departure.stop_name,
                        at = %departure.departure_time,
                        leave_in = departure.leave_in(),
                        status = %departure.status,
                        "Board"
                    );
                }
            }
        }
    });

    // Host-bus integration point: SIGHUP forces a refresh, SIGUSR2 flips the
    // direction.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let refresh_tx = command_tx.clone();
        tokio::spawn(async move {
            let mut hangup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");
            while hangup.recv().await.is_some() {
                let _ = refresh_tx.send(Command::Refresh).await;
            }
        });

        let toggle_tx = command_tx.clone();
        tokio::spawn(async move {
            let mut toggle =
                signal(SignalKind::user_defined2()).expect("Failed to install SIGUSR2 handler");
            while toggle.recv().await.is_some() {
                let _ = toggle_tx.send(Command::ToggleDirection).await;
            }
        });
    }

    // Keep the command channel open for the engine's lifetime.
    let _command_tx = command_tx;

    engine.run(command_rx).await;
}
