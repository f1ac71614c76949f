/// Server setup and initialization
///
/// Wires together all components: storage, registries, the progression engine,
/// the single notification dispatcher, background tasks and HTTP/WebSocket routes.

use crate::{
    access::{ledger::AccessLedger, storage::GrantStorage, store::AccessGrantStore},
    api::{create_api_routes, AppState},
    config::Config,
    gateway::{auth::JwtVerifier, session::ws_handler},
    realtime::{
        deadlines::DeadlineMonitor,
        dispatcher::NotificationDispatcher,
        registry::ConnectionRegistry,
        supervisor::{supervise, BackoffPolicy},
    },
    workflow::{progression::StepProgressionEngine, registry::WorkflowRegistry, storage::WorkflowStorage},
};
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::sync::Arc;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch, Mutex},
};
use tracing_subscriber::EnvFilter;

/// Create the main Axum application with all routes
///
/// Opens the database, restores workflows, grants and entitlements, starts the
/// notification pump and deadline monitor under supervision, and builds the router.
/// Background tasks stop when `shutdown` flips to true.
pub async fn create_app(config: Config, shutdown: watch::Receiver<bool>) -> Result<Router> {
    tracing::info!("📁 Ensuring data directory exists: {}", config.database.data_dir);
    std::fs::create_dir_all(&config.database.data_dir)
        .with_context(|| format!("Failed to create data directory {}", config.database.data_dir))?;

    let db_path = config.database.database_path();
    tracing::info!("🗄️ Opening database at {}", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(SqliteConnectOptions::new().filename(&db_path).create_if_missing(true))
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    // Workflows
    let workflow_storage = WorkflowStorage::new(pool.clone());
    workflow_storage.init_schema().await?;
    let registry = Arc::new(WorkflowRegistry::new(workflow_storage));
    tracing::info!("📥 Loading existing workflows from storage");
    registry
        .init_from_storage()
        .await
        .context("Failed to load workflows from storage")?;

    // Grants and entitlements
    let grant_storage = GrantStorage::new(pool);
    grant_storage.init_schema().await?;
    let grants = Arc::new(AccessGrantStore::new(chrono::Duration::hours(config.access.grant_ttl_hours)));
    let mut stored_grants = grant_storage.load_grants().await?;
    let mut stored_entitlements = grant_storage.load_entitlements().await?;
    // Orphaned records of deleted workflows are not restored
    stored_grants.retain(|g| registry.handle(&g.workflow_id).is_some());
    stored_entitlements.retain(|e| registry.handle(&e.workflow_id).is_some());
    tracing::info!(
        grants = stored_grants.len(),
        entitlements = stored_entitlements.len(),
        "🔑 Restored access records"
    );
    grants.load(stored_grants, stored_entitlements);

    // Real-time layer: one registry and one dispatcher per process
    let connections = Arc::new(ConnectionRegistry::new());
    let dispatcher = NotificationDispatcher::new(Arc::clone(&connections));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let engine = StepProgressionEngine::new(Arc::clone(&registry), events_tx.clone());

    tracing::info!("📬 Starting notification pump");
    let events_rx = Arc::new(Mutex::new(events_rx));
    {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(supervise("notification-pump", BackoffPolicy::default(), shutdown.clone(), move || {
            let dispatcher = dispatcher.clone();
            let events_rx = Arc::clone(&events_rx);
            let shutdown = shutdown.clone();
            async move { dispatcher.run_event_pump(events_rx, shutdown).await }
        }));
    }

    tracing::info!("⏰ Starting deadline monitor");
    let monitor = Arc::new(DeadlineMonitor::new(
        Arc::clone(&registry),
        events_tx,
        config.realtime.deadline_window_days,
    ));
    {
        let schedule = config.realtime.deadline_schedule.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(supervise("deadline-monitor", BackoffPolicy::default(), shutdown.clone(), move || {
            Arc::clone(&monitor).run(schedule.clone(), shutdown.clone())
        }));
    }

    let state = AppState {
        registry,
        engine,
        access: Arc::new(AccessLedger::new(Arc::clone(&grants), grant_storage)),
        grants,
        connections,
        dispatcher,
        verifier: Arc::new(JwtVerifier::from_secret(&config.auth.jwt_secret)),
        channel_buffer: config.realtime.channel_buffer,
        shutdown,
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = create_router(state);

    tracing::info!("✅ Application initialized successfully");
    Ok(app)
}

/// Routes over already-built state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/ws", get(ws_handler))
        .merge(create_api_routes())
        .with_state(state)
}

/// Start the HTTP server with the given configuration
///
/// Ctrl-C flips the shutdown signal: live sessions are closed, background tasks
/// stop, and the listener drains in-flight requests.
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,onboardflow=debug")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting onboardflow server...");

    let (stop, shutdown) = watch::channel(false);
    let app = create_app(config.clone(), shutdown).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("🛑 Shutdown requested");
            let _ = stop.send(true);
        })
        .await?;

    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_check_responds_ok() {
        let harness = test_state().await;
        let response = create_router(harness.state.clone())
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn websocket_route_requires_an_upgrade() {
        let harness = test_state().await;
        let response = create_router(harness.state.clone())
            .oneshot(Request::builder().uri("/ws?token=abc").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn create_app_restores_state_from_disk() {
        let dir = std::env::temp_dir().join(format!("onboardflow-test-{}", uuid::Uuid::new_v4()));
        let mut config = Config::default();
        config.database.data_dir = dir.to_string_lossy().into_owned();

        let (stop, shutdown) = watch::channel(false);
        let app = create_app(config.clone(), shutdown).await.unwrap();
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(config.database.database_path().exists());

        stop.send(true).unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }
}
