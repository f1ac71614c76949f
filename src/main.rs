/// Onboardflow server entry point
///
/// Initializes configuration and starts the HTTP/WebSocket server.

use onboardflow::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Real-time notifications at /ws?token=...
/// - Workflow and step progression API at /api/workflows/*
/// - Invite grants at /api/workflows/{id}/invites and /api/invites/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults to 0.0.0.0:3004 and data/onboardflow.db)
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
