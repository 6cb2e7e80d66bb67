//! Pulse Relay - Signaling-Relay und P2P Anrufsteuerung
//!
//! Besteht aus:
//! - Relay-Server (WebSocket) mit Presence Registry und Räumen
//! - Signaling-Client und Nachrichtenprotokoll
//! - Call Engine mit WebRTC für die Medien direkt zwischen den Peers

pub mod call_engine;
pub mod config;
pub mod relay;
pub mod signaling;

use config::RelayConfig;
use relay::RelayServer;

/// Standardfilter, wenn `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_FILTER: &str = "pulse_relay=debug,webrtc=warn";

/// Initialisiert das Logging
///
/// `RUST_LOG` hat Vorrang vor dem Standardfilter. Ein zweiter Aufruf
/// (z.B. aus Tests) wird ignoriert.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Startet den Relay und läuft bis Ctrl+C
pub async fn run() -> anyhow::Result<()> {
    let config = RelayConfig::from_env()?;
    tracing::info!("Starting relay with {:?}", config);

    let server = RelayServer::bind(config).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    tracing::info!("Relay stopped");
    Ok(())
}
