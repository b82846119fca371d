//! Long-lived service supervision: the web server and the credit ticker
//! run as registered services with a shared shutdown signal.

use tokio::sync::broadcast;
use tracing::{error, info, warn};

pub mod manager;
pub mod ticker;
pub mod web;

pub use manager::ServiceManager;
pub use ticker::TickerService;
pub use web::WebService;

#[derive(Debug)]
pub enum ServiceResult {
    GracefulShutdown,
    /// `run` returned Ok without a shutdown having been requested.
    NormalCompletion,
    Error(anyhow::Error),
}

/// Common trait for all services in the application.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// The name of the service for logging.
    fn name(&self) -> &'static str;

    /// Run the service's main work loop.
    async fn run(&mut self) -> Result<(), anyhow::Error>;

    /// Gracefully shut the service down.
    async fn shutdown(&mut self) -> Result<(), anyhow::Error>;
}

/// Drive one service until it finishes or the shared shutdown fires.
pub async fn run_service(
    mut service: Box<dyn Service>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> ServiceResult {
    let name = service.name();
    info!(service = name, "service started");

    tokio::select! {
        result = service.run() => {
            match result {
                Ok(()) => {
                    warn!(service = name, "service completed unexpectedly");
                    ServiceResult::NormalCompletion
                }
                Err(e) => {
                    error!(service = name, error = ?e, "service failed");
                    ServiceResult::Error(e)
                }
            }
        }
        _ = shutdown_rx.recv() => {
            let started = std::time::Instant::now();
            match service.shutdown().await {
                Ok(()) => {
                    info!(service = name, elapsed = ?started.elapsed(), "service shut down");
                    ServiceResult::GracefulShutdown
                }
                Err(e) => {
                    error!(service = name, error = ?e, "service shutdown failed");
                    ServiceResult::Error(e)
                }
            }
        }
    }
}
