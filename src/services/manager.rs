//! Registration and lifecycle of the application's services.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::services::{Service, ServiceResult, run_service};

pub struct ServiceManager {
    registered: HashMap<&'static str, Box<dyn Service>>,
    running: HashMap<&'static str, JoinHandle<ServiceResult>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            registered: HashMap::new(),
            running: HashMap::new(),
            shutdown_tx,
        }
    }

    /// Register a service; it starts on `spawn_all`.
    pub fn register(&mut self, service: Box<dyn Service>) {
        self.registered.insert(service.name(), service);
    }

    pub fn spawn_all(&mut self) {
        let names: Vec<_> = self.registered.keys().copied().collect();
        for (name, service) in self.registered.drain() {
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.running
                .insert(name, tokio::spawn(run_service(service, shutdown_rx)));
        }
        info!(services = ?names, "spawned {} services", names.len());
    }

    /// Wait until any service completes; returns its name and result.
    pub async fn run(&mut self) -> (&'static str, ServiceResult) {
        if self.running.is_empty() {
            return (
                "none",
                ServiceResult::Error(anyhow::anyhow!("no services registered")),
            );
        }

        let (names, handles): (Vec<_>, Vec<_>) = self.running.drain().unzip();
        let (result, index, rest) = futures::future::select_all(handles).await;
        // Put the still-running services back for shutdown().
        for (i, handle) in rest.into_iter().enumerate() {
            let name_index = if i < index { i } else { i + 1 };
            self.running.insert(names[name_index], handle);
        }

        let name = names[index];
        match result {
            Ok(service_result) => (name, service_result),
            Err(e) => (
                name,
                ServiceResult::Error(anyhow::anyhow!("service task panicked: {e}")),
            ),
        }
    }

    /// Signal every running service and wait up to `timeout` for each.
    /// Returns elapsed time, or the names that failed to stop.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<Duration, Vec<&'static str>> {
        let names: Vec<_> = self.running.keys().copied().collect();
        info!(services = ?names, ?timeout, "shutting down services");
        let _ = self.shutdown_tx.send(());

        let started = std::time::Instant::now();
        let mut pending = Vec::new();
        for (name, handle) in self.running.drain() {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(_)) => debug!(service = name, "service shutdown complete"),
                Ok(Err(e)) => {
                    warn!(service = name, error = ?e, "service task failed during shutdown");
                    pending.push(name);
                }
                Err(_) => {
                    warn!(service = name, "service shutdown timed out");
                    pending.push(name);
                }
            }
        }

        if pending.is_empty() {
            Ok(started.elapsed())
        } else {
            Err(pending)
        }
    }
}
