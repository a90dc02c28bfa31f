//! Shutdown manager for graceful node termination.

use crate::broadcast::Broadcaster;
use crate::storage::{P2PDataStorage, PersistenceManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Manages graceful shutdown of the node
pub struct ShutdownManager {
    /// Token to signal shutdown to all tasks
    cancel_token: CancellationToken,
    /// Handles to all spawned tasks
    task_handles: Vec<JoinHandle<()>>,
    broadcaster: Option<Arc<Broadcaster>>,
    storage: Option<Arc<P2PDataStorage>>,
    persistence_manager: Option<Arc<PersistenceManager>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
            broadcaster: None,
            storage: None,
            persistence_manager: None,
        }
    }

    /// Get a clone of the cancellation token for spawning tasks
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Register a task handle for shutdown coordination
    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    /// Pending gossip is pushed out before connections close.
    pub fn set_broadcaster(&mut self, broadcaster: Arc<Broadcaster>) {
        self.broadcaster = Some(broadcaster);
    }

    pub fn set_storage(&mut self, storage: Arc<P2PDataStorage>) {
        self.storage = Some(storage);
    }

    pub fn set_persistence_manager(&mut self, manager: Arc<PersistenceManager>) {
        self.persistence_manager = Some(manager);
    }

    /// Waits for ctrl+c or for something else to cancel the token, then
    /// shuts everything down.
    pub async fn wait_for_shutdown(self) {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                    return;
                }
                tracing::info!("🛑 Shutdown signal received");
            }
            _ = self.cancel_token.cancelled() => {
                tracing::info!("🛑 Shutdown requested");
            }
        }
        self.shut_down().await;
    }

    pub async fn shut_down(mut self) {
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.shut_down().await;
        }
        if let Some(storage) = &self.storage {
            storage.shut_down();
        }

        // Signal all tasks to stop
        self.cancel_token.cancel();

        let shutdown_tasks = std::pin::pin!(async {
            for handle in self.task_handles.drain(..) {
                let _ = handle.await;
            }
        });
        match tokio::time::timeout(TASK_JOIN_TIMEOUT, shutdown_tasks).await {
            Ok(_) => {
                tracing::info!("✓ All tasks shut down gracefully");
            }
            Err(_) => {
                tracing::warn!("⏱️  Shutdown timeout: Some tasks did not complete");
            }
        }

        // Covers stores that changed after the periodic flusher stopped.
        if let Some(manager) = &self.persistence_manager {
            if let Err(e) = manager.flush_all() {
                tracing::error!("❌ Final flush failed: {}", e);
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shut_down_cancels_and_joins_tasks() {
        let mut manager = ShutdownManager::new();
        let token = manager.token();
        let (tx, rx) = tokio::sync::oneshot::channel();
        manager.register_task(tokio::spawn(async move {
            token.cancelled().await;
            let _ = tx.send(());
        }));

        manager.shut_down().await;
        assert!(rx.await.is_ok());
    }
}
