//! Router instance for tests.

use std::sync::Arc;

use elvin_core::{BasicExpressions, Environment, Listener};
use elvin_router::{RouterConfig, RouterServer};
use tokio::task::JoinHandle;

/// A [`RouterServer`] serving one listener on a background task.
#[derive(Debug)]
pub struct SimRouter<E: Environment> {
    server: Arc<RouterServer<E, BasicExpressions>>,
    task: JoinHandle<()>,
}

impl<E: Environment> SimRouter<E> {
    /// Start serving `listener`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<L: Listener>(listener: L, env: E, config: RouterConfig) -> Self {
        let server = Arc::new(RouterServer::new(env, BasicExpressions, config));
        let serving = Arc::clone(&server);
        let task = tokio::spawn(async move {
            if let Err(error) = serving.serve(listener).await {
                tracing::error!(%error, "simulated router stopped");
            }
        });
        Self { server, task }
    }

    /// The running server.
    pub fn server(&self) -> &RouterServer<E, BasicExpressions> {
        &self.server
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.server.core().session_count()
    }

    /// Graceful shutdown: Disconn(1) to every client, then stop accepting.
    pub async fn shutdown(mut self) {
        self.server.shutdown().await;
        if let Err(error) = (&mut self.task).await {
            tracing::debug!(%error, "router task ended abnormally");
        }
    }
}

impl<E: Environment> Drop for SimRouter<E> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
