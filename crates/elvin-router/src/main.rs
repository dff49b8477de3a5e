//! Elvin router binary.
//!
//! Signals: Ctrl-C and SIGTERM shut down gracefully, SIGUSR1 logs the client
//! list, SIGHUP redirects every client to the failover address.

use std::{sync::Arc, time::Duration};

use clap::Parser;
use elvin_core::{BasicExpressions, KeepaliveConfig, SystemEnv, TcpAcceptor};
use elvin_router::{ConnectionLimits, RouterConfig, RouterServer};
use tracing_subscriber::EnvFilter;

type Server = RouterServer<SystemEnv, BasicExpressions>;

/// Elvin publish/subscribe router.
#[derive(Debug, Parser)]
#[command(name = "elvin-router", version, about)]
struct Args {
    /// Address to listen on (repeatable).
    #[arg(short, long = "listen", default_value = "0.0.0.0:2917")]
    listen: Vec<String>,

    /// Maximum concurrent connections.
    #[arg(long, default_value_t = 1024)]
    max_connections: usize,

    /// Seconds of silence before a keepalive check.
    #[arg(long, default_value_t = 60)]
    keepalive_interval: u64,

    /// Seconds to wait for a keepalive response.
    #[arg(long, default_value_t = 10)]
    keepalive_timeout: u64,

    /// Seconds a new connection has to send ConnRqst.
    #[arg(long, default_value_t = 10)]
    handshake_timeout: u64,

    /// Address clients are redirected to on SIGHUP.
    #[arg(long)]
    failover: Option<String>,

    /// Outbound queue length per connection.
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
}

impl Args {
    fn into_config(self) -> RouterConfig {
        RouterConfig {
            listen: self.listen,
            max_connections: self.max_connections,
            keepalive: KeepaliveConfig {
                idle_interval: Duration::from_secs(self.keepalive_interval),
                response_timeout: Duration::from_secs(self.keepalive_timeout),
            },
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
            failover: self.failover,
            queue_capacity: self.queue_capacity,
            limits: ConnectionLimits::default(),
            ..RouterConfig::default()
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = Args::parse().into_config();
    if config.listen.is_empty() {
        return Err(elvin_router::RouterError::NoListeners.into());
    }

    let server = Arc::new(Server::new(SystemEnv, BasicExpressions, config.clone()));
    let mut listeners = Vec::with_capacity(config.listen.len());
    for address in &config.listen {
        let acceptor = TcpAcceptor::bind(address).await?;
        let server = Arc::clone(&server);
        listeners.push(tokio::spawn(async move { server.serve(acceptor).await }));
    }

    handle_signals(&server).await?;
    server.shutdown().await;
    tokio::time::sleep(config.shutdown_grace).await;

    for listener in listeners {
        if let Err(error) = listener.await? {
            tracing::error!(%error, "listener failed");
        }
    }
    tracing::info!("router stopped");
    Ok(())
}

#[cfg(unix)]
async fn handle_signals(server: &Server) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut dump = signal(SignalKind::user_defined1())?;
    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("received SIGINT, shutting down");
                return Ok(());
            },
            _ = terminate.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                return Ok(());
            },
            _ = dump.recv() => {
                server.dump_clients();
            },
            _ = hangup.recv() => {
                server.redirect_all().await;
            },
        }
    }
}

#[cfg(not(unix))]
async fn handle_signals(_server: &Server) -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl-C, shutting down");
    Ok(())
}
