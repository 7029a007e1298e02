use crate::prelude::*;
use crate::ecu::connection::ConnectionHandler;

use {
    net2::TcpStreamExt,
    std::net::SocketAddr,
    std::sync::{Arc, Mutex},
    std::time::Duration,
    tokio::net::{TcpListener, TcpStream},
    tokio::sync::Semaphore,
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
};

// pause after a failed accept so a persistent error can't spin the task
const ACCEPT_RETRY_DELAY_MS: u64 = 100;

/// One acceptor per configured port.
///
/// A port that fails to bind is logged and skipped; the rest still serve.
/// Stopping closes the listening sockets but leaves accepted connections to
/// finish on their own.
pub struct ListenerSet {
    host: String,
    ports: Vec<u16>,
    keepalive: Option<Duration>,
    max_connections: Option<usize>,
    handler: ConnectionHandler,
    stats: Arc<Mutex<ProxyStats>>,
    token: CancellationToken,
    acceptors: Mutex<Vec<JoinHandle<()>>>,
}

impl ListenerSet {
    pub fn new(
        listener: &config::Listener,
        handler: ConnectionHandler,
        stats: Arc<Mutex<ProxyStats>>,
    ) -> Self {
        Self {
            host: listener.host().to_string(),
            ports: listener.ports().to_vec(),
            keepalive: listener.keepalive(),
            max_connections: listener.max_connections(),
            handler,
            stats,
            token: CancellationToken::new(),
            acceptors: Mutex::new(Vec::new()),
        }
    }

    /// Binds every configured port and spawns its acceptor. Returns the
    /// addresses that were actually bound.
    pub async fn start(&self) -> Vec<SocketAddr> {
        let limiter = self.max_connections.map(|max| Arc::new(Semaphore::new(max)));
        let mut bound = Vec::new();

        for &port in &self.ports {
            debug!("Creating server for port {}", port);

            let listener = match TcpListener::bind((self.host.as_str(), port)).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!("Error starting server on {}:{} - {}", self.host, port, err);
                    self.count_bind_failure();
                    continue;
                }
            };

            let addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(err) => {
                    error!("Error starting server on {}:{} - {}", self.host, port, err);
                    self.count_bind_failure();
                    continue;
                }
            };

            info!("Server for port {} started on {}", port, addr);
            bound.push(addr);

            let acceptor = Acceptor {
                listener,
                port: addr.port(),
                keepalive: self.keepalive,
                limiter: limiter.clone(),
                handler: self.handler.clone(),
                stats: self.stats.clone(),
                token: self.token.child_token(),
            };

            let handle = tokio::spawn(acceptor.run());
            if let Ok(mut acceptors) = self.acceptors.lock() {
                acceptors.push(handle);
            }
        }

        if bound.is_empty() {
            warn!("No listening ports could be opened");
        }

        bound
    }

    /// Closes every listening socket and waits for the acceptors to exit.
    pub async fn stop(&self) {
        self.token.cancel();

        let handles: Vec<_> = match self.acceptors.lock() {
            Ok(mut acceptors) => acceptors.drain(..).collect(),
            Err(_) => Vec::new(),
        };

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Error waiting for acceptor task: {}", e);
            }
        }
    }

    fn count_bind_failure(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.bind_failures += 1;
        }
    }
}

struct Acceptor {
    listener: TcpListener,
    port: u16,
    keepalive: Option<Duration>,
    limiter: Option<Arc<Semaphore>>,
    handler: ConnectionHandler,
    stats: Arc<Mutex<ProxyStats>>,
    token: CancellationToken,
}

impl Acceptor {
    async fn run(self) {
        loop {
            tokio::select! {
                () = self.token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(err) => {
                        warn!("Accept on port {} failed: {}", self.port, err);
                        tokio::time::sleep(Duration::from_millis(ACCEPT_RETRY_DELAY_MS)).await;
                    }
                },
            }
        }

        // dropping the listener here closes the socket
        info!("Server for port {} stopped", self.port);
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let permit = match &self.limiter {
            Some(limiter) => match limiter.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(
                        "Connection limit reached, dropping ECU @ {} on port {}",
                        peer, self.port
                    );
                    return;
                }
            },
            None => None,
        };

        let stream = match configure_socket(stream, self.keepalive) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Unable to configure socket for {}: {}", peer, err);
                return;
            }
        };

        if let Ok(mut stats) = self.stats.lock() {
            stats.connections_accepted += 1;
            stats.connections_active += 1;
            debug!("Connected clients: {}", stats.connections_active);
        }

        let handler = self.handler.clone();
        let stats = self.stats.clone();
        let port = self.port;

        tokio::spawn(async move {
            let _permit = permit;

            if let Err(err) = handler.run(stream, port).await {
                warn!("Connection from {} on port {} closed: {}", peer, port, err);
            }

            if let Ok(mut stats) = stats.lock() {
                stats.connections_active = stats.connections_active.saturating_sub(1);
            }
        });
    }
}

fn configure_socket(stream: TcpStream, keepalive: Option<Duration>) -> Result<TcpStream> {
    let Some(keepalive) = keepalive else {
        return Ok(stream);
    };

    let std_stream = stream.into_std()?;
    if let Err(e) = std_stream.set_keepalive(Some(keepalive)) {
        warn!("Failed to set TCP keepalive: {}", e);
    }

    Ok(TcpStream::from_std(std_stream)?)
}
