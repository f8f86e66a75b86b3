//! Listener
//!
//! Accepts sockets, wraps each in a [`ConnectionHandler`], registers it and
//! supervises its teardown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::handler::{ConnectionEvents, ConnectionHandler};
use super::registry::ConnectionRegistry;
use super::types::ConnectionId;
use crate::error::RelayError;
use crate::shutdown::ShutdownSignal;
use crate::Result;

/// Pause after a failed accept so a persistent fault (EMFILE) cannot spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Per-connection socket settings applied at accept time
#[derive(Debug, Clone, Copy)]
pub struct ListenerOptions {
    pub send_retry_interval: Duration,
    pub tcp_nodelay: bool,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            send_retry_interval: Duration::from_secs(1),
            tcp_nodelay: true,
        }
    }
}

pub struct Listener {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    events: Arc<dyn ConnectionEvents>,
    options: ListenerOptions,
    next_connection_id: AtomicU64,
}

impl Listener {
    /// Bind the listening socket
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<ConnectionRegistry>,
        events: Arc<dyn ConnectionEvents>,
        options: ListenerOptions,
    ) -> Result<Self> {
        info!("Binding TCP listener to {}", addr);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind listener on {}", addr))?;

        Ok(Self {
            listener,
            registry,
            events,
            options,
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is raised.
    ///
    /// Dropping `self` on return closes the listening socket. Connections
    /// already accepted are left running.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<()> {
        let local_addr = self.local_addr()?;
        info!("Accepting connections on {}", local_addr);

        loop {
            if shutdown.is_triggered() {
                break;
            }

            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => self.admit(stream, peer),
                        Err(e) => accept_failed(e).await,
                    }
                }
                _ = shutdown.wait() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
            }
        }

        info!(
            active_connections = self.registry.len(),
            "Connection acceptance loop stopped"
        );
        Ok(())
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let id = ConnectionId::new(self.next_connection_id.fetch_add(1, Ordering::Relaxed));

        if let Err(e) = stream.set_nodelay(self.options.tcp_nodelay) {
            warn!(connection_id = %id, error = %e, "Failed to set TCP_NODELAY");
        }

        let handler = ConnectionHandler::new(id, stream, peer, self.options.send_retry_interval);
        if !self.registry.add(Arc::clone(&handler)) {
            return;
        }
        info!(connection_id = %id, peer = %peer, "Accepted connection");
        self.events.connection_opened(&handler);

        let Some(tasks) = handler.start(Arc::clone(&self.events)) else {
            if self.registry.remove(id).is_some() {
                self.events.connection_unregistered(&handler);
            }
            return;
        };

        let registry = Arc::clone(&self.registry);
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            if let Err(e) = tasks.receive.await {
                error!(connection_id = %id, error = %e, "Receive task failed");
            }

            if registry.remove(id).is_some() {
                events.connection_unregistered(&handler);
            }
            handler.dispose().await;

            if let Err(e) = tasks.send.await {
                error!(connection_id = %id, error = %e, "Send task failed");
            }
            debug!(connection_id = %id, "Connection torn down");
        });
    }
}

/// Log an accept fault and back off before the next attempt
async fn accept_failed(e: std::io::Error) {
    let fault = RelayError::Accept(e);
    error!(error = %fault, "Error accepting connection");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChatMessage;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    #[derive(Default)]
    struct CountingEvents {
        opened: AtomicUsize,
        closed: AtomicUsize,
        unregistered: AtomicUsize,
    }

    impl ConnectionEvents for CountingEvents {
        fn connection_opened(&self, _handler: &ConnectionHandler) {
            self.opened.fetch_add(1, Ordering::SeqCst);
        }

        fn message_received(&self, _sender: &ConnectionHandler, _message: ChatMessage) {}

        fn connection_closed(&self, _handler: &ConnectionHandler) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn connection_unregistered(&self, _handler: &ConnectionHandler) {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_for_len(registry: &ConnectionRegistry, expected: usize) {
        timeout(Duration::from_secs(2), async {
            while registry.len() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registry did not reach expected size");
    }

    #[tokio::test]
    async fn accepted_connections_are_registered_and_removed() {
        let registry = Arc::new(ConnectionRegistry::new());
        let events = Arc::new(CountingEvents::default());
        let listener = Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&registry),
            events.clone(),
            ListenerOptions::default(),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = ShutdownSignal::new();
        let server = tokio::spawn(listener.run(shutdown.clone()));

        let first = TcpStream::connect(addr).await.unwrap();
        let second = TcpStream::connect(addr).await.unwrap();
        wait_for_len(&registry, 2).await;
        assert_eq!(events.opened.load(Ordering::SeqCst), 2);

        drop(first);
        wait_for_len(&registry, 1).await;
        assert_eq!(events.closed.load(Ordering::SeqCst), 1);

        shutdown.trigger();
        timeout(Duration::from_secs(2), server).await.unwrap().unwrap().unwrap();

        // Live connections survive the end of the accept loop.
        assert_eq!(registry.len(), 1);
        drop(second);
        wait_for_len(&registry, 0).await;

        // These events leave removal to the supervisor, which reports each one.
        timeout(Duration::from_secs(2), async {
            while events.unregistered.load(Ordering::SeqCst) != 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("supervisor did not report both removals");
    }

    #[tokio::test]
    async fn accept_fault_pauses_before_retrying() {
        let started = std::time::Instant::now();
        accept_failed(std::io::Error::from_raw_os_error(24)).await;
        assert!(started.elapsed() >= ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn shutdown_closes_the_listening_socket() {
        let registry = Arc::new(ConnectionRegistry::new());
        let listener = Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            registry,
            Arc::new(CountingEvents::default()),
            ListenerOptions::default(),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();

        timeout(Duration::from_secs(2), listener.run(shutdown))
            .await
            .unwrap()
            .unwrap();

        assert!(TcpStream::connect(addr).await.is_err());
    }
}
