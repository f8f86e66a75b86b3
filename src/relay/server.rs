//! Relay Server
//!
//! Entry point for embedding the relay: owns the registry, runs the listener
//! and lets callers inject traffic into live connections.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::bail;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::events::{RelayEvents, RelayObserver};
use super::router::BroadcastRouter;
use crate::config::ServerConfig;
use crate::connection::{ConnectionId, ConnectionInfo, ConnectionRegistry, Listener, ListenerOptions};
use crate::metrics::RelayMetrics;
use crate::protocol::{ChatMessage, Frame};
use crate::shutdown::ShutdownSignal;
use crate::Result;

pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    router: BroadcastRouter,
    metrics: Arc<RelayMetrics>,
    observer: Option<Arc<dyn RelayObserver>>,
    stop_signal: ShutdownSignal,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    started_at: Instant,
}

impl RelayServer {
    pub fn new(config: ServerConfig, metrics: Arc<RelayMetrics>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());

        Self {
            config,
            router: BroadcastRouter::new(Arc::clone(&registry)),
            registry,
            metrics,
            observer: None,
            stop_signal: ShutdownSignal::new(),
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    /// Attach an observer for received messages and closed connections.
    /// Must be called before `start`.
    pub fn with_observer(mut self, observer: Arc<dyn RelayObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Bind `port` on the configured interface and start accepting.
    ///
    /// Port 0 picks an ephemeral port; the bound address is returned. The
    /// accept loop stops when `shutdown` is raised or `stop` is called.
    pub async fn start(&self, port: u16, shutdown: ShutdownSignal) -> Result<SocketAddr> {
        if self.accept_task.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            bail!("relay server already started");
        }
        if self.stop_signal.is_triggered() {
            bail!("relay server has been stopped");
        }

        let events = Arc::new(RelayEvents::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
            self.observer.clone(),
        ));
        let options = ListenerOptions {
            send_retry_interval: self.config.send_retry_interval,
            tcp_nodelay: self.config.tcp_nodelay,
        };
        let bind_addr = SocketAddr::new(self.config.bind_addr.ip(), port);

        let listener = Listener::bind(bind_addr, Arc::clone(&self.registry), events, options).await?;
        let local_addr = listener.local_addr()?;

        let stop_signal = self.stop_signal.clone();
        let task = tokio::spawn(async move {
            let listener_stop = stop_signal.clone();
            let forward = tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.wait() => stop_signal.trigger(),
                    _ = stop_signal.wait() => {}
                }
            });

            if let Err(e) = listener.run(listener_stop).await {
                error!("Listener error: {:#}", e);
            }
            forward.abort();
        });

        {
            let mut accept_task = self.accept_task.lock().unwrap_or_else(PoisonError::into_inner);
            if accept_task.is_some() {
                task.abort();
                bail!("relay server already started");
            }
            *accept_task = Some(task);
        }
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);

        info!("Relay server listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop accepting and dispose every live connection.
    pub async fn stop(&self) {
        self.stop_signal.trigger();

        let task = self.accept_task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Accept task failed: {}", e);
                }
            }
        }

        let handlers = self.registry.drain();
        let count = handlers.len();
        for handler in handlers {
            handler.dispose().await;
        }
        self.metrics.set_active_connections(0);

        info!(disposed_connections = count, "Relay server stopped");
    }

    /// Queue a pre-encoded frame on one connection.
    ///
    /// Returns `false` if the connection is unknown or already disposed.
    pub fn enqueue(&self, id: ConnectionId, frame: Frame) -> bool {
        let queued = self
            .registry
            .get(id)
            .map(|handler| handler.enqueue(frame))
            .unwrap_or(false);
        if queued {
            self.metrics.frames_enqueued(1);
        }
        queued
    }

    /// Send a server-originated message to every connection
    pub fn broadcast(&self, message: &ChatMessage) -> usize {
        let recipients = self.router.fan_out(None, message);
        self.metrics.frames_enqueued(recipients);
        recipients
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.infos()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_payload, encode_frame, read_frame};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            send_retry_interval: Duration::from_millis(50),
            tcp_nodelay: true,
        }
    }

    fn test_server() -> RelayServer {
        RelayServer::new(test_config(), Arc::new(RelayMetrics::new().unwrap()))
    }

    async fn wait_for_count(server: &RelayServer, expected: usize) {
        timeout(Duration::from_secs(2), async {
            while server.connection_count() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection count not reached");
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = test_server();
        server.start(0, ShutdownSignal::new()).await.unwrap();
        assert!(server.start(0, ShutdownSignal::new()).await.is_err());
        server.stop().await;
        assert!(server.start(0, ShutdownSignal::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_external_shutdown_stops_accepting() {
        let server = test_server();
        let shutdown = ShutdownSignal::new();
        let addr = server.start(0, shutdown.clone()).await.unwrap();
        assert!(server.is_running());

        shutdown.trigger();
        timeout(Duration::from_secs(2), async {
            while server.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_enqueue_targets_one_connection() {
        let server = test_server();
        let addr = server.start(0, ShutdownSignal::new()).await.unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 1).await;

        let id = server.connections()[0].id;
        let frame = encode_frame(&ChatMessage::new("server", "direct")).unwrap();
        assert!(server.enqueue(id, frame.clone()));
        assert!(!server.enqueue(ConnectionId::new(9999), frame));

        let payload = timeout(Duration::from_secs(2), read_frame(&mut client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decode_payload(&payload).unwrap().text, "direct");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_disposes_live_connections() {
        let server = test_server();
        let addr = server.start(0, ShutdownSignal::new()).await.unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 1).await;

        server.stop().await;
        assert_eq!(server.connection_count(), 0);

        let result = timeout(Duration::from_secs(2), read_frame(&mut client))
            .await
            .unwrap();
        assert!(result.unwrap_err().is_clean_close());

        // Writing into a disposed connection must not resurrect anything.
        let _ = client.write_all(&[0, 0]).await;
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_clients() {
        let server = test_server();
        let addr = server.start(0, ShutdownSignal::new()).await.unwrap();
        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 2).await;

        assert_eq!(server.broadcast(&ChatMessage::new("server", "notice")), 2);

        for client in [&mut a, &mut b] {
            let payload = timeout(Duration::from_secs(2), read_frame(client))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(decode_payload(&payload).unwrap(), ChatMessage::new("server", "notice"));
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn test_active_connection_gauge_follows_the_registry() {
        async fn wait_for_gauge(server: &RelayServer, expected: i64) {
            timeout(Duration::from_secs(2), async {
                while server.metrics().snapshot().active_connections != expected {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("gauge did not reach expected value");
        }

        let server = test_server();
        let addr = server.start(0, ShutdownSignal::new()).await.unwrap();
        let first = TcpStream::connect(addr).await.unwrap();
        let _second = TcpStream::connect(addr).await.unwrap();
        wait_for_gauge(&server, 2).await;

        drop(first);
        wait_for_gauge(&server, 1).await;

        server.stop().await;
        assert_eq!(server.metrics().snapshot().active_connections, 0);
    }
}
