//! Connection Handler
//!
//! Owns one client socket and runs two independent loops over it:
//! - the receive loop reads frames, decodes them and hands messages to the
//!   event sink; it is the only path that reports the connection as closed
//! - the send loop waits on the outbound queue signal and drains queued
//!   frames to the socket; on failure it closes the socket and leaves the
//!   reporting to the receive loop
//!
//! Both loops re-check the handler state after every suspension point, since
//! `dispose` may run while either of them is parked in a read, write or wait.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::queue::OutboundQueue;
use super::types::{ConnectionId, ConnectionInfo, ConnectionState, ConnectionStats};
use crate::error::{DecodeError, RelayError};
use crate::protocol::{decode_payload, read_frame, write_frame, ChatMessage, Frame, FRAME_LENGTH_SIZE};

/// Sink for everything a connection reports upward.
pub trait ConnectionEvents: Send + Sync {
    /// The handler was registered and its loops are about to start
    fn connection_opened(&self, _handler: &ConnectionHandler) {}

    /// A frame from `sender` decoded successfully
    fn message_received(&self, sender: &ConnectionHandler, message: ChatMessage);

    /// The receive loop ended on a fault; called at most once per handler
    fn connection_closed(&self, handler: &ConnectionHandler);

    /// The handler was taken out of the registry by its supervisor
    fn connection_unregistered(&self, _handler: &ConnectionHandler) {}

    /// A malformed frame was dropped; the connection stays up
    fn frame_dropped(&self, _handler: &ConnectionHandler, _error: &DecodeError) {}

    /// A complete frame of `bytes` wire bytes was read
    fn frame_received(&self, _handler: &ConnectionHandler, _bytes: usize) {}

    /// A complete frame of `bytes` wire bytes was written
    fn frame_sent(&self, _handler: &ConnectionHandler, _bytes: usize) {}
}

/// Join handles for the two per-connection loops
pub struct ConnectionTasks {
    pub receive: JoinHandle<()>,
    pub send: JoinHandle<()>,
}

/// Per-connection socket owner
pub struct ConnectionHandler {
    id: ConnectionId,
    peer_addr: SocketAddr,
    connected_at: SystemTime,
    state: AtomicU8,
    queue: OutboundQueue,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    socket_closed: CancellationToken,
    close_reported: AtomicBool,
    retry_interval: Duration,
    stats: ConnectionStats,
}

impl ConnectionHandler {
    /// Wrap an accepted socket.
    ///
    /// `retry_interval` bounds each send-loop wait so a missed wake-up is
    /// picked up on the next timeout.
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        peer_addr: SocketAddr,
        retry_interval: Duration,
    ) -> Arc<Self> {
        let (reader, writer) = stream.into_split();

        Arc::new(Self {
            id,
            peer_addr,
            connected_at: SystemTime::now(),
            state: AtomicU8::new(ConnectionState::Active as u8),
            queue: OutboundQueue::new(),
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            socket_closed: CancellationToken::new(),
            close_reported: AtomicBool::new(false),
            retry_interval,
            stats: ConnectionStats::default(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == ConnectionState::Disposed
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Number of frames waiting to be written
    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    /// Spawn the receive and send loops.
    ///
    /// Returns `None` if the loops were already started or the handler has
    /// been disposed.
    pub fn start(self: &Arc<Self>, events: Arc<dyn ConnectionEvents>) -> Option<ConnectionTasks> {
        if self.is_disposed() {
            return None;
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;

        let receive = tokio::spawn(Arc::clone(self).receive_loop(reader, Arc::clone(&events)));
        let send = tokio::spawn(Arc::clone(self).send_loop(events));

        Some(ConnectionTasks { receive, send })
    }

    /// Queue a frame for this connection. Never blocks.
    ///
    /// Returns `false` without queueing once the handler is disposed.
    pub fn enqueue(&self, frame: Frame) -> bool {
        if self.is_disposed() {
            return false;
        }
        self.queue.push(frame)
    }

    /// Tear the connection down.
    ///
    /// Only the first call acts: it marks the handler disposed, cancels the
    /// pending signal wait and any in-flight I/O, closes the socket and
    /// releases the queue. Returns whether this call performed the teardown.
    pub async fn dispose(&self) -> bool {
        let previous = self
            .state
            .swap(ConnectionState::Disposed as u8, Ordering::AcqRel);
        if previous == ConnectionState::Disposed as u8 {
            return false;
        }

        self.socket_closed.cancel();
        let discarded = self.queue.close();
        drop(
            self.reader
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        self.release_writer().await;

        info!(
            connection_id = %self.id,
            peer = %self.peer_addr,
            discarded_frames = discarded,
            bytes_received = self.stats.bytes_received(),
            bytes_sent = self.stats.bytes_sent(),
            "Connection disposed"
        );
        true
    }

    /// Close the socket after an I/O fault without disposing the handler.
    ///
    /// Moves `Active -> Closing` and wakes both loops. The receive loop sees
    /// the closure and reports it, so callers never notify the registry
    /// themselves.
    pub async fn close_socket(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Active as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.socket_closed.cancel();
        self.release_writer().await;
    }

    /// Snapshot for status reporting
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            peer_addr: self.peer_addr,
            connected_at: self.connected_at,
            state: self.state(),
            queued_frames: self.queue.len(),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received(),
            bytes_sent: self.stats.bytes_sent(),
            decode_failures: self.stats.decode_failures.load(Ordering::Relaxed),
        }
    }

    async fn release_writer(&self) -> bool {
        let writer = self.writer.lock().await.take();
        match writer {
            Some(mut writer) => {
                if let Err(e) = writer.shutdown().await {
                    debug!(connection_id = %self.id, error = %e, "Socket shutdown reported an error");
                }
                true
            }
            None => false,
        }
    }

    #[instrument(name = "receive_loop", skip_all, fields(connection_id = %self.id, peer = %self.peer_addr))]
    async fn receive_loop(self: Arc<Self>, mut reader: OwnedReadHalf, events: Arc<dyn ConnectionEvents>) {
        debug!("Receive loop started");

        let fault = loop {
            let result = tokio::select! {
                biased;
                _ = self.socket_closed.cancelled() => None,
                result = read_frame(&mut reader) => Some(result),
            };

            if self.is_disposed() {
                break None;
            }

            let Some(result) = result else {
                break Some(RelayError::Socket(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "socket closed after send failure",
                )));
            };

            let decoded = result.and_then(|payload| {
                let wire_len = payload.len() + FRAME_LENGTH_SIZE;
                self.stats.record_received(wire_len);
                events.frame_received(&self, wire_len);
                decode_payload(&payload).map_err(RelayError::from)
            });

            match decoded {
                Ok(message) => {
                    debug!(name = %message.name, len = message.text.len(), "Frame received");
                    events.message_received(&self, message);
                }
                Err(e) if e.is_fatal() => break Some(e),
                Err(e) => {
                    self.stats.record_decode_failure();
                    warn!(error = %e, "Dropping malformed frame");
                    if let RelayError::Decode(reason) = &e {
                        events.frame_dropped(&self, reason);
                    }
                }
            }
        };

        drop(reader);

        let Some(fault) = fault else {
            debug!("Receive loop stopped after disposal");
            return;
        };

        if fault.is_clean_close() {
            info!("Peer closed the connection");
        } else {
            warn!(error = %fault, "Connection fault");
        }

        self.close_socket().await;

        if self.is_disposed() {
            return;
        }
        if !self.close_reported.swap(true, Ordering::AcqRel) {
            events.connection_closed(&self);
        }
    }

    #[instrument(name = "send_loop", skip_all, fields(connection_id = %self.id, peer = %self.peer_addr))]
    async fn send_loop(self: Arc<Self>, events: Arc<dyn ConnectionEvents>) {
        debug!("Send loop started");

        loop {
            if self.state() != ConnectionState::Active {
                break;
            }

            let woken = tokio::select! {
                biased;
                _ = self.socket_closed.cancelled() => break,
                woken = self.queue.signal().wait(self.retry_interval) => woken,
            };

            if self.state() != ConnectionState::Active {
                break;
            }
            if !woken && self.queue.is_empty() {
                continue;
            }

            self.queue.signal().clear();
            if let Err(e) = self.drain(events.as_ref()).await {
                warn!(error = %e, "Send failed, closing socket");
                self.close_socket().await;
                break;
            }
        }

        debug!("Send loop stopped");
    }

    /// Write queued frames until the queue is empty
    async fn drain(&self, events: &dyn ConnectionEvents) -> Result<(), RelayError> {
        let mut writer = self.writer.lock().await;

        while let Some(frame) = self.queue.pop() {
            if self.is_disposed() {
                return Ok(());
            }
            let Some(socket) = writer.as_mut() else {
                return Ok(());
            };

            tokio::select! {
                biased;
                _ = self.socket_closed.cancelled() => return Ok(()),
                result = write_frame(socket, &frame) => result?,
            }
            self.stats.record_sent(frame.len());
            events.frame_sent(self, frame.len());
        }

        Ok(())
    }
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .field("queued_frames", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_frame, encode_payload};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[derive(Default)]
    struct RecordingEvents {
        messages: Mutex<Vec<(ConnectionId, ChatMessage)>>,
        closed: AtomicUsize,
        dropped: AtomicUsize,
    }

    impl ConnectionEvents for RecordingEvents {
        fn message_received(&self, sender: &ConnectionHandler, message: ChatMessage) {
            self.messages.lock().unwrap().push((sender.id(), message));
        }

        fn connection_closed(&self, _handler: &ConnectionHandler) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn frame_dropped(&self, _handler: &ConnectionHandler, _error: &DecodeError) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn connected_handler() -> (Arc<ConnectionHandler>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();

        let handler = ConnectionHandler::new(
            ConnectionId::new(1),
            server,
            peer,
            Duration::from_millis(50),
        );
        (handler, client)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn received_frames_reach_the_event_sink() {
        let (handler, mut client) = connected_handler().await;
        let events = Arc::new(RecordingEvents::default());
        handler.start(events.clone()).unwrap();

        let frame = encode_frame(&ChatMessage::new("alice", "hi")).unwrap();
        client.write_all(frame.as_bytes()).await.unwrap();

        wait_until(|| !events.messages.lock().unwrap().is_empty()).await;
        let messages = events.messages.lock().unwrap();
        assert_eq!(messages[0], (ConnectionId::new(1), ChatMessage::new("alice", "hi")));
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_and_connection_survives() {
        let (handler, mut client) = connected_handler().await;
        let events = Arc::new(RecordingEvents::default());
        handler.start(events.clone()).unwrap();

        // Name length of 9 inside a 3 byte payload.
        client.write_all(&[0x00, 0x03, 0x00, 0x09, b'x']).await.unwrap();
        let good = encode_frame(&ChatMessage::new("bob", "still here")).unwrap();
        client.write_all(good.as_bytes()).await.unwrap();

        wait_until(|| !events.messages.lock().unwrap().is_empty()).await;
        assert_eq!(events.dropped.load(Ordering::SeqCst), 1);
        assert_eq!(events.closed.load(Ordering::SeqCst), 0);
        assert_eq!(handler.state(), ConnectionState::Active);
        assert_eq!(handler.stats().decode_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn enqueued_frames_are_written_in_order() {
        let (handler, mut client) = connected_handler().await;
        handler.start(Arc::new(RecordingEvents::default())).unwrap();

        let texts = ["one", "two", "three"];
        for text in texts {
            assert!(handler.enqueue(encode_frame(&ChatMessage::new("srv", text)).unwrap()));
        }

        for text in texts {
            let payload = timeout(Duration::from_secs(2), read_frame(&mut client))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(decode_payload(&payload).unwrap().text, text);
        }
    }

    #[tokio::test]
    async fn frame_queued_before_start_is_delivered() {
        let (handler, mut client) = connected_handler().await;
        handler.enqueue(encode_frame(&ChatMessage::new("srv", "early")).unwrap());
        handler.start(Arc::new(RecordingEvents::default())).unwrap();

        let payload = timeout(Duration::from_secs(2), read_frame(&mut client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decode_payload(&payload).unwrap().text, "early");
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let (handler, mut client) = connected_handler().await;
        let events = Arc::new(RecordingEvents::default());
        let tasks = handler.start(events.clone()).unwrap();

        assert!(handler.dispose().await);
        assert!(!handler.dispose().await);
        assert_eq!(handler.state(), ConnectionState::Disposed);

        timeout(Duration::from_secs(2), tasks.receive).await.unwrap().unwrap();
        timeout(Duration::from_secs(2), tasks.send).await.unwrap().unwrap();

        // The peer observes exactly one orderly close.
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(events.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn enqueue_after_dispose_is_a_no_op() {
        let (handler, _client) = connected_handler().await;
        handler.dispose().await;

        let frame = encode_frame(&ChatMessage::new("late", "ignored")).unwrap();
        assert!(!handler.enqueue(frame));
        assert_eq!(handler.queued_frames(), 0);
    }

    #[tokio::test]
    async fn start_after_dispose_or_twice_is_refused() {
        let (handler, _client) = connected_handler().await;
        let events: Arc<dyn ConnectionEvents> = Arc::new(RecordingEvents::default());
        assert!(handler.start(Arc::clone(&events)).is_some());
        assert!(handler.start(Arc::clone(&events)).is_none());

        let (other, _client) = connected_handler().await;
        other.dispose().await;
        assert!(other.start(events).is_none());
    }

    #[tokio::test]
    async fn peer_disconnect_is_reported_once() {
        let (handler, client) = connected_handler().await;
        let events = Arc::new(RecordingEvents::default());
        let tasks = handler.start(events.clone()).unwrap();

        drop(client);
        timeout(Duration::from_secs(2), tasks.receive).await.unwrap().unwrap();

        assert_eq!(events.closed.load(Ordering::SeqCst), 1);
        assert_eq!(handler.state(), ConnectionState::Closing);

        handler.dispose().await;
        assert_eq!(events.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn truncated_frame_is_fatal() {
        let (handler, mut client) = connected_handler().await;
        let events = Arc::new(RecordingEvents::default());
        let tasks = handler.start(events.clone()).unwrap();

        // Announces 10 payload bytes, sends 3 and hangs up.
        client.write_all(&[0x00, 0x0A, 0x00, 0x00, b'x']).await.unwrap();
        drop(client);

        timeout(Duration::from_secs(2), tasks.receive).await.unwrap().unwrap();
        assert_eq!(events.closed.load(Ordering::SeqCst), 1);
        assert!(events.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_write_closes_socket_and_is_reported_once() {
        let (handler, mut client) = connected_handler().await;
        let events = Arc::new(RecordingEvents::default());
        let tasks = handler.start(events.clone()).unwrap();

        // Shut our write side so the next write fails with EPIPE.
        handler
            .writer
            .lock()
            .await
            .as_mut()
            .unwrap()
            .shutdown()
            .await
            .unwrap();
        assert!(handler.enqueue(encode_frame(&ChatMessage::new("srv", "lost")).unwrap()));

        timeout(Duration::from_secs(2), tasks.send).await.unwrap().unwrap();
        timeout(Duration::from_secs(2), tasks.receive).await.unwrap().unwrap();

        assert!(handler.socket_closed.is_cancelled());
        assert!(handler.writer.lock().await.is_none());
        assert_eq!(handler.state(), ConnectionState::Closing);
        assert_eq!(handler.stats().frames_sent.load(Ordering::Relaxed), 0);
        assert_eq!(events.closed.load(Ordering::SeqCst), 1);

        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn frame_queued_without_a_wake_is_sent_after_the_timeout() {
        let (handler, mut client) = connected_handler().await;
        handler.start(Arc::new(RecordingEvents::default())).unwrap();

        // Let the send loop park on the signal first.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let frame = encode_frame(&ChatMessage::new("srv", "missed wake")).unwrap();
        handler.queue.push_unsignalled(frame);
        assert!(!handler.queue.signal().is_raised());

        // retry_interval is 50ms; allow two intervals plus scheduling slack.
        let payload = timeout(Duration::from_millis(150), read_frame(&mut client))
            .await
            .expect("frame not sent after the wait timed out")
            .unwrap();
        assert_eq!(decode_payload(&payload).unwrap().text, "missed wake");
    }

    #[tokio::test]
    async fn send_side_close_is_reported_by_the_receive_loop() {
        let (handler, _client) = connected_handler().await;
        let events = Arc::new(RecordingEvents::default());
        let tasks = handler.start(events.clone()).unwrap();

        // What the send loop does after a failed write.
        handler.close_socket().await;

        timeout(Duration::from_secs(2), tasks.receive).await.unwrap().unwrap();
        timeout(Duration::from_secs(2), tasks.send).await.unwrap().unwrap();
        assert_eq!(events.closed.load(Ordering::SeqCst), 1);
        assert_eq!(handler.state(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn empty_name_and_text_round_trip_through_socket() {
        let (handler, mut client) = connected_handler().await;
        let events = Arc::new(RecordingEvents::default());
        handler.start(events.clone()).unwrap();

        let payload = encode_payload("", "").unwrap();
        let frame = Frame::from_payload(&payload).unwrap();
        client.write_all(frame.as_bytes()).await.unwrap();

        wait_until(|| !events.messages.lock().unwrap().is_empty()).await;
        assert_eq!(events.messages.lock().unwrap()[0].1, ChatMessage::new("", ""));
    }
}
