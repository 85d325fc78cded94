//! Transport layer abstraction for the watch stream.

use crate::error::{SyncError, SyncResult};
use docsync_protocol::{
    BatchId, Status, StreamError, StreamEvent, StreamRequest, Version, WatchChange,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// Client half of one duplex stream.
#[derive(Debug)]
pub struct StreamChannel {
    /// Outbound requests.
    pub requests: mpsc::UnboundedSender<StreamRequest>,
    /// Inbound events. The stream reports `StreamEvent::Open` once it
    /// accepts requests; a closed channel counts as an unavailable stream.
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
}

/// A connection opens watch streams to the server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (gRPC, WebSocket, in-process mock for testing, etc.).
pub trait Connection: Send + Sync {
    /// Starts a new stream.
    fn open_stream(&self) -> SyncResult<StreamChannel>;
}

impl<C: Connection + ?Sized> Connection for Arc<C> {
    fn open_stream(&self) -> SyncResult<StreamChannel> {
        (**self).open_stream()
    }
}

/// Server half of a mock stream.
#[derive(Debug)]
pub struct ServerStream {
    requests: mpsc::UnboundedReceiver<StreamRequest>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl ServerStream {
    /// Creates a connected pair of stream halves.
    pub fn pair() -> (StreamChannel, ServerStream) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            StreamChannel {
                requests: request_tx,
                events: event_rx,
            },
            ServerStream {
                requests: request_rx,
                events: event_tx,
            },
        )
    }

    /// Sends an event. Returns false if the client dropped the stream.
    pub fn send(&self, event: StreamEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Completes the handshake.
    pub fn open(&self) -> bool {
        self.send(StreamEvent::Open)
    }

    /// Sends a watch change.
    pub fn watch(&self, change: WatchChange) -> bool {
        self.send(StreamEvent::Watch(change))
    }

    /// Acknowledges a write.
    pub fn ack_write(&self, batch_id: BatchId, commit_version: Version) -> bool {
        self.send(StreamEvent::WriteAcked {
            batch_id,
            commit_version,
        })
    }

    /// Rejects a write.
    pub fn reject_write(&self, batch_id: BatchId, status: Status) -> bool {
        self.send(StreamEvent::WriteRejected { batch_id, status })
    }

    /// Ends the stream.
    pub fn close(self, error: Option<StreamError>) {
        let _ = self.events.send(StreamEvent::Closed(error));
    }

    /// Waits for the next request. `None` once the client dropped the
    /// stream.
    pub async fn next_request(&mut self) -> Option<StreamRequest> {
        self.requests.recv().await
    }

    /// Returns the next request if one is queued.
    pub fn try_next_request(&mut self) -> Option<StreamRequest> {
        self.requests.try_recv().ok()
    }
}

/// A mock connection for testing.
///
/// Every opened stream's server half is queued for the test to pick up
/// with [`MockConnection::next_stream`].
#[derive(Debug)]
pub struct MockConnection {
    available: AtomicBool,
    opened: AtomicUsize,
    streams: Mutex<VecDeque<ServerStream>>,
    stream_ready: Notify,
}

impl MockConnection {
    /// Creates a new mock connection.
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            opened: AtomicUsize::new(0),
            streams: Mutex::new(VecDeque::new()),
            stream_ready: Notify::new(),
        }
    }

    /// Sets whether new streams can be opened.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of streams opened so far.
    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Waits for the server half of the next opened stream.
    pub async fn next_stream(&self) -> ServerStream {
        loop {
            if let Some(stream) = self.streams.lock().pop_front() {
                return stream;
            }
            self.stream_ready.notified().await;
        }
    }

    /// Returns the server half of the next opened stream, if any.
    pub fn try_next_stream(&self) -> Option<ServerStream> {
        self.streams.lock().pop_front()
    }
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for MockConnection {
    fn open_stream(&self) -> SyncResult<StreamChannel> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("mock connection unavailable"));
        }
        let (client, server) = ServerStream::pair();
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.streams.lock().push_back(server);
        self.stream_ready.notify_one();
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::{StatusCode, TargetId, WatchRequest};

    #[test]
    fn mock_connection_availability() {
        let connection = MockConnection::new();
        assert!(connection.open_stream().is_ok());
        assert_eq!(connection.opened_count(), 1);

        connection.set_available(false);
        let result = connection.open_stream();
        assert!(matches!(
            result,
            Err(SyncError::Transport {
                retryable: true,
                ..
            })
        ));
        assert_eq!(connection.opened_count(), 1);
    }

    #[test]
    fn stream_halves_are_connected() {
        let connection = MockConnection::new();
        let mut client = connection.open_stream().unwrap();
        let mut server = connection.try_next_stream().unwrap();

        client
            .requests
            .send(StreamRequest::Watch(WatchRequest::RemoveTarget {
                target_id: TargetId(1),
            }))
            .unwrap();
        assert!(server.try_next_request().is_some());

        assert!(server.open());
        server.close(Some(StreamError::new(StatusCode::Unavailable, "bye")));
        assert_eq!(client.events.try_recv().unwrap(), StreamEvent::Open);
        assert!(matches!(
            client.events.try_recv().unwrap(),
            StreamEvent::Closed(Some(_))
        ));
    }

    #[tokio::test]
    async fn next_stream_waits_for_open() {
        let connection = Arc::new(MockConnection::new());
        let opener = Arc::clone(&connection);
        let task = tokio::spawn(async move { opener.open_stream().map(|_| ()) });
        let _server = connection.next_stream().await;
        assert!(task.await.unwrap().is_ok());
    }
}
