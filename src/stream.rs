//! Per-connection SSE driver.
//!
//! A [`ChatStream`] attaches one viewer to the hub and turns its queue into
//! SSE frames: a `connected` event first, then one `message` event per
//! delivered message, with a keep-alive comment whenever the connection has
//! been idle for the keep-alive interval. It ends when its queue is closed
//! by the hub or the server signals shutdown, and it always unregisters from
//! the hub exactly once, including when the client simply goes away and the
//! stream is dropped.

use axum::response::sse::Event;
use futures_util::stream::{self, Stream};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::hub::{ClientSession, Hub, SessionId};
use crate::models::{display_name, Message};
use crate::render::render_message;

/// Stream tuning taken from configuration.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub queue_capacity: usize,
    pub keepalive: Duration,
}

/// One SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Connected,
    Message(String),
    KeepAlive,
}

impl Frame {
    pub fn into_event(self) -> Event {
        match self {
            Frame::Connected => Event::default().event("connected").data("connected"),
            Frame::Message(html) => Event::default().event("message").data(html),
            Frame::KeepAlive => Event::default().comment("keepalive"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Streaming,
    Closed,
}

/// Unregisters its session when released or dropped, whichever comes first.
struct Registration {
    hub: Option<Hub>,
    session_id: SessionId,
}

impl Registration {
    fn release(&mut self) {
        if let Some(hub) = self.hub.take() {
            debug!("Stream for session {} closing", self.session_id);
            hub.unregister(&self.session_id);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

/// A viewer's connection to the hub.
pub struct ChatStream {
    registration: Registration,
    username: String,
    queue: mpsc::Receiver<Arc<Message>>,
    shutdown: watch::Receiver<bool>,
    keepalive: Duration,
    state: State,
}

impl ChatStream {
    /// Create a session for `username` and register it with the hub.
    pub fn connect(
        hub: &Hub,
        username: &str,
        settings: StreamSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let username = display_name(username);
        let (session, queue) = ClientSession::new(&username, settings.queue_capacity);
        let session_id = session.id.clone();
        hub.register(session);

        Self {
            registration: Registration {
                hub: Some(hub.clone()),
                session_id,
            },
            username,
            queue,
            shutdown,
            keepalive: settings.keepalive,
            state: State::Connecting,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.registration.session_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Wait for the next frame. `None` once the connection is finished.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        match self.state {
            State::Connecting => {
                self.state = State::Streaming;
                return Some(Frame::Connected);
            }
            State::Closed => return None,
            State::Streaming => {}
        }

        tokio::select! {
            message = self.queue.recv() => match message {
                Some(message) => Some(Frame::Message(render_message(&message, &self.username))),
                None => {
                    debug!("Queue for session {} closed by hub", self.registration.session_id);
                    self.close()
                }
            },
            _ = cancelled(&mut self.shutdown) => {
                debug!("Server shutting down, ending session {}", self.registration.session_id);
                self.close()
            }
            _ = tokio::time::sleep(self.keepalive) => Some(Frame::KeepAlive),
        }
    }

    fn close(&mut self) -> Option<Frame> {
        self.state = State::Closed;
        self.registration.release();
        None
    }

    /// Adapt into the stream type `axum::response::Sse` expects.
    pub fn into_stream(self) -> impl Stream<Item = Result<Event, Infallible>> + Send {
        stream::unfold(self, |mut chat| async move {
            let frame = chat.next_frame().await?;
            Some((Ok(frame.into_event()), chat))
        })
    }
}

/// Resolves once shutdown is signalled or the signal's sender is gone.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn settings(keepalive: Duration) -> StreamSettings {
        StreamSettings {
            queue_capacity: 16,
            keepalive,
        }
    }

    async fn next(chat: &mut ChatStream) -> Option<Frame> {
        timeout(WAIT, chat.next_frame()).await.expect("no frame in time")
    }

    fn message_html(frame: Option<Frame>) -> String {
        match frame {
            Some(Frame::Message(html)) => html,
            other => panic!("expected a message frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connected_then_join_then_chat() {
        let hub = Hub::spawn(Arc::new(MemoryStore::new()), 16);
        let (_stop, shutdown) = watch::channel(false);

        let mut bob = ChatStream::connect(&hub, "Bob", settings(Duration::from_secs(30)), shutdown);
        hub.broadcast(Message::text("Carol", "hi").unwrap()).await;

        assert_eq!(next(&mut bob).await, Some(Frame::Connected));
        assert!(message_html(next(&mut bob).await).contains("Bob joined the chat"));
        let chat = message_html(next(&mut bob).await);
        assert!(chat.contains(r#"<span class="author">Carol</span>"#));
        assert!(chat.contains(r#"<span class="content">hi</span>"#));
    }

    #[tokio::test]
    async fn test_blank_username_becomes_guest() {
        let hub = Hub::spawn(Arc::new(MemoryStore::new()), 16);
        let (_stop, shutdown) = watch::channel(false);

        let chat = ChatStream::connect(&hub, "  ", settings(Duration::from_secs(30)), shutdown);
        assert_eq!(chat.username(), "Guest");
        assert_eq!(hub.members().await[0].id, chat.session_id());
    }

    #[tokio::test]
    async fn test_keepalive_after_idle() {
        let hub = Hub::spawn(Arc::new(MemoryStore::new()), 16);
        let (_stop, shutdown) = watch::channel(false);

        let mut chat = ChatStream::connect(&hub, "idle", settings(Duration::from_millis(50)), shutdown);
        assert_eq!(next(&mut chat).await, Some(Frame::Connected));
        message_html(next(&mut chat).await);
        assert_eq!(next(&mut chat).await, Some(Frame::KeepAlive));
        assert_eq!(next(&mut chat).await, Some(Frame::KeepAlive));
    }

    #[tokio::test]
    async fn test_shutdown_ends_stream_and_unregisters() {
        let hub = Hub::spawn(Arc::new(MemoryStore::new()), 16);
        let (stop, shutdown) = watch::channel(false);

        let mut chat = ChatStream::connect(&hub, "Dana", settings(Duration::from_secs(30)), shutdown);
        assert_eq!(next(&mut chat).await, Some(Frame::Connected));
        message_html(next(&mut chat).await);

        stop.send(true).unwrap();
        assert_eq!(next(&mut chat).await, None);
        assert_eq!(next(&mut chat).await, None);
        assert_eq!(hub.connected_count().await, 0);
    }

    #[tokio::test]
    async fn test_dropping_stream_unregisters() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::spawn(store.clone(), 16);
        let (_stop, shutdown) = watch::channel(false);

        let chat = ChatStream::connect(&hub, "Eve", settings(Duration::from_secs(30)), shutdown);
        assert_eq!(hub.connected_count().await, 1);

        drop(chat);
        assert_eq!(hub.connected_count().await, 0);
        assert!(store.messages()[1].content.contains("Eve left"));
    }

    #[tokio::test]
    async fn test_eviction_ends_stream() {
        let hub = Hub::spawn(Arc::new(MemoryStore::new()), 16);
        let (_stop, shutdown) = watch::channel(false);

        let tiny = StreamSettings {
            queue_capacity: 1,
            keepalive: Duration::from_secs(30),
        };
        let mut chat = ChatStream::connect(&hub, "slow", tiny, shutdown);
        // The join notice fills the queue; this one overflows it.
        hub.broadcast(Message::text("x", "overflow").unwrap()).await;

        assert_eq!(next(&mut chat).await, Some(Frame::Connected));
        assert!(message_html(next(&mut chat).await).contains("slow joined"));
        assert_eq!(next(&mut chat).await, None);
    }
}
