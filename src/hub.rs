//! The chat hub: a single task that owns room membership and fans messages
//! out to every connected client.
//!
//! All membership changes and broadcasts are funnelled through one loop, so
//! the member map needs no lock. Each member is reached through a bounded
//! queue; the hub never waits on a member. A member whose queue is full is
//! dropped on the spot, which closes its queue and ends its stream.

use serde::Serialize;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::models::Message;
use crate::storage::MessageStore;

pub type SessionId = String;

/// The hub's handle on one connected viewer.
///
/// The hub keeps the sending half of the viewer's queue; the stream serving
/// the viewer holds the receiving half. Dropping the session closes the queue.
#[derive(Debug)]
pub struct ClientSession {
    pub id: SessionId,
    pub username: String,
    sender: mpsc::Sender<Arc<Message>>,
}

impl ClientSession {
    /// Create a session with a fresh id and a queue of `capacity` messages.
    pub fn new(username: &str, capacity: usize) -> (Self, mpsc::Receiver<Arc<Message>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let session = Self {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            sender,
        };
        (session, receiver)
    }
}

/// Public view of a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub id: SessionId,
    pub username: String,
}

/// Events processed by the hub loop, one at a time.
#[derive(Debug)]
pub enum HubCommand {
    Register(ClientSession),
    Unregister(SessionId),
    Broadcast(Message),
    Members(oneshot::Sender<Vec<Member>>),
    Shutdown,
}

/// Cloneable handle used to talk to the hub loop.
///
/// Register, unregister and queries travel on an unbounded control lane so
/// they can be sent from synchronous code (including `Drop`). Broadcasts use
/// a bounded lane; the loop always drains the control lane first.
#[derive(Clone)]
pub struct Hub {
    control: mpsc::UnboundedSender<HubCommand>,
    broadcasts: mpsc::Sender<HubCommand>,
}

impl Hub {
    /// Create a hub and its loop without starting it.
    pub fn new(store: Arc<dyn MessageStore>, broadcast_buffer: usize) -> (Self, HubLoop) {
        let (control, control_rx) = mpsc::unbounded_channel();
        let (broadcasts, broadcast_rx) = mpsc::channel(broadcast_buffer.max(1));

        let hub = Self {
            control,
            broadcasts,
        };
        let hub_loop = HubLoop {
            clients: HashMap::new(),
            control_rx,
            broadcast_rx,
            store,
        };
        (hub, hub_loop)
    }

    /// Create a hub and spawn its loop on the current runtime.
    pub fn spawn(store: Arc<dyn MessageStore>, broadcast_buffer: usize) -> Self {
        let (hub, hub_loop) = Self::new(store, broadcast_buffer);
        tokio::spawn(hub_loop.run());
        hub
    }

    pub fn register(&self, session: ClientSession) {
        self.send_control(HubCommand::Register(session));
    }

    /// Ask the hub to drop a session. Unknown ids are ignored by the hub.
    pub fn unregister(&self, session_id: &str) {
        self.send_control(HubCommand::Unregister(session_id.to_string()));
    }

    /// Queue a message for persistence and fan-out. Waits only when the
    /// hub's broadcast lane is full.
    pub async fn broadcast(&self, message: Message) {
        if self
            .broadcasts
            .send(HubCommand::Broadcast(message))
            .await
            .is_err()
        {
            debug!("Hub stopped, broadcast discarded");
        }
    }

    /// Current members, in no particular order. Empty if the hub has stopped.
    pub async fn members(&self) -> Vec<Member> {
        let (reply, rx) = oneshot::channel();
        self.send_control(HubCommand::Members(reply));
        rx.await.unwrap_or_default()
    }

    pub async fn connected_count(&self) -> usize {
        self.members().await.len()
    }

    /// Close every member's queue and stop the loop.
    pub fn shutdown(&self) {
        self.send_control(HubCommand::Shutdown);
    }

    fn send_control(&self, command: HubCommand) {
        if let Err(e) = self.control.send(command) {
            debug!("Hub stopped, dropping {:?}", e.0);
        }
    }
}

/// The coordination loop. Sole owner of the member map.
pub struct HubLoop {
    clients: HashMap<SessionId, ClientSession>,
    control_rx: mpsc::UnboundedReceiver<HubCommand>,
    broadcast_rx: mpsc::Receiver<HubCommand>,
    store: Arc<dyn MessageStore>,
}

impl HubLoop {
    /// Run until shut down or until every [`Hub`] handle is gone.
    pub async fn run(mut self) {
        info!("Chat hub started");

        loop {
            let command = tokio::select! {
                biased;
                Some(command) = self.control_rx.recv() => command,
                Some(command) = self.broadcast_rx.recv() => command,
                else => break,
            };

            if self.handle(command).await.is_break() {
                break;
            }
        }

        let remaining = self.clients.len();
        self.clients.clear();
        info!("Chat hub stopped, closed {} client queue(s)", remaining);
    }

    async fn handle(&mut self, command: HubCommand) -> ControlFlow<()> {
        match command {
            HubCommand::Register(session) => {
                let notice = Message::joined(&session.username);
                info!(
                    "Client {} ({}) joined, total={}",
                    session.username,
                    session.id,
                    self.clients.len() + 1
                );
                self.clients.insert(session.id.clone(), session);
                self.persist_and_fan_out(notice).await;
            }
            HubCommand::Unregister(session_id) => match self.clients.remove(&session_id) {
                Some(session) => {
                    info!(
                        "Client {} ({}) left, total={}",
                        session.username,
                        session.id,
                        self.clients.len()
                    );
                    let notice = Message::left(&session.username);
                    // Closes the client's queue.
                    drop(session);
                    self.persist_and_fan_out(notice).await;
                }
                None => debug!("Unregister for unknown session {}", session_id),
            },
            HubCommand::Broadcast(message) => {
                self.persist_and_fan_out(message).await;
            }
            HubCommand::Members(reply) => {
                let members = self
                    .clients
                    .values()
                    .map(|c| Member {
                        id: c.id.clone(),
                        username: c.username.clone(),
                    })
                    .collect();
                let _ = reply.send(members);
            }
            HubCommand::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    /// Persist first, then deliver regardless of whether the save worked.
    async fn persist_and_fan_out(&mut self, message: Message) {
        if let Err(e) = self.store.save(&message).await {
            error!("Failed to save message {}: {}", message.id, e);
        }
        self.fan_out(Arc::new(message));
    }

    fn fan_out(&mut self, message: Arc<Message>) {
        let mut evicted = Vec::new();

        for (id, client) in &self.clients {
            match client.sender.try_send(Arc::clone(&message)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Dropping slow client {} ({})", client.username, id);
                    evicted.push(id.clone());
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Client {} ({}) already gone", client.username, id);
                    evicted.push(id.clone());
                }
            }
        }

        for id in evicted {
            self.clients.remove(&id);
        }
    }
}
