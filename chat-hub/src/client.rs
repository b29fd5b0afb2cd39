//! One authenticated session and its dispatch logic.
//!
//! A started client runs two tasks:
//!
//! - the receive loop, which pulls messages from the connection and
//!   dispatches them (TEXT to a room broadcast, JOIN/LEAVE to the registry,
//!   LOGOUT to teardown);
//! - the writer, which drains the client's bounded outbound queue into
//!   `Connection::send`. Broadcasts only ever push onto that queue, so a
//!   slow peer holds up nobody but itself.
//!
//! Lifecycle is `Created → Running → Stopping → Stopped`. Teardown runs
//! once no matter how many of `stop()`, a LOGOUT, a transport failure or a
//! failed write race to trigger it.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tokio::{
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    connection::Connection,
    error::{DeliveryError, HubError, ReceiveError, StateError},
    message::{Message, MessageKind},
    registry::Registry,
    session::{Session, User},
};

pub type ClientId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl ClientState {
    fn is_active(self) -> bool {
        matches!(self, ClientState::Created | ClientState::Running)
    }
}

/// Lifecycle state and the room mirror share one lock so that a join can
/// never slip in between "mark stopping" and "collect rooms to leave".
struct Membership {
    state: ClientState,
    rooms: BTreeSet<String>,
}

#[derive(Default)]
struct Tasks {
    receive: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

/// Who asked for teardown. Tasks must not wait for themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Caller,
    ReceiveLoop,
    Writer,
}

pub struct Client {
    session: Session,
    connection: Arc<dyn Connection>,
    registry: Weak<Registry>,
    membership: Mutex<Membership>,
    state_tx: watch::Sender<ClientState>,
    outbound_tx: mpsc::Sender<Arc<Message>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Arc<Message>>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Tasks>,
}

impl Client {
    pub fn new<C>(session: Session, connection: C, registry: &Arc<Registry>) -> Arc<Self>
    where
        C: Connection + 'static,
    {
        let capacity = registry.config().outbound_capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (state_tx, _) = watch::channel(ClientState::Created);

        Arc::new(Self {
            session,
            connection: Arc::new(connection),
            registry: Arc::downgrade(registry),
            membership: Mutex::new(Membership {
                state: ClientState::Created,
                rooms: BTreeSet::new(),
            }),
            state_tx,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Tasks::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn user(&self) -> &User {
        &self.session.user
    }

    pub fn state(&self) -> ClientState {
        self.lock_membership().state
    }

    /// Names of the rooms this client is currently in, sorted.
    pub fn rooms(&self) -> Vec<String> {
        self.lock_membership().rooms.iter().cloned().collect()
    }

    /// Spawns the receive loop and the writer.
    ///
    /// # Errors
    ///
    /// [`StateError::AlreadyStarted`] on a second call, [`StateError::Stopped`]
    /// once the client has been stopped.
    pub fn start(self: &Arc<Self>) -> Result<(), HubError> {
        let mut tasks = self.lock_tasks();
        {
            let mut membership = self.lock_membership();
            match membership.state {
                ClientState::Created => membership.state = ClientState::Running,
                ClientState::Running => return Err(StateError::AlreadyStarted.into()),
                ClientState::Stopping | ClientState::Stopped => {
                    return Err(StateError::Stopped.into());
                }
            }
        }
        self.state_tx.send_replace(ClientState::Running);

        let outbound = self
            .outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(StateError::AlreadyStarted)?;

        tasks.writer = Some(tokio::spawn(Arc::clone(self).run_writer(outbound)));
        tasks.receive = Some(tokio::spawn(Arc::clone(self).run_receive_loop()));

        info!(
            client = %self.id(),
            user = %self.session.user.name,
            peer = %self.connection.peer(),
            "client started"
        );
        Ok(())
    }

    /// Stops the client: leaves every room, closes the connection and waits
    /// for both tasks to exit. Safe to call repeatedly and concurrently; every
    /// call returns once the client is `Stopped`.
    pub async fn stop(&self) {
        self.teardown(Origin::Caller).await;
    }

    /// Resolves once the client reaches `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut state = self.state_tx.subscribe();
        let _ = state.wait_for(|state| *state == ClientState::Stopped).await;
    }

    /// Queues `message` for this client's writer without waiting.
    pub fn deliver(&self, message: Arc<Message>) -> Result<(), DeliveryError> {
        if self.shutdown.is_cancelled() {
            return Err(DeliveryError::Inactive);
        }
        self.outbound_tx.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Inactive,
        })
    }

    /// Records a room in the mirror. Refused once teardown has begun.
    pub(crate) fn enter_room(&self, room: &str) -> bool {
        let mut membership = self.lock_membership();
        if !membership.state.is_active() {
            return false;
        }
        membership.rooms.insert(room.to_string());
        true
    }

    pub(crate) fn leave_room(&self, room: &str) {
        self.lock_membership().rooms.remove(room);
    }

    async fn run_receive_loop(self: Arc<Self>) {
        loop {
            let next = select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = self.connection.receive() => next,
            };

            match next {
                Some(Ok(message)) => {
                    if !self.handle_message(message) {
                        break;
                    }
                }
                Some(Err(ReceiveError::Decode(error))) => {
                    warn!(client = %self.id(), %error, "skipping malformed frame");
                }
                Some(Err(ReceiveError::Transport(error))) => {
                    warn!(client = %self.id(), %error, "connection failed");
                    break;
                }
                None => {
                    debug!(client = %self.id(), "connection closed by peer");
                    break;
                }
            }
        }

        self.teardown(Origin::ReceiveLoop).await;
    }

    /// Returns `false` when the loop should end.
    fn handle_message(self: &Arc<Self>, message: Message) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            debug!(client = %self.id(), "registry dropped; ending session");
            return false;
        };

        match message.kind {
            MessageKind::Text => {
                let room_name = message.target_room().to_string();
                let Some(room) = registry.find_room(&room_name) else {
                    debug!(client = %self.id(), room = %room_name, "no such room; text dropped");
                    return true;
                };
                let message = message.with_sender(&self.session.user.id, &self.session.user.name);
                let report = room.broadcast(message);
                debug!(
                    client = %self.id(),
                    room = %room_name,
                    delivered = report.delivered,
                    failed = report.failed.len(),
                    "text broadcast"
                );
            }
            MessageKind::JoinRoom => match message.named_room() {
                Some(room) => {
                    let outcome = registry.add_client_to_room(room, self);
                    debug!(client = %self.id(), %room, ?outcome, "join requested");
                }
                None => warn!(client = %self.id(), "join without a room name ignored"),
            },
            MessageKind::LeaveRoom => match message.named_room() {
                Some(room) => {
                    let affected = registry.remove_client_from_room(room, self.id());
                    debug!(client = %self.id(), %room, left = !affected.is_empty(), "leave requested");
                }
                None => warn!(client = %self.id(), "leave without a room name ignored"),
            },
            MessageKind::Logout => {
                info!(client = %self.id(), "logout requested");
                return false;
            }
        }
        true
    }

    async fn run_writer(self: Arc<Self>, mut outbound: mpsc::Receiver<Arc<Message>>) {
        loop {
            let message = select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                message = outbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            if let Err(error) = self.connection.send(&message).await {
                if !self.shutdown.is_cancelled() {
                    warn!(client = %self.id(), %error, "write failed");
                    self.teardown(Origin::Writer).await;
                }
                break;
            }
        }
    }

    async fn teardown(&self, origin: Origin) {
        let rooms = {
            let mut membership = self.lock_membership();
            if membership.state.is_active() {
                membership.state = ClientState::Stopping;
                Some(std::mem::take(&mut membership.rooms))
            } else {
                None
            }
        };
        let Some(rooms) = rooms else {
            if origin == Origin::Caller {
                self.wait_stopped().await;
            }
            return;
        };
        self.state_tx.send_replace(ClientState::Stopping);
        self.shutdown.cancel();

        if let Some(registry) = self.registry.upgrade() {
            for room in &rooms {
                registry.remove_client_from_room(room, self.id());
            }
            registry.forget_client(self);
        }

        if let Err(error) = self.connection.close().await {
            debug!(client = %self.id(), %error, "error while closing connection");
        }

        let (receive, writer) = {
            let mut tasks = self.lock_tasks();
            (tasks.receive.take(), tasks.writer.take())
        };
        if origin != Origin::ReceiveLoop {
            if let Some(handle) = receive {
                let _ = handle.await;
            }
        }
        if origin != Origin::Writer {
            if let Some(handle) = writer {
                let _ = handle.await;
            }
        }

        self.lock_membership().state = ClientState::Stopped;
        self.state_tx.send_replace(ClientState::Stopped);
        info!(client = %self.id(), rooms_left = rooms.len(), ?origin, "client stopped");
    }

    fn lock_membership(&self) -> MutexGuard<'_, Membership> {
        self.membership.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.session.id)
            .field("user", &self.session.user)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::{
        connection::{MemoryConnection, MemoryPeer},
        registry::RegistryConfig,
    };

    fn client(registry: &Arc<Registry>, name: &str) -> (Arc<Client>, MemoryPeer) {
        let (connection, peer) = MemoryConnection::pair(name);
        let session = Session::new(format!("s-{name}"), format!("u-{name}"), name);
        (Client::new(session, connection, registry), peer)
    }

    async fn stopped(client: &Client) {
        timeout(Duration::from_secs(1), client.wait_stopped())
            .await
            .expect("client should stop");
    }

    #[tokio::test]
    async fn starting_twice_is_an_error() {
        let registry = Registry::new(RegistryConfig::default());
        let (alice, _peer) = client(&registry, "alice");

        alice.start().unwrap();
        assert_eq!(
            alice.start(),
            Err(HubError::State(StateError::AlreadyStarted))
        );
        alice.stop().await;
        assert_eq!(alice.start(), Err(HubError::State(StateError::Stopped)));
    }

    #[tokio::test]
    async fn state_walks_through_the_lifecycle() {
        let registry = Registry::new(RegistryConfig::default());
        let (alice, _peer) = client(&registry, "alice");
        let mut states = alice.state_tx.subscribe();

        assert_eq!(alice.state(), ClientState::Created);
        alice.start().unwrap();
        assert_eq!(alice.state(), ClientState::Running);

        alice.stop().await;
        assert_eq!(alice.state(), ClientState::Stopped);
        assert_eq!(*states.borrow_and_update(), ClientState::Stopped);
    }

    #[tokio::test]
    async fn never_started_client_can_be_stopped() {
        let registry = Registry::new(RegistryConfig::default());
        let (alice, peer) = client(&registry, "alice");
        registry.add_client_to_room("main", &alice);

        alice.stop().await;

        assert_eq!(alice.state(), ClientState::Stopped);
        assert!(!registry.find_room("main").unwrap().contains(alice.id()));
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let registry = Registry::new(RegistryConfig::default());
        let (alice, peer) = client(&registry, "alice");
        alice.start().unwrap();

        peer.push_frame("{not json");
        peer.push(Message::join("rust"));

        timeout(Duration::from_secs(1), async {
            while registry.find_room("rust").is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("join after bad frame");
        assert_eq!(alice.state(), ClientState::Running);
        alice.stop().await;
    }

    #[tokio::test]
    async fn transport_failure_stops_the_client() {
        let registry = Registry::new(RegistryConfig::default());
        let (alice, peer) = client(&registry, "alice");
        registry.add_client_to_room("main", &alice);
        alice.start().unwrap();

        peer.push_failure("connection reset");
        stopped(&alice).await;

        assert!(registry.find_room("main").unwrap().is_empty());
        assert_eq!(peer.releases(), 1);
    }

    #[tokio::test]
    async fn hang_up_stops_the_client() {
        let registry = Registry::new(RegistryConfig::default());
        let (alice, peer) = client(&registry, "alice");
        alice.start().unwrap();

        peer.hang_up();
        stopped(&alice).await;
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn text_is_stamped_with_the_senders_identity() {
        let registry = Registry::new(RegistryConfig::default());
        let (alice, mut peer) = client(&registry, "alice");
        registry.add_client_to_room("main", &alice);
        alice.start().unwrap();

        let mut forged = Message::text("main", "hi");
        forged.sender_id = "someone-else".into();
        peer.push(forged);

        let echoed = timeout(Duration::from_secs(1), peer.next_sent())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed.sender_id, "u-alice");
        assert_eq!(echoed.sender_name, "alice");
        alice.stop().await;
    }

    #[tokio::test]
    async fn text_for_unknown_room_is_dropped_silently() {
        let registry = Registry::new(RegistryConfig::default());
        let (alice, mut peer) = client(&registry, "alice");
        registry.add_client_to_room("main", &alice);
        alice.start().unwrap();

        peer.push(Message::text("nowhere", "lost"));
        peer.push(Message::text("main", "found"));

        let got = timeout(Duration::from_secs(1), peer.next_sent())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.content.as_deref(), Some("found"));
        assert_eq!(alice.state(), ClientState::Running);
        alice.stop().await;
    }

    #[tokio::test]
    async fn full_queue_reports_delivery_failure() {
        let registry = Registry::new(RegistryConfig {
            outbound_capacity: 1,
            ..RegistryConfig::default()
        });
        let (alice, _peer) = client(&registry, "alice");
        let message = Arc::new(Message::text("main", "hi"));

        assert_eq!(alice.deliver(Arc::clone(&message)), Ok(()));
        assert_eq!(
            alice.deliver(Arc::clone(&message)),
            Err(DeliveryError::QueueFull)
        );
        alice.stop().await;
        assert_eq!(alice.deliver(message), Err(DeliveryError::Inactive));
    }
}
