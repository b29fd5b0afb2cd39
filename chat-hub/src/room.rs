use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tracing::{debug, warn};

use crate::{
    client::{Client, ClientId},
    error::DeliveryError,
    message::Message,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
    /// The client is stopping or stopped and may not join anything.
    ClientInactive,
    /// The room does not exist and rooms are not created on join.
    NoSuchRoom,
}

impl JoinOutcome {
    pub fn is_member(self) -> bool {
        matches!(self, JoinOutcome::Joined | JoinOutcome::AlreadyMember)
    }
}

/// Result of one broadcast. Partial failure is normal.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<(ClientId, DeliveryError)>,
}

/// A named broadcast group, keyed by client id.
pub struct Room {
    name: String,
    members: RwLock<HashMap<ClientId, Arc<Client>>>,
}

impl Room {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_member(&self, client: &Arc<Client>) -> JoinOutcome {
        let mut members = self.write_members();
        if members.contains_key(client.id()) {
            return JoinOutcome::AlreadyMember;
        }
        // Recorded on the client under our lock, so a concurrent stop either
        // sees this room in its mirror or makes us refuse the join.
        if !client.enter_room(&self.name) {
            return JoinOutcome::ClientInactive;
        }
        members.insert(client.id().to_string(), Arc::clone(client));
        debug!(room = %self.name, client = %client.id(), members = members.len(), "member joined");
        JoinOutcome::Joined
    }

    pub fn remove_member(&self, client_id: &str) -> Option<Arc<Client>> {
        let mut members = self.write_members();
        let removed = members.remove(client_id)?;
        removed.leave_room(&self.name);
        debug!(room = %self.name, client = %client_id, members = members.len(), "member left");
        Some(removed)
    }

    /// Removes every member, e.g. when the room itself is destroyed.
    pub(crate) fn evict_all(&self) -> Vec<Arc<Client>> {
        let evicted: Vec<Arc<Client>> = self.write_members().drain().map(|(_, c)| c).collect();
        for client in &evicted {
            client.leave_room(&self.name);
        }
        evicted
    }

    /// Delivers `message` to everyone who is a member right now, the sender
    /// included when it is a member.
    ///
    /// The member lock is released before any delivery. A client that leaves
    /// while this runs may or may not get the message.
    pub fn broadcast(&self, message: Message) -> BroadcastReport {
        let recipients: Vec<Arc<Client>> = self.read_members().values().cloned().collect();
        let message = Arc::new(message);
        let mut report = BroadcastReport::default();

        for member in recipients {
            match member.deliver(Arc::clone(&message)) {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    warn!(room = %self.name, client = %member.id(), %error, "dropping message for member");
                    report.failed.push((member.id().to_string(), error));
                }
            }
        }

        report
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.read_members().contains_key(client_id)
    }

    pub fn member_ids(&self) -> Vec<ClientId> {
        self.read_members().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read_members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_members().is_empty()
    }

    fn read_members(&self) -> RwLockReadGuard<'_, HashMap<ClientId, Arc<Client>>> {
        self.members.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_members(&self) -> RwLockWriteGuard<'_, HashMap<ClientId, Arc<Client>>> {
        self.members.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("members", &self.len())
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
        registry::{Registry, RegistryConfig},
        session::Session,
    };

    fn client(registry: &Arc<Registry>, name: &str) -> (Arc<Client>, MemoryPeer) {
        let (connection, peer) = MemoryConnection::pair(name);
        let session = Session::new(format!("s-{name}"), format!("u-{name}"), name);
        (Client::new(session, connection, registry), peer)
    }

    #[tokio::test]
    async fn members_are_unique() {
        let registry = Registry::new(RegistryConfig::default());
        let room = Room::new("rust");
        let (alice, _peer) = client(&registry, "alice");

        assert_eq!(room.add_member(&alice), JoinOutcome::Joined);
        assert_eq!(room.add_member(&alice), JoinOutcome::AlreadyMember);
        assert_eq!(room.len(), 1);
        assert_eq!(alice.rooms(), vec!["rust".to_string()]);
    }

    #[tokio::test]
    async fn removing_a_stranger_is_a_no_op() {
        let room = Room::new("rust");
        assert!(room.remove_member("nobody").is_none());
        assert!(room.is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_member_including_the_sender() {
        let registry = Registry::new(RegistryConfig::default());
        let room = Room::new("main");
        let (alice, mut alice_peer) = client(&registry, "alice");
        let (bob, mut bob_peer) = client(&registry, "bob");
        room.add_member(&alice);
        room.add_member(&bob);
        alice.start().unwrap();
        bob.start().unwrap();

        let report = room.broadcast(Message::text("main", "hi").with_sender("u-alice", "alice"));
        assert_eq!(report.delivered, 2);
        assert!(report.failed.is_empty());

        for peer in [&mut alice_peer, &mut bob_peer] {
            let got = timeout(Duration::from_secs(1), peer.next_sent())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got.content.as_deref(), Some("hi"));
        }

        alice.stop().await;
        bob.stop().await;
    }

    #[tokio::test]
    async fn stopped_clients_cannot_join() {
        let registry = Registry::new(RegistryConfig::default());
        let room = Room::new("rust");
        let (alice, _peer) = client(&registry, "alice");
        alice.stop().await;

        assert_eq!(room.add_member(&alice), JoinOutcome::ClientInactive);
        assert!(room.is_empty());
    }

    #[tokio::test]
    async fn evicting_clears_member_mirrors() {
        let registry = Registry::new(RegistryConfig::default());
        let room = Room::new("rust");
        let (alice, _peer) = client(&registry, "alice");
        room.add_member(&alice);

        assert_eq!(room.evict_all().len(), 1);
        assert!(room.is_empty());
        assert!(alice.rooms().is_empty());
    }
}
