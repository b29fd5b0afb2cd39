//! Process-wide directory of rooms and connected clients.
//!
//! Everything that creates, joins, leaves or destroys a room goes through
//! [`Registry`]. Locks are always taken in the order registry map, room
//! members, client membership, and none is held across an `.await`.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tracing::{debug, info};

use crate::{
    client::{Client, ClientId},
    error::HubError,
    room::{JoinOutcome, Room},
};

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Create a missing room when a client asks to join it.
    pub create_rooms_on_join: bool,
    /// Drop a room as soon as its last member leaves.
    pub remove_empty_rooms: bool,
    /// Messages buffered per client before broadcasts to it are dropped.
    pub outbound_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            create_rooms_on_join: true,
            remove_empty_rooms: false,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

pub struct Registry {
    config: RegistryConfig,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    clients: RwLock<HashMap<ClientId, Arc<Client>>>,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            rooms: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Creates `name`, optionally with a first member.
    ///
    /// # Errors
    ///
    /// [`HubError::DuplicateRoom`] if a room with that name already exists.
    pub fn create_room(
        &self,
        name: &str,
        initial_member: Option<&Arc<Client>>,
    ) -> Result<Arc<Room>, HubError> {
        let mut rooms = self.write_rooms();
        if rooms.contains_key(name) {
            return Err(HubError::DuplicateRoom(name.to_string()));
        }

        let room = Arc::new(Room::new(name));
        rooms.insert(name.to_string(), Arc::clone(&room));
        info!(room = %name, "room created");

        if let Some(client) = initial_member {
            let outcome = room.add_member(client);
            if !outcome.is_member() {
                debug!(room = %name, client = %client.id(), ?outcome, "initial member not added");
            }
        }
        Ok(room)
    }

    pub fn add_client_to_room(&self, name: &str, client: &Arc<Client>) -> JoinOutcome {
        // The read lock stays held while joining so an empty-room sweep,
        // which needs the write lock, cannot remove the room underneath us.
        {
            let rooms = self.read_rooms();
            if let Some(room) = rooms.get(name) {
                return room.add_member(client);
            }
        }

        if !self.config.create_rooms_on_join {
            debug!(room = %name, client = %client.id(), "join for unknown room ignored");
            return JoinOutcome::NoSuchRoom;
        }

        let mut rooms = self.write_rooms();
        let room = Arc::clone(rooms.entry(name.to_string()).or_insert_with(|| {
            info!(room = %name, "room created on join");
            Arc::new(Room::new(name))
        }));
        let outcome = room.add_member(client);
        if self.config.remove_empty_rooms && room.is_empty() {
            rooms.remove(name);
        }
        outcome
    }

    /// Removes the client from `name` and returns the rooms that changed.
    /// Unknown rooms and non-members give an empty list.
    pub fn remove_client_from_room(&self, name: &str, client_id: &str) -> Vec<String> {
        if self.config.remove_empty_rooms {
            let mut rooms = self.write_rooms();
            let Some(room) = rooms.get(name).cloned() else {
                return Vec::new();
            };
            if room.remove_member(client_id).is_none() {
                return Vec::new();
            }
            if room.is_empty() {
                rooms.remove(name);
                info!(room = %name, "empty room removed");
            }
            return vec![name.to_string()];
        }

        let room = self.find_room(name);
        match room.and_then(|room| room.remove_member(client_id)) {
            Some(_) => vec![name.to_string()],
            None => Vec::new(),
        }
    }

    pub fn find_room(&self, name: &str) -> Option<Arc<Room>> {
        self.read_rooms().get(name).cloned()
    }

    /// Destroys a room. Its members stay connected but are no longer in it.
    pub fn remove_room(&self, name: &str) -> Option<Arc<Room>> {
        let room = self.write_rooms().remove(name)?;
        let evicted = room.evict_all();
        info!(room = %name, evicted = evicted.len(), "room removed");
        Some(room)
    }

    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_rooms().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn room_count(&self) -> usize {
        self.read_rooms().len()
    }

    /// Adds the client to the directory. Returns `false` when another client
    /// with the same id is already registered.
    pub fn add_client(&self, client: &Arc<Client>) -> bool {
        let mut clients = self.write_clients();
        if clients.contains_key(client.id()) {
            return false;
        }
        clients.insert(client.id().to_string(), Arc::clone(client));
        true
    }

    pub fn remove_client(&self, client_id: &str) -> Option<Arc<Client>> {
        self.write_clients().remove(client_id)
    }

    /// Removes `client` from the directory only if the entry is that client.
    pub(crate) fn forget_client(&self, client: &Client) {
        let mut clients = self.write_clients();
        let registered = clients
            .get(client.id())
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), client));
        if registered {
            clients.remove(client.id());
        }
    }

    pub fn find_client(&self, client_id: &str) -> Option<Arc<Client>> {
        self.read_clients().get(client_id).cloned()
    }

    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.read_clients().values().cloned().collect()
    }

    pub fn client_count(&self) -> usize {
        self.read_clients().len()
    }

    fn read_rooms(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Room>>> {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_rooms(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Room>>> {
        self.rooms.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_clients(&self) -> RwLockReadGuard<'_, HashMap<ClientId, Arc<Client>>> {
        self.clients.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_clients(&self) -> RwLockWriteGuard<'_, HashMap<ClientId, Arc<Client>>> {
        self.clients.write().unwrap_or_else(PoisonError::into_inner)
    }
}
