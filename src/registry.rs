use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::Mutex;

use crate::connection::ConnectionHandle;
use crate::messages::{ConnectionId, RoomId};
use crate::room::Room;

pub struct Attachment {
    pub room: Arc<Room>,
    /// This attach brought the room into existence.
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// Nothing to do: unknown room or connection already gone.
    NotAttached,
    Remaining(usize),
    RoomRemoved,
}

/// Live rooms by id. A room is present only while at least one connection
/// is attached. The lock guards membership only; no I/O happens under it.
pub struct Registry {
    rooms: Mutex<HashMap<RoomId, Arc<Room>>>,
    room_queue_capacity: usize,
}

impl Registry {
    pub fn new(room_queue_capacity: usize) -> Self {
        Registry {
            rooms: Mutex::new(HashMap::new()),
            room_queue_capacity,
        }
    }

    pub async fn attach(&self, room_id: RoomId, connection: ConnectionHandle) -> Attachment {
        debug_assert_eq!(room_id, connection.room_id());
        let connection_id = connection.id();
        let user_id = connection.user_id();

        let mut rooms = self.rooms.lock().await;
        let (room, created) = match rooms.get(&room_id) {
            Some(room) if !room.is_closed() => (Arc::clone(room), false),
            _ => {
                let room = Arc::new(Room::new(room_id, self.room_queue_capacity));
                rooms.insert(room_id, Arc::clone(&room));
                info!("Room {} is live", room_id);
                (room, true)
            }
        };
        let count = room.add(connection).await;
        drop(rooms);

        info!(
            "Connection {} (user {}) attached to room {} ({} connected)",
            connection_id, user_id, room_id, count
        );
        Attachment { room, created }
    }

    pub async fn detach(&self, room_id: RoomId, connection_id: ConnectionId) -> Detached {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get(&room_id).cloned() else {
            debug!(
                "Detach of connection {} from room {} ignored, room not live",
                connection_id, room_id
            );
            return Detached::NotAttached;
        };

        let Some(remaining) = room.remove(connection_id).await else {
            debug!(
                "Detach of connection {} from room {} ignored, not attached",
                connection_id, room_id
            );
            return Detached::NotAttached;
        };

        if remaining > 0 {
            drop(rooms);
            info!(
                "Connection {} detached from room {} ({} connected)",
                connection_id, room_id, remaining
            );
            return Detached::Remaining(remaining);
        }

        rooms.remove(&room_id);
        room.close();
        drop(rooms);
        info!(
            "Connection {} detached, room {} is empty and removed",
            connection_id, room_id
        );
        Detached::RoomRemoved
    }

    pub async fn get(&self, room_id: RoomId) -> Option<Arc<Room>> {
        self.rooms.lock().await.get(&room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Closes the room and its connections if it is live. Returns whether it was.
    pub async fn close_room(&self, room_id: RoomId) -> bool {
        let Some(room) = self.get(room_id).await else {
            return false;
        };
        room.abandon().await;
        info!("Room {} closed with its connections", room_id);
        true
    }

    /// Closes every attached connection; their teardown empties the registry.
    pub async fn close_all(&self) {
        let rooms: Vec<Arc<Room>> = self.rooms.lock().await.values().cloned().collect();
        for room in rooms {
            room.abandon().await;
        }
    }
}
