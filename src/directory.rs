use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::messages::{RoomId, UserId};

/// Room existence and membership checks consulted before a socket is upgraded.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn room_exists(&self, room_id: RoomId) -> bool;

    /// Owner or member.
    async fn has_access(&self, room_id: RoomId, user_id: UserId) -> bool;

    async fn is_owner(&self, room_id: RoomId, user_id: UserId) -> bool;

    async fn create_room(&self, owner_id: UserId, name: &str) -> RoomInfo;

    async fn add_member(&self, room_id: RoomId, user_id: UserId) -> Result<RoomInfo, StorageError>;

    async fn room_info(&self, room_id: RoomId) -> Option<RoomInfo>;

    async fn rename_room(&self, room_id: RoomId, name: &str) -> Result<RoomInfo, StorageError>;

    /// Removes the room and its membership. Returns what was removed.
    async fn delete_room(&self, room_id: RoomId) -> Result<RoomInfo, StorageError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub id: RoomId,
    pub owner_id: UserId,
    pub name: String,
    pub members: BTreeSet<UserId>,
}

#[derive(Default)]
struct Rooms {
    last_id: u64,
    by_id: HashMap<RoomId, RoomInfo>,
}

#[derive(Default)]
pub struct InMemoryRoomDirectory {
    rooms: RwLock<Rooms>,
}

impl InMemoryRoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomDirectory for InMemoryRoomDirectory {
    async fn room_exists(&self, room_id: RoomId) -> bool {
        self.rooms.read().await.by_id.contains_key(&room_id)
    }

    async fn has_access(&self, room_id: RoomId, user_id: UserId) -> bool {
        self.rooms
            .read()
            .await
            .by_id
            .get(&room_id)
            .is_some_and(|room| room.owner_id == user_id || room.members.contains(&user_id))
    }

    async fn is_owner(&self, room_id: RoomId, user_id: UserId) -> bool {
        self.rooms
            .read()
            .await
            .by_id
            .get(&room_id)
            .is_some_and(|room| room.owner_id == user_id)
    }

    async fn create_room(&self, owner_id: UserId, name: &str) -> RoomInfo {
        let mut rooms = self.rooms.write().await;
        rooms.last_id += 1;
        let info = RoomInfo {
            id: RoomId(rooms.last_id),
            owner_id,
            name: name.to_string(),
            members: BTreeSet::new(),
        };
        rooms.by_id.insert(info.id, info.clone());
        info
    }

    async fn add_member(&self, room_id: RoomId, user_id: UserId) -> Result<RoomInfo, StorageError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .by_id
            .get_mut(&room_id)
            .ok_or(StorageError::RoomNotFound(room_id))?;
        room.members.insert(user_id);
        Ok(room.clone())
    }

    async fn room_info(&self, room_id: RoomId) -> Option<RoomInfo> {
        self.rooms.read().await.by_id.get(&room_id).cloned()
    }

    async fn rename_room(&self, room_id: RoomId, name: &str) -> Result<RoomInfo, StorageError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .by_id
            .get_mut(&room_id)
            .ok_or(StorageError::RoomNotFound(room_id))?;
        room.name = name.to_string();
        Ok(room.clone())
    }

    async fn delete_room(&self, room_id: RoomId) -> Result<RoomInfo, StorageError> {
        self.rooms
            .write()
            .await
            .by_id
            .remove(&room_id)
            .ok_or(StorageError::RoomNotFound(room_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn owner_and_members_have_access() {
        let directory = InMemoryRoomDirectory::new();
        let room = directory.create_room(UserId(1), "general").await;
        directory.add_member(room.id, UserId(2)).await.unwrap();

        assert!(directory.room_exists(room.id).await);
        assert!(directory.has_access(room.id, UserId(1)).await);
        assert!(directory.has_access(room.id, UserId(2)).await);
        assert!(!directory.has_access(room.id, UserId(3)).await);
        assert!(directory.is_owner(room.id, UserId(1)).await);
        assert!(!directory.is_owner(room.id, UserId(2)).await);
    }

    #[tokio::test]
    async fn unknown_room() {
        let directory = InMemoryRoomDirectory::new();
        assert!(!directory.room_exists(RoomId(9)).await);
        assert!(!directory.has_access(RoomId(9), UserId(1)).await);
        assert_eq!(
            directory.add_member(RoomId(9), UserId(1)).await.unwrap_err(),
            StorageError::RoomNotFound(RoomId(9))
        );
    }

    #[tokio::test]
    async fn room_ids_are_sequential() {
        let directory = InMemoryRoomDirectory::new();
        assert_eq!(directory.create_room(UserId(1), "a").await.id, RoomId(1));
        assert_eq!(directory.create_room(UserId(1), "b").await.id, RoomId(2));
        assert_eq!(directory.room_info(RoomId(2)).await.unwrap().name, "b");
    }

    #[tokio::test]
    async fn rename_and_delete() {
        let directory = InMemoryRoomDirectory::new();
        let room = directory.create_room(UserId(1), "old").await;
        directory.add_member(room.id, UserId(2)).await.unwrap();

        let renamed = directory.rename_room(room.id, "new").await.unwrap();
        assert_eq!(renamed.name, "new");
        assert!(renamed.members.contains(&UserId(2)));

        let removed = directory.delete_room(room.id).await.unwrap();
        assert_eq!(removed.name, "new");
        assert!(!directory.room_exists(room.id).await);
        assert!(!directory.has_access(room.id, UserId(2)).await);
        assert!(directory.room_info(room.id).await.is_none());
        assert_eq!(
            directory.delete_room(room.id).await.unwrap_err(),
            StorageError::RoomNotFound(room.id)
        );
        assert_eq!(
            directory.rename_room(room.id, "gone").await.unwrap_err(),
            StorageError::RoomNotFound(room.id)
        );
    }
}
