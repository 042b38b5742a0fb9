use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::messages::{DraftMessage, Message, MessageId, MessageStatus, RoomId, UserId};

/// Durable message storage used by the broadcast pipeline and the history routes.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists a draft, assigning its id and timestamps.
    async fn insert(&self, draft: &DraftMessage) -> Result<Message, StorageError>;

    async fn get(&self, id: MessageId) -> Result<Message, StorageError>;

    async fn mark_read(&self, id: MessageId) -> Result<Message, StorageError>;

    /// Replaces the content of an active message.
    async fn edit_content(&self, id: MessageId, content: &str) -> Result<Message, StorageError>;

    /// Returns the deactivated message.
    async fn soft_delete_by_id(&self, id: MessageId) -> Result<Message, StorageError>;

    /// Returns the number of messages deactivated.
    async fn soft_delete_by_room(&self, room_id: RoomId) -> Result<usize, StorageError>;

    /// One page of the room's active messages. `page` is 1-based.
    async fn paginate(
        &self,
        room_id: RoomId,
        per_page: u32,
        page: u32,
        reverse: bool,
    ) -> Result<Vec<Message>, StorageError>;

    async fn is_owner(&self, user_id: UserId, id: MessageId) -> Result<bool, StorageError> {
        Ok(self.get(id).await?.sender_id == user_id)
    }
}

#[derive(Default)]
struct Messages {
    last_id: u64,
    by_id: BTreeMap<MessageId, Message>,
}

#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: RwLock<Messages>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert(&self, draft: &DraftMessage) -> Result<Message, StorageError> {
        if draft.content.trim().is_empty() {
            return Err(StorageError::EmptyContent);
        }

        let mut messages = self.messages.write().await;
        messages.last_id += 1;
        let now = Utc::now();
        let message = Message {
            id: MessageId(messages.last_id),
            sender_id: draft.sender_id,
            room_id: draft.room_id,
            content: draft.content.clone(),
            status: MessageStatus::Sent,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            is_active: true,
        };
        messages.by_id.insert(message.id, message.clone());
        Ok(message)
    }

    async fn get(&self, id: MessageId) -> Result<Message, StorageError> {
        let messages = self.messages.read().await;
        messages
            .by_id
            .get(&id)
            .filter(|m| m.is_active)
            .cloned()
            .ok_or(StorageError::MessageNotFound(id))
    }

    async fn mark_read(&self, id: MessageId) -> Result<Message, StorageError> {
        let mut messages = self.messages.write().await;
        let message = messages
            .by_id
            .get_mut(&id)
            .filter(|m| m.is_active)
            .ok_or(StorageError::MessageNotFound(id))?;
        message.status = MessageStatus::Read;
        message.updated_at = Utc::now();
        Ok(message.clone())
    }

    async fn edit_content(&self, id: MessageId, content: &str) -> Result<Message, StorageError> {
        if content.trim().is_empty() {
            return Err(StorageError::EmptyContent);
        }

        let mut messages = self.messages.write().await;
        let message = messages
            .by_id
            .get_mut(&id)
            .filter(|m| m.is_active)
            .ok_or(StorageError::MessageNotFound(id))?;
        message.content = content.to_string();
        message.updated_at = Utc::now();
        Ok(message.clone())
    }

    async fn soft_delete_by_id(&self, id: MessageId) -> Result<Message, StorageError> {
        let mut messages = self.messages.write().await;
        let message = messages
            .by_id
            .get_mut(&id)
            .filter(|m| m.is_active)
            .ok_or(StorageError::MessageNotFound(id))?;
        let now = Utc::now();
        message.is_active = false;
        message.deleted_at = Some(now);
        message.updated_at = now;
        Ok(message.clone())
    }

    async fn soft_delete_by_room(&self, room_id: RoomId) -> Result<usize, StorageError> {
        let mut messages = self.messages.write().await;
        let now = Utc::now();
        let mut deleted = 0;
        for message in messages
            .by_id
            .values_mut()
            .filter(|m| m.room_id == room_id && m.is_active)
        {
            message.is_active = false;
            message.deleted_at = Some(now);
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn paginate(
        &self,
        room_id: RoomId,
        per_page: u32,
        page: u32,
        reverse: bool,
    ) -> Result<Vec<Message>, StorageError> {
        let per_page = per_page as usize;
        let offset = (page.max(1) as usize - 1).saturating_mul(per_page);
        let messages = self.messages.read().await;
        let in_room = |m: &&Message| m.room_id == room_id && m.is_active;

        let page: Vec<Message> = if reverse {
            messages
                .by_id
                .values()
                .rev()
                .filter(in_room)
                .skip(offset)
                .take(per_page)
                .cloned()
                .collect()
        } else {
            messages
                .by_id
                .values()
                .filter(in_room)
                .skip(offset)
                .take(per_page)
                .cloned()
                .collect()
        };
        Ok(page)
    }
}
