use std::future::Future;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::auth::{Identity, IdentityResolver};
use crate::broadcast;
use crate::config::Config;
use crate::connection::{Connection, LoopExit, TransportReader, TransportWriter};
use crate::directory::{RoomDirectory, RoomInfo};
use crate::error::{AuthError, HubError, TransportError};
use crate::messages::{Message, MessageId, PageQuery, RoomId, UserId};
use crate::registry::Registry;
use crate::session::{Session, SessionState};
use crate::store::MessageStore;

/// The real-time hub: owns the room registry and the collaborators every
/// join needs. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Server {
    registry: Arc<Registry>,
    store: Arc<dyn MessageStore>,
    rooms: Arc<dyn RoomDirectory>,
    auth: Arc<dyn IdentityResolver>,
    mailbox_capacity: usize,
}

impl Server {
    pub fn new(
        config: &Config,
        auth: Arc<dyn IdentityResolver>,
        rooms: Arc<dyn RoomDirectory>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        Server {
            registry: Arc::new(Registry::new(config.room_queue_capacity)),
            store,
            rooms,
            auth,
            mailbox_capacity: config.mailbox_capacity,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub async fn active_rooms(&self) -> usize {
        self.registry.room_count().await
    }

    pub async fn identify(&self, credential: Option<&str>) -> Result<Identity, HubError> {
        let credential = credential.ok_or(AuthError::MissingCredential)?;
        Ok(self.auth.resolve_identity(credential).await?)
    }

    async fn check_access(&self, room_id: RoomId, credential: Option<&str>) -> Result<Identity, HubError> {
        let identity = self.identify(credential).await?;
        if !self.rooms.room_exists(room_id).await {
            return Err(HubError::RoomNotFound(room_id));
        }
        if !self.rooms.has_access(room_id, identity.user_id).await {
            return Err(HubError::Forbidden(room_id));
        }
        Ok(identity)
    }

    /// Resolves the caller and checks room access. Must succeed before any
    /// socket is upgraded.
    pub async fn authorize(
        &self,
        session: &mut Session,
        credential: Option<&str>,
    ) -> Result<Identity, HubError> {
        session.advance(SessionState::Authorizing);
        match self.check_access(session.room_id(), credential).await {
            Ok(identity) => {
                session.identify(identity.user_id);
                session.advance(SessionState::Upgrading);
                Ok(identity)
            }
            Err(err) => {
                warn!("Join to room {} refused: {}", session.room_id(), err);
                session.advance(SessionState::Closed);
                Err(err)
            }
        }
    }

    /// Full join: authorize, upgrade the transport, then stream until the
    /// client goes away.
    pub async fn join_room<U, F, R, W>(
        &self,
        room_id: RoomId,
        credential: Option<&str>,
        upgrade: U,
    ) -> Result<LoopExit, HubError>
    where
        U: FnOnce() -> F,
        F: Future<Output = Result<(R, W), TransportError>>,
        R: TransportReader + 'static,
        W: TransportWriter + 'static,
    {
        let mut session = Session::new(room_id);
        let identity = self.authorize(&mut session, credential).await?;
        let (reader, writer) = match upgrade().await {
            Ok(transport) => transport,
            Err(err) => {
                warn!("Upgrade for room {} failed: {}", room_id, err);
                session.advance(SessionState::Closed);
                return Err(err.into());
            }
        };
        Ok(self.handle_connection(session, identity, reader, writer).await)
    }

    /// Runs an upgraded, authorized connection to completion.
    pub async fn handle_connection<R, W>(
        &self,
        mut session: Session,
        identity: Identity,
        reader: R,
        writer: W,
    ) -> LoopExit
    where
        R: TransportReader + 'static,
        W: TransportWriter + 'static,
    {
        let room_id = session.room_id();
        let connection = Connection::new(identity.user_id, room_id, self.mailbox_capacity);
        let handle = connection.handle().clone();

        let attachment = self.registry.attach(room_id, handle.clone()).await;
        session.advance(SessionState::Attached);
        // no-op when the room already has its loop
        broadcast::ensure_fan_out(&attachment.room, &self.store);

        session.advance(SessionState::Streaming);
        let exit = connection.run(reader, writer, attachment.room).await;

        session.advance(SessionState::Detaching);
        self.registry.detach(room_id, handle.id()).await;
        session.advance(SessionState::Closed);
        info!(
            "{} ({}) left room {}: {:?}",
            identity.username, identity.user_id, room_id, exit
        );
        exit
    }

    pub async fn history(
        &self,
        room_id: RoomId,
        credential: Option<&str>,
        query: PageQuery,
    ) -> Result<Vec<Message>, HubError> {
        self.check_access(room_id, credential).await?;
        Ok(self
            .store
            .paginate(room_id, query.per_page, query.page, query.reverse)
            .await?)
    }

    /// Pushes a changed message to everyone connected to its room. These
    /// updates bypass the room queue and are not ordered against new messages.
    async fn publish(&self, message: Message) {
        if let Some(room) = self.registry.get(message.room_id).await {
            let report = room.fan_out(&Arc::new(message), None).await;
            debug!("Update pushed: {:?}", report);
        }
    }

    async fn require_sender(&self, id: MessageId, credential: Option<&str>) -> Result<Identity, HubError> {
        let identity = self.identify(credential).await?;
        if !self.store.is_owner(identity.user_id, id).await? {
            return Err(HubError::NotMessageOwner(id));
        }
        Ok(identity)
    }

    pub async fn edit_message(
        &self,
        id: MessageId,
        content: &str,
        credential: Option<&str>,
    ) -> Result<Message, HubError> {
        let identity = self.require_sender(id, credential).await?;
        let message = self.store.edit_content(id, content).await?;
        info!("Message {} edited by user {}", id, identity.user_id);
        self.publish(message.clone()).await;
        Ok(message)
    }

    /// Read receipt from a room participant other than the sender.
    pub async fn mark_read(&self, id: MessageId, credential: Option<&str>) -> Result<Message, HubError> {
        let message = self.store.get(id).await?;
        let identity = self.check_access(message.room_id, credential).await?;
        if identity.user_id == message.sender_id {
            return Err(HubError::InvalidInput("senders cannot mark their own message read"));
        }
        let message = self.store.mark_read(id).await?;
        debug!("Message {} read by user {}", id, identity.user_id);
        self.publish(message.clone()).await;
        Ok(message)
    }

    pub async fn delete_message(&self, id: MessageId, credential: Option<&str>) -> Result<(), HubError> {
        let identity = self.require_sender(id, credential).await?;
        let tombstone = self.store.soft_delete_by_id(id).await?;
        info!("Message {} deleted by user {}", id, identity.user_id);
        self.publish(tombstone).await;
        Ok(())
    }

    pub async fn delete_room_messages(
        &self,
        room_id: RoomId,
        credential: Option<&str>,
    ) -> Result<usize, HubError> {
        let identity = self.require_owner(room_id, credential).await?;
        let deleted = self.store.soft_delete_by_room(room_id).await?;
        info!(
            "{} messages in room {} deleted by user {}",
            deleted, room_id, identity.user_id
        );
        Ok(deleted)
    }

    pub async fn create_room(&self, name: &str, credential: Option<&str>) -> Result<RoomInfo, HubError> {
        let identity = self.identify(credential).await?;
        let name = name.trim();
        if name.is_empty() {
            return Err(HubError::InvalidInput("room name must not be empty"));
        }
        let room = self.rooms.create_room(identity.user_id, name).await;
        info!("Room {} ({}) created by user {}", room.id, room.name, identity.user_id);
        Ok(room)
    }

    pub async fn add_member(
        &self,
        room_id: RoomId,
        user_id: UserId,
        credential: Option<&str>,
    ) -> Result<RoomInfo, HubError> {
        self.require_owner(room_id, credential).await?;
        Ok(self.rooms.add_member(room_id, user_id).await?)
    }

    pub async fn room_info(&self, room_id: RoomId, credential: Option<&str>) -> Result<RoomInfo, HubError> {
        self.check_access(room_id, credential).await?;
        self.rooms
            .room_info(room_id)
            .await
            .ok_or(HubError::RoomNotFound(room_id))
    }

    pub async fn rename_room(
        &self,
        room_id: RoomId,
        name: &str,
        credential: Option<&str>,
    ) -> Result<RoomInfo, HubError> {
        self.require_owner(room_id, credential).await?;
        let name = name.trim();
        if name.is_empty() {
            return Err(HubError::InvalidInput("room name must not be empty"));
        }
        Ok(self.rooms.rename_room(room_id, name).await?)
    }

    /// Removes the room from the directory first so no new join can pass
    /// authorization, then clears its history and closes its live connections.
    pub async fn delete_room(&self, room_id: RoomId, credential: Option<&str>) -> Result<(), HubError> {
        let identity = self.require_owner(room_id, credential).await?;
        self.rooms.delete_room(room_id).await?;
        let deleted = self.store.soft_delete_by_room(room_id).await?;
        let was_live = self.registry.close_room(room_id).await;
        info!(
            "Room {} deleted by user {} ({} messages, live: {})",
            room_id, identity.user_id, deleted, was_live
        );
        Ok(())
    }

    /// Revokes the caller's token for the rest of its lifetime.
    pub async fn logout(&self, credential: Option<&str>) -> Result<Identity, HubError> {
        let credential = credential.ok_or(AuthError::MissingCredential)?;
        let identity = self.auth.revoke(credential).await?;
        info!("{} ({}) logged out", identity.username, identity.user_id);
        Ok(identity)
    }

    async fn require_owner(&self, room_id: RoomId, credential: Option<&str>) -> Result<Identity, HubError> {
        let identity = self.identify(credential).await?;
        if !self.rooms.room_exists(room_id).await {
            return Err(HubError::RoomNotFound(room_id));
        }
        if !self.rooms.is_owner(room_id, identity.user_id).await {
            return Err(HubError::Forbidden(room_id));
        }
        Ok(identity)
    }

    /// Closes every live connection. Their teardown empties the registry.
    pub async fn shutdown(&self) {
        info!("Closing {} live rooms", self.registry.room_count().await);
        self.registry.close_all().await;
    }
}
