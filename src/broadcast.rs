use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::messages::DraftMessage;
use crate::room::Room;
use crate::shutdown;
use crate::store::MessageStore;

/// Starts the room's fan-out loop unless one is already running for it.
///
/// The loop runs in its own task, supervised by a second one: a panic in the
/// loop abandons that room alone, closing its connections so clients rejoin
/// into a fresh room.
pub fn ensure_fan_out(room: &Arc<Room>, store: &Arc<dyn MessageStore>) -> Option<JoinHandle<()>> {
    if !room.try_start_fan_out() {
        return None;
    }

    let room = Arc::clone(room);
    let store = Arc::clone(store);
    Some(tokio::spawn(async move {
        let worker = tokio::spawn(run_fan_out(Arc::clone(&room), store));
        if let Err(err) = worker.await {
            error!("Fan-out loop for room {} died: {}", room.id(), err);
            room.abandon().await;
        }
        room.fan_out_stopped();
    }))
}

async fn run_fan_out(room: Arc<Room>, store: Arc<dyn MessageStore>) {
    let Some(mut inbound) = room.take_inbound().await else {
        error!(
            "Invariant violated: second fan-out loop started for room {}",
            room.id()
        );
        debug_assert!(false, "fan-out started twice for room {}", room.id());
        return;
    };
    let mut closed = room.closed_signal();
    info!("Fan-out started for room {}", room.id());

    loop {
        let draft = tokio::select! {
            biased;
            () = shutdown::requested(&mut closed) => break,
            draft = inbound.recv() => match draft {
                Some(draft) => draft,
                None => break,
            },
        };
        if room.is_closed() {
            break;
        }
        relay(&room, store.as_ref(), draft).await;
    }

    info!("Fan-out stopped for room {}", room.id());
}

/// Persists one draft and hands the stored message to the room's connections.
/// A storage failure drops the message; the sender is not told.
async fn relay(room: &Room, store: &dyn MessageStore, draft: DraftMessage) {
    let message = match store.insert(&draft).await {
        Ok(message) => Arc::new(message),
        Err(err) => {
            warn!(
                "Dropping message from user {} in room {}: {}",
                draft.sender_id,
                room.id(),
                err
            );
            return;
        }
    };

    let report = room.fan_out(&message, draft.origin).await;
    debug!(
        "Message {} in room {}: {} delivered, {} dropped, {} closed",
        message.id,
        room.id(),
        report.delivered,
        report.dropped,
        report.closed
    );
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use tokio::time::timeout;

    use super::*;
    use crate::connection::Connection;
    use crate::error::StorageError;
    use crate::messages::{Message, MessageId, RoomId, UserId};
    use crate::store::InMemoryMessageStore;

    const WAIT: Duration = Duration::from_secs(2);

    /// Records inserts and fails the ones scripted to fail.
    #[derive(Default)]
    struct ScriptedStore {
        inner: InMemoryMessageStore,
        failures: Mutex<VecDeque<bool>>,
        inserted: Mutex<Vec<DraftMessage>>,
        panic_on: Option<&'static str>,
    }

    impl ScriptedStore {
        fn failing_first(count: usize) -> Self {
            ScriptedStore {
                failures: Mutex::new(std::iter::repeat(true).take(count).collect()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl MessageStore for ScriptedStore {
        async fn insert(&self, draft: &DraftMessage) -> Result<Message, StorageError> {
            if self.panic_on == Some(draft.content.as_str()) {
                panic!("storage exploded");
            }
            self.inserted.lock().await.push(draft.clone());
            if self.failures.lock().await.pop_front().unwrap_or(false) {
                return Err(StorageError::Backend("connection refused".to_string()));
            }
            self.inner.insert(draft).await
        }

        async fn get(&self, id: MessageId) -> Result<Message, StorageError> {
            self.inner.get(id).await
        }

        async fn mark_read(&self, id: MessageId) -> Result<Message, StorageError> {
            self.inner.mark_read(id).await
        }

        async fn edit_content(&self, id: MessageId, content: &str) -> Result<Message, StorageError> {
            self.inner.edit_content(id, content).await
        }

        async fn soft_delete_by_id(&self, id: MessageId) -> Result<Message, StorageError> {
            self.inner.soft_delete_by_id(id).await
        }

        async fn soft_delete_by_room(&self, room_id: RoomId) -> Result<usize, StorageError> {
            self.inner.soft_delete_by_room(room_id).await
        }

        async fn paginate(
            &self,
            room_id: RoomId,
            per_page: u32,
            page: u32,
            reverse: bool,
        ) -> Result<Vec<Message>, StorageError> {
            self.inner.paginate(room_id, per_page, page, reverse).await
        }
    }

    struct Member {
        connection: Connection,
    }

    impl Member {
        async fn join(room: &Room, user: u64) -> Self {
            let connection = Connection::new(UserId(user), room.id(), 8);
            room.add(connection.handle().clone()).await;
            Member { connection }
        }

        fn draft(&self, content: &str) -> DraftMessage {
            let handle = self.connection.handle();
            DraftMessage::new(handle.user_id(), handle.room_id(), content).with_origin(handle.id())
        }
    }

    async fn recv(member: &mut Member) -> Arc<Message> {
        let mailbox = crate::connection::testing::mailbox(&mut member.connection);
        timeout(WAIT, mailbox.recv()).await.unwrap().unwrap()
    }

    fn nothing_pending(member: &mut Member) -> bool {
        crate::connection::testing::mailbox(&mut member.connection)
            .try_recv()
            .is_err()
    }

    #[tokio::test]
    async fn persists_then_delivers_to_everyone_but_the_sender() {
        let room = Arc::new(Room::new(RoomId(7), 8));
        let store = Arc::new(ScriptedStore::default());
        let mut a = Member::join(&room, 1).await;
        let mut b = Member::join(&room, 2).await;
        let dyn_store: Arc<dyn MessageStore> = store.clone();
        ensure_fan_out(&room, &dyn_store).unwrap();

        room.enqueue(a.draft("hi")).await.unwrap();

        let delivered = recv(&mut b).await;
        assert_eq!(delivered.content, "hi");
        assert_eq!(delivered.sender_id, UserId(1));
        assert_eq!(delivered.room_id, RoomId(7));
        assert_eq!(delivered.id, MessageId(1));

        let inserted = store.inserted.lock().await.clone();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].sender_id, UserId(1));
        assert_eq!(inserted[0].room_id, RoomId(7));
        assert_eq!(inserted[0].content, "hi");

        assert!(nothing_pending(&mut a));
    }

    #[tokio::test]
    async fn fifo_per_room() {
        let room = Arc::new(Room::new(RoomId(7), 64));
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
        let a = Member::join(&room, 1).await;
        let mut b = Member::join(&room, 2).await;

        for i in 0..5 {
            room.enqueue(a.draft(&format!("m{i}"))).await.unwrap();
        }
        ensure_fan_out(&room, &store).unwrap();

        for i in 0..5 {
            assert_eq!(recv(&mut b).await.content, format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn storage_failure_drops_message_and_loop_survives() {
        let room = Arc::new(Room::new(RoomId(7), 8));
        let store: Arc<dyn MessageStore> = Arc::new(ScriptedStore::failing_first(1));
        let a = Member::join(&room, 1).await;
        let mut b = Member::join(&room, 2).await;
        ensure_fan_out(&room, &store).unwrap();

        room.enqueue(a.draft("lost")).await.unwrap();
        room.enqueue(a.draft("kept")).await.unwrap();

        let delivered = recv(&mut b).await;
        assert_eq!(delivered.content, "kept");
        assert!(room.is_fan_out_active());
        assert!(nothing_pending(&mut b));
    }

    #[tokio::test]
    async fn second_start_is_refused() {
        let room = Arc::new(Room::new(RoomId(7), 8));
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());

        assert!(ensure_fan_out(&room, &store).is_some());
        assert!(ensure_fan_out(&room, &store).is_none());
    }

    #[tokio::test]
    async fn closing_the_room_stops_the_loop_without_further_writes() {
        let room = Arc::new(Room::new(RoomId(7), 8));
        let store = Arc::new(ScriptedStore::default());
        let a = Member::join(&room, 1).await;
        let dyn_store: Arc<dyn MessageStore> = store.clone();
        let task = ensure_fan_out(&room, &dyn_store).unwrap();

        room.close();
        timeout(WAIT, task).await.unwrap().unwrap();
        assert!(!room.is_fan_out_active());

        // the queue may still accept a late draft, but nobody persists it
        let _ = room.enqueue(a.draft("late")).await;
        assert!(store.inserted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn slow_member_does_not_stall_the_room() {
        let room = Arc::new(Room::new(RoomId(7), 64));
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
        let a = Member::join(&room, 1).await;
        let mut fast = Member::join(&room, 2).await;
        let slow = Connection::new(UserId(3), RoomId(7), 1);
        room.add(slow.handle().clone()).await;
        ensure_fan_out(&room, &store).unwrap();

        for i in 0..6 {
            room.enqueue(a.draft(&format!("m{i}"))).await.unwrap();
        }
        for i in 0..6 {
            assert_eq!(recv(&mut fast).await.content, format!("m{i}"));
        }
        timeout(WAIT, async {
            while slow.handle().dropped() < 5 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(slow.handle().dropped(), 5);
    }

    #[tokio::test]
    async fn panic_in_one_room_is_isolated() {
        let store: Arc<dyn MessageStore> = Arc::new(ScriptedStore {
            panic_on: Some("boom"),
            ..ScriptedStore::default()
        });
        let doomed = Arc::new(Room::new(RoomId(1), 8));
        let healthy = Arc::new(Room::new(RoomId(2), 8));
        let victim = Member::join(&doomed, 1).await;
        let sender = Member::join(&healthy, 2).await;
        let mut receiver = Member::join(&healthy, 3).await;

        let doomed_task = ensure_fan_out(&doomed, &store).unwrap();
        ensure_fan_out(&healthy, &store).unwrap();

        doomed.enqueue(victim.draft("boom")).await.unwrap();
        timeout(WAIT, doomed_task).await.unwrap().unwrap();
        assert!(doomed.is_closed());
        assert!(victim.connection.handle().is_closed());

        healthy.enqueue(sender.draft("still here")).await.unwrap();
        assert_eq!(recv(&mut receiver).await.content, "still here");
    }
}
