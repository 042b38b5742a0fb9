use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;

use crate::error::TransportError;
use crate::messages::{ConnectionId, DraftMessage, Message, RoomId, UserId};
use crate::room::Room;
use crate::shutdown;

/// Upper bound on a close handshake with a peer that stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
    /// Ping, pong and anything else the transport answers on its own.
    Control,
}

/// Read half of a client transport.
#[async_trait]
pub trait TransportReader: Send {
    /// `None` once the peer has gone away.
    async fn read_frame(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// Write half of a client transport.
#[async_trait]
pub trait TransportWriter: Send {
    async fn write_text(&mut self, text: String) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Mailbox full; the message is lost for this connection only.
    Dropped,
    Closed,
}

/// Why a connection's actor pair stopped.
#[derive(Debug)]
pub enum LoopExit {
    PeerClosed,
    Shutdown,
    RoomClosed,
    Transport(TransportError),
    Panicked,
}

/// The room-facing side of a connection: its mailbox and close switch.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    room_id: RoomId,
    mailbox: mpsc::Sender<Arc<Message>>,
    shutdown: Arc<watch::Sender<bool>>,
    dropped: Arc<AtomicU64>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Never waits: a full mailbox drops the message for this connection.
    pub fn deliver(&self, message: &Arc<Message>) -> Delivery {
        match self.mailbox.try_send(Arc::clone(message)) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Mailbox full for connection {} (user {}, room {}), dropped message {} ({} dropped so far)",
                    self.id, self.user_id, self.room_id, message.id, dropped
                );
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Asks both loops to stop. Safe to call any number of times.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// One client socket: an inbound loop feeding the room and an outbound loop
/// draining the mailbox.
pub struct Connection {
    handle: ConnectionHandle,
    mailbox: mpsc::Receiver<Arc<Message>>,
    shutdown: watch::Receiver<bool>,
}

impl Connection {
    pub fn new(user_id: UserId, room_id: RoomId, mailbox_capacity: usize) -> Self {
        let (mailbox_tx, mailbox) = mpsc::channel(mailbox_capacity);
        let (shutdown_tx, shutdown) = shutdown::channel();
        Connection {
            handle: ConnectionHandle {
                id: ConnectionId::new(),
                user_id,
                room_id,
                mailbox: mailbox_tx,
                shutdown: Arc::new(shutdown_tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            mailbox,
            shutdown,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Runs both loops until either one stops, then stops the other and
    /// closes the transport. Detaching from the registry is the caller's job.
    pub async fn run<R, W>(self, reader: R, writer: W, room: Arc<Room>) -> LoopExit
    where
        R: TransportReader + 'static,
        W: TransportWriter + 'static,
    {
        let Connection {
            handle,
            mailbox,
            shutdown,
        } = self;

        let mut inbound = tokio::spawn(inbound_loop(
            reader,
            room,
            handle.clone(),
            shutdown.clone(),
        ));
        let mut outbound = tokio::spawn(outbound_loop(writer, mailbox, shutdown));

        let first = tokio::select! {
            exit = &mut inbound => {
                handle.close();
                let _ = outbound.await;
                exit
            }
            exit = &mut outbound => {
                handle.close();
                let _ = inbound.await;
                exit
            }
        };

        match first {
            Ok(exit) => exit,
            Err(err) => {
                error!("Connection {} loop failed: {}", handle.id(), err);
                LoopExit::Panicked
            }
        }
    }
}

async fn inbound_loop<R: TransportReader>(
    mut reader: R,
    room: Arc<Room>,
    handle: ConnectionHandle,
    mut shutdown: watch::Receiver<bool>,
) -> LoopExit {
    loop {
        let frame = tokio::select! {
            () = shutdown::requested(&mut shutdown) => return LoopExit::Shutdown,
            frame = reader.read_frame() => frame,
        };

        let text = match frame {
            None | Some(Ok(Frame::Close)) => return LoopExit::PeerClosed,
            Some(Err(err)) => {
                debug!("Read failed on connection {}: {}", handle.id(), err);
                return LoopExit::Transport(err);
            }
            Some(Ok(Frame::Text(text))) => text,
            Some(Ok(Frame::Binary(bytes))) => {
                debug!(
                    "Ignoring {} byte binary frame on connection {}",
                    bytes.len(),
                    handle.id()
                );
                continue;
            }
            Some(Ok(Frame::Control)) => continue,
        };

        if text.trim().is_empty() {
            debug!("Ignoring empty frame on connection {}", handle.id());
            continue;
        }

        let draft =
            DraftMessage::new(handle.user_id(), handle.room_id(), text).with_origin(handle.id());
        tokio::select! {
            () = shutdown::requested(&mut shutdown) => return LoopExit::Shutdown,
            queued = room.enqueue(draft) => {
                if queued.is_err() {
                    return LoopExit::RoomClosed;
                }
            }
        }
    }
}

async fn outbound_loop<W: TransportWriter>(
    mut writer: W,
    mut mailbox: mpsc::Receiver<Arc<Message>>,
    mut shutdown: watch::Receiver<bool>,
) -> LoopExit {
    let exit = loop {
        let message = tokio::select! {
            () = shutdown::requested(&mut shutdown) => break LoopExit::Shutdown,
            message = mailbox.recv() => message,
        };
        let Some(message) = message else {
            break LoopExit::Shutdown;
        };

        let text = match serde_json::to_string(&*message) {
            Ok(text) => text,
            Err(err) => {
                error!("Failed to encode message {}: {}", message.id, err);
                continue;
            }
        };

        let written = tokio::select! {
            () = shutdown::requested(&mut shutdown) => break LoopExit::Shutdown,
            written = writer.write_text(text) => written,
        };
        if let Err(err) = written {
            debug!("Write failed: {}", err);
            break LoopExit::Transport(err);
        }
    };

    match tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!("Close failed: {}", err),
        Err(_) => debug!("Close timed out"),
    }
    exit
}


#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use super::testing::{transport, transport_with};
    use super::*;
    use crate::messages::{MessageId, MessageStatus};

    const WAIT: Duration = Duration::from_secs(2);

    fn persisted(id: u64, content: &str) -> Arc<Message> {
        let now = chrono::Utc::now();
        Arc::new(Message {
            id: MessageId(id),
            sender_id: UserId(2),
            room_id: RoomId(7),
            content: content.to_string(),
            status: MessageStatus::Sent,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            is_active: true,
        })
    }

    #[tokio::test]
    async fn text_frames_become_drafts_on_the_room_queue() {
        let room = Arc::new(Room::new(RoomId(7), 8));
        let mut inbound = room.take_inbound().await.unwrap();
        let connection = Connection::new(UserId(1), RoomId(7), 8);
        let id = connection.handle().id();
        let (reader, writer, peer) = transport();

        let task = tokio::spawn(connection.run(reader, writer, Arc::clone(&room)));
        peer.frames.send(Ok(Frame::Text("hi".to_string()))).unwrap();
        peer.frames.send(Ok(Frame::Text("  ".to_string()))).unwrap();
        peer.frames.send(Ok(Frame::Binary(vec![1, 2]))).unwrap();
        peer.frames.send(Ok(Frame::Text("again".to_string()))).unwrap();

        let first = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
        assert_eq!(first.sender_id, UserId(1));
        assert_eq!(first.room_id, RoomId(7));
        assert_eq!(first.content, "hi");
        assert_eq!(first.origin, Some(id));
        let second = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
        assert_eq!(second.content, "again");

        drop(peer.frames);
        let exit = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(exit, LoopExit::PeerClosed));
        assert_eq!(peer.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mailbox_is_written_as_json_in_order() {
        let room = Arc::new(Room::new(RoomId(7), 8));
        let connection = Connection::new(UserId(1), RoomId(7), 8);
        let handle = connection.handle().clone();
        let (reader, writer, mut peer) = transport();

        let task = tokio::spawn(connection.run(reader, writer, room));
        assert_eq!(handle.deliver(&persisted(1, "one")), Delivery::Queued);
        assert_eq!(handle.deliver(&persisted(2, "two")), Delivery::Queued);

        for (id, content) in [(1, "one"), (2, "two")] {
            let text = timeout(WAIT, peer.written.recv()).await.unwrap().unwrap();
            let json: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(json["id"], id);
            assert_eq!(json["content"], content);
        }

        handle.close();
        let exit = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(exit, LoopExit::Shutdown));
    }

    #[tokio::test]
    async fn write_failure_stops_the_reader_too() {
        let room = Arc::new(Room::new(RoomId(7), 8));
        let connection = Connection::new(UserId(1), RoomId(7), 8);
        let handle = connection.handle().clone();
        let (reader, writer, peer) = transport_with(true);

        let task = tokio::spawn(connection.run(reader, writer, room));
        handle.deliver(&persisted(1, "boom"));

        let exit = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(exit, LoopExit::Transport(TransportError::Write(_))));
        assert!(handle.is_closed());
        assert_eq!(peer.closed.load(Ordering::SeqCst), 1);
        drop(peer);
    }

    #[tokio::test]
    async fn read_error_tears_down() {
        let room = Arc::new(Room::new(RoomId(7), 8));
        let connection = Connection::new(UserId(1), RoomId(7), 8);
        let (reader, writer, peer) = transport();

        let task = tokio::spawn(connection.run(reader, writer, room));
        peer.frames
            .send(Err(TransportError::Read("reset".to_string())))
            .unwrap();

        let exit = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(exit, LoopExit::Transport(TransportError::Read(_))));
        assert_eq!(peer.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_unblocks_a_sender_stuck_on_a_full_room_queue() {
        let room = Arc::new(Room::new(RoomId(7), 1));
        let _inbound = room.take_inbound().await.unwrap();
        let connection = Connection::new(UserId(1), RoomId(7), 8);
        let handle = connection.handle().clone();
        let (reader, writer, peer) = transport();

        let task = tokio::spawn(connection.run(reader, writer, room.clone()));
        for content in ["a", "b", "c"] {
            peer.frames.send(Ok(Frame::Text(content.to_string()))).unwrap();
        }
        timeout(WAIT, async {
            while room.spare_capacity() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!task.is_finished());

        handle.close();
        let exit = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(exit, LoopExit::Shutdown));
    }

    #[tokio::test]
    async fn room_gone_ends_the_connection() {
        let room = Arc::new(Room::new(RoomId(7), 1));
        drop(room.take_inbound().await);
        let connection = Connection::new(UserId(1), RoomId(7), 8);
        let (reader, writer, peer) = transport();

        let task = tokio::spawn(connection.run(reader, writer, room));
        peer.frames.send(Ok(Frame::Text("hi".to_string()))).unwrap();

        let exit = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(exit, LoopExit::RoomClosed));
    }

    #[tokio::test]
    async fn full_mailbox_drops_instead_of_waiting() {
        let connection = Connection::new(UserId(1), RoomId(7), 1);
        let handle = connection.handle().clone();

        assert_eq!(handle.deliver(&persisted(1, "a")), Delivery::Queued);
        assert_eq!(handle.deliver(&persisted(2, "b")), Delivery::Dropped);
        assert_eq!(handle.dropped(), 1);

        drop(connection);
        assert_eq!(handle.deliver(&persisted(3, "c")), Delivery::Closed);
    }
}
