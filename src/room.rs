use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use crate::connection::{ConnectionHandle, Delivery};
use crate::messages::{ConnectionId, DraftMessage, Message, RoomId};
use crate::shutdown;

/// Outcome of pushing one persisted message to every attached connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

/// Shared state of one live room. The room owns no tasks; the registry and
/// the fan-out loop drive it.
pub struct Room {
    id: RoomId,
    inbound: mpsc::Sender<DraftMessage>,
    pending: Mutex<Option<mpsc::Receiver<DraftMessage>>>,
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    fan_out_active: AtomicBool,
    closed: watch::Sender<bool>,
}

impl Room {
    pub fn new(id: RoomId, queue_capacity: usize) -> Self {
        let (inbound, pending) = mpsc::channel(queue_capacity);
        let (closed, _) = shutdown::channel();
        Room {
            id,
            inbound,
            pending: Mutex::new(Some(pending)),
            connections: RwLock::new(HashMap::new()),
            fan_out_active: AtomicBool::new(false),
            closed,
        }
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    /// Queues a draft for the fan-out loop, waiting while the queue is full.
    /// Fails once the room's fan-out loop is gone.
    pub async fn enqueue(&self, draft: DraftMessage) -> Result<(), DraftMessage> {
        self.inbound.send(draft).await.map_err(|err| err.0)
    }

    pub(crate) async fn add(&self, connection: ConnectionHandle) -> usize {
        let mut connections = self.connections.write().await;
        connections.insert(connection.id(), connection);
        connections.len()
    }

    /// Returns the remaining count, or `None` if the connection was not attached.
    pub(crate) async fn remove(&self, connection_id: ConnectionId) -> Option<usize> {
        let mut connections = self.connections.write().await;
        connections.remove(&connection_id)?;
        Some(connections.len())
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn contains(&self, connection_id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&connection_id)
    }

    /// Pushes `message` to every attached connection except `origin` without
    /// waiting on any mailbox.
    pub async fn fan_out(&self, message: &Arc<Message>, origin: Option<ConnectionId>) -> FanOutReport {
        let connections = self.connections.read().await;
        let mut report = FanOutReport::default();
        for connection in connections.values() {
            if Some(connection.id()) == origin {
                continue;
            }
            match connection.deliver(message) {
                Delivery::Queued => report.delivered += 1,
                Delivery::Dropped => report.dropped += 1,
                Delivery::Closed => report.closed += 1,
            }
        }
        report
    }

    /// Claims the right to run this room's fan-out loop. True for exactly one caller.
    pub fn try_start_fan_out(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.fan_out_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_fan_out_active(&self) -> bool {
        self.fan_out_active.load(Ordering::Acquire)
    }

    pub(crate) fn fan_out_stopped(&self) {
        self.fan_out_active.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn spare_capacity(&self) -> usize {
        self.inbound.capacity()
    }

    pub(crate) async fn take_inbound(&self) -> Option<mpsc::Receiver<DraftMessage>> {
        self.pending.lock().await.take()
    }

    /// Marks the room dead. Its fan-out loop exits and it is never reused.
    pub(crate) fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("Room {} closed", self.id);
        }
        self.fan_out_stopped();
    }

    /// Closes the room and every connection still attached to it.
    pub(crate) async fn abandon(&self) {
        self.close();
        for connection in self.connections.read().await.values() {
            connection.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}
