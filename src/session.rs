use log::{debug, error};

use crate::messages::{RoomId, UserId};

/// Lifecycle of one client's join, from the HTTP request to socket close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Requesting,
    Authorizing,
    Upgrading,
    Attached,
    Streaming,
    Detaching,
    Closed,
}

impl SessionState {
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::{Attached, Authorizing, Closed, Detaching, Requesting, Streaming, Upgrading};
        matches!(
            (self, next),
            (Requesting, Authorizing)
                | (Authorizing, Upgrading | Closed)
                | (Upgrading, Attached | Closed)
                | (Attached, Streaming | Detaching)
                | (Streaming, Detaching)
                | (Detaching, Closed)
        )
    }
}

#[derive(Debug)]
pub struct Session {
    room_id: RoomId,
    user_id: Option<UserId>,
    state: SessionState,
}

impl Session {
    pub fn new(room_id: RoomId) -> Self {
        Session {
            room_id,
            user_id: None,
            state: SessionState::Requesting,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn identify(&mut self, user_id: UserId) {
        self.user_id = Some(user_id);
    }

    /// Moves to `next`. An illegal transition is a bug: it is logged and the
    /// state is left unchanged.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if !self.state.can_advance_to(next) {
            error!(
                "Invalid session transition {:?} -> {:?} in room {}",
                self.state, next, self.room_id
            );
            debug_assert!(false, "invalid session transition {:?} -> {next:?}", self.state);
            return false;
        }
        debug!(
            "Session in room {} (user {:?}): {:?} -> {:?}",
            self.room_id, self.user_id, self.state, next
        );
        self.state = next;
        true
    }
}
