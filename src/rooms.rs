//! "Watch together" rooms.
//!
//! Each room is a broadcast channel of playback positions. Members see every
//! update published by the others, never their own. Nothing is persisted and
//! nothing else in the backend depends on this module.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

const ROOM_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackUpdate {
    #[serde(default)]
    pub item_id: Option<String>,
    pub position: f64,
    #[serde(default)]
    pub playing: bool,
}

#[derive(Debug, Clone)]
struct Envelope {
    member: u64,
    update: PlaybackUpdate,
}

#[derive(Clone, Default)]
pub struct RoomHub {
    inner: Arc<RoomHubInner>,
}

#[derive(Default)]
struct RoomHubInner {
    rooms: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
    next_member: AtomicU64,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, room: &str) -> RoomMember {
        let id = self.inner.next_member.fetch_add(1, Ordering::Relaxed);
        let mut rooms = self.inner.rooms.lock();
        let sender = rooms
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .clone();
        let receiver = sender.subscribe();
        debug!(room, member = id, "joined room");
        RoomMember {
            id,
            room: room.to_string(),
            hub: self.clone(),
            sender,
            receiver,
        }
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.lock().len()
    }
}

/// Membership of one connection. Dropping it leaves the room; the last member
/// out removes the room.
pub struct RoomMember {
    id: u64,
    room: String,
    hub: RoomHub,
    sender: broadcast::Sender<Envelope>,
    receiver: broadcast::Receiver<Envelope>,
}

/// Write half of a membership, usable from a separate task.
#[derive(Clone)]
pub struct RoomPublisher {
    id: u64,
    sender: broadcast::Sender<Envelope>,
}

impl RoomPublisher {
    pub fn publish(&self, update: PlaybackUpdate) {
        // Err only means nobody is listening right now.
        let _ = self.sender.send(Envelope {
            member: self.id,
            update,
        });
    }
}

impl RoomMember {
    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn publisher(&self) -> RoomPublisher {
        RoomPublisher {
            id: self.id,
            sender: self.sender.clone(),
        }
    }

    /// Next update from another member. Lagging members skip what they
    /// missed; only the latest position matters.
    pub async fn next_update(&mut self) -> Option<PlaybackUpdate> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if envelope.member == self.id => continue,
                Ok(envelope) => return Some(envelope.update),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(room = %self.room, skipped, "member lagged behind");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for RoomMember {
    fn drop(&mut self) {
        let mut rooms = self.hub.inner.rooms.lock();
        // Our own receiver is still alive at this point.
        if rooms
            .get(&self.room)
            .is_some_and(|sender| sender.receiver_count() <= 1)
        {
            rooms.remove(&self.room);
        }
        debug!(room = %self.room, member = self.id, "left room");
    }
}
