//! Room registry: which live connections are watching which match.
//!
//! Fan-out is best-effort with per-connection isolation. Each connection owns
//! a bounded outbound queue; the registry only ever `try_send`s into it, so a
//! slow socket can never stall the engine. A connection whose queue is full
//! gets detached on the spot.
//!
//! Per-match broadcast order is total: every hand-off goes through the one
//! registry lock, and each connection's queue preserves that order, so all
//! surviving connections of a match observe the same event sequence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::ServerEvent;
use crate::mtch::{MatchId, UserId};

/// Id for one live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display, derive_more::From)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

/// The sending half of a connection's outbound queue, handed to the registry
/// at attach time.
#[derive(Clone)]
pub struct ConnHandle {
    pub conn_id: ConnId,
    pub tx: mpsc::Sender<Arc<ServerEvent>>,
}

struct RoomMember {
    conn_id: ConnId,
    user_id: UserId,
    tx: mpsc::Sender<Arc<ServerEvent>>,
}

#[derive(Default)]
struct RoomsInner {
    rooms: HashMap<MatchId, Vec<RoomMember>>,
    by_conn: HashMap<ConnId, MatchId>,
}

#[derive(Default)]
pub struct RoomRegistry {
    inner: Mutex<RoomsInner>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to a match room.
    ///
    /// A connection belongs to at most one room, so any previous binding is
    /// dropped first. If the same user already has a connection in this room
    /// (a reconnect), the stale one is replaced.
    pub fn attach(&self, match_id: &str, user_id: &str, conn: ConnHandle) {
        let mut inner = self.inner.lock().expect("room registry poisoned");

        remove_conn(&mut inner, conn.conn_id);

        let room = inner.rooms.entry(match_id.to_owned()).or_default();
        if let Some(stale) = room.iter().position(|m| m.user_id == user_id) {
            let stale = room.remove(stale);
            inner.by_conn.remove(&stale.conn_id);
            debug!(%match_id, user_id, "replacing stale room binding");
        }

        let room = inner.rooms.entry(match_id.to_owned()).or_default();
        room.push(RoomMember {
            conn_id: conn.conn_id,
            user_id: user_id.to_owned(),
            tx: conn.tx,
        });
        inner.by_conn.insert(conn.conn_id, match_id.to_owned());
    }

    /// Unbind a connection. No-op for a connection that owns no room.
    pub fn detach(&self, conn_id: ConnId) {
        let mut inner = self.inner.lock().expect("room registry poisoned");
        remove_conn(&mut inner, conn_id);
    }

    /// Drop a whole room (match deleted or settled and evicted).
    pub fn drop_room(&self, match_id: &str) {
        let mut inner = self.inner.lock().expect("room registry poisoned");
        if let Some(members) = inner.rooms.remove(match_id) {
            for member in members {
                inner.by_conn.remove(&member.conn_id);
            }
        }
    }

    pub fn broadcast(&self, match_id: &str, event: ServerEvent) {
        self.deliver(match_id, event, |_| true);
    }

    /// Fan out to everyone in the room except one user.
    pub fn broadcast_except(&self, match_id: &str, skip_user: &str, event: ServerEvent) {
        self.deliver(match_id, event, |member| member != skip_user);
    }

    /// Deliver to a single user's connection. Returns whether a live
    /// connection was found.
    pub fn send_to(&self, match_id: &str, user_id: &str, event: ServerEvent) -> bool {
        let mut delivered = false;
        self.deliver(match_id, event, |member| {
            let hit = member == user_id;
            delivered |= hit;
            hit
        });
        delivered
    }

    /// How many live connections are watching a match.
    #[allow(unused)]
    pub fn active_count(&self, match_id: &str) -> usize {
        let inner = self.inner.lock().expect("room registry poisoned");
        inner.rooms.get(match_id).map_or(0, Vec::len)
    }

    fn deliver(&self, match_id: &str, event: ServerEvent, mut filter: impl FnMut(&str) -> bool) {
        let event = Arc::new(event);
        let mut inner = self.inner.lock().expect("room registry poisoned");

        let Some(room) = inner.rooms.get_mut(match_id) else {
            return;
        };

        let mut dropped = Vec::new();
        for member in room.iter() {
            if !filter(&member.user_id) {
                continue;
            }

            match member.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        %match_id,
                        user_id = %member.user_id,
                        "outbound queue full, detaching slow connection"
                    );
                    dropped.push(member.conn_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(%match_id, user_id = %member.user_id, "connection gone, detaching");
                    dropped.push(member.conn_id);
                }
            }
        }

        for conn_id in dropped {
            remove_conn(&mut inner, conn_id);
        }
    }
}

fn remove_conn(inner: &mut RoomsInner, conn_id: ConnId) {
    let Some(match_id) = inner.by_conn.remove(&conn_id) else {
        return;
    };

    if let Some(room) = inner.rooms.get_mut(&match_id) {
        room.retain(|m| m.conn_id != conn_id);
        if room.is_empty() {
            inner.rooms.remove(&match_id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn handle(cap: usize) -> (ConnHandle, mpsc::Receiver<Arc<ServerEvent>>) {
        let (tx, rx) = mpsc::channel(cap);
        (
            ConnHandle {
                conn_id: ConnId::generate(),
                tx,
            },
            rx,
        )
    }

    fn tick(n: u32) -> ServerEvent {
        ServerEvent::TimerTick {
            time_remaining_sec: n,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_member_in_order() {
        let rooms = RoomRegistry::new();
        let (a, mut a_rx) = handle(8);
        let (b, mut b_rx) = handle(8);
        rooms.attach("m1", "alice", a);
        rooms.attach("m1", "bob", b);

        rooms.broadcast("m1", tick(3));
        rooms.broadcast("m1", tick(2));

        for rx in [&mut a_rx, &mut b_rx] {
            for expected in [3, 2] {
                match &*rx.recv().await.unwrap() {
                    ServerEvent::TimerTick { time_remaining_sec } => {
                        assert_eq!(*time_remaining_sec, expected)
                    }
                    other => panic!("unexpected event {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn broadcast_except_skips_the_sender() {
        let rooms = RoomRegistry::new();
        let (a, mut a_rx) = handle(8);
        let (b, mut b_rx) = handle(8);
        rooms.attach("m1", "alice", a);
        rooms.attach("m1", "bob", b);

        rooms.broadcast_except("m1", "alice", tick(9));

        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn full_queue_detaches_the_slow_connection() {
        let rooms = RoomRegistry::new();
        let (slow, _slow_rx) = handle(1);
        rooms.attach("m1", "alice", slow);

        rooms.broadcast("m1", tick(2));
        assert_eq!(rooms.active_count("m1"), 1);

        // Second event overflows the undrained queue.
        rooms.broadcast("m1", tick(1));
        assert_eq!(rooms.active_count("m1"), 0);
    }

    #[tokio::test]
    async fn reattach_replaces_the_stale_binding() {
        let rooms = RoomRegistry::new();
        let (old, mut old_rx) = handle(8);
        let (new, mut new_rx) = handle(8);
        rooms.attach("m1", "alice", old);
        rooms.attach("m1", "alice", new);

        assert_eq!(rooms.active_count("m1"), 1);
        rooms.broadcast("m1", tick(5));
        assert!(old_rx.try_recv().is_err());
        assert!(new_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn detach_unknown_connection_is_a_no_op() {
        let rooms = RoomRegistry::new();
        rooms.detach(ConnId::generate());
        assert_eq!(rooms.active_count("m1"), 0);
    }
}
