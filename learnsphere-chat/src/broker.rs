//! Room membership and fan-out for course chat.
//!
//! The broker owns two maps that must always agree with each other: the
//! member-set of every room, and the joined-set of every connection. Both live
//! in one registry behind a single mutex, so every mutation updates them
//! together. Publishing copies the recipients' outbound senders while holding
//! the lock and fans out after releasing it.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::message::{ChatPayload, RoomId, ServerEvent};

pub type ConnectionId = u64;

/// Frames buffered per connection before the slow-consumer policy kicks in.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Whether a publisher receives its own message back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenderPolicy {
    /// Every current member gets a copy, the publisher included. Browser
    /// clients rely on the echo to render their own messages.
    #[default]
    Include,
    /// The publisher is skipped during fan-out.
    Exclude,
}

/// What happens when a member's outbound queue is full during fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlowConsumerPolicy {
    /// Lose this copy for the slow member only.
    #[default]
    Drop,
    /// Evict the slow member as if it had disconnected.
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub sender_policy: SenderPolicy,
    pub slow_consumer: SlowConsumerPolicy,
    pub outbound_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            sender_policy: SenderPolicy::default(),
            slow_consumer: SlowConsumerPolicy::default(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// A freshly registered connection and the queue the broker delivers into.
///
/// `closed` is cancelled once the broker forgets the connection, whether it
/// disconnected, was evicted as a slow consumer, or the server shut down.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub outbound: mpsc::Receiver<ServerEvent>,
    pub closed: CancellationToken,
}

/// Outcome of a single publish. Never reported back to the publishing client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
    pub evicted: usize,
}

pub struct Broker {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    config: BrokerConfig,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, ConnectionRecord>,
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
}

struct ConnectionRecord {
    outbound: mpsc::Sender<ServerEvent>,
    rooms: HashSet<RoomId>,
    closed: CancellationToken,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Registers a new connection with no room memberships.
    pub fn connect(&self) -> Connection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let closed = CancellationToken::new();

        self.registry().connections.insert(
            id,
            ConnectionRecord {
                outbound: outbound_tx,
                rooms: HashSet::new(),
                closed: closed.clone(),
            },
        );
        debug!(connection = id, "connection registered");

        Connection {
            id,
            outbound: outbound_rx,
            closed,
        }
    }

    /// Adds `connection` to `room`, creating the room on its first member.
    ///
    /// Returns `false` when nothing changed: the connection was already a
    /// member, or it is no longer registered.
    pub fn join(&self, connection: ConnectionId, room: &str) -> bool {
        let joined = self.registry().join(connection, room);
        if joined {
            info!(connection, %room, "joined room");
        }
        joined
    }

    /// Removes a single membership, dropping the room once it is empty.
    pub fn leave(&self, connection: ConnectionId, room: &str) -> bool {
        let left = self.registry().leave(connection, room);
        if left {
            info!(connection, %room, "left room");
        }
        left
    }

    /// Fans `payload` out to every current member of its room.
    ///
    /// The publisher does not need to be a member. Delivery failures are
    /// isolated per recipient and only show up in the returned report.
    pub fn publish(&self, from: ConnectionId, payload: ChatPayload) -> PublishReport {
        let recipients = self.recipients(from, payload.room_id());
        let mut report = PublishReport::default();
        if recipients.is_empty() {
            debug!(
                connection = from,
                room = payload.room_id(),
                "publish to room without recipients"
            );
            return report;
        }

        debug!(
            connection = from,
            room = payload.room_id(),
            sender = %payload.chat.sender.name,
            recipients = recipients.len(),
            "fanning out message"
        );

        let event = ServerEvent::ReceiveMessage(payload);
        let mut evicted = Vec::new();
        for (id, outbound) in recipients {
            match outbound.try_send(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => match self.config.slow_consumer {
                    SlowConsumerPolicy::Drop => {
                        warn!(connection = id, "outbound queue full; dropping message");
                        report.dropped += 1;
                    }
                    SlowConsumerPolicy::Disconnect => {
                        warn!(connection = id, "outbound queue full; evicting connection");
                        evicted.push(id);
                    }
                },
                Err(TrySendError::Closed(_)) => {
                    debug!(connection = id, "outbound queue closed; evicting connection");
                    evicted.push(id);
                }
            }
        }

        report.evicted = evicted.len();
        for id in evicted {
            self.disconnect(id);
        }
        report
    }

    /// Forgets `connection` and all of its memberships. Safe to repeat.
    pub fn disconnect(&self, connection: ConnectionId) -> bool {
        let removed = self.registry().remove_connection(connection);
        if let Some(rooms) = &removed {
            info!(connection, rooms = rooms.len(), "connection removed");
        }
        removed.is_some()
    }

    /// Drops every connection and room, closing all outbound queues.
    ///
    /// Returns how many connections were registered.
    pub fn close_all(&self) -> usize {
        let mut registry = self.registry();
        let closed = registry.connections.len();
        for (_, record) in registry.connections.drain() {
            record.closed.cancel();
        }
        registry.rooms.clear();
        closed
    }

    /// Connection ids currently in `room`, in ascending order.
    pub fn members(&self, room: &str) -> Vec<ConnectionId> {
        let registry = self.registry();
        let mut members: Vec<_> = registry
            .rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    /// Rooms `connection` has joined, sorted by name.
    pub fn rooms_of(&self, connection: ConnectionId) -> Vec<RoomId> {
        let registry = self.registry();
        let mut rooms: Vec<_> = registry
            .connections
            .get(&connection)
            .map(|record| record.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub fn room_count(&self) -> usize {
        self.registry().rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.registry().connections.len()
    }

    fn recipients(
        &self,
        from: ConnectionId,
        room: &str,
    ) -> Vec<(ConnectionId, mpsc::Sender<ServerEvent>)> {
        let registry = self.registry();
        let Some(members) = registry.rooms.get(room) else {
            return Vec::new();
        };

        members
            .iter()
            .filter(|&&id| self.config.sender_policy == SenderPolicy::Include || id != from)
            .filter_map(|&id| {
                registry
                    .connections
                    .get(&id)
                    .map(|record| (id, record.outbound.clone()))
            })
            .collect()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Registry updates never leave the maps half-written, so a poisoned
        // lock still guards consistent state.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl Registry {
    fn join(&mut self, connection: ConnectionId, room: &str) -> bool {
        let Some(record) = self.connections.get_mut(&connection) else {
            return false;
        };
        if !record.rooms.insert(room.to_string()) {
            return false;
        }
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection);
        true
    }

    fn leave(&mut self, connection: ConnectionId, room: &str) -> bool {
        let Some(record) = self.connections.get_mut(&connection) else {
            return false;
        };
        if !record.rooms.remove(room) {
            return false;
        }
        self.remove_member(room, connection);
        true
    }

    fn remove_connection(&mut self, connection: ConnectionId) -> Option<HashSet<RoomId>> {
        let record = self.connections.remove(&connection)?;
        record.closed.cancel();
        for room in &record.rooms {
            self.remove_member(room, connection);
        }
        Some(record.rooms)
    }

    fn remove_member(&mut self, room: &str, connection: ConnectionId) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(&connection);
            if members.is_empty() {
                self.rooms.remove(room);
                debug!(%room, "room emptied");
            }
        }
    }
}
