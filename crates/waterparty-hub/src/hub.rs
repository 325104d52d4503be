//! Client registry, room registry, and fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use waterparty_core::{ConnectionId, RoomId, UserId};
use waterparty_telemetry::MetricsRecorder;

use crate::client::{ClientHandle, EnqueueError};

type Members = HashMap<ConnectionId, ClientHandle>;

#[derive(Default)]
struct Registry {
    clients: HashMap<UserId, ClientHandle>,
    rooms: HashMap<RoomId, Members>,
}

impl Registry {
    fn is_current(&self, client: &ClientHandle) -> bool {
        self.clients.get(client.user_id()) == Some(client)
    }

    /// Strip a connection from every room, pruning rooms left empty.
    fn remove_from_rooms(&mut self, connection_id: &ConnectionId) {
        self.rooms.retain(|_, members| {
            let _ = members.remove(connection_id);
            !members.is_empty()
        });
    }
}

/// Outcome of one fan-out pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Mailboxes the frame was queued into.
    pub delivered: usize,
    /// Recipients removed because their mailbox was full.
    pub evicted: usize,
}

/// Process-wide coordinator for connected clients and the rooms they joined.
///
/// Every client reachable from a room is also the registered client for
/// its user id. Broadcasts never wait on a recipient: a full mailbox gets
/// the recipient evicted once the fan-out pass has released the lock.
pub struct Hub {
    registry: RwLock<Registry>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            metrics: None,
        }
    }

    pub fn with_metrics(metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            metrics: Some(metrics),
        }
    }

    pub fn metrics(&self) -> Option<&Arc<MetricsRecorder>> {
        self.metrics.as_ref()
    }

    /// Register a client, replacing any earlier client with the same user id.
    ///
    /// The replaced client is removed from its rooms and closed, and is
    /// returned to the caller.
    pub fn register(&self, client: ClientHandle) -> Option<ClientHandle> {
        let (superseded, clients, rooms) = {
            let mut reg = self.registry.write();
            let previous = reg.clients.insert(client.user_id().clone(), client.clone());
            let superseded = previous.filter(|prev| *prev != client);
            if let Some(prev) = &superseded {
                reg.remove_from_rooms(prev.connection_id());
            }
            (superseded, reg.clients.len(), reg.rooms.len())
        };

        if let Some(prev) = &superseded {
            prev.close();
            info!(
                user_id = %client.user_id(),
                connection_id = %client.connection_id(),
                superseded = %prev.connection_id(),
                "client replaced existing connection"
            );
        } else {
            debug!(
                user_id = %client.user_id(),
                connection_id = %client.connection_id(),
                clients,
                "client registered"
            );
        }

        self.record(|m| {
            m.counter_inc("hub_registrations_total", &[], 1);
            m.gauge_set("hub_clients_connected", &[], clients as i64);
            m.gauge_set("hub_rooms_active", &[], rooms as i64);
        });
        superseded
    }

    /// Remove a client from the registry and every room, then close it.
    ///
    /// A no-op for a client that is not registered, including one already
    /// replaced by a newer connection. Returns whether the registry changed.
    pub fn unregister(&self, client: &ClientHandle) -> bool {
        let (removed, clients, rooms) = {
            let mut reg = self.registry.write();
            let removed = reg.is_current(client);
            if removed {
                let _ = reg.clients.remove(client.user_id());
                reg.remove_from_rooms(client.connection_id());
            }
            (removed, reg.clients.len(), reg.rooms.len())
        };
        client.close();

        if removed {
            debug!(
                user_id = %client.user_id(),
                connection_id = %client.connection_id(),
                clients,
                "client unregistered"
            );
            self.record(|m| {
                m.counter_inc("hub_unregistrations_total", &[], 1);
                m.gauge_set("hub_clients_connected", &[], clients as i64);
                m.gauge_set("hub_rooms_active", &[], rooms as i64);
            });
        }
        removed
    }

    /// Add a client to a room, creating the room. Ignored unless `client`
    /// is the currently registered connection for its user id.
    pub fn join_room(&self, room_id: &RoomId, client: &ClientHandle) -> bool {
        let rooms = {
            let mut reg = self.registry.write();
            if !reg.is_current(client) {
                return false;
            }
            let _ = reg
                .rooms
                .entry(room_id.clone())
                .or_default()
                .insert(client.connection_id().clone(), client.clone());
            reg.rooms.len()
        };
        debug!(room_id = %room_id, user_id = %client.user_id(), "joined room");
        self.record(|m| m.gauge_set("hub_rooms_active", &[], rooms as i64));
        true
    }

    pub fn leave_room(&self, room_id: &RoomId, client: &ClientHandle) -> bool {
        let (left, rooms) = {
            let mut reg = self.registry.write();
            let left = match reg.rooms.get_mut(room_id) {
                Some(members) => {
                    let left = members.remove(client.connection_id()).is_some();
                    if members.is_empty() {
                        let _ = reg.rooms.remove(room_id);
                    }
                    left
                }
                None => false,
            };
            (left, reg.rooms.len())
        };
        if left {
            debug!(room_id = %room_id, user_id = %client.user_id(), "left room");
            self.record(|m| m.gauge_set("hub_rooms_active", &[], rooms as i64));
        }
        left
    }

    /// Queue a frame for every member of a room. An unknown room has no
    /// recipients.
    pub fn broadcast_to_room(&self, room_id: &RoomId, frame: Arc<str>) -> BroadcastReport {
        let (delivered, overflowed) = {
            let reg = self.registry.read();
            match reg.rooms.get(room_id) {
                Some(members) => fan_out(members.values(), &frame),
                None => (0, Vec::new()),
            }
        };
        let report = BroadcastReport {
            delivered,
            evicted: self.evict(overflowed),
        };
        debug!(
            room_id = %room_id,
            delivered = report.delivered,
            evicted = report.evicted,
            "room broadcast"
        );
        self.record_fan_out("room", report);
        report
    }

    /// Queue a frame for every registered client.
    pub fn broadcast_global(&self, frame: Arc<str>) -> BroadcastReport {
        let (delivered, overflowed) = {
            let reg = self.registry.read();
            fan_out(reg.clients.values(), &frame)
        };
        let report = BroadcastReport {
            delivered,
            evicted: self.evict(overflowed),
        };
        debug!(delivered = report.delivered, evicted = report.evicted, "global broadcast");
        self.record_fan_out("global", report);
        report
    }

    /// Queue a frame for one user, if connected. Returns whether it was queued.
    pub fn send_to_user(&self, user_id: &UserId, frame: Arc<str>) -> bool {
        let client = self.registry.read().clients.get(user_id).cloned();
        match client {
            Some(client) => self.send_to_client(&client, frame).is_ok(),
            None => false,
        }
    }

    /// Queue a frame for a specific connection, evicting it if its mailbox
    /// is full.
    pub fn send_to_client(
        &self,
        client: &ClientHandle,
        frame: Arc<str>,
    ) -> Result<(), EnqueueError> {
        let result = client.try_enqueue(frame);
        match result {
            Ok(()) => self.record(|m| m.counter_inc("hub_frames_enqueued_total", &[], 1)),
            Err(EnqueueError::Full) => {
                let _ = self.evict(vec![client.clone()]);
            }
            Err(EnqueueError::Closed) => {
                self.record(|m| m.counter_inc("hub_frames_dropped_total", &[], 1));
            }
        }
        result
    }

    pub fn client_count(&self) -> usize {
        self.registry.read().clients.len()
    }

    pub fn room_count(&self) -> usize {
        self.registry.read().rooms.len()
    }

    pub fn is_registered(&self, user_id: &UserId) -> bool {
        self.registry.read().clients.contains_key(user_id)
    }

    /// The currently registered client for a user id.
    pub fn client(&self, user_id: &UserId) -> Option<ClientHandle> {
        self.registry.read().clients.get(user_id).cloned()
    }

    /// User ids of a room's members, sorted.
    pub fn room_members(&self, room_id: &RoomId) -> Vec<UserId> {
        let mut members: Vec<UserId> = self
            .registry
            .read()
            .rooms
            .get(room_id)
            .map(|m| m.values().map(|c| c.user_id().clone()).collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Drop every client and room and close all mailboxes. Returns how many
    /// clients were closed.
    pub fn close_all(&self) -> usize {
        let clients: Vec<ClientHandle> = {
            let mut reg = self.registry.write();
            reg.rooms.clear();
            reg.clients.drain().map(|(_, c)| c).collect()
        };
        for client in &clients {
            client.close();
        }
        self.record(|m| {
            m.gauge_set("hub_clients_connected", &[], 0);
            m.gauge_set("hub_rooms_active", &[], 0);
        });
        clients.len()
    }

    /// Unregister clients whose mailboxes overflowed. Runs without the
    /// registry lock held.
    fn evict(&self, overflowed: Vec<ClientHandle>) -> usize {
        let mut evicted = 0;
        for client in overflowed {
            warn!(
                user_id = %client.user_id(),
                connection_id = %client.connection_id(),
                "evicting slow client"
            );
            if self.unregister(&client) {
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.record(|m| m.counter_inc("hub_evictions_total", &[], evicted as u64));
        }
        evicted
    }

    fn record(&self, f: impl FnOnce(&MetricsRecorder)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }

    fn record_fan_out(&self, scope: &str, report: BroadcastReport) {
        self.record(|m| {
            m.counter_inc("hub_frames_enqueued_total", &[], report.delivered as u64);
            m.histogram_observe(
                "hub_broadcast_fanout",
                &[("scope", scope)],
                report.delivered as f64,
            );
        });
    }
}

/// Try to queue `frame` for each client; collect the ones that are full.
fn fan_out<'a>(
    clients: impl Iterator<Item = &'a ClientHandle>,
    frame: &Arc<str>,
) -> (usize, Vec<ClientHandle>) {
    let mut delivered = 0;
    let mut overflowed = Vec::new();
    for client in clients {
        match client.try_enqueue(Arc::clone(frame)) {
            Ok(()) => delivered += 1,
            Err(EnqueueError::Full) => overflowed.push(client.clone()),
            Err(EnqueueError::Closed) => {}
        }
    }
    (delivered, overflowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{channel, Mailbox};

    fn client(id: &str) -> (ClientHandle, Mailbox) {
        channel(UserId::from_raw(id), 16)
    }

    fn room(id: &str) -> RoomId {
        RoomId::from_raw(id)
    }

    fn frame(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    fn drain(mailbox: &mut Mailbox) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(batch) = mailbox.drain() {
            out.extend(batch.split('\n').map(str::to_owned));
        }
        out
    }

    #[test]
    fn single_member_receives_room_broadcast_once() {
        let hub = Hub::new();
        let (u1, mut m1) = client("u1");
        let _ = hub.register(u1.clone());
        assert!(hub.join_room(&room("room-1"), &u1));

        let report = hub.broadcast_to_room(&room("room-1"), frame("X"));
        assert_eq!(report, BroadcastReport { delivered: 1, evicted: 0 });
        assert_eq!(drain(&mut m1), vec!["X"]);
    }

    #[test]
    fn room_broadcast_reaches_only_that_room() {
        let hub = Hub::new();
        let (u1, mut m1) = client("u1");
        let (u2, mut m2) = client("u2");
        let (u3, mut m3) = client("u3");
        for c in [&u1, &u2, &u3] {
            let _ = hub.register(c.clone());
        }
        let _ = hub.join_room(&room("room-1"), &u1);
        let _ = hub.join_room(&room("room-1"), &u2);
        let _ = hub.join_room(&room("room-b"), &u3);

        let _ = hub.broadcast_to_room(&room("room-1"), frame("X"));
        let report = hub.broadcast_to_room(&room("room-2"), frame("Y"));
        assert_eq!(report.delivered, 0);

        assert_eq!(drain(&mut m1), vec!["X"]);
        assert_eq!(drain(&mut m2), vec!["X"]);
        assert!(drain(&mut m3).is_empty());
    }

    #[test]
    fn saturated_client_is_evicted_from_global_broadcast() {
        let hub = Hub::new();
        let (u1, _m1) = channel(UserId::from_raw("u1"), 1);
        let _ = hub.register(u1.clone());
        u1.try_enqueue(frame("filler")).unwrap();

        let report = hub.broadcast_global(frame("Z"));
        assert_eq!(report, BroadcastReport { delivered: 0, evicted: 1 });
        assert!(!hub.is_registered(&UserId::from_raw("u1")));
        assert!(u1.is_closed());
    }

    #[test]
    fn slow_member_does_not_block_healthy_members() {
        let hub = Hub::new();
        let (slow, _slow_mb) = channel(UserId::from_raw("slow"), 1);
        let _ = hub.register(slow.clone());
        let _ = hub.join_room(&room("party"), &slow);
        slow.try_enqueue(frame("filler")).unwrap();

        let mut healthy = Vec::new();
        for i in 0..10 {
            let (c, m) = client(&format!("h{i}"));
            let _ = hub.register(c.clone());
            let _ = hub.join_room(&room("party"), &c);
            healthy.push(m);
        }

        let report = hub.broadcast_to_room(&room("party"), frame("F"));
        assert_eq!(report.delivered, 10);
        assert_eq!(report.evicted, 1);
        for m in &mut healthy {
            assert_eq!(drain(m), vec!["F"]);
        }
        assert!(!hub.is_registered(&UserId::from_raw("slow")));
        assert_eq!(hub.room_members(&room("party")).len(), 10);
    }

    #[test]
    fn unregister_unknown_client_is_noop() {
        let hub = Hub::new();
        let (u1, _m1) = client("u1");
        let _ = hub.register(u1.clone());
        let _ = hub.join_room(&room("r"), &u1);

        let (stranger, _ms) = client("stranger");
        assert!(!hub.unregister(&stranger));
        assert_eq!(hub.client_count(), 1);
        assert_eq!(hub.room_members(&room("r")), vec![UserId::from_raw("u1")]);
    }

    #[test]
    fn unregister_twice_matches_once() {
        let hub = Hub::new();
        let (u1, _m1) = client("u1");
        let (u2, _m2) = client("u2");
        let _ = hub.register(u1.clone());
        let _ = hub.register(u2.clone());
        let _ = hub.join_room(&room("r"), &u1);
        let _ = hub.join_room(&room("r"), &u2);

        assert!(hub.unregister(&u1));
        let once = (hub.client_count(), hub.room_members(&room("r")));
        assert!(!hub.unregister(&u1));
        let twice = (hub.client_count(), hub.room_members(&room("r")));
        assert_eq!(once, twice);
        assert_eq!(twice, (1, vec![UserId::from_raw("u2")]));
    }

    #[test]
    fn unregister_removes_from_every_room_and_prunes() {
        let hub = Hub::new();
        let (u1, _m1) = client("u1");
        let _ = hub.register(u1.clone());
        for r in ["a", "b", "c"] {
            let _ = hub.join_room(&room(r), &u1);
        }
        assert_eq!(hub.room_count(), 3);
        let _ = hub.unregister(&u1);
        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn duplicate_id_replaces_and_closes_previous() {
        let hub = Hub::new();
        let (old, _mo) = client("u1");
        let (new, mut mn) = client("u1");
        let _ = hub.register(old.clone());
        let _ = hub.join_room(&room("r"), &old);

        let superseded = hub.register(new.clone());
        assert_eq!(superseded.as_ref(), Some(&old));
        assert!(old.is_closed());
        assert_eq!(hub.client(&UserId::from_raw("u1")), Some(new.clone()));
        assert!(hub.room_members(&room("r")).is_empty());

        // The stale connection cannot remove its replacement.
        assert!(!hub.unregister(&old));
        assert!(hub.is_registered(&UserId::from_raw("u1")));

        let _ = hub.join_room(&room("r"), &new);
        let _ = hub.broadcast_to_room(&room("r"), frame("hi"));
        assert_eq!(drain(&mut mn), vec!["hi"]);
    }

    #[test]
    fn reregistering_same_connection_is_not_a_replacement() {
        let hub = Hub::new();
        let (u1, _m1) = client("u1");
        let _ = hub.register(u1.clone());
        assert!(hub.register(u1.clone()).is_none());
        assert!(!u1.is_closed());
    }

    #[test]
    fn join_room_ignored_for_unregistered_client() {
        let hub = Hub::new();
        let (ghost, _m) = client("ghost");
        assert!(!hub.join_room(&room("r"), &ghost));
        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn leave_room_prunes_empty_room() {
        let hub = Hub::new();
        let (u1, _m1) = client("u1");
        let _ = hub.register(u1.clone());
        let _ = hub.join_room(&room("r"), &u1);
        assert!(hub.leave_room(&room("r"), &u1));
        assert!(!hub.leave_room(&room("r"), &u1));
        assert_eq!(hub.room_count(), 0);
        assert!(hub.is_registered(&UserId::from_raw("u1")));
    }

    #[test]
    fn registry_tracks_latest_client_per_id() {
        let hub = Hub::new();
        let mut latest: HashMap<String, ClientHandle> = HashMap::new();
        let mut mailboxes = Vec::new();
        let ops = ["a", "b", "a", "-a", "c", "b", "-b", "a", "-c"];
        for op in ops {
            if let Some(id) = op.strip_prefix('-') {
                if let Some(c) = latest.remove(id) {
                    let _ = hub.unregister(&c);
                }
            } else {
                let (c, m) = client(op);
                mailboxes.push(m);
                let _ = hub.register(c.clone());
                let _ = hub.join_room(&room("shared"), &c);
                let _ = latest.insert(op.to_string(), c);
            }
            assert_eq!(hub.client_count(), latest.len());
            for (id, c) in &latest {
                assert_eq!(hub.client(&UserId::from_raw(id.as_str())).as_ref(), Some(c));
            }
            let mut expected: Vec<UserId> =
                latest.keys().map(|k| UserId::from_raw(k.as_str())).collect();
            expected.sort();
            assert_eq!(hub.room_members(&room("shared")), expected);
        }
    }

    #[test]
    fn send_to_user_reaches_registered_client() {
        let hub = Hub::new();
        let (u1, mut m1) = client("u1");
        let _ = hub.register(u1);
        assert!(hub.send_to_user(&UserId::from_raw("u1"), frame("dm")));
        assert!(!hub.send_to_user(&UserId::from_raw("nobody"), frame("dm")));
        assert_eq!(drain(&mut m1), vec!["dm"]);
    }

    #[test]
    fn send_to_full_client_evicts() {
        let hub = Hub::new();
        let (u1, _m1) = channel(UserId::from_raw("u1"), 1);
        let _ = hub.register(u1.clone());
        assert!(hub.send_to_client(&u1, frame("a")).is_ok());
        assert_eq!(hub.send_to_client(&u1, frame("b")), Err(EnqueueError::Full));
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn close_all_empties_registry() {
        let hub = Hub::new();
        let (u1, _m1) = client("u1");
        let (u2, _m2) = client("u2");
        let _ = hub.register(u1.clone());
        let _ = hub.register(u2.clone());
        let _ = hub.join_room(&room("r"), &u1);
        assert_eq!(hub.close_all(), 2);
        assert_eq!(hub.client_count(), 0);
        assert_eq!(hub.room_count(), 0);
        assert!(u1.is_closed() && u2.is_closed());
    }

    #[test]
    fn metrics_follow_registry() {
        let metrics = Arc::new(MetricsRecorder::new());
        let hub = Hub::with_metrics(Arc::clone(&metrics));
        let (u1, _m1) = channel(UserId::from_raw("u1"), 1);
        let (u2, _m2) = client("u2");
        let _ = hub.register(u1.clone());
        let _ = hub.register(u2);
        assert_eq!(metrics.gauge_get("hub_clients_connected", &[]), 2);

        u1.try_enqueue(frame("filler")).unwrap();
        let _ = hub.broadcast_global(frame("g"));
        assert_eq!(metrics.counter_get("hub_evictions_total", &[]), 1);
        assert_eq!(metrics.gauge_get("hub_clients_connected", &[]), 1);
        assert_eq!(metrics.counter_get("hub_registrations_total", &[]), 2);
    }

    /// Every room member must be the registered client for its user id.
    fn assert_rooms_consistent(hub: &Hub) {
        let reg = hub.registry.read();
        for (room_id, members) in &reg.rooms {
            assert!(!members.is_empty(), "empty room {room_id} kept");
            for (conn_id, member) in members {
                assert_eq!(member.connection_id(), conn_id);
                assert_eq!(
                    reg.clients.get(member.user_id()),
                    Some(member),
                    "{room_id} holds a stale client for {}",
                    member.user_id()
                );
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_churn_keeps_rooms_consistent() {
        let hub = Arc::new(Hub::new());
        let mut tasks = Vec::new();
        for t in 0..16usize {
            let hub = Arc::clone(&hub);
            tasks.push(tokio::spawn(async move {
                let mut mailboxes = Vec::new();
                for i in 0..500usize {
                    let user = UserId::from_raw(format!("u{}", (t * 7 + i) % 24));
                    let room_id = room(&format!("r{}", i % 5));
                    match (t + i) % 6 {
                        0 | 1 => {
                            let (c, m) = channel(user, 2);
                            let _ = hub.register(c.clone());
                            let _ = hub.join_room(&room_id, &c);
                            mailboxes.push(m);
                        }
                        2 => {
                            let _ = hub.broadcast_to_room(&room_id, frame("r"));
                        }
                        3 => {
                            if let Some(c) = hub.client(&user) {
                                let _ = hub.unregister(&c);
                            }
                        }
                        4 => {
                            if let Some(c) = hub.client(&user) {
                                let _ = hub.leave_room(&room_id, &c);
                            }
                        }
                        _ => {
                            let _ = hub.broadcast_global(frame("g"));
                        }
                    }
                    if i % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                mailboxes.len()
            }));
        }

        for task in tasks {
            assert!(task.await.unwrap() > 0);
        }
        assert_rooms_consistent(&hub);
        assert!(hub.client_count() <= 24);
    }
}
