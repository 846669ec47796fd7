use metrics::{counter, gauge};
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionId, CLOSE_CODE_REPLACED, CLOSE_REASON_REPLACED};
use crate::heartbeat::{self, HeartbeatReport};
use crate::namespace::{Identity, Namespace, Role};
use crate::presence;
use crate::room::{RoomRegistry, RoomSnapshot};
use crate::router::{self, RouteOutcome};

/// Result of admitting a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Primary {
        /// Previous primary closed with the `replaced` status, if any.
        evicted: Option<ConnectionId>,
    },
    Observer {
        /// Value of the initial status push.
        primary_online: bool,
    },
}

/// Result of a connection going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// Held the primary slot; observers were told it went offline.
    Primary { room_released: bool },
    Observer { room_released: bool },
    /// Room or membership already gone.
    Unknown,
}

/// All relay state: one registry per namespace.
///
/// Every method runs to completion without awaiting. The engine task in
/// [`crate::handle`] is the only owner in production; tests drive it directly.
#[derive(Debug)]
pub struct Engine {
    control: RoomRegistry,
    signal: RoomRegistry,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            control: RoomRegistry::new(Namespace::Control),
            signal: RoomRegistry::new(Namespace::Signal),
        }
    }

    pub fn registry(&self, namespace: Namespace) -> &RoomRegistry {
        match namespace {
            Namespace::Control => &self.control,
            Namespace::Signal => &self.signal,
        }
    }

    fn registry_mut(&mut self, namespace: Namespace) -> &mut RoomRegistry {
        match namespace {
            Namespace::Control => &mut self.control,
            Namespace::Signal => &mut self.signal,
        }
    }

    pub fn admit(&mut self, conn: Connection) -> Admission {
        let Identity {
            namespace,
            role,
            room_id,
        } = conn.identity().clone();
        let conn_id = conn.id();
        let room = self.registry_mut(namespace).get_or_create(&room_id);

        let admission = match role {
            Role::Primary => {
                let mut evicted = None;
                if let Some(mut previous) = room.primary.take() {
                    if previous.is_live() {
                        previous.close(CLOSE_CODE_REPLACED, CLOSE_REASON_REPLACED);
                        evicted = Some(previous.id());
                    }
                }
                room.primary = Some(conn);
                let notified = presence::announce(room, namespace, true);
                info!(
                    namespace = %namespace,
                    room_id = %room_id,
                    connection_id = %conn_id,
                    observers = notified,
                    "{} connected",
                    namespace.primary_label()
                );
                if let Some(previous) = evicted {
                    info!(
                        namespace = %namespace,
                        room_id = %room_id,
                        connection_id = %previous,
                        "{} replaced by newer connection",
                        namespace.primary_label()
                    );
                    counter!("beach_pier_evictions_total", "namespace" => namespace.as_str())
                        .increment(1);
                }
                Admission::Primary { evicted }
            }
            Role::Observer => {
                room.observers.insert(conn_id, conn);
                let primary_online = room.primary_online();
                presence::greet_observer(room, namespace, conn_id);
                info!(
                    namespace = %namespace,
                    room_id = %room_id,
                    connection_id = %conn_id,
                    primary_online,
                    "observer connected"
                );
                Admission::Observer { primary_online }
            }
        };

        counter!(
            "beach_pier_admissions_total",
            "namespace" => namespace.as_str(),
            "role" => role.as_str()
        )
        .increment(1);
        self.record_gauges(namespace);
        admission
    }

    pub fn inbound(&mut self, id: ConnectionId, identity: &Identity, raw: &str) -> RouteOutcome {
        let namespace = identity.namespace;
        let outcome = match self.registry(namespace).get(&identity.room_id) {
            Some(room) => router::route(room, namespace, id, identity.role, raw),
            None => RouteOutcome::NotMember,
        };

        match outcome {
            RouteOutcome::Forwarded(delivered) => {
                counter!(
                    "beach_pier_messages_forwarded_total",
                    "namespace" => namespace.as_str(),
                    "from" => identity.role.as_str()
                )
                .increment(delivered as u64);
            }
            other => {
                debug!(
                    namespace = %namespace,
                    room_id = %identity.room_id,
                    connection_id = %id,
                    outcome = other.metric_label(),
                    "inbound message not forwarded"
                );
                counter!(
                    "beach_pier_messages_dropped_total",
                    "namespace" => namespace.as_str(),
                    "reason" => other.metric_label()
                )
                .increment(1);
            }
        }
        outcome
    }

    /// Pong received: the connection answered the last probe.
    pub fn probe_ack(&mut self, id: ConnectionId, identity: &Identity) {
        if let Some(conn) = self
            .registry_mut(identity.namespace)
            .get_mut(&identity.room_id)
            .and_then(|room| room.member_mut(id))
        {
            conn.acknowledge_probe();
        }
    }

    /// Transport closed for any reason. Safe to call more than once.
    pub fn close(&mut self, id: ConnectionId, identity: &Identity) -> Departure {
        let namespace = identity.namespace;
        let registry = self.registry_mut(namespace);
        let Some(room) = registry.get_mut(&identity.room_id) else {
            return Departure::Unknown;
        };

        let departure = if room.is_primary(id) {
            room.primary = None;
            presence::announce(room, namespace, false);
            info!(
                namespace = %namespace,
                room_id = %identity.room_id,
                connection_id = %id,
                "{} disconnected",
                namespace.primary_label()
            );
            Departure::Primary {
                room_released: registry.release_if_empty(&identity.room_id),
            }
        } else if room.observers.remove(&id).is_some() {
            debug!(
                namespace = %namespace,
                room_id = %identity.room_id,
                connection_id = %id,
                "observer disconnected"
            );
            Departure::Observer {
                room_released: registry.release_if_empty(&identity.room_id),
            }
        } else {
            Departure::Unknown
        };

        if departure != Departure::Unknown {
            self.record_gauges(namespace);
        }
        departure
    }

    /// Run one heartbeat pass over both namespaces.
    pub fn heartbeat_tick(&mut self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();
        for namespace in Namespace::ALL {
            let pass = heartbeat::sweep(self.registry_mut(namespace));
            if pass.reclaimed > 0 {
                counter!(
                    "beach_pier_heartbeat_reclaimed_total",
                    "namespace" => namespace.as_str()
                )
                .increment(pass.reclaimed as u64);
            }
            report += pass;
        }
        if report.reclaimed > 0 {
            info!(
                probed = report.probed,
                reclaimed = report.reclaimed,
                "heartbeat reclaimed unresponsive connections"
            );
        }
        report
    }

    pub fn snapshot(&self) -> Vec<RoomSnapshot> {
        Namespace::ALL
            .into_iter()
            .flat_map(|namespace| self.registry(namespace).snapshot())
            .collect()
    }

    fn record_gauges(&self, namespace: Namespace) {
        let registry = self.registry(namespace);
        gauge!("beach_pier_rooms_active", "namespace" => namespace.as_str())
            .set(registry.len() as f64);
        gauge!("beach_pier_connections_active", "namespace" => namespace.as_str())
            .set(registry.connection_count() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Disconnect, Liveness, Mailbox, Outbound};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::{json, Value};

    struct Peer {
        id: ConnectionId,
        identity: Identity,
        mailbox: Mailbox,
    }

    impl Peer {
        fn drain(&mut self) -> Vec<Outbound> {
            let mut frames = Vec::new();
            while let Some(frame) = self.mailbox.try_frame() {
                frames.push(frame);
            }
            frames
        }

        fn disconnect(&mut self) -> Option<Disconnect> {
            self.mailbox.try_disconnect()
        }

        fn texts(&mut self) -> Vec<Value> {
            self.drain()
                .into_iter()
                .filter_map(|frame| match frame {
                    Outbound::Text(text) => serde_json::from_str(&text).ok(),
                    _ => None,
                })
                .collect()
        }
    }

    fn join(engine: &mut Engine, namespace: Namespace, role: Role, room: &str) -> (Peer, Admission) {
        let identity = Identity::new(namespace, role, room);
        let (conn, mailbox) = Connection::open(ConnectionId::new(), identity.clone());
        let id = conn.id();
        let admission = engine.admit(conn);
        (
            Peer {
                id,
                identity,
                mailbox,
            },
            admission,
        )
    }

    fn send(engine: &mut Engine, peer: &Peer, payload: Value) -> RouteOutcome {
        engine.inbound(peer.id, &peer.identity, &payload.to_string())
    }

    fn leave(engine: &mut Engine, peer: &Peer) -> Departure {
        engine.close(peer.id, &peer.identity)
    }

    #[test_timeout::timeout]
    fn device_and_ui_round_trip() {
        let mut engine = Engine::new();
        let (mut device, _) = join(&mut engine, Namespace::Control, Role::Primary, "cam1");
        let (mut ui, admission) = join(&mut engine, Namespace::Control, Role::Observer, "cam1");

        assert_eq!(admission, Admission::Observer { primary_online: true });
        assert_eq!(ui.texts(), vec![json!({"type": "device_status", "online": true})]);

        let outcome = send(&mut engine, &ui, json!({"type": "move", "angle": 30}));
        assert_eq!(outcome, RouteOutcome::Forwarded(1));
        assert_eq!(device.texts(), vec![json!({"type": "move", "angle": 30})]);

        assert_eq!(
            leave(&mut engine, &device),
            Departure::Primary { room_released: false }
        );
        assert_eq!(ui.texts(), vec![json!({"type": "device_status", "online": false})]);
    }

    #[test_timeout::timeout]
    fn lone_observer_gets_offline_status_and_error() {
        let mut engine = Engine::new();
        let (mut ui, admission) = join(&mut engine, Namespace::Control, Role::Observer, "x");

        assert_eq!(admission, Admission::Observer { primary_online: false });
        assert_eq!(ui.texts(), vec![json!({"type": "device_status", "online": false})]);

        let outcome = send(&mut engine, &ui, json!({"type": "move"}));
        assert_eq!(outcome, RouteOutcome::PrimaryOffline);
        assert_eq!(
            ui.texts(),
            vec![json!({"type": "error", "message": "device_offline"})]
        );
    }

    #[test_timeout::timeout]
    fn signal_namespace_uses_pi_naming() {
        let mut engine = Engine::new();
        let (mut ui, _) = join(&mut engine, Namespace::Signal, Role::Observer, "default");
        assert_eq!(ui.texts(), vec![json!({"type": "pi_status", "online": false})]);

        send(&mut engine, &ui, json!({"type": "offer", "sdp": "v=0"}));
        assert_eq!(ui.texts(), vec![json!({"type": "error", "message": "pi_offline"})]);

        let (_pi, _) = join(&mut engine, Namespace::Signal, Role::Primary, "default");
        assert_eq!(ui.texts(), vec![json!({"type": "pi_status", "online": true})]);
    }

    #[test_timeout::timeout]
    fn newer_primary_evicts_older_one() {
        let mut engine = Engine::new();
        let (mut ui, _) = join(&mut engine, Namespace::Control, Role::Observer, "cam1");
        let (mut first, _) = join(&mut engine, Namespace::Control, Role::Primary, "cam1");
        ui.drain();

        let (mut second, admission) = join(&mut engine, Namespace::Control, Role::Primary, "cam1");
        assert_eq!(admission, Admission::Primary { evicted: Some(first.id) });
        assert_eq!(
            first.disconnect(),
            Some(Disconnect::Close {
                code: CLOSE_CODE_REPLACED,
                reason: CLOSE_REASON_REPLACED
            })
        );
        assert!(first.drain().is_empty());
        assert_eq!(ui.texts(), vec![json!({"type": "device_status", "online": true})]);

        let room = engine.registry(Namespace::Control).get("cam1").unwrap();
        assert!(room.is_primary(second.id));

        // The evicted socket closing later must not disturb the new primary.
        assert_eq!(leave(&mut engine, &first), Departure::Unknown);
        assert!(ui.texts().is_empty());

        send(&mut engine, &ui, json!({"type": "ping"}));
        assert_eq!(second.texts(), vec![json!({"type": "ping"})]);
    }

    #[test_timeout::timeout]
    fn evicted_primary_cannot_broadcast() {
        let mut engine = Engine::new();
        let (first, _) = join(&mut engine, Namespace::Control, Role::Primary, "cam1");
        let (_second, _) = join(&mut engine, Namespace::Control, Role::Primary, "cam1");
        let (mut ui, _) = join(&mut engine, Namespace::Control, Role::Observer, "cam1");
        ui.drain();

        let outcome = send(&mut engine, &first, json!({"type": "frame"}));
        assert_eq!(outcome, RouteOutcome::NotMember);
        assert!(ui.texts().is_empty());
    }

    #[test_timeout::timeout]
    fn primary_broadcast_reaches_live_observers_only() {
        let mut engine = Engine::new();
        let (device, _) = join(&mut engine, Namespace::Control, Role::Primary, "cam1");
        let (mut a, _) = join(&mut engine, Namespace::Control, Role::Observer, "cam1");
        let (mut b, _) = join(&mut engine, Namespace::Control, Role::Observer, "cam1");
        let (gone, _) = join(&mut engine, Namespace::Control, Role::Observer, "cam1");
        let (mut elsewhere, _) = join(&mut engine, Namespace::Control, Role::Observer, "cam2");
        drop(gone.mailbox);
        a.drain();
        b.drain();
        elsewhere.drain();

        let outcome = send(&mut engine, &device, json!({"type": "telemetry", "v": 1}));
        assert_eq!(outcome, RouteOutcome::Forwarded(2));
        assert_eq!(a.texts(), vec![json!({"type": "telemetry", "v": 1})]);
        assert_eq!(b.texts(), vec![json!({"type": "telemetry", "v": 1})]);
        assert!(elsewhere.texts().is_empty());
    }

    #[test_timeout::timeout]
    fn observer_messages_never_reach_other_observers() {
        let mut engine = Engine::new();
        let (mut device, _) = join(&mut engine, Namespace::Control, Role::Primary, "r");
        let (a, _) = join(&mut engine, Namespace::Control, Role::Observer, "r");
        let (mut b, _) = join(&mut engine, Namespace::Control, Role::Observer, "r");
        b.drain();

        send(&mut engine, &a, json!({"type": "move"}));
        assert!(b.texts().is_empty());
        assert_eq!(device.texts(), vec![json!({"type": "move"})]);
    }

    #[test_timeout::timeout]
    fn malformed_payload_is_dropped_silently() {
        let mut engine = Engine::new();
        let (mut device, _) = join(&mut engine, Namespace::Control, Role::Primary, "r");
        let (mut ui, _) = join(&mut engine, Namespace::Control, Role::Observer, "r");
        ui.drain();

        assert_eq!(engine.inbound(ui.id, &ui.identity, "{oops"), RouteOutcome::Malformed);
        assert_eq!(
            engine.inbound(device.id, &device.identity, "not json"),
            RouteOutcome::Malformed
        );
        assert!(device.drain().is_empty());
        assert!(ui.drain().is_empty());
    }

    #[test_timeout::timeout]
    fn primary_messages_keep_send_order() {
        let mut engine = Engine::new();
        let (device, _) = join(&mut engine, Namespace::Signal, Role::Primary, "r");
        let (mut ui, _) = join(&mut engine, Namespace::Signal, Role::Observer, "r");
        ui.drain();

        for seq in 0..5 {
            send(&mut engine, &device, json!({"type": "candidate", "seq": seq}));
        }
        let seqs: Vec<_> = ui.texts().iter().map(|msg| msg["seq"].clone()).collect();
        assert_eq!(seqs, (0..5).map(Value::from).collect::<Vec<_>>());
    }

    #[test_timeout::timeout]
    fn empty_rooms_are_released() {
        let mut engine = Engine::new();
        let (device, _) = join(&mut engine, Namespace::Control, Role::Primary, "r");
        let (ui, _) = join(&mut engine, Namespace::Control, Role::Observer, "r");

        assert_eq!(leave(&mut engine, &ui), Departure::Observer { room_released: false });
        assert_eq!(leave(&mut engine, &device), Departure::Primary { room_released: true });
        assert!(engine.registry(Namespace::Control).get("r").is_none());

        // Closing again is harmless.
        assert_eq!(leave(&mut engine, &device), Departure::Unknown);
    }

    #[test_timeout::timeout]
    fn namespaces_do_not_share_rooms() {
        let mut engine = Engine::new();
        let (_device, _) = join(&mut engine, Namespace::Control, Role::Primary, "shared");
        let (_ui, admission) = join(&mut engine, Namespace::Signal, Role::Observer, "shared");
        assert_eq!(admission, Admission::Observer { primary_online: false });
        assert_eq!(engine.registry(Namespace::Control).len(), 1);
        assert_eq!(engine.registry(Namespace::Signal).len(), 1);
    }

    #[test_timeout::timeout]
    fn silent_connection_is_reclaimed_on_second_tick() {
        let mut engine = Engine::new();
        let (mut device, _) = join(&mut engine, Namespace::Control, Role::Primary, "r");
        let (mut ui, _) = join(&mut engine, Namespace::Control, Role::Observer, "r");
        ui.drain();

        let first = engine.heartbeat_tick();
        assert_eq!(first, HeartbeatReport { probed: 2, reclaimed: 0 });
        assert_eq!(device.drain(), vec![Outbound::Ping]);
        assert_eq!(ui.drain(), vec![Outbound::Ping]);

        // Only the observer answers.
        engine.probe_ack(ui.id, &ui.identity);

        let second = engine.heartbeat_tick();
        assert_eq!(second, HeartbeatReport { probed: 1, reclaimed: 1 });
        assert_eq!(device.disconnect(), Some(Disconnect::Terminate));
        assert!(device.drain().is_empty());
        assert_eq!(ui.drain(), vec![Outbound::Ping]);
        assert_eq!(ui.disconnect(), None);

        let room = engine.registry(Namespace::Control).get("r").unwrap();
        assert_eq!(room.primary().map(Connection::liveness), Some(Liveness::Closed));
        assert!(!room.primary_online());

        // Socket task reports the termination as an ordinary close.
        leave(&mut engine, &device);
        assert_eq!(ui.texts(), vec![json!({"type": "device_status", "online": false})]);
    }

    #[test_timeout::timeout]
    fn terminated_primary_is_not_reported_online() {
        let mut engine = Engine::new();
        let (device, _) = join(&mut engine, Namespace::Control, Role::Primary, "r");
        engine.heartbeat_tick();
        engine.heartbeat_tick();

        let (mut ui, admission) = join(&mut engine, Namespace::Control, Role::Observer, "r");
        assert_eq!(admission, Admission::Observer { primary_online: false });
        assert_eq!(ui.texts(), vec![json!({"type": "device_status", "online": false})]);

        // A third tick leaves the already-terminated primary alone.
        let report = engine.heartbeat_tick();
        assert_eq!(report.reclaimed, 0);

        // A new primary takes the slot without a replace close.
        let (_next, admission) = join(&mut engine, Namespace::Control, Role::Primary, "r");
        assert_eq!(admission, Admission::Primary { evicted: None });
        assert_eq!(leave(&mut engine, &device), Departure::Unknown);
    }

    #[test_timeout::timeout]
    fn snapshot_lists_both_namespaces() {
        let mut engine = Engine::new();
        let (_device, _) = join(&mut engine, Namespace::Control, Role::Primary, "cam1");
        let (_ui, _) = join(&mut engine, Namespace::Control, Role::Observer, "cam1");
        let (_ui2, _) = join(&mut engine, Namespace::Signal, Role::Observer, "cam1");

        let snapshot = engine.snapshot();
        assert_eq!(
            snapshot,
            vec![
                RoomSnapshot {
                    namespace: Namespace::Control,
                    room_id: "cam1".into(),
                    primary_online: true,
                    observers: 1,
                },
                RoomSnapshot {
                    namespace: Namespace::Signal,
                    room_id: "cam1".into(),
                    primary_online: false,
                    observers: 1,
                },
            ]
        );
    }

    #[test_timeout::timeout]
    fn relay_activity_is_recorded_as_metrics() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let mut engine = Engine::new();

        metrics::with_local_recorder(&recorder, || {
            let (device, _) = join(&mut engine, Namespace::Control, Role::Primary, "cam1");
            let (_ui, _) = join(&mut engine, Namespace::Control, Role::Observer, "cam1");
            send(&mut engine, &device, json!({"type": "telemetry"}));
        });

        let rendered = handle.render();
        for name in [
            "beach_pier_admissions_total",
            "beach_pier_messages_forwarded_total",
            "beach_pier_rooms_active",
            "beach_pier_connections_active",
        ] {
            assert!(rendered.contains(name), "{name} missing from:\n{rendered}");
        }
        assert!(rendered.contains(r#"role="primary""#));
    }
}
