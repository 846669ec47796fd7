use std::ops::AddAssign;
use std::time::Duration;

use tracing::debug;

use crate::connection::Liveness;
use crate::room::RoomRegistry;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub probed: usize,
    pub reclaimed: usize,
}

impl AddAssign for HeartbeatReport {
    fn add_assign(&mut self, other: Self) {
        self.probed += other.probed;
        self.reclaimed += other.reclaimed;
    }
}

/// One heartbeat pass over a registry.
///
/// Connections still waiting on the previous probe are terminated; their
/// socket tasks report the close later and room cleanup runs then. Everyone
/// else is marked as awaiting and probed.
pub fn sweep(registry: &mut RoomRegistry) -> HeartbeatReport {
    let namespace = registry.namespace();
    let mut report = HeartbeatReport::default();
    for room in registry.rooms_mut() {
        let room_id = room.id().to_owned();
        for conn in room.members_mut() {
            match conn.liveness() {
                Liveness::Admitted => {
                    conn.probe();
                    report.probed += 1;
                }
                Liveness::AwaitingAck => {
                    debug!(
                        namespace = %namespace,
                        room_id = %room_id,
                        connection_id = %conn.id(),
                        "terminating unresponsive connection"
                    );
                    conn.terminate();
                    report.reclaimed += 1;
                }
                Liveness::Closed => {}
            }
        }
    }
    report
}
