use crate::connection::ConnectionId;
use crate::namespace::{Namespace, Role};
use crate::protocol::{offline_error, parse_payload};
use crate::room::Room;

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Payload did not parse.
    Malformed,
    /// Sender no longer holds a slot in its room (e.g. an evicted primary).
    NotMember,
    /// Observer spoke while no live primary was present; the sender got an error.
    PrimaryOffline,
    /// Delivered to this many connections.
    Forwarded(usize),
}

impl RouteOutcome {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RouteOutcome::Malformed => "malformed",
            RouteOutcome::NotMember => "not_member",
            RouteOutcome::PrimaryOffline => "primary_offline",
            RouteOutcome::Forwarded(_) => "forwarded",
        }
    }
}

/// Route a raw frame from `sender` inside `room`.
///
/// Observers only ever reach the primary. The primary fans out to every live
/// observer. Nothing is echoed back to the sender except the offline error.
pub fn route(
    room: &Room,
    namespace: Namespace,
    sender: ConnectionId,
    role: Role,
    raw: &str,
) -> RouteOutcome {
    let Some(payload) = parse_payload(raw) else {
        return RouteOutcome::Malformed;
    };

    match role {
        Role::Observer => {
            let Some(from) = room.observer(sender) else {
                return RouteOutcome::NotMember;
            };
            match room.primary() {
                Some(primary) if primary.is_live() => {
                    let delivered = primary.send_text(payload.to_string());
                    RouteOutcome::Forwarded(usize::from(delivered))
                }
                _ => {
                    from.send_text(offline_error(namespace));
                    RouteOutcome::PrimaryOffline
                }
            }
        }
        Role::Primary => {
            if !room.is_primary(sender) {
                return RouteOutcome::NotMember;
            }
            let message = payload.to_string();
            let delivered = room
                .observers()
                .filter(|observer| observer.send_text(message.clone()))
                .count();
            RouteOutcome::Forwarded(delivered)
        }
    }
}
