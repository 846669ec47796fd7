use crate::connection::ConnectionId;
use crate::namespace::Namespace;
use crate::protocol::status_message;
use crate::room::Room;

/// Broadcast the primary's status to every live observer. Returns how many
/// observers it reached.
pub fn announce(room: &Room, namespace: Namespace, online: bool) -> usize {
    let message = status_message(namespace, online);
    room.observers()
        .filter(|observer| observer.send_text(message.clone()))
        .count()
}

/// Targeted push to a freshly admitted observer describing the primary as it
/// is right now.
pub fn greet_observer(room: &Room, namespace: Namespace, observer: ConnectionId) -> bool {
    let online = room.primary_online();
    room.observer(observer)
        .is_some_and(|conn| conn.send_text(status_message(namespace, online)))
}
