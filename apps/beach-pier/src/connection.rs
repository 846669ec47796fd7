use std::fmt;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::namespace::{Identity, Role};

/// Close code sent to a primary that lost its slot to a newer one.
pub const CLOSE_CODE_REPLACED: u16 = 4000;
pub const CLOSE_REASON_REPLACED: &str = "replaced";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Frames the engine asks a socket task to put on the wire, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Heartbeat probe; the peer answers with a pong.
    Ping,
}

/// How the engine ends a connection. Delivered outside the frame queue so it
/// overtakes queued frames and interrupts a stalled write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Send a close frame, then drop the socket.
    Close { code: u16, reason: &'static str },
    /// Drop the socket without a closing handshake.
    Terminate,
}

/// What a socket task should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Frame(Outbound),
    Disconnect(Disconnect),
}

/// Per-connection lifecycle.
///
/// `Admitted` → (tick) → `AwaitingAck` → (pong) → `Admitted`, or
/// `AwaitingAck` → (tick) → `Closed`. Eviction also moves straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Admitted,
    AwaitingAck,
    Closed,
}

/// Engine-side half of a relayed socket. Owned by exactly one room slot.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    liveness: Liveness,
    outbound: mpsc::UnboundedSender<Outbound>,
    disconnect: Option<oneshot::Sender<Disconnect>>,
}

/// Socket-side half of a relayed socket.
#[derive(Debug)]
pub struct Mailbox {
    outbound: mpsc::UnboundedReceiver<Outbound>,
    disconnect: Option<oneshot::Receiver<Disconnect>>,
}

impl Connection {
    pub fn open(id: ConnectionId, identity: Identity) -> (Self, Mailbox) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let conn = Self {
            id,
            identity,
            liveness: Liveness::Admitted,
            outbound: outbound_tx,
            disconnect: Some(disconnect_tx),
        };
        let mailbox = Mailbox {
            outbound: outbound_rx,
            disconnect: Some(disconnect_rx),
        };
        (conn, mailbox)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn role(&self) -> Role {
        self.identity.role
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    /// True while the transport is open: not yet ended by us and the socket
    /// task still holds its mailbox.
    pub fn is_live(&self) -> bool {
        self.liveness != Liveness::Closed && !self.outbound.is_closed()
    }

    /// Queue a text frame. Frames for a dead transport are discarded.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        if !self.is_live() {
            return false;
        }
        self.outbound.send(Outbound::Text(text.into())).is_ok()
    }

    /// Mark the connection as awaiting a pong and queue a probe.
    pub fn probe(&mut self) {
        self.liveness = Liveness::AwaitingAck;
        let _ = self.outbound.send(Outbound::Ping);
    }

    pub fn acknowledge_probe(&mut self) {
        if self.liveness == Liveness::AwaitingAck {
            self.liveness = Liveness::Admitted;
        }
    }

    pub fn close(&mut self, code: u16, reason: &'static str) {
        self.end(Disconnect::Close { code, reason });
    }

    pub fn terminate(&mut self) {
        self.end(Disconnect::Terminate);
    }

    fn end(&mut self, disconnect: Disconnect) {
        self.liveness = Liveness::Closed;
        if let Some(signal) = self.disconnect.take() {
            let _ = signal.send(disconnect);
        }
    }
}

impl Mailbox {
    /// Next thing to do for this socket. A pending disconnect wins over
    /// queued frames; a dropped [`Connection`] reads as termination.
    pub async fn next_delivery(&mut self) -> Delivery {
        tokio::select! {
            biased;
            disconnect = wait_disconnect(&mut self.disconnect) => Delivery::Disconnect(disconnect),
            frame = self.outbound.recv() => match frame {
                Some(frame) => Delivery::Frame(frame),
                None => Delivery::Disconnect(Disconnect::Terminate),
            },
        }
    }

    /// Resolves once the engine ends the connection. Cancel safe.
    pub async fn disconnected(&mut self) -> Disconnect {
        wait_disconnect(&mut self.disconnect).await
    }

    #[cfg(test)]
    pub(crate) fn try_frame(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }

    #[cfg(test)]
    pub(crate) fn try_disconnect(&mut self) -> Option<Disconnect> {
        let disconnect = self.disconnect.as_mut()?.try_recv().ok()?;
        self.disconnect = None;
        Some(disconnect)
    }
}

async fn wait_disconnect(slot: &mut Option<oneshot::Receiver<Disconnect>>) -> Disconnect {
    let Some(signal) = slot.as_mut() else {
        return Disconnect::Terminate;
    };
    let disconnect = signal.await.unwrap_or(Disconnect::Terminate);
    *slot = None;
    disconnect
}
