use std::time::Duration;

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionId, Delivery, Disconnect, Mailbox};
use crate::engine::Engine;
use crate::error::PierError;
use crate::namespace::Identity;
use crate::room::RoomSnapshot;

enum Command {
    Admit(Connection),
    Inbound {
        id: ConnectionId,
        identity: Identity,
        payload: String,
    },
    ProbeAck {
        id: ConnectionId,
        identity: Identity,
    },
    Closed {
        id: ConnectionId,
        identity: Identity,
    },
    Snapshot(oneshot::Sender<Vec<RoomSnapshot>>),
}

/// Cloneable front door to the engine task.
#[derive(Clone)]
pub struct PierHandle {
    commands: mpsc::UnboundedSender<Command>,
}

/// Start the engine task with its heartbeat ticker. The task exits once
/// every [`PierHandle`] and [`PeerLink`] has been dropped.
pub fn spawn_engine(heartbeat_interval: Duration) -> (PierHandle, JoinHandle<()>) {
    let (commands, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_engine(Engine::new(), rx, heartbeat_interval));
    (PierHandle { commands }, task)
}

async fn run_engine(
    mut engine: Engine,
    mut commands: mpsc::UnboundedReceiver<Command>,
    heartbeat_interval: Duration,
) {
    let mut ticker = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(?heartbeat_interval, "relay engine started");

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                match command {
                    Command::Admit(conn) => {
                        engine.admit(conn);
                    }
                    Command::Inbound { id, identity, payload } => {
                        engine.inbound(id, &identity, &payload);
                    }
                    Command::ProbeAck { id, identity } => engine.probe_ack(id, &identity),
                    Command::Closed { id, identity } => {
                        engine.close(id, &identity);
                    }
                    Command::Snapshot(reply) => {
                        let _ = reply.send(engine.snapshot());
                    }
                }
            }
            _ = ticker.tick() => {
                let report = engine.heartbeat_tick();
                debug!(probed = report.probed, reclaimed = report.reclaimed, "heartbeat tick");
            }
        }
    }

    info!("relay engine stopped");
}

impl PierHandle {
    /// Register a new connection under `identity`. The returned link is the
    /// socket task's side of it.
    pub fn admit(&self, identity: Identity) -> Result<PeerLink, PierError> {
        let id = ConnectionId::new();
        let (conn, mailbox) = Connection::open(id, identity.clone());
        self.submit(Command::Admit(conn))?;
        Ok(PeerLink {
            id,
            identity,
            mailbox,
            pier: self.clone(),
        })
    }

    pub async fn snapshot(&self) -> Result<Vec<RoomSnapshot>, PierError> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Snapshot(tx))?;
        rx.await.map_err(|_| PierError::EngineStopped)
    }

    fn submit(&self, command: Command) -> Result<(), PierError> {
        self.commands
            .send(command)
            .map_err(|_| PierError::EngineStopped)
    }
}

/// Socket-side handle for one admitted connection.
///
/// Dropping the link reports the close to the engine, so every exit path of
/// a socket task runs room cleanup exactly once.
pub struct PeerLink {
    id: ConnectionId,
    identity: Identity,
    mailbox: Mailbox,
    pier: PierHandle,
}

impl PeerLink {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn inbound(&self, payload: String) -> Result<(), PierError> {
        self.pier.submit(Command::Inbound {
            id: self.id,
            identity: self.identity.clone(),
            payload,
        })
    }

    pub fn probe_ack(&self) -> Result<(), PierError> {
        self.pier.submit(Command::ProbeAck {
            id: self.id,
            identity: self.identity.clone(),
        })
    }

    /// Next frame to write, or the engine ending the connection.
    pub async fn next_delivery(&mut self) -> Delivery {
        self.mailbox.next_delivery().await
    }

    /// Resolves once the engine ends the connection, even while frames are
    /// still queued. Cancel safe, so it can race a blocked socket write.
    pub async fn disconnected(&mut self) -> Disconnect {
        self.mailbox.disconnected().await
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        let _ = self.pier.submit(Command::Closed {
            id: self.id,
            identity: self.identity.clone(),
        });
    }
}
