//! Beach Pier: a room relay pairing one primary peer (a device on `/control`,
//! a signaling Pi on `/signal`) with any number of UI observers.
#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod handle;
mod heartbeat;
pub mod namespace;
mod presence;
pub mod protocol;
pub mod room;
mod router;
pub mod server;
pub mod telemetry;

pub use engine::{Admission, Departure, Engine};
pub use handle::{spawn_engine, PeerLink, PierHandle};
pub use heartbeat::{HeartbeatReport, DEFAULT_HEARTBEAT_INTERVAL};
pub use namespace::{Identity, Namespace, Role};
pub use router::RouteOutcome;
