use serde::Serialize;

/// Room id used when a peer does not name one.
pub const DEFAULT_ROOM_ID: &str = "default";

/// Role label advertised by control UIs. Any unrecognised role lands here too.
pub const OBSERVER_LABEL: &str = "ui";

/// The two independent relay planes. Both run the same room logic over
/// disjoint registries; they differ only in naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Servo/device control: the primary peer is a `device`.
    Control,
    /// WebRTC signaling: the primary peer is a `pi`.
    Signal,
}

impl Namespace {
    pub const ALL: [Namespace; 2] = [Namespace::Control, Namespace::Signal];

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Control => "control",
            Namespace::Signal => "signal",
        }
    }

    /// Upgrade path this namespace is served on.
    pub fn path(self) -> &'static str {
        match self {
            Namespace::Control => "/control",
            Namespace::Signal => "/signal",
        }
    }

    /// Role string a peer presents to claim the primary slot.
    pub fn primary_label(self) -> &'static str {
        match self {
            Namespace::Control => "device",
            Namespace::Signal => "pi",
        }
    }

    /// `type` of the presence message pushed to observers.
    pub fn status_type(self) -> &'static str {
        match self {
            Namespace::Control => "device_status",
            Namespace::Signal => "pi_status",
        }
    }

    /// `message` of the error returned when an observer talks to an empty slot.
    pub fn offline_error(self) -> &'static str {
        match self {
            Namespace::Control => "device_offline",
            Namespace::Signal => "pi_offline",
        }
    }

    pub fn parse_role(self, role: Option<&str>) -> Role {
        match role {
            Some(label) if label == self.primary_label() => Role::Primary,
            _ => Role::Observer,
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Observer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Observer => "observer",
        }
    }
}

/// Who a connection is, fixed at admission.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub namespace: Namespace,
    pub role: Role,
    pub room_id: String,
}

impl Identity {
    pub fn new(namespace: Namespace, role: Role, room_id: impl Into<String>) -> Self {
        Self {
            namespace,
            role,
            room_id: room_id.into(),
        }
    }

    /// Classify a peer from the raw query values it sent. Nothing is
    /// rejected: a missing or empty value falls back to its default.
    pub fn from_request(namespace: Namespace, role: Option<&str>, room_id: Option<&str>) -> Self {
        let role = namespace.parse_role(role.filter(|value| !value.is_empty()));
        let room_id = room_id
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_ROOM_ID);
        Self::new(namespace, role, room_id)
    }
}
