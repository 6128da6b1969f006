use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

/// A server-to-client message bundling flow-control hints and commands.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Directive {
    pub id: String,
    pub stop_reporting: bool,
    pub min_report_period: Option<Duration>,
    /// When set, switches hard-limit mode on or off.
    pub enforce_limits: Option<bool>,
    pub commands: Vec<Command>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub id: Option<String>,
    pub kind: CommandKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Log {
        message: String,
    },
    Rollout {
        name: String,
        namespace: String,
        action: RolloutAction,
    },
    SecretSync {
        name: String,
        namespace: String,
        action: SecretSyncAction,
        payload: Option<BTreeMap<String, Vec<u8>>>,
    },
    /// A known command variant whose fields could not be interpreted.
    Invalid(String),
    /// A command variant this agent does not know about.
    Unknown,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RolloutAction {
    Pause,
    Resume,
    Abort,
    Promote,
    Restart,
    Retry,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SecretSyncAction {
    Set,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandResult {
    pub command_id: String,
    pub success: bool,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidAction(String);

/// Applies the local floor to a server-requested report period.
///
/// The server may slow reporting down but never speed it up past the floor.
pub fn clamp_report_period(requested: Duration, floor: Duration) -> Duration {
    requested.max(floor)
}

// === impl Command ===

impl Command {
    pub fn log(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            kind: CommandKind::Log {
                message: message.into(),
            },
        }
    }

    pub fn rollout(
        id: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
        action: RolloutAction,
    ) -> Self {
        Self {
            id: Some(id.into()),
            kind: CommandKind::Rollout {
                name: name.into(),
                namespace: namespace.into(),
                action,
            },
        }
    }

    /// The quota that must admit this command before it runs, if any.
    pub fn limit_name(&self) -> Option<&'static str> {
        match self.kind {
            CommandKind::Rollout { .. } => Some("rollouts"),
            CommandKind::SecretSync { .. } => Some("secrets"),
            _ => None,
        }
    }
}

// === impl CommandKind ===

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::Rollout { .. } => "rollout",
            Self::SecretSync { .. } => "secret_sync",
            Self::Invalid(_) => "invalid",
            Self::Unknown => "unknown",
        }
    }
}

// === impl RolloutAction ===

impl RolloutAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Abort => "abort",
            Self::Promote => "promote",
            Self::Restart => "restart",
            Self::Retry => "retry",
        }
    }
}

impl FromStr for RolloutAction {
    type Err = InvalidAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "abort" => Ok(Self::Abort),
            "promote" => Ok(Self::Promote),
            "restart" => Ok(Self::Restart),
            "retry" => Ok(Self::Retry),
            _ => Err(InvalidAction(s.to_string())),
        }
    }
}

impl fmt::Display for RolloutAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl SecretSyncAction ===

impl SecretSyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for SecretSyncAction {
    type Err = InvalidAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "set" => Ok(Self::Set),
            "delete" => Ok(Self::Delete),
            _ => Err(InvalidAction(s.to_string())),
        }
    }
}

impl fmt::Display for SecretSyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl InvalidAction ===

impl fmt::Display for InvalidAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid action: {:?}", self.0)
    }
}

impl std::error::Error for InvalidAction {}

// === impl CommandResult ===

impl CommandResult {
    pub fn ok(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            success: true,
            message: String::new(),
        }
    }

    pub fn failed(command_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            success: false,
            message: message.into(),
        }
    }
}
