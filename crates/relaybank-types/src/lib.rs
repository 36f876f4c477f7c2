use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable numeric identity of a relay channel.  Immutable for the lifetime of
/// the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a mutual-exclusion group (e.g. `"power"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// What a channel is wired to.  Always explicit, never derived from the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A power source feeding the bank (AC supply, battery, …).
    Input,
    /// An independently switched load.
    Output,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Input => f.write_str("input"),
            Role::Output => f.write_str("output"),
        }
    }
}

/// Logical relay level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    On,
    Off,
}

impl Level {
    pub fn is_on(self) -> bool {
        matches!(self, Level::On)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::On => f.write_str("on"),
            Level::Off => f.write_str("off"),
        }
    }
}

/// Electrical convention of the relay module driving a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Low line level energises the relay (the common opto-isolated boards).
    #[default]
    ActiveLow,
    /// High line level energises the relay.
    ActiveHigh,
}

/// Static description of one relay channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    /// Short slug used by the API, e.g. `"ac"` or `"output_1"`.
    pub key: String,
    /// Human readable name, e.g. `"AC Supply Input"`.
    pub name: String,
    pub role: Role,
    /// Physical GPIO line number.
    pub line: u32,
    /// Mutual-exclusion group.  Only meaningful for inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupId>,
    #[serde(default)]
    pub polarity: Polarity,
}

impl Channel {
    pub fn is_input(&self) -> bool {
        self.role == Role::Input
    }

    pub fn in_group(&self, group: &GroupId) -> bool {
        self.group.as_ref() == Some(group)
    }
}

/// Observed state of one channel inside a [`SystemSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub id: ChannelId,
    pub key: String,
    pub name: String,
    pub role: Role,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupId>,
    pub level: Level,
}

impl ChannelState {
    pub fn of(channel: &Channel, level: Level) -> Self {
        Self {
            id: channel.id,
            key: channel.key.clone(),
            name: channel.name.clone(),
            role: channel.role,
            line: channel.line,
            group: channel.group.clone(),
            level,
        }
    }
}

/// Active source of one mutual-exclusion group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatus {
    pub group: GroupId,
    /// The input currently on, or `None` when every source is off.
    pub active: Option<ChannelId>,
}

/// Point-in-time view of the whole relay bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub taken_at: DateTime<Utc>,
    pub channels: Vec<ChannelState>,
    pub groups: Vec<GroupStatus>,
}

impl SystemSnapshot {
    /// Assemble a snapshot from per-channel states, deriving the active
    /// source of every group in first-seen order.
    pub fn new(channels: Vec<ChannelState>) -> Self {
        let mut groups: Vec<GroupStatus> = Vec::new();
        for state in channels.iter().filter(|c| c.role == Role::Input) {
            let Some(group) = &state.group else {
                continue;
            };
            let entry = match groups.iter_mut().position(|g| &g.group == group) {
                Some(idx) => &mut groups[idx],
                None => {
                    groups.push(GroupStatus {
                        group: group.clone(),
                        active: None,
                    });
                    let last = groups.len() - 1;
                    &mut groups[last]
                }
            };
            if entry.active.is_none() && state.level.is_on() {
                entry.active = Some(state.id);
            }
        }
        Self {
            taken_at: Utc::now(),
            channels,
            groups,
        }
    }

    pub fn channel(&self, id: ChannelId) -> Option<&ChannelState> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn level(&self, id: ChannelId) -> Option<Level> {
        self.channel(id).map(|c| c.level)
    }

    /// The input currently on within `group`, if any.
    pub fn active_source(&self, group: &GroupId) -> Option<ChannelId> {
        self.groups
            .iter()
            .find(|g| &g.group == group)
            .and_then(|g| g.active)
    }

    /// Every channel of `group` that currently reads on.
    pub fn on_in_group<'a>(&'a self, group: &'a GroupId) -> impl Iterator<Item = &'a ChannelState> {
        self.channels
            .iter()
            .filter(move |c| c.group.as_ref() == Some(group) && c.level.is_on())
    }

    pub fn all_off(&self) -> bool {
        self.channels.iter().all(|c| !c.level.is_on())
    }
}

/// A request to drive one channel to a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelChange {
    pub channel: ChannelId,
    pub level: Level,
}

/// Per-channel result of an all-off pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOutcome {
    pub id: ChannelId,
    pub key: String,
    pub confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate result of forcing every channel off.  Individual failures do not
/// abort the pass; they are listed here instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffReport {
    pub outcomes: Vec<ChannelOutcome>,
}

impl OffReport {
    pub fn all_confirmed(&self) -> bool {
        self.outcomes.iter().all(|o| o.confirmed)
    }

    /// Ids of the channels that failed to confirm off.
    pub fn failed(&self) -> Vec<ChannelId> {
        self.outcomes
            .iter()
            .filter(|o| !o.confirmed)
            .map(|o| o.id)
            .collect()
    }
}

/// Error type shared by every layer of the relay controller.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayError {
    /// Unknown channel or group, or an invalid bank definition.
    #[error("Configuration Error: {0}")]
    Configuration(String),

    #[error("Safety interlock: {reason}")]
    InterlockViolation {
        channel: ChannelId,
        conflicting: ChannelId,
        group: GroupId,
        reason: String,
    },

    #[error("Hardware Read Error on line {line}: {details}")]
    HardwareRead { line: u32, details: String },

    #[error("Hardware Write Error on line {line}: {details}")]
    HardwareWrite { line: u32, details: String },

    #[error("Hardware Init Error: {0}")]
    HardwareInit(String),

    #[error("Hardware not initialized")]
    Uninitialized,
}

impl RelayError {
    /// Stable machine-readable kind, safe to expose over the API.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Configuration(_) => "configuration_error",
            RelayError::InterlockViolation { .. } => "interlock_violation",
            RelayError::HardwareRead { .. } => "hardware_read_error",
            RelayError::HardwareWrite { .. } => "hardware_write_error",
            RelayError::HardwareInit(_) => "hardware_init_error",
            RelayError::Uninitialized => "uninitialized",
        }
    }
}
