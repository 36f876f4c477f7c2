//! [`InterlockPolicy`] – safety rule engine for relay changes.
//!
//! Before the engine energises a channel it passes the requested
//! [`ChannelChange`] and the current [`SystemSnapshot`] through
//! [`InterlockPolicy::validate`].  Every registered [`InterlockRule`] is
//! evaluated in order; the first violation is returned and the change is
//! **not** executed.
//!
//! Rules are pure: no I/O, no mutation, deterministic for a given change and
//! snapshot.
//!
//! One built-in rule is provided:
//! - [`ExclusiveGroupRule`] – at most one input of a mutual-exclusion group
//!   may be on.

use relaybank_types::{ChannelChange, RelayError, Role, SystemSnapshot};

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single invariant a channel change must satisfy.
pub trait InterlockRule: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Return `Ok(())` when `change` is legal given `snapshot`.
    fn check(&self, change: &ChannelChange, snapshot: &SystemSnapshot) -> Result<(), RelayError>;
}

// ────────────────────────────────────────────────────────────────────────────
// InterlockPolicy
// ────────────────────────────────────────────────────────────────────────────

/// Ordered set of [`InterlockRule`]s.
///
/// # Example
///
/// ```
/// use relaybank_kernel::interlock::InterlockPolicy;
/// use relaybank_types::{ChannelChange, ChannelId, ChannelState, GroupId, Level, Role, SystemSnapshot};
///
/// let input = |id: u32, level| ChannelState {
///     id: ChannelId(id),
///     key: format!("src{id}"),
///     name: format!("Source {id}"),
///     role: Role::Input,
///     line: 17 + id,
///     group: Some(GroupId::from("power")),
///     level,
/// };
/// let snapshot = SystemSnapshot::new(vec![input(1, Level::On), input(2, Level::Off)]);
///
/// let policy = InterlockPolicy::standard();
/// let turn_on_2 = ChannelChange { channel: ChannelId(2), level: Level::On };
/// assert!(policy.validate(&turn_on_2, &snapshot).is_err());
///
/// let turn_off_1 = ChannelChange { channel: ChannelId(1), level: Level::Off };
/// assert!(policy.validate(&turn_off_1, &snapshot).is_ok());
/// ```
#[derive(Default)]
pub struct InterlockPolicy {
    rules: Vec<Box<dyn InterlockRule>>,
}

impl InterlockPolicy {
    /// A policy with no rules.  Every change passes.
    pub fn new() -> Self {
        Self::default()
    }

    /// The policy used by the switch engine: [`ExclusiveGroupRule`] only.
    pub fn standard() -> Self {
        let mut policy = Self::new();
        policy.add_rule(Box::new(ExclusiveGroupRule));
        policy
    }

    /// Register a rule.  Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn InterlockRule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Validate `change` against every rule; the first violation wins.
    pub fn validate(&self, change: &ChannelChange, snapshot: &SystemSnapshot) -> Result<(), RelayError> {
        for rule in &self.rules {
            rule.check(change, snapshot)?;
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Rejects turning an input on while another input of the same group is on.
///
/// Outputs, ungrouped inputs and every off transition always pass.
pub struct ExclusiveGroupRule;

impl InterlockRule for ExclusiveGroupRule {
    fn name(&self) -> &str {
        "exclusive_group"
    }

    fn check(&self, change: &ChannelChange, snapshot: &SystemSnapshot) -> Result<(), RelayError> {
        if !change.level.is_on() {
            return Ok(());
        }
        let target = snapshot.channel(change.channel).ok_or_else(|| {
            RelayError::Configuration(format!("unknown channel id {}", change.channel))
        })?;
        if target.role != Role::Input {
            return Ok(());
        }
        let Some(group) = &target.group else {
            return Ok(());
        };
        match snapshot.on_in_group(group).find(|c| c.id != target.id) {
            Some(active) => Err(RelayError::InterlockViolation {
                channel: target.id,
                conflicting: active.id,
                group: group.clone(),
                reason: format!(
                    "cannot turn on {} while {} is active",
                    target.name, active.name
                ),
            }),
            None => Ok(()),
        }
    }
}
