//! [`ChannelRegistry`] – immutable map from logical relay channels to
//! physical lines.
//!
//! Built once at startup from configuration and never mutated afterwards, so
//! it can be shared between request handlers without locking.  Construction
//! validates the bank:
//!
//! - channel ids, keys and line numbers are unique;
//! - outputs never belong to a mutual-exclusion group;
//! - the bank is not empty.

use std::collections::HashSet;

use relaybank_types::{Channel, ChannelId, GroupId, Polarity, RelayError, Role};

/// Static, validated description of the relay bank.
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    channels: Vec<Channel>,
}

impl ChannelRegistry {
    /// Validate `channels` and build a registry.  Channel order is preserved.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Configuration`] describing the first problem.
    pub fn new(channels: Vec<Channel>) -> Result<Self, RelayError> {
        if channels.is_empty() {
            return Err(RelayError::Configuration(
                "relay bank must define at least one channel".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        let mut keys = HashSet::new();
        let mut lines = HashSet::new();
        for ch in &channels {
            if ch.key.trim().is_empty() {
                return Err(RelayError::Configuration(format!(
                    "channel {} has an empty key",
                    ch.id
                )));
            }
            if !ids.insert(ch.id) {
                return Err(RelayError::Configuration(format!(
                    "duplicate channel id {}",
                    ch.id
                )));
            }
            if !keys.insert(ch.key.as_str()) {
                return Err(RelayError::Configuration(format!(
                    "duplicate channel key '{}'",
                    ch.key
                )));
            }
            if !lines.insert(ch.line) {
                return Err(RelayError::Configuration(format!(
                    "line {} is assigned to more than one channel",
                    ch.line
                )));
            }
            if ch.role == Role::Output && ch.group.is_some() {
                return Err(RelayError::Configuration(format!(
                    "output channel '{}' cannot belong to a mutual-exclusion group",
                    ch.key
                )));
            }
        }

        Ok(Self { channels })
    }

    /// Resolve a channel by id.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Configuration`] for unknown ids.
    pub fn lookup(&self, id: ChannelId) -> Result<&Channel, RelayError> {
        self.channels
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| RelayError::Configuration(format!("unknown channel id {id}")))
    }

    /// Resolve a channel by its API key.
    pub fn by_key(&self, key: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.key == key)
    }

    /// Every channel, in configuration order.
    pub fn all_channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Members of `group`, in configuration order.  Empty for unknown groups.
    pub fn channels_in_group(&self, group: &GroupId) -> Vec<&Channel> {
        self.channels.iter().filter(|c| c.in_group(group)).collect()
    }

    /// Distinct group ids in first-seen order.
    pub fn groups(&self) -> Vec<&GroupId> {
        let mut seen: Vec<&GroupId> = Vec::new();
        for group in self.channels.iter().filter_map(|c| c.group.as_ref()) {
            if !seen.contains(&group) {
                seen.push(group);
            }
        }
        seen
    }

    pub fn has_group(&self, group: &GroupId) -> bool {
        self.channels.iter().any(|c| c.in_group(group))
    }

    /// The `number`-th output channel, counting from 1.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Configuration`] when `number` is out of range.
    pub fn output(&self, number: usize) -> Result<&Channel, RelayError> {
        let count = self.channels.iter().filter(|c| c.role == Role::Output).count();
        number
            .checked_sub(1)
            .and_then(|idx| self.channels.iter().filter(|c| c.role == Role::Output).nth(idx))
            .ok_or_else(|| {
                RelayError::Configuration(format!("invalid output {number}; use 1-{count}"))
            })
    }
}

/// The reference wiring: AC supply and battery as one exclusive `power`
/// group on lines 18/19, two outputs on lines 20/21.
pub fn default_bank() -> Vec<Channel> {
    let power = GroupId::new("power");
    let input = |id, key: &str, name: &str, line| Channel {
        id: ChannelId(id),
        key: key.to_string(),
        name: name.to_string(),
        role: Role::Input,
        line,
        group: Some(power.clone()),
        polarity: Polarity::ActiveLow,
    };
    let output = |id, key: &str, name: &str, line| Channel {
        id: ChannelId(id),
        key: key.to_string(),
        name: name.to_string(),
        role: Role::Output,
        line,
        group: None,
        polarity: Polarity::ActiveLow,
    };
    vec![
        input(1, "ac", "AC Supply Input", 18),
        input(2, "battery", "Battery Input", 19),
        output(3, "output_1", "Output 1", 20),
        output(4, "output_2", "Output 2", 21),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(default_bank()).unwrap()
    }

    #[test]
    fn default_bank_is_valid() {
        let reg = registry();
        assert_eq!(reg.all_channels().len(), 4);
        assert_eq!(reg.groups(), vec![&GroupId::from("power")]);
    }

    #[test]
    fn lookup_by_id_and_key() {
        let reg = registry();
        assert_eq!(reg.lookup(ChannelId(2)).unwrap().key, "battery");
        assert_eq!(reg.by_key("output_2").unwrap().line, 21);
        assert!(reg.by_key("solar").is_none());
    }

    #[test]
    fn lookup_unknown_id_is_configuration_error() {
        let reg = registry();
        assert!(matches!(
            reg.lookup(ChannelId(9)),
            Err(RelayError::Configuration(_))
        ));
    }

    #[test]
    fn channels_in_group_preserves_order() {
        let reg = registry();
        let keys: Vec<&str> = reg
            .channels_in_group(&GroupId::from("power"))
            .iter()
            .map(|c| c.key.as_str())
            .collect();
        assert_eq!(keys, vec!["ac", "battery"]);
        assert!(reg.channels_in_group(&GroupId::from("solar")).is_empty());
        assert!(!reg.has_group(&GroupId::from("solar")));
    }

    #[test]
    fn outputs_are_one_based() {
        let reg = registry();
        assert_eq!(reg.output(1).unwrap().key, "output_1");
        assert_eq!(reg.output(2).unwrap().key, "output_2");
        assert!(reg.output(0).is_err());
        assert!(reg.output(3).is_err());
    }

    #[test]
    fn duplicate_line_is_rejected() {
        let mut bank = default_bank();
        bank[3].line = 18;
        let err = ChannelRegistry::new(bank).unwrap_err();
        assert!(err.to_string().contains("line 18"));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut bank = default_bank();
        bank[1].id = ChannelId(1);
        assert!(ChannelRegistry::new(bank).is_err());
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let mut bank = default_bank();
        bank[2].key = "output_2".to_string();
        assert!(ChannelRegistry::new(bank).is_err());
    }

    #[test]
    fn grouped_output_is_rejected() {
        let mut bank = default_bank();
        bank[2].group = Some(GroupId::from("power"));
        assert!(ChannelRegistry::new(bank).is_err());
    }

    #[test]
    fn empty_bank_is_rejected() {
        assert!(ChannelRegistry::new(Vec::new()).is_err());
    }
}
