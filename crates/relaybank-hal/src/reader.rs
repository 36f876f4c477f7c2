//! [`StateReader`] – derives logical relay state from physical line levels.
//!
//! The reader never mutates hardware.  A failed read surfaces as
//! [`RelayError::HardwareRead`]; it is never replaced with a guessed level.

use std::collections::HashMap;

use relaybank_types::{ChannelState, RelayError, SystemSnapshot};

use crate::line::{LineDriver, LineHandle, LineLevel};
use crate::registry::ChannelRegistry;

/// Builds [`SystemSnapshot`]s for the channels of a [`ChannelRegistry`].
#[derive(Debug, Clone, Copy)]
pub struct StateReader<'a> {
    registry: &'a ChannelRegistry,
}

impl<'a> StateReader<'a> {
    pub fn new(registry: &'a ChannelRegistry) -> Self {
        Self { registry }
    }

    /// Read every channel's line through `driver`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::HardwareRead`] for the first line that cannot be
    /// read.
    pub fn current_state(
        &self,
        driver: &mut dyn LineDriver,
        handle: &LineHandle,
    ) -> Result<SystemSnapshot, RelayError> {
        let mut states = Vec::with_capacity(self.registry.all_channels().len());
        for ch in self.registry.all_channels() {
            let raw = driver
                .read_line(handle, ch.line)
                .map_err(|e| RelayError::HardwareRead {
                    line: ch.line,
                    details: e.to_string(),
                })?;
            states.push(ChannelState::of(ch, raw.to_level(ch.polarity)));
        }
        Ok(SystemSnapshot::new(states))
    }

    /// Build a snapshot from the last commanded line levels, for drivers that
    /// cannot read back.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::HardwareRead`] if a line was never commanded.
    pub fn from_commanded(
        &self,
        commanded: &HashMap<u32, LineLevel>,
    ) -> Result<SystemSnapshot, RelayError> {
        let mut states = Vec::with_capacity(self.registry.all_channels().len());
        for ch in self.registry.all_channels() {
            let raw = commanded
                .get(&ch.line)
                .copied()
                .ok_or_else(|| RelayError::HardwareRead {
                    line: ch.line,
                    details: "no commanded level recorded".to_string(),
                })?;
            states.push(ChannelState::of(ch, raw.to_level(ch.polarity)));
        }
        Ok(SystemSnapshot::new(states))
    }
}
