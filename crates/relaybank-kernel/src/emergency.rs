//! Emergency all-off.
//!
//! Writes the off level to every channel without consulting the interlock
//! policy; an off transition can never violate group exclusivity.  Each
//! channel is attempted independently so one stuck line never prevents the
//! rest from being released.  Callers must already hold exclusive access to
//! the driver.

use std::collections::HashMap;

use relaybank_hal::{ChannelRegistry, LineDriver, LineHandle, LineLevel};
use relaybank_types::{ChannelOutcome, Level, OffReport};
use tracing::{error, warn};

/// Force every channel of `registry` off.
///
/// A channel counts as confirmed when its write succeeded and, on drivers
/// with readback, the line reads back at the off level.  Successful writes
/// are recorded in `commanded`.
pub fn force_all_off(
    registry: &ChannelRegistry,
    driver: &mut dyn LineDriver,
    handle: &LineHandle,
    commanded: &mut HashMap<u32, LineLevel>,
) -> OffReport {
    let readback = driver.supports_readback();
    let mut outcomes = Vec::with_capacity(registry.all_channels().len());

    for ch in registry.all_channels() {
        let off = LineLevel::for_level(Level::Off, ch.polarity);
        let result = driver
            .write_line(handle, ch.line, off)
            .and_then(|()| {
                commanded.insert(ch.line, off);
                if readback {
                    driver.read_line(handle, ch.line).map(Some)
                } else {
                    Ok(None)
                }
            });

        let error = match result {
            Ok(None) => None,
            Ok(Some(level)) if level == off => None,
            Ok(Some(_)) => Some("line did not read back at the off level".to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = &error {
            error!(channel = %ch.id, line = ch.line, %reason, "channel failed to confirm off");
        }
        outcomes.push(ChannelOutcome {
            id: ch.id,
            key: ch.key.clone(),
            confirmed: error.is_none(),
            error,
        });
    }

    let report = OffReport { outcomes };
    if !report.all_confirmed() {
        warn!(failed = ?report.failed(), "all-off pass incomplete");
    }
    report
}
