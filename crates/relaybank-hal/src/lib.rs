//! `relaybank-hal` – Hardware Abstraction Layer
//!
//! Everything that touches, or stands in for, the physical relay lines.
//!
//! # Modules
//!
//! - [`line`] – the [`LineDriver`] trait, raw [`LineLevel`]s and the
//!   active-low / active-high mapping to logical relay levels.
//! - [`registry`] – [`ChannelRegistry`]: the immutable, validated map from
//!   logical channels to line numbers, plus the reference [`default_bank`].
//! - [`reader`] – [`StateReader`]: builds a
//!   [`SystemSnapshot`][relaybank_types::SystemSnapshot] from line levels.
//! - [`sim`] – [`SimLineDriver`]: in-memory chip with a write journal and
//!   fault injection, for tests and headless runs.
//! - [`sysfs`] – [`SysfsLineDriver`]: Linux `/sys/class/gpio` backend.

pub mod line;
pub mod reader;
pub mod registry;
pub mod sim;
pub mod sysfs;

pub use line::{LineDriver, LineError, LineHandle, LineLevel};
pub use reader::StateReader;
pub use registry::{default_bank, ChannelRegistry};
pub use sim::{SimLineDriver, SimProbe, WriteRecord};
pub use sysfs::{SysfsLineDriver, DEFAULT_GPIO_ROOT};
