//! [`LineDriver`] – the boundary between the relay controller and the
//! digital output lines that energise each relay coil.
//!
//! The controller never talks to GPIO hardware directly.  It opens a driver
//! once at startup, receives a [`LineHandle`] proving the lines are claimed,
//! and from then on only ever writes or reads single line levels through
//! that handle.  Every driver call returns a [`LineError`] on failure and
//! every call site in the controller handles it.

use relaybank_types::{Level, Polarity};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Raw electrical level of a digital line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineLevel {
    Low,
    High,
}

impl LineLevel {
    /// The line level that puts a relay of the given polarity into `level`.
    ///
    /// For the default active-low boards `On` maps to `Low` and `Off` to
    /// `High`.
    pub fn for_level(level: Level, polarity: Polarity) -> Self {
        match (polarity, level) {
            (Polarity::ActiveLow, Level::On) | (Polarity::ActiveHigh, Level::Off) => LineLevel::Low,
            (Polarity::ActiveLow, Level::Off) | (Polarity::ActiveHigh, Level::On) => LineLevel::High,
        }
    }

    /// The logical relay level a line at `self` represents.
    pub fn to_level(self, polarity: Polarity) -> Level {
        match (polarity, self) {
            (Polarity::ActiveLow, LineLevel::Low) | (Polarity::ActiveHigh, LineLevel::High) => Level::On,
            (Polarity::ActiveLow, LineLevel::High) | (Polarity::ActiveHigh, LineLevel::Low) => Level::Off,
        }
    }

    /// `0` for low, `1` for high, as written to a GPIO value file.
    pub fn as_bit(self) -> u8 {
        match self {
            LineLevel::Low => 0,
            LineLevel::High => 1,
        }
    }
}

/// Errors reported by a [`LineDriver`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LineError {
    #[error("cannot open line driver: {0}")]
    Open(String),

    #[error("write to line {line} failed: {details}")]
    Write { line: u32, details: String },

    #[error("read from line {line} failed: {details}")]
    Read { line: u32, details: String },

    #[error("line {0} was not claimed by this handle")]
    Unclaimed(u32),

    #[error("handle is stale; the driver was closed or reopened")]
    StaleHandle,

    #[error("driver cannot read line levels back")]
    ReadbackUnsupported,
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Proof that a set of lines has been claimed as outputs.
///
/// Deliberately neither `Clone` nor `Copy`: [`LineDriver::close`] consumes the
/// handle so it can be released exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct LineHandle {
    token: u64,
    lines: Vec<u32>,
}

impl LineHandle {
    /// Issue a fresh handle for `lines`.  Called by driver implementations.
    pub fn issue(lines: impl IntoIterator<Item = u32>) -> Self {
        Self {
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            lines: lines.into_iter().collect(),
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn lines(&self) -> &[u32] {
        &self.lines
    }

    pub fn claims(&self, line: u32) -> bool {
        self.lines.contains(&line)
    }
}

/// A bank of binary output lines.
///
/// Implementations must be `Send` so the owning engine can live behind a
/// mutex shared by many request handlers.
pub trait LineDriver: Send {
    /// Short driver name for logs and the health probe, e.g. `"sim"`.
    fn name(&self) -> &str;

    /// Claim every line in `lines` as an output driven to its paired initial
    /// level.
    ///
    /// # Errors
    ///
    /// Returns [`LineError::Open`] if the chip or any line cannot be claimed.
    fn open(&mut self, lines: &[(u32, LineLevel)]) -> Result<LineHandle, LineError>;

    /// Drive a single claimed line.
    ///
    /// # Errors
    ///
    /// Returns [`LineError::Write`] on an I/O fault.
    fn write_line(&mut self, handle: &LineHandle, line: u32, level: LineLevel) -> Result<(), LineError>;

    /// Read the current level of a single claimed line.
    ///
    /// # Errors
    ///
    /// Returns [`LineError::Read`] on an I/O fault, or
    /// [`LineError::ReadbackUnsupported`] for write-only hardware.
    fn read_line(&mut self, handle: &LineHandle, line: u32) -> Result<LineLevel, LineError>;

    /// Release every line claimed by `handle`.  Never fails; problems are
    /// logged by the driver.
    fn close(&mut self, handle: LineHandle);

    /// Whether [`read_line`](LineDriver::read_line) reflects the real line
    /// level.  When `false` the controller tracks the last commanded levels
    /// itself.
    fn supports_readback(&self) -> bool {
        true
    }
}
