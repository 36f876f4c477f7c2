//! In-process line simulator for CI and development without a relay board.
//!
//! [`SimLineDriver`] keeps line levels in memory.  A cloneable [`SimProbe`]
//! shares the same state so tests can inspect a timestamped write journal
//! and inject faults after the driver has been boxed and handed to the
//! engine.  Nothing is journaled until a probe is taken, so a daemon running
//! on the simulator holds constant memory.
//!
//! # Example
//!
//! ```rust
//! use relaybank_hal::line::{LineDriver, LineLevel};
//! use relaybank_hal::sim::SimLineDriver;
//!
//! let mut driver = SimLineDriver::new();
//! let probe = driver.probe();
//! let handle = driver.open(&[(18, LineLevel::High)]).unwrap();
//!
//! driver.write_line(&handle, 18, LineLevel::Low).unwrap();
//! assert_eq!(probe.level(18), Some(LineLevel::Low));
//! assert_eq!(probe.journal().len(), 1);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::debug;

use crate::line::{LineDriver, LineError, LineHandle, LineLevel};

/// One journaled line write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub line: u32,
    pub level: LineLevel,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct SimState {
    open_token: Option<u64>,
    levels: HashMap<u32, LineLevel>,
    /// Writes are journaled only once a probe exists to read them.
    journaling: bool,
    journal: Vec<WriteRecord>,
    failing_writes: HashSet<u32>,
    failing_reads: HashSet<u32>,
    fail_open: bool,
    opens: usize,
    closes: usize,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ────────────────────────────────────────────────────────────────────────────
// Driver
// ────────────────────────────────────────────────────────────────────────────

/// Simulated GPIO chip.  Always succeeds unless a fault was injected.
#[derive(Debug)]
pub struct SimLineDriver {
    state: Arc<Mutex<SimState>>,
    readback: bool,
}

impl Default for SimLineDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimLineDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            readback: true,
        }
    }

    /// Model write-only hardware: [`read_line`](LineDriver::read_line)
    /// always fails with [`LineError::ReadbackUnsupported`].
    pub fn without_readback(mut self) -> Self {
        self.readback = false;
        self
    }

    /// A handle onto the simulator's shared state.  Write journaling starts
    /// with the first probe.
    pub fn probe(&self) -> SimProbe {
        lock(&self.state).journaling = true;
        SimProbe {
            state: Arc::clone(&self.state),
        }
    }

    fn check_handle(state: &SimState, handle: &LineHandle, line: u32) -> Result<(), LineError> {
        if state.open_token != Some(handle.token()) {
            return Err(LineError::StaleHandle);
        }
        if !handle.claims(line) {
            return Err(LineError::Unclaimed(line));
        }
        Ok(())
    }
}

impl LineDriver for SimLineDriver {
    fn name(&self) -> &str {
        "sim"
    }

    fn open(&mut self, lines: &[(u32, LineLevel)]) -> Result<LineHandle, LineError> {
        let mut state = lock(&self.state);
        if state.fail_open {
            return Err(LineError::Open("simulated chip unavailable".to_string()));
        }
        if state.open_token.is_some() {
            return Err(LineError::Open("chip is already open".to_string()));
        }
        for &(line, level) in lines {
            state.levels.insert(line, level);
        }
        let handle = LineHandle::issue(lines.iter().map(|&(line, _)| line));
        state.open_token = Some(handle.token());
        state.opens += 1;
        debug!(lines = lines.len(), "sim chip opened");
        Ok(handle)
    }

    fn write_line(&mut self, handle: &LineHandle, line: u32, level: LineLevel) -> Result<(), LineError> {
        let mut state = lock(&self.state);
        Self::check_handle(&state, handle, line)?;
        if state.failing_writes.contains(&line) {
            return Err(LineError::Write {
                line,
                details: "simulated write fault".to_string(),
            });
        }
        state.levels.insert(line, level);
        if state.journaling {
            state.journal.push(WriteRecord {
                line,
                level,
                at: Instant::now(),
            });
        }
        Ok(())
    }

    fn read_line(&mut self, handle: &LineHandle, line: u32) -> Result<LineLevel, LineError> {
        if !self.readback {
            return Err(LineError::ReadbackUnsupported);
        }
        let state = lock(&self.state);
        Self::check_handle(&state, handle, line)?;
        if state.failing_reads.contains(&line) {
            return Err(LineError::Read {
                line,
                details: "simulated read fault".to_string(),
            });
        }
        state.levels.get(&line).copied().ok_or(LineError::Unclaimed(line))
    }

    fn close(&mut self, handle: LineHandle) {
        let mut state = lock(&self.state);
        if state.open_token == Some(handle.token()) {
            state.open_token = None;
            state.closes += 1;
            debug!("sim chip closed");
        }
    }

    fn supports_readback(&self) -> bool {
        self.readback
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Probe
// ────────────────────────────────────────────────────────────────────────────

/// Test-side view of a [`SimLineDriver`].  Clones share the same state.
#[derive(Debug, Clone)]
pub struct SimProbe {
    state: Arc<Mutex<SimState>>,
}

impl SimProbe {
    /// Current level of `line`, if it was ever claimed or set.
    pub fn level(&self, line: u32) -> Option<LineLevel> {
        lock(&self.state).levels.get(&line).copied()
    }

    /// Force a line level from outside, as if the wiring changed under us.
    /// Not journaled.
    pub fn set_level(&self, line: u32, level: LineLevel) {
        lock(&self.state).levels.insert(line, level);
    }

    /// Every write since the last [`clear_journal`](Self::clear_journal), in
    /// order.
    pub fn journal(&self) -> Vec<WriteRecord> {
        lock(&self.state).journal.clone()
    }

    pub fn clear_journal(&self) {
        lock(&self.state).journal.clear();
    }

    /// Make every subsequent write to `line` fail.
    pub fn fail_writes(&self, line: u32) {
        lock(&self.state).failing_writes.insert(line);
    }

    /// Make every subsequent read of `line` fail.
    pub fn fail_reads(&self, line: u32) {
        lock(&self.state).failing_reads.insert(line);
    }

    /// Clear every injected read or write fault on `line`.
    pub fn heal(&self, line: u32) {
        let mut state = lock(&self.state);
        state.failing_writes.remove(&line);
        state.failing_reads.remove(&line);
    }

    /// Make the next [`open`](LineDriver::open) calls fail.
    pub fn fail_open(&self, fail: bool) {
        lock(&self.state).fail_open = fail;
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open_token.is_some()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_claims_initial_levels() {
        let mut driver = SimLineDriver::new();
        let probe = driver.probe();
        let _handle = driver
            .open(&[(18, LineLevel::High), (19, LineLevel::High)])
            .unwrap();
        assert!(probe.is_open());
        assert_eq!(probe.level(18), Some(LineLevel::High));
        assert!(probe.journal().is_empty());
    }

    #[test]
    fn second_open_is_rejected() {
        let mut driver = SimLineDriver::new();
        let _handle = driver.open(&[(18, LineLevel::High)]).unwrap();
        assert!(matches!(
            driver.open(&[(18, LineLevel::High)]),
            Err(LineError::Open(_))
        ));
    }

    #[test]
    fn writes_are_journaled_in_order() {
        let mut driver = SimLineDriver::new();
        let probe = driver.probe();
        let handle = driver
            .open(&[(18, LineLevel::High), (19, LineLevel::High)])
            .unwrap();

        driver.write_line(&handle, 19, LineLevel::High).unwrap();
        driver.write_line(&handle, 18, LineLevel::Low).unwrap();

        let journal = probe.journal();
        assert_eq!(journal.len(), 2);
        assert_eq!((journal[0].line, journal[0].level), (19, LineLevel::High));
        assert_eq!((journal[1].line, journal[1].level), (18, LineLevel::Low));
        assert!(journal[0].at <= journal[1].at);
    }

    #[test]
    fn writes_are_not_journaled_until_observed() {
        let mut driver = SimLineDriver::new();
        let handle = driver.open(&[(18, LineLevel::High)]).unwrap();
        for _ in 0..100 {
            driver.write_line(&handle, 18, LineLevel::Low).unwrap();
        }

        let probe = driver.probe();
        assert!(probe.journal().is_empty());
        assert_eq!(probe.level(18), Some(LineLevel::Low));

        driver.write_line(&handle, 18, LineLevel::High).unwrap();
        assert_eq!(probe.journal().len(), 1);
    }

    #[test]
    fn injected_write_fault_leaves_level_untouched() {
        let mut driver = SimLineDriver::new();
        let probe = driver.probe();
        let handle = driver.open(&[(20, LineLevel::High)]).unwrap();

        probe.fail_writes(20);
        assert!(matches!(
            driver.write_line(&handle, 20, LineLevel::Low),
            Err(LineError::Write { line: 20, .. })
        ));
        assert_eq!(probe.level(20), Some(LineLevel::High));

        probe.heal(20);
        driver.write_line(&handle, 20, LineLevel::Low).unwrap();
        assert_eq!(probe.level(20), Some(LineLevel::Low));
    }

    #[test]
    fn unclaimed_line_is_rejected() {
        let mut driver = SimLineDriver::new();
        let handle = driver.open(&[(18, LineLevel::High)]).unwrap();
        assert_eq!(
            driver.write_line(&handle, 42, LineLevel::Low),
            Err(LineError::Unclaimed(42))
        );
    }

    #[test]
    fn stale_handle_after_close() {
        let mut driver = SimLineDriver::new();
        let probe = driver.probe();
        let handle = driver.open(&[(18, LineLevel::High)]).unwrap();
        let other = LineHandle::issue([18]);
        driver.close(handle);

        assert!(!probe.is_open());
        assert_eq!(probe.close_count(), 1);
        assert_eq!(
            driver.write_line(&other, 18, LineLevel::Low),
            Err(LineError::StaleHandle)
        );
    }

    #[test]
    fn write_only_driver_refuses_reads() {
        let mut driver = SimLineDriver::new().without_readback();
        let handle = driver.open(&[(18, LineLevel::High)]).unwrap();
        assert!(!driver.supports_readback());
        assert_eq!(
            driver.read_line(&handle, 18),
            Err(LineError::ReadbackUnsupported)
        );
    }

    #[test]
    fn fail_open_is_reported() {
        let mut driver = SimLineDriver::new();
        let probe = driver.probe();
        probe.fail_open(true);
        assert!(matches!(driver.open(&[]), Err(LineError::Open(_))));
        assert_eq!(probe.open_count(), 0);
    }
}
