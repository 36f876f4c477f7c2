//! [`SwitchEngine`] – the single owner of the relay hardware.
//!
//! The engine holds the [`LineDriver`] and its [`LineHandle`] behind one
//! mutex.  Every operation that touches the lines runs its whole
//! read-validate-write sequence inside that lock, so requests serialise and
//! no caller can observe or create a half-applied change.
//!
//! # Source changeover
//!
//! [`SwitchEngine::select_exclusive_source`] is break-before-make:
//!
//! 1. read the current state of the group;
//! 2. write off to every other member of the group;
//! 3. sleep for the settling interval (blocking, inside the lock);
//! 4. write on to the requested source.
//!
//! The settling interval is never skipped when a source is engaged.  A
//! failed write aborts the sequence and leaves the already-committed steps
//! in place; off writes are never rolled back.
//!
//! # Lifecycle
//!
//! ```text
//!   new ──▶ initialize ──▶ (operations) ──▶ shutdown
//!             │ claims every line at its off level
//!             └ forces all off; any failure closes the handle again
//! ```
//!
//! Before [`initialize`](SwitchEngine::initialize) and after
//! [`shutdown`](SwitchEngine::shutdown) every operation returns
//! [`RelayError::Uninitialized`].  Dropping an initialised engine forces all
//! channels off and releases the lines.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use relaybank_hal::{ChannelRegistry, LineDriver, LineHandle, LineLevel, StateReader};
use relaybank_types::{
    Channel, ChannelChange, ChannelId, ChannelState, GroupId, GroupStatus, Level, OffReport,
    RelayError, SystemSnapshot,
};
use tracing::{debug, error, info, instrument, warn};

use crate::emergency;
use crate::interlock::InterlockPolicy;

/// Default break-before-make settling interval.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(100);

// ────────────────────────────────────────────────────────────────────────────
// Hardware state guarded by the engine lock
// ────────────────────────────────────────────────────────────────────────────

struct Bank {
    driver: Box<dyn LineDriver>,
    handle: Option<LineHandle>,
    /// Last successfully written level per line.
    commanded: HashMap<u32, LineLevel>,
}

impl Bank {
    fn ensure_open(&self) -> Result<(), RelayError> {
        if self.handle.is_some() {
            Ok(())
        } else {
            Err(RelayError::Uninitialized)
        }
    }

    fn snapshot(&mut self, reader: StateReader<'_>) -> Result<SystemSnapshot, RelayError> {
        let handle = self.handle.as_ref().ok_or(RelayError::Uninitialized)?;
        if self.driver.supports_readback() {
            reader.current_state(self.driver.as_mut(), handle)
        } else {
            reader.from_commanded(&self.commanded)
        }
    }

    fn write(&mut self, channel: &Channel, level: Level) -> Result<(), RelayError> {
        let handle = self.handle.as_ref().ok_or(RelayError::Uninitialized)?;
        let raw = LineLevel::for_level(level, channel.polarity);
        self.driver
            .write_line(handle, channel.line, raw)
            .map_err(|e| RelayError::HardwareWrite {
                line: channel.line,
                details: e.to_string(),
            })?;
        self.commanded.insert(channel.line, raw);
        Ok(())
    }

    fn force_all_off(&mut self, registry: &ChannelRegistry) -> Result<OffReport, RelayError> {
        let handle = self.handle.as_ref().ok_or(RelayError::Uninitialized)?;
        Ok(emergency::force_all_off(
            registry,
            self.driver.as_mut(),
            handle,
            &mut self.commanded,
        ))
    }

    /// Force all off and release the lines.  Returns `None` if nothing was
    /// open.
    fn release(&mut self, registry: &ChannelRegistry) -> Option<OffReport> {
        let handle = self.handle.take()?;
        let report = emergency::force_all_off(
            registry,
            self.driver.as_mut(),
            &handle,
            &mut self.commanded,
        );
        self.driver.close(handle);
        self.commanded.clear();
        Some(report)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SwitchEngine
// ────────────────────────────────────────────────────────────────────────────

/// Relay switching and interlock engine.
///
/// Share it between request handlers behind an [`Arc`](std::sync::Arc); all
/// methods take `&self`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use relaybank_hal::{default_bank, ChannelRegistry, SimLineDriver};
/// use relaybank_kernel::SwitchEngine;
/// use relaybank_types::{ChannelId, GroupId, Level};
///
/// let registry = ChannelRegistry::new(default_bank()).unwrap();
/// let engine = SwitchEngine::new(registry, Box::new(SimLineDriver::new()))
///     .with_settle(Duration::from_millis(5));
/// engine.initialize().unwrap();
///
/// let power = GroupId::from("power");
/// engine.select_exclusive_source(&power, Some(ChannelId(1))).unwrap();
/// engine.select_exclusive_source(&power, Some(ChannelId(2))).unwrap();
///
/// let snap = engine.current_state().unwrap();
/// assert_eq!(snap.active_source(&power), Some(ChannelId(2)));
/// assert_eq!(snap.level(ChannelId(1)), Some(Level::Off));
/// ```
pub struct SwitchEngine {
    registry: ChannelRegistry,
    policy: InterlockPolicy,
    settle: Duration,
    driver_name: String,
    initialized: AtomicBool,
    bank: Mutex<Bank>,
}

impl SwitchEngine {
    /// Create an uninitialised engine owning `driver`.
    pub fn new(registry: ChannelRegistry, driver: Box<dyn LineDriver>) -> Self {
        Self {
            registry,
            policy: InterlockPolicy::standard(),
            settle: DEFAULT_SETTLE,
            driver_name: driver.name().to_string(),
            initialized: AtomicBool::new(false),
            bank: Mutex::new(Bank {
                driver,
                handle: None,
                commanded: HashMap::new(),
            }),
        }
    }

    /// Override the settling interval (builder-style).
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Replace the interlock policy (builder-style).
    pub fn with_policy(mut self, policy: InterlockPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn settle(&self) -> Duration {
        self.settle
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// Health probe.  Never blocks behind an in-flight switch.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn lock_bank(&self) -> MutexGuard<'_, Bank> {
        // A panic inside the lock cannot leave a torn snapshot behind: state
        // is re-read from the lines on every operation.
        self.bank.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reader(&self) -> StateReader<'_> {
        StateReader::new(&self.registry)
    }

    /// Claim every line at its off level and run a fail-safe all-off pass.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::HardwareInit`] when the driver cannot be opened,
    /// when the engine is already initialised, or when any channel fails to
    /// confirm off.  In the last case the lines are released again before
    /// returning.
    #[instrument(skip(self), fields(driver = %self.driver_name))]
    pub fn initialize(&self) -> Result<OffReport, RelayError> {
        let mut bank = self.lock_bank();
        if bank.handle.is_some() {
            return Err(RelayError::HardwareInit("already initialized".to_string()));
        }

        let claims: Vec<(u32, LineLevel)> = self
            .registry
            .all_channels()
            .iter()
            .map(|c| (c.line, LineLevel::for_level(Level::Off, c.polarity)))
            .collect();
        let handle = bank
            .driver
            .open(&claims)
            .map_err(|e| RelayError::HardwareInit(e.to_string()))?;
        bank.handle = Some(handle);
        bank.commanded = claims.into_iter().collect();

        let report = bank.force_all_off(&self.registry)?;
        if !report.all_confirmed() {
            let failed = report.failed();
            bank.release(&self.registry);
            error!(?failed, "initial all-off failed; hardware released");
            return Err(RelayError::HardwareInit(format!(
                "channels failed to confirm off: {}",
                failed
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        self.initialized.store(true, Ordering::Release);
        info!(channels = report.outcomes.len(), "relay bank initialized, all channels off");
        Ok(report)
    }

    /// Read the state of every channel.
    ///
    /// Takes the engine lock, so a status request issued during a changeover
    /// waits for it and never sees the settling window.
    ///
    /// # Errors
    ///
    /// [`RelayError::Uninitialized`] or [`RelayError::HardwareRead`].
    pub fn current_state(&self) -> Result<SystemSnapshot, RelayError> {
        let mut bank = self.lock_bank();
        bank.snapshot(self.reader())
    }

    /// Drive a single channel.
    ///
    /// Turning an input on is checked against the interlock policy first; a
    /// violation is returned without touching the hardware.  Off transitions
    /// and outputs need no current state and are written directly.
    ///
    /// # Errors
    ///
    /// [`RelayError::Uninitialized`], [`RelayError::Configuration`] for an
    /// unknown id, [`RelayError::InterlockViolation`],
    /// [`RelayError::HardwareRead`] or [`RelayError::HardwareWrite`].
    #[instrument(skip(self))]
    pub fn set_channel(&self, id: ChannelId, level: Level) -> Result<ChannelState, RelayError> {
        let mut bank = self.lock_bank();
        bank.ensure_open()?;
        let channel = self.registry.lookup(id)?;

        if channel.is_input() && level.is_on() {
            let snapshot = bank.snapshot(self.reader())?;
            let change = ChannelChange { channel: id, level };
            if let Err(violation) = self.policy.validate(&change, &snapshot) {
                warn!(key = %channel.key, error = %violation, "interlock rejected channel change");
                return Err(violation);
            }
        }

        if let Err(e) = bank.write(channel, level) {
            error!(key = %channel.key, error = %e, "channel write failed");
            return Err(e);
        }
        info!(key = %channel.key, %level, "channel switched");
        Ok(ChannelState::of(channel, level))
    }

    /// Break-before-make changeover of a mutual-exclusion group.
    ///
    /// `source = None` turns every source of the group off.  Selecting the
    /// source that is already the only one on is a no-op with no writes.
    ///
    /// # Errors
    ///
    /// [`RelayError::Uninitialized`], [`RelayError::Configuration`] for an
    /// unknown group or a source outside the group,
    /// [`RelayError::HardwareRead`], or [`RelayError::HardwareWrite`] when a
    /// step fails (earlier steps stay committed).
    #[instrument(skip(self, group), fields(group = %group))]
    pub fn select_exclusive_source(
        &self,
        group: &GroupId,
        source: Option<ChannelId>,
    ) -> Result<GroupStatus, RelayError> {
        let mut bank = self.lock_bank();
        bank.ensure_open()?;

        let members = self.registry.channels_in_group(group);
        if members.is_empty() {
            return Err(RelayError::Configuration(format!("unknown group '{group}'")));
        }
        let target = match source {
            Some(id) => Some(*members.iter().find(|c| c.id == id).ok_or_else(|| {
                RelayError::Configuration(format!("channel {id} is not a source in group '{group}'"))
            })?),
            None => None,
        };

        let snapshot = bank.snapshot(self.reader())?;
        let on: Vec<ChannelId> = snapshot.on_in_group(group).map(|c| c.id).collect();
        let unchanged = match target {
            Some(t) => on == [t.id],
            None => on.is_empty(),
        };
        if unchanged {
            debug!("requested source already selected");
            return Ok(GroupStatus {
                group: group.clone(),
                active: source,
            });
        }

        // Break.
        for ch in members.iter().filter(|c| Some(c.id) != source) {
            if let Err(e) = bank.write(ch, Level::Off) {
                error!(key = %ch.key, error = %e, "changeover aborted while releasing source");
                return Err(e);
            }
        }

        let Some(target) = target else {
            info!(previous = ?on, "all sources off");
            return Ok(GroupStatus {
                group: group.clone(),
                active: None,
            });
        };

        // Settle, then make.
        thread::sleep(self.settle);
        if let Err(e) = bank.write(target, Level::On) {
            error!(key = %target.key, error = %e, "changeover aborted while engaging source");
            return Err(e);
        }

        info!(previous = ?on, active = %target.key, "source changeover complete");
        Ok(GroupStatus {
            group: group.clone(),
            active: Some(target.id),
        })
    }

    /// Emergency all-off.  Bypasses the interlock policy and the settling
    /// interval; waits only for the lock.
    ///
    /// # Errors
    ///
    /// Only [`RelayError::Uninitialized`].  Per-channel failures are listed
    /// in the returned [`OffReport`].
    #[instrument(skip(self))]
    pub fn force_all_off(&self) -> Result<OffReport, RelayError> {
        let mut bank = self.lock_bank();
        let report = bank.force_all_off(&self.registry)?;
        if report.all_confirmed() {
            info!("emergency all-off complete");
        }
        Ok(report)
    }

    /// Force everything off and release the lines.  The engine is
    /// uninitialised afterwards.
    ///
    /// # Errors
    ///
    /// [`RelayError::Uninitialized`] if the lines were not held.
    #[instrument(skip(self))]
    pub fn shutdown(&self) -> Result<OffReport, RelayError> {
        let mut bank = self.lock_bank();
        self.initialized.store(false, Ordering::Release);
        let report = bank.release(&self.registry).ok_or(RelayError::Uninitialized)?;
        info!(confirmed = report.all_confirmed(), "relay bank released");
        Ok(report)
    }
}

impl Drop for SwitchEngine {
    fn drop(&mut self) {
        let bank = self.bank.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(report) = bank.release(&self.registry) {
            if !report.all_confirmed() {
                error!(failed = ?report.failed(), "channels left unconfirmed on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interlock::InterlockRule;
    use relaybank_hal::{default_bank, SimLineDriver, SimProbe, WriteRecord};
    use std::sync::Arc;
    use std::time::Instant;

    const SETTLE: Duration = Duration::from_millis(20);

    const AC: ChannelId = ChannelId(1);
    const BATTERY: ChannelId = ChannelId(2);
    const OUT1: ChannelId = ChannelId(3);
    const OUT2: ChannelId = ChannelId(4);

    // ------------------------------------------------------------------ helpers

    fn power() -> GroupId {
        GroupId::from("power")
    }

    fn uninitialized(driver: SimLineDriver) -> (SwitchEngine, SimProbe) {
        let probe = driver.probe();
        let registry = ChannelRegistry::new(default_bank()).unwrap();
        let engine = SwitchEngine::new(registry, Box::new(driver)).with_settle(SETTLE);
        (engine, probe)
    }

    fn engine() -> (SwitchEngine, SimProbe) {
        let (engine, probe) = uninitialized(SimLineDriver::new());
        engine.initialize().unwrap();
        probe.clear_journal();
        (engine, probe)
    }

    fn index_of(journal: &[WriteRecord], line: u32, level: LineLevel) -> usize {
        journal
            .iter()
            .position(|w| w.line == line && w.level == level)
            .unwrap_or_else(|| panic!("no write of {level:?} to line {line}"))
    }

    /// Replay the journal from an all-off start and assert the two power
    /// lines are never low at the same time.
    fn assert_never_dual_on(journal: &[WriteRecord]) {
        let mut ac = LineLevel::High;
        let mut battery = LineLevel::High;
        for w in journal {
            match w.line {
                18 => ac = w.level,
                19 => battery = w.level,
                _ => {}
            }
            assert!(
                !(ac == LineLevel::Low && battery == LineLevel::Low),
                "both power sources energised"
            );
        }
    }

    // ------------------------------------------------------------------ lifecycle

    #[test]
    fn operations_reject_before_initialize() {
        let (engine, probe) = uninitialized(SimLineDriver::new());
        assert!(!engine.is_initialized());
        assert_eq!(engine.current_state(), Err(RelayError::Uninitialized));
        assert_eq!(engine.set_channel(OUT1, Level::On), Err(RelayError::Uninitialized));
        assert_eq!(
            engine.select_exclusive_source(&power(), Some(AC)),
            Err(RelayError::Uninitialized)
        );
        assert_eq!(engine.force_all_off(), Err(RelayError::Uninitialized));
        assert!(probe.journal().is_empty());
    }

    #[test]
    fn initialize_claims_and_forces_all_off() {
        let (engine, probe) = uninitialized(SimLineDriver::new());
        let report = engine.initialize().unwrap();

        assert!(engine.is_initialized());
        assert!(report.all_confirmed());
        assert_eq!(probe.journal().len(), 4);
        assert!(engine.current_state().unwrap().all_off());
        assert_eq!(engine.driver_name(), "sim");
    }

    #[test]
    fn initialize_twice_is_rejected() {
        let (engine, _probe) = engine();
        assert!(matches!(engine.initialize(), Err(RelayError::HardwareInit(_))));
        assert!(engine.is_initialized());
    }

    #[test]
    fn initialize_open_failure_leaves_engine_uninitialized() {
        let driver = SimLineDriver::new();
        driver.probe().fail_open(true);
        let (engine, probe) = uninitialized(driver);

        assert!(matches!(engine.initialize(), Err(RelayError::HardwareInit(_))));
        assert!(!engine.is_initialized());
        assert!(!probe.is_open());
    }

    #[test]
    fn initialize_releases_lines_when_all_off_fails() {
        let driver = SimLineDriver::new();
        driver.probe().fail_writes(21);
        let (engine, probe) = uninitialized(driver);

        let err = engine.initialize().unwrap_err();
        assert!(err.to_string().contains('4'));
        assert!(!engine.is_initialized());
        assert!(!probe.is_open());
        assert_eq!(probe.close_count(), 1);

        probe.heal(21);
        engine.initialize().unwrap();
        assert!(engine.is_initialized());
    }

    #[test]
    fn shutdown_forces_off_and_releases_once() {
        let (engine, probe) = engine();
        engine.set_channel(OUT1, Level::On).unwrap();

        let report = engine.shutdown().unwrap();
        assert!(report.all_confirmed());
        assert_eq!(probe.level(20), Some(LineLevel::High));
        assert!(!probe.is_open());
        assert!(!engine.is_initialized());

        assert_eq!(engine.shutdown(), Err(RelayError::Uninitialized));
        assert_eq!(engine.current_state(), Err(RelayError::Uninitialized));
        assert_eq!(probe.close_count(), 1);
    }

    #[test]
    fn drop_releases_hardware() {
        let (engine, probe) = engine();
        engine.select_exclusive_source(&power(), Some(BATTERY)).unwrap();
        drop(engine);

        assert!(!probe.is_open());
        assert_eq!(probe.level(19), Some(LineLevel::High));
        assert_eq!(probe.close_count(), 1);
    }

    // ------------------------------------------------------------------ set_channel

    #[test]
    fn set_channel_round_trips_through_state() {
        let (engine, _probe) = engine();
        for id in [AC, BATTERY, OUT1, OUT2] {
            let confirmed = engine.set_channel(id, Level::On).unwrap();
            assert_eq!(confirmed.level, Level::On);
            assert_eq!(engine.current_state().unwrap().level(id), Some(Level::On));
            engine.set_channel(id, Level::Off).unwrap();
        }
    }

    #[test]
    fn set_channel_interlock_leaves_hardware_untouched() {
        let (engine, probe) = engine();
        engine.select_exclusive_source(&power(), Some(AC)).unwrap();
        let before = engine.current_state().unwrap();
        probe.clear_journal();

        let err = engine.set_channel(BATTERY, Level::On).unwrap_err();
        assert!(matches!(
            err,
            RelayError::InterlockViolation { channel, conflicting, .. }
                if channel == BATTERY && conflicting == AC
        ));
        assert!(probe.journal().is_empty());
        assert_eq!(engine.current_state().unwrap().channels, before.channels);
    }

    #[test]
    fn set_channel_off_is_never_interlocked() {
        let (engine, _probe) = engine();
        engine.set_channel(AC, Level::On).unwrap();
        engine.set_channel(BATTERY, Level::Off).unwrap();
        engine.set_channel(AC, Level::Off).unwrap();
        assert!(engine.current_state().unwrap().all_off());
    }

    #[test]
    fn set_channel_unknown_id() {
        let (engine, probe) = engine();
        assert!(matches!(
            engine.set_channel(ChannelId(42), Level::On),
            Err(RelayError::Configuration(_))
        ));
        assert!(probe.journal().is_empty());
    }

    #[test]
    fn set_channel_write_fault_is_reported() {
        let (engine, probe) = engine();
        probe.fail_writes(20);
        assert!(matches!(
            engine.set_channel(OUT1, Level::On),
            Err(RelayError::HardwareWrite { line: 20, .. })
        ));
        assert_eq!(engine.current_state().unwrap().level(OUT1), Some(Level::Off));
    }

    #[test]
    fn set_channel_read_fault_blocks_input_on() {
        let (engine, probe) = engine();
        probe.fail_reads(19);
        assert!(matches!(
            engine.set_channel(AC, Level::On),
            Err(RelayError::HardwareRead { line: 19, .. })
        ));
        assert!(probe.journal().is_empty());
        // Outputs don't need a snapshot.
        engine.set_channel(OUT2, Level::On).unwrap();
    }

    // ------------------------------------------------------------------ select_exclusive_source

    #[test]
    fn changeover_is_break_before_make_with_settling() {
        let (engine, probe) = engine();
        engine.select_exclusive_source(&power(), Some(AC)).unwrap();
        probe.clear_journal();

        let status = engine.select_exclusive_source(&power(), Some(BATTERY)).unwrap();
        assert_eq!(status.active, Some(BATTERY));

        let journal = probe.journal();
        let ac_off = index_of(&journal, 18, LineLevel::High);
        let battery_on = index_of(&journal, 19, LineLevel::Low);
        assert!(ac_off < battery_on);
        assert!(journal[battery_on].at.duration_since(journal[ac_off].at) >= SETTLE);
        assert_never_dual_on(&journal);
    }

    #[test]
    fn settling_applies_even_from_idle() {
        let (engine, _probe) = engine();
        let started = Instant::now();
        engine.select_exclusive_source(&power(), Some(AC)).unwrap();
        assert!(started.elapsed() >= SETTLE);
    }

    #[test]
    fn reselecting_active_source_is_a_no_op() {
        let (engine, probe) = engine();
        engine.select_exclusive_source(&power(), Some(AC)).unwrap();
        let before = engine.current_state().unwrap();
        probe.clear_journal();

        let started = Instant::now();
        let status = engine.select_exclusive_source(&power(), Some(AC)).unwrap();
        assert_eq!(status.active, Some(AC));
        assert!(probe.journal().is_empty());
        assert!(started.elapsed() < SETTLE);
        assert_eq!(engine.current_state().unwrap().channels, before.channels);
    }

    #[test]
    fn select_none_turns_group_off_without_touching_outputs() {
        let (engine, probe) = engine();
        engine.set_channel(OUT1, Level::On).unwrap();
        engine.select_exclusive_source(&power(), Some(BATTERY)).unwrap();

        let status = engine.select_exclusive_source(&power(), None).unwrap();
        assert_eq!(status.active, None);
        let snap = engine.current_state().unwrap();
        assert_eq!(snap.active_source(&power()), None);
        assert_eq!(snap.level(OUT1), Some(Level::On));

        probe.clear_journal();
        engine.select_exclusive_source(&power(), None).unwrap();
        assert!(probe.journal().is_empty());
    }

    #[test]
    fn select_repairs_a_dual_on_group() {
        let (engine, probe) = engine();
        engine.set_channel(AC, Level::On).unwrap();
        // Simulate a wiring fault energising the battery line too.
        probe.set_level(19, LineLevel::Low);

        engine.select_exclusive_source(&power(), Some(AC)).unwrap();
        let snap = engine.current_state().unwrap();
        assert_eq!(snap.level(AC), Some(Level::On));
        assert_eq!(snap.level(BATTERY), Some(Level::Off));
    }

    #[test]
    fn select_rejects_unknown_group_and_foreign_source() {
        let (engine, probe) = engine();
        assert!(matches!(
            engine.select_exclusive_source(&GroupId::from("solar"), Some(AC)),
            Err(RelayError::Configuration(_))
        ));
        assert!(matches!(
            engine.select_exclusive_source(&power(), Some(OUT1)),
            Err(RelayError::Configuration(_))
        ));
        assert!(probe.journal().is_empty());
    }

    #[test]
    fn select_read_fault_writes_nothing() {
        let (engine, probe) = engine();
        probe.fail_reads(18);
        assert!(matches!(
            engine.select_exclusive_source(&power(), Some(BATTERY)),
            Err(RelayError::HardwareRead { line: 18, .. })
        ));
        assert!(probe.journal().is_empty());
        assert_eq!(probe.level(19), Some(LineLevel::High));
    }

    #[test]
    fn fault_while_releasing_aborts_before_make() {
        let (engine, probe) = engine();
        engine.select_exclusive_source(&power(), Some(AC)).unwrap();
        probe.fail_writes(18);

        assert!(matches!(
            engine.select_exclusive_source(&power(), Some(BATTERY)),
            Err(RelayError::HardwareWrite { line: 18, .. })
        ));
        let snap = engine.current_state().unwrap();
        assert_eq!(snap.level(AC), Some(Level::On));
        assert_eq!(snap.level(BATTERY), Some(Level::Off));
    }

    #[test]
    fn fault_while_engaging_keeps_committed_release() {
        let (engine, probe) = engine();
        engine.select_exclusive_source(&power(), Some(AC)).unwrap();
        probe.fail_writes(19);

        assert!(matches!(
            engine.select_exclusive_source(&power(), Some(BATTERY)),
            Err(RelayError::HardwareWrite { line: 19, .. })
        ));
        let snap = engine.current_state().unwrap();
        assert_eq!(snap.level(AC), Some(Level::Off));
        assert_eq!(snap.level(BATTERY), Some(Level::Off));
    }

    // ------------------------------------------------------------------ force_all_off

    #[test]
    fn force_all_off_from_any_state() {
        let (engine, _probe) = engine();
        engine.select_exclusive_source(&power(), Some(AC)).unwrap();
        engine.set_channel(OUT1, Level::On).unwrap();
        engine.set_channel(OUT2, Level::On).unwrap();

        let report = engine.force_all_off().unwrap();
        assert!(report.all_confirmed());
        assert!(engine.current_state().unwrap().all_off());
    }

    #[test]
    fn force_all_off_attempts_every_channel_despite_faults() {
        let (engine, probe) = engine();
        engine.set_channel(OUT1, Level::On).unwrap();
        engine.set_channel(OUT2, Level::On).unwrap();
        probe.fail_writes(20);

        let report = engine.force_all_off().unwrap();
        assert_eq!(report.failed(), vec![OUT1]);
        let snap = engine.current_state().unwrap();
        assert_eq!(snap.level(OUT2), Some(Level::Off));
        assert_eq!(snap.level(AC), Some(Level::Off));
        assert_eq!(snap.level(BATTERY), Some(Level::Off));
    }

    // ------------------------------------------------------------------ readback-less hardware

    #[test]
    fn write_only_driver_tracks_commanded_levels() {
        let (engine, _probe) = uninitialized(SimLineDriver::new().without_readback());
        engine.initialize().unwrap();

        engine.select_exclusive_source(&power(), Some(AC)).unwrap();
        assert!(matches!(
            engine.set_channel(BATTERY, Level::On),
            Err(RelayError::InterlockViolation { .. })
        ));
        engine.select_exclusive_source(&power(), Some(BATTERY)).unwrap();

        let snap = engine.current_state().unwrap();
        assert_eq!(snap.active_source(&power()), Some(BATTERY));
        assert_eq!(snap.level(AC), Some(Level::Off));
    }

    // ------------------------------------------------------------------ scenario

    #[test]
    fn reference_bank_scenario() {
        let (engine, probe) = engine();
        assert!(engine.current_state().unwrap().all_off());

        engine.select_exclusive_source(&power(), Some(AC)).unwrap();
        let snap = engine.current_state().unwrap();
        assert_eq!(snap.level(AC), Some(Level::On));
        assert_eq!(snap.level(BATTERY), Some(Level::Off));
        assert_eq!(snap.active_source(&power()), Some(AC));

        engine.select_exclusive_source(&power(), Some(BATTERY)).unwrap();
        let snap = engine.current_state().unwrap();
        assert_eq!(snap.level(AC), Some(Level::Off));
        assert_eq!(snap.level(BATTERY), Some(Level::On));
        assert_eq!(snap.active_source(&power()), Some(BATTERY));

        engine.set_channel(OUT1, Level::On).unwrap();
        let snap = engine.current_state().unwrap();
        assert_eq!(snap.level(OUT1), Some(Level::On));
        assert_eq!(snap.level(OUT2), Some(Level::Off));
        assert_eq!(snap.level(BATTERY), Some(Level::On));

        engine.force_all_off().unwrap();
        assert!(engine.current_state().unwrap().all_off());
        assert_never_dual_on(&probe.journal());
    }

    // ------------------------------------------------------------------ policy

    struct BatteryLockedOut;

    impl InterlockRule for BatteryLockedOut {
        fn name(&self) -> &str {
            "battery_locked_out"
        }

        fn check(&self, change: &ChannelChange, _snapshot: &SystemSnapshot) -> Result<(), RelayError> {
            if change.channel == BATTERY && change.level.is_on() {
                return Err(RelayError::Configuration("battery is locked out".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn custom_policy_is_consulted_before_writes() {
        let (engine, probe) = uninitialized(SimLineDriver::new());
        let mut policy = InterlockPolicy::standard();
        policy.add_rule(Box::new(BatteryLockedOut));
        let engine = engine.with_policy(policy);
        engine.initialize().unwrap();
        probe.clear_journal();

        assert!(matches!(
            engine.set_channel(BATTERY, Level::On),
            Err(RelayError::Configuration(_))
        ));
        assert!(probe.journal().is_empty());

        engine.set_channel(AC, Level::On).unwrap();
        assert_eq!(engine.current_state().unwrap().level(AC), Some(Level::On));
    }

    // ------------------------------------------------------------------ concurrency

    #[test]
    fn emergency_off_queues_behind_an_in_flight_changeover() {
        let settle = Duration::from_millis(200);
        let driver = SimLineDriver::new();
        let probe = driver.probe();
        let registry = ChannelRegistry::new(default_bank()).unwrap();
        let engine = Arc::new(SwitchEngine::new(registry, Box::new(driver)).with_settle(settle));
        engine.initialize().unwrap();
        engine.set_channel(AC, Level::On).unwrap();
        probe.clear_journal();

        let changeover = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.select_exclusive_source(&GroupId::from("power"), Some(BATTERY)))
        };
        // The break write has landed: the changeover is now settling.
        while probe.journal().is_empty() {
            thread::sleep(Duration::from_millis(1));
        }

        // Health answers without waiting for the lock.
        let asked = Instant::now();
        assert!(engine.is_initialized());
        assert!(asked.elapsed() < settle / 4);

        let report = engine.force_all_off().unwrap();
        changeover.join().unwrap().unwrap();
        assert!(report.all_confirmed());

        let writes: Vec<(u32, LineLevel)> =
            probe.journal().iter().map(|w| (w.line, w.level)).collect();
        assert_eq!(
            writes,
            vec![
                (18, LineLevel::High),
                (19, LineLevel::Low),
                (18, LineLevel::High),
                (19, LineLevel::High),
                (20, LineLevel::High),
                (21, LineLevel::High),
            ]
        );
        assert!(engine.current_state().unwrap().all_off());
    }

    #[test]
    fn concurrent_changeovers_never_energise_both_sources() {
        let (engine, probe) = engine();
        let engine = Arc::new(engine);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    let source = if i % 2 == 0 { AC } else { BATTERY };
                    for _ in 0..3 {
                        engine
                            .select_exclusive_source(&GroupId::from("power"), Some(source))
                            .unwrap();
                        // Racing single-channel requests may be rejected but
                        // must never succeed in creating a dual-on state.
                        let other = if source == AC { BATTERY } else { AC };
                        let _ = engine.set_channel(other, Level::On);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_never_dual_on(&probe.journal());
        let snap = engine.current_state().unwrap();
        assert!(snap.on_in_group(&power()).count() <= 1);
    }
}
