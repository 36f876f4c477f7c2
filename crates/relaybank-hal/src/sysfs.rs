//! [`SysfsLineDriver`] – drives relay lines through the Linux sysfs GPIO
//! interface (`/sys/class/gpio`).
//!
//! Lines are exported on [`open`](LineDriver::open) and configured as outputs
//! by writing `high` or `low` to their `direction` file, which sets the
//! direction and the initial value in one step so the relay never glitches
//! on.  [`close`](LineDriver::close) unexports them again.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::line::{LineDriver, LineError, LineHandle, LineLevel};

/// Default sysfs GPIO root.
pub const DEFAULT_GPIO_ROOT: &str = "/sys/class/gpio";

/// GPIO driver backed by sysfs files.
#[derive(Debug)]
pub struct SysfsLineDriver {
    root: PathBuf,
    open_token: Option<u64>,
}

impl SysfsLineDriver {
    /// Driver rooted at `root` (normally [`DEFAULT_GPIO_ROOT`]).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open_token: None,
        }
    }

    fn line_dir(&self, line: u32) -> PathBuf {
        self.root.join(format!("gpio{line}"))
    }

    fn check_handle(&self, handle: &LineHandle, line: u32) -> Result<(), LineError> {
        if self.open_token != Some(handle.token()) {
            return Err(LineError::StaleHandle);
        }
        if !handle.claims(line) {
            return Err(LineError::Unclaimed(line));
        }
        Ok(())
    }

    fn claim(&self, line: u32, initial: LineLevel) -> Result<(), LineError> {
        let dir = self.line_dir(line);
        if !dir.exists() {
            fs::write(self.root.join("export"), line.to_string())
                .map_err(|e| LineError::Open(format!("export of line {line} failed: {e}")))?;
        }
        let direction = match initial {
            LineLevel::Low => "low",
            LineLevel::High => "high",
        };
        fs::write(dir.join("direction"), direction)
            .map_err(|e| LineError::Open(format!("cannot configure line {line} as output: {e}")))
    }

    fn release(&self, line: u32) {
        if let Err(e) = fs::write(self.root.join("unexport"), line.to_string()) {
            warn!(line, error = %e, "failed to unexport GPIO line");
        }
    }
}

impl Default for SysfsLineDriver {
    fn default() -> Self {
        Self::new(DEFAULT_GPIO_ROOT)
    }
}

impl LineDriver for SysfsLineDriver {
    fn name(&self) -> &str {
        "sysfs"
    }

    fn open(&mut self, lines: &[(u32, LineLevel)]) -> Result<LineHandle, LineError> {
        if self.open_token.is_some() {
            return Err(LineError::Open("GPIO lines are already claimed".to_string()));
        }
        for (idx, &(line, initial)) in lines.iter().enumerate() {
            if let Err(e) = self.claim(line, initial) {
                // Release what was claimed so far before reporting.
                for &(claimed, _) in &lines[..idx] {
                    self.release(claimed);
                }
                return Err(e);
            }
        }
        let handle = LineHandle::issue(lines.iter().map(|&(line, _)| line));
        self.open_token = Some(handle.token());
        debug!(root = %self.root.display(), lines = lines.len(), "sysfs GPIO lines claimed");
        Ok(handle)
    }

    fn write_line(&mut self, handle: &LineHandle, line: u32, level: LineLevel) -> Result<(), LineError> {
        self.check_handle(handle, line)?;
        fs::write(self.line_dir(line).join("value"), level.as_bit().to_string()).map_err(|e| {
            LineError::Write {
                line,
                details: e.to_string(),
            }
        })
    }

    fn read_line(&mut self, handle: &LineHandle, line: u32) -> Result<LineLevel, LineError> {
        self.check_handle(handle, line)?;
        let raw = fs::read_to_string(self.line_dir(line).join("value")).map_err(|e| {
            LineError::Read {
                line,
                details: e.to_string(),
            }
        })?;
        match raw.trim() {
            "0" => Ok(LineLevel::Low),
            "1" => Ok(LineLevel::High),
            other => Err(LineError::Read {
                line,
                details: format!("unexpected value '{other}'"),
            }),
        }
    }

    fn close(&mut self, handle: LineHandle) {
        if self.open_token != Some(handle.token()) {
            return;
        }
        for &line in handle.lines() {
            self.release(line);
        }
        self.open_token = None;
        debug!("sysfs GPIO lines released");
    }
}
