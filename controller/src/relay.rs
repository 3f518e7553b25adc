use std::{
    collections::HashMap,
    fmt,
    ops::RangeInclusive,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineId(pub u32);

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gpio{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpioError {
    #[error("{0} does not resolve to a hardware line")]
    UnknownLine(LineId),
    #[error("{0} is already claimed")]
    Busy(LineId),
    #[error("{line}: {reason}")]
    Io { line: LineId, reason: String },
}

pub trait GpioBackend: Send + Sync {
    fn claim(&self, line: LineId) -> Result<(), GpioError>;
    fn get_output(&self, line: LineId) -> Result<bool, GpioError>;
    fn set_output(&self, line: LineId, on: bool) -> Result<(), GpioError>;
    fn release(&self, line: LineId);
}

/// Exclusive handle on one relay line. Dropping it releases the line.
pub struct RelayLine {
    line: LineId,
    backend: Arc<dyn GpioBackend>,
}

impl RelayLine {
    /// Claims `line`, reads the level it was left at and keeps driving that
    /// level as an output, so a restart does not glitch the relay.
    pub fn claim(backend: Arc<dyn GpioBackend>, line: LineId) -> Result<(Self, bool), GpioError> {
        backend.claim(line)?;
        let handle = Self { line, backend };
        let level = handle.backend.get_output(line)?;
        handle.drive(level)?;
        Ok((handle, level))
    }

    pub fn line(&self) -> LineId {
        self.line
    }

    pub fn drive(&self, on: bool) -> Result<(), GpioError> {
        self.backend.set_output(self.line, on)
    }
}

impl Drop for RelayLine {
    fn drop(&mut self) {
        self.backend.release(self.line);
    }
}

impl fmt::Debug for RelayLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayLine").field("line", &self.line).finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SimulatedLine {
    claimed: bool,
    level: bool,
}

/// In-memory GPIO bank used by the host build and tests.
pub struct SimulatedGpio {
    valid: RangeInclusive<u32>,
    lines: Mutex<HashMap<LineId, SimulatedLine>>,
}

impl Default for SimulatedGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedGpio {
    pub fn new() -> Self {
        Self {
            valid: 2..=27,
            lines: Mutex::new(HashMap::new()),
        }
    }

    /// Presets the level a line was left at, as after a process restart.
    pub fn preset_level(&self, line: LineId, on: bool) {
        self.lines().entry(line).or_default().level = on;
    }

    pub fn level(&self, line: LineId) -> Option<bool> {
        self.lines().get(&line).map(|state| state.level)
    }

    pub fn is_claimed(&self, line: LineId) -> bool {
        self.lines().get(&line).is_some_and(|state| state.claimed)
    }

    fn lines(&self) -> MutexGuard<'_, HashMap<LineId, SimulatedLine>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claimed_line<'a>(
        lines: &'a mut HashMap<LineId, SimulatedLine>,
        line: LineId,
    ) -> Result<&'a mut SimulatedLine, GpioError> {
        match lines.get_mut(&line) {
            Some(state) if state.claimed => Ok(state),
            _ => Err(GpioError::Io {
                line,
                reason: "line is not claimed".to_string(),
            }),
        }
    }
}

impl GpioBackend for SimulatedGpio {
    fn claim(&self, line: LineId) -> Result<(), GpioError> {
        if !self.valid.contains(&line.0) {
            return Err(GpioError::UnknownLine(line));
        }
        let mut lines = self.lines();
        let state = lines.entry(line).or_default();
        if state.claimed {
            return Err(GpioError::Busy(line));
        }
        state.claimed = true;
        Ok(())
    }

    fn get_output(&self, line: LineId) -> Result<bool, GpioError> {
        let mut lines = self.lines();
        Self::claimed_line(&mut lines, line).map(|state| state.level)
    }

    fn set_output(&self, line: LineId, on: bool) -> Result<(), GpioError> {
        let mut lines = self.lines();
        Self::claimed_line(&mut lines, line)?.level = on;
        Ok(())
    }

    fn release(&self, line: LineId) {
        if let Some(state) = self.lines().get_mut(&line) {
            state.claimed = false;
        }
    }
}
