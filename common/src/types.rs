use serde::{Deserialize, Serialize};

use crate::job::JobSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    On,
    Off,
    Unknown,
}

impl RelayState {
    pub fn from_level(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerPhase {
    Off,
    PoweringOn,
    AwaitingConnection,
    On,
    CoolingDown,
}

impl PowerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::PoweringOn => "POWERING_ON",
            Self::AwaitingConnection => "AWAITING_CONNECTION",
            Self::On => "ON",
            Self::CoolingDown => "COOLING_DOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerPhase {
    #[default]
    Idle,
    Armed,
    Starting,
    Printing,
}

impl SchedulerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Armed => "ARMED",
            Self::Starting => "STARTING",
            Self::Printing => "PRINTING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PowerSnapshot {
    pub printer: RelayState,
    pub light: RelayState,
    pub phase: PowerPhase,
    #[serde(rename = "coolingDown")]
    pub cooling_down: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobView {
    pub file: String,
    pub placement: &'static str,
    /// Milliseconds since epoch.
    pub time: i64,
    #[serde(rename = "startTime")]
    pub start_time: i64,
    #[serde(rename = "turnOffAfterPrint")]
    pub turn_off_after_print: bool,
    pub state: &'static str,
}

impl JobView {
    pub fn new(job: &JobSpec, phase: SchedulerPhase) -> Self {
        Self {
            file: job.file_path().to_string(),
            placement: job.placement().as_str(),
            time: job.target_time().timestamp_millis(),
            start_time: job.start_time().timestamp_millis(),
            turn_off_after_print: job.turn_off_after(),
            state: phase.as_str(),
        }
    }
}

/// What the controller reports upward for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    pub printer: bool,
    pub light: bool,
    pub cooldown: bool,
    pub connected: bool,
    pub job: Option<JobView>,
}

impl ControllerStatus {
    pub fn new(power: PowerSnapshot, connected: bool, job: Option<JobView>) -> Self {
        Self {
            printer: power.printer.is_on(),
            light: power.light.is_on(),
            cooldown: power.cooling_down,
            connected,
            job,
        }
    }
}
