use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    #[serde(rename = "start")]
    AtTime,
    #[serde(rename = "finish")]
    FinishBy,
    #[serde(rename = "asap")]
    Asap,
}

impl Placement {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AtTime => "start",
            Self::FinishBy => "finish",
            Self::Asap => "asap",
        }
    }
}

/// Everything a caller supplies to place a print job, minus the duration
/// estimate which comes from file metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub file: String,
    #[serde(rename = "startFinish")]
    pub placement: Placement,
    #[serde(rename = "time", with = "chrono::serde::ts_milliseconds")]
    pub target_time: DateTime<Utc>,
    #[serde(rename = "turnOffAfterPrint", default)]
    pub turn_off_after: bool,
    #[serde(rename = "startWithLights", default = "default_true")]
    pub start_with_lights: bool,
}

fn default_true() -> bool {
    true
}

/// Rejected because the computed start instant already lies in the past.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("print job would have had to start {} ago", render_deficit(.deficit))]
pub struct ScheduleTooEarly {
    pub deficit: Duration,
}

impl ScheduleTooEarly {
    pub fn deficit_seconds(&self) -> i64 {
        ceil_div(self.deficit.num_milliseconds().max(0), 1_000)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    file_path: String,
    placement: Placement,
    target_time: DateTime<Utc>,
    turn_off_after: bool,
    start_with_lights: bool,
    estimated_duration_secs: Option<u64>,
    start_time: DateTime<Utc>,
}

impl JobSpec {
    pub fn create(
        request: JobRequest,
        estimated_duration_secs: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleTooEarly> {
        let start_time = match request.placement {
            Placement::Asap => now,
            Placement::AtTime => request.target_time,
            Placement::FinishBy => request
                .target_time
                .checked_sub_signed(Duration::seconds(finish_by_offset_secs(
                    estimated_duration_secs,
                )))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        };

        if request.placement != Placement::Asap && start_time < now {
            return Err(ScheduleTooEarly {
                deficit: now - start_time,
            });
        }

        Ok(Self {
            file_path: request.file,
            placement: request.placement,
            target_time: request.target_time,
            turn_off_after: request.turn_off_after,
            start_with_lights: request.start_with_lights,
            estimated_duration_secs,
            start_time,
        })
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn target_time(&self) -> DateTime<Utc> {
        self.target_time
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn turn_off_after(&self) -> bool {
        self.turn_off_after
    }

    pub fn start_with_lights(&self) -> bool {
        self.start_with_lights
    }

    pub fn estimated_duration_secs(&self) -> Option<u64> {
        self.estimated_duration_secs
    }

    pub fn set_turn_off_after(&mut self, turn_off_after: bool) {
        self.turn_off_after = turn_off_after;
    }

    pub fn seconds_until_start(&self, now: DateTime<Utc>) -> f64 {
        if self.placement == Placement::Asap {
            return 0.0;
        }
        let remaining_ms = (self.start_time - now).num_milliseconds().max(0);
        remaining_ms as f64 / 1_000.0
    }

    pub fn time_until_start(&self, now: DateTime<Utc>) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.seconds_until_start(now))
    }
}

/// Seconds to pull a FinishBy start forward: the estimate rounded up to a
/// whole minute. An unknown estimate counts as zero.
pub fn finish_by_offset_secs(estimated_duration_secs: Option<u64>) -> i64 {
    let rounded = estimated_duration_secs
        .unwrap_or(0)
        .min(u64::MAX / 4_000)
        .div_ceil(60)
        * 60;
    rounded as i64
}

fn render_deficit(deficit: &Duration) -> String {
    let minutes = ceil_div(deficit.num_milliseconds().max(0), 60_000);

    if minutes < 120 {
        if minutes == 1 {
            "1 minute".to_string()
        } else {
            format!("{minutes} minutes")
        }
    } else if minutes < 1_440 {
        format!("{} hours", ceil_div(minutes, 60))
    } else {
        let tenths = ceil_div(minutes * 10, 1_440);
        format!("{}.{} days", tenths / 10, tenths % 10)
    }
}

fn ceil_div(value: i64, divisor: i64) -> i64 {
    (value + divisor - 1) / divisor
}
