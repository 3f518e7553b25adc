pub mod config;
pub mod job;
pub mod power;
pub mod scheduler;
pub mod types;

pub use config::{AutoprintSettings, ConfigError, PollConfig, RuntimeConfig, SettingValue};
pub use job::{JobRequest, JobSpec, Placement, ScheduleTooEarly};
pub use power::{
    ChannelTemperature, PowerAction, PowerEngine, Relay, TemperatureSnapshot,
    TEMP_WAIT_CYCLE_SECS,
};
pub use scheduler::JobSlot;
pub use types::{
    ControllerStatus, JobView, PowerPhase, PowerSnapshot, RelayState, SchedulerPhase,
};
