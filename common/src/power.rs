use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    config::{ConfigError, SettingValue},
    types::{PowerPhase, PowerSnapshot, RelayState},
};

/// Seconds between temperature checks while a shutdown waits for the nozzle.
pub const TEMP_WAIT_CYCLE_SECS: u64 = 5;

const DEFAULT_STARTUP_TIME_SECS: u32 = 5;
const DEFAULT_COOLDOWN_THRESHOLD_C: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relay {
    Printer,
    Light,
}

impl Relay {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Printer => "printer",
            Self::Light => "light",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    SetRelay(Relay, bool),
    ArmStartupDelay(u64),
    CancelStartupDelay,
    Connect,
    Disconnect,
    AwaitClosed,
    CutPower,
    ArmCooldownRetry(u64),
    CancelCooldownRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelTemperature {
    pub actual: Option<f64>,
    pub target: Option<f64>,
}

pub type TemperatureSnapshot = BTreeMap<String, ChannelTemperature>;

pub fn is_tool_channel(name: &str) -> bool {
    name.to_ascii_lowercase().contains("tool")
}

/// True when every tool channel reports a reading at or below `threshold_c`.
/// A tool without a reading is treated as hot.
pub fn tools_cooled(temperatures: &TemperatureSnapshot, threshold_c: f64) -> bool {
    temperatures
        .iter()
        .filter(|(name, _)| is_tool_channel(name))
        .all(|(_, channel)| matches!(channel.actual, Some(actual) if actual <= threshold_c))
}

pub fn hottest_tool(temperatures: &TemperatureSnapshot) -> Option<(&str, f64)> {
    temperatures
        .iter()
        .filter(|(name, _)| is_tool_channel(name))
        .filter_map(|(name, channel)| channel.actual.map(|actual| (name.as_str(), actual)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// Relay and power-sequencing state. Every transition returns the ordered
/// side effects the caller has to carry out.
#[derive(Debug, Clone)]
pub struct PowerEngine {
    printer: RelayState,
    light: RelayState,
    phase: PowerPhase,
    cooldown_pending: bool,
    power_cut_pending: bool,
    startup_time_secs: u32,
    cooldown_threshold_c: u32,
}

impl Default for PowerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerEngine {
    pub fn new() -> Self {
        Self {
            printer: RelayState::Unknown,
            light: RelayState::Unknown,
            phase: PowerPhase::Off,
            cooldown_pending: false,
            power_cut_pending: false,
            startup_time_secs: DEFAULT_STARTUP_TIME_SECS,
            cooldown_threshold_c: DEFAULT_COOLDOWN_THRESHOLD_C,
        }
    }

    pub fn snapshot(&self) -> PowerSnapshot {
        PowerSnapshot {
            printer: self.printer,
            light: self.light,
            phase: self.phase,
            cooling_down: self.cooldown_pending,
        }
    }

    pub fn phase(&self) -> PowerPhase {
        self.phase
    }

    pub fn relay(&self, relay: Relay) -> RelayState {
        match relay {
            Relay::Printer => self.printer,
            Relay::Light => self.light,
        }
    }

    pub fn is_cooling_down(&self) -> bool {
        self.cooldown_pending
    }

    pub fn startup_time_secs(&self) -> u32 {
        self.startup_time_secs
    }

    pub fn cooldown_threshold_c(&self) -> u32 {
        self.cooldown_threshold_c
    }

    pub fn set_startup_time(&mut self, value: &SettingValue) -> Result<bool, ConfigError> {
        let secs = value.positive_integer("printer.startupTime")?;
        let changed = secs != self.startup_time_secs;
        self.startup_time_secs = secs;
        Ok(changed)
    }

    pub fn set_cooldown_threshold(&mut self, value: &SettingValue) -> Result<bool, ConfigError> {
        let celsius = value.positive_integer("nozzle.cooldownTemp")?;
        let changed = celsius != self.cooldown_threshold_c;
        self.cooldown_threshold_c = celsius;
        Ok(changed)
    }

    /// Seeds tracked state from the level a freshly claimed line was left at.
    pub fn relay_claimed(&mut self, relay: Relay, level: bool) {
        match relay {
            Relay::Printer => {
                self.printer = RelayState::from_level(level);
                if matches!(self.phase, PowerPhase::Off | PowerPhase::On) {
                    self.phase = if level { PowerPhase::On } else { PowerPhase::Off };
                }
            }
            Relay::Light => self.light = RelayState::from_level(level),
        }
    }

    pub fn relay_released(&mut self, relay: Relay) {
        match relay {
            Relay::Printer => self.printer = RelayState::Unknown,
            Relay::Light => self.light = RelayState::Unknown,
        }
    }

    pub fn start_up(&mut self, lights_on: bool) -> Vec<PowerAction> {
        let mut actions = Vec::new();

        if self.cooldown_pending {
            self.cooldown_pending = false;
            actions.push(PowerAction::CancelCooldownRetry);
        }
        self.power_cut_pending = false;

        self.drive(Relay::Printer, true, &mut actions);
        if lights_on {
            self.drive(Relay::Light, true, &mut actions);
        }

        self.phase = PowerPhase::PoweringOn;
        actions.push(PowerAction::ArmStartupDelay(u64::from(
            self.startup_time_secs,
        )));
        actions
    }

    pub fn startup_elapsed(&mut self) -> Vec<PowerAction> {
        if self.phase != PowerPhase::PoweringOn {
            return Vec::new();
        }
        self.phase = PowerPhase::AwaitingConnection;
        vec![PowerAction::Connect]
    }

    pub fn connection_confirmed(&mut self) {
        if matches!(
            self.phase,
            PowerPhase::PoweringOn | PowerPhase::AwaitingConnection
        ) {
            self.phase = PowerPhase::On;
        }
    }

    pub fn shut_down(&mut self, temperatures: &TemperatureSnapshot) -> Vec<PowerAction> {
        let mut actions = Vec::new();

        if self.phase == PowerPhase::PoweringOn {
            actions.push(PowerAction::CancelStartupDelay);
            self.phase = PowerPhase::On;
        }

        if tools_cooled(temperatures, f64::from(self.cooldown_threshold_c)) {
            self.cooldown_pending = false;
            self.power_cut_pending = true;
            actions.extend([
                PowerAction::Disconnect,
                PowerAction::AwaitClosed,
                PowerAction::CutPower,
            ]);
        } else {
            self.cooldown_pending = true;
            self.phase = PowerPhase::CoolingDown;
            actions.push(PowerAction::ArmCooldownRetry(TEMP_WAIT_CYCLE_SECS));
        }

        actions
    }

    /// Retry tick of a shutdown waiting on the nozzle. Does nothing once the
    /// wait was cancelled.
    pub fn cooldown_elapsed(&mut self, temperatures: &TemperatureSnapshot) -> Vec<PowerAction> {
        if !self.cooldown_pending {
            return Vec::new();
        }
        self.shut_down(temperatures)
    }

    /// True while a shutdown is waiting on the nozzle or on its power cut.
    pub fn is_shutting_down(&self) -> bool {
        self.cooldown_pending || self.power_cut_pending
    }

    /// Stops any shutdown in flight, including one already past the
    /// temperature gate whose power cut has not run yet.
    pub fn cancel_shut_down(&mut self) -> Vec<PowerAction> {
        self.power_cut_pending = false;
        if !self.cooldown_pending {
            return Vec::new();
        }
        self.cooldown_pending = false;
        self.phase = if self.printer == RelayState::Off {
            PowerPhase::Off
        } else {
            PowerPhase::On
        };
        vec![PowerAction::CancelCooldownRetry]
    }

    pub fn cut_power(&mut self) -> Vec<PowerAction> {
        if !self.power_cut_pending {
            return Vec::new();
        }
        self.power_cut_pending = false;

        let mut actions = Vec::new();
        self.drive(Relay::Printer, false, &mut actions);
        self.drive(Relay::Light, false, &mut actions);
        self.phase = PowerPhase::Off;
        actions
    }

    pub fn toggle_light(&mut self) -> Vec<PowerAction> {
        let mut actions = Vec::new();
        let on = !self.light.is_on();
        self.drive(Relay::Light, on, &mut actions);
        actions
    }

    fn drive(&mut self, relay: Relay, on: bool, actions: &mut Vec<PowerAction>) {
        let state = match relay {
            Relay::Printer => &mut self.printer,
            Relay::Light => &mut self.light,
        };

        // Unassigned lines stay untouched until a claim succeeds.
        if *state == RelayState::Unknown {
            return;
        }
        *state = RelayState::from_level(on);
        actions.push(PowerAction::SetRelay(relay, on));
    }
}
