use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use autoprint_common::{
    power::hottest_tool, AutoprintSettings, PollConfig, PowerAction, PowerEngine, PowerSnapshot,
    Relay, RelayState, SettingValue, TemperatureSnapshot,
};

use crate::{
    printer::{poll_until, PrinterInterface, Readiness},
    relay::{GpioBackend, LineId, RelayLine},
    timer::DelayedTask,
};

type ReadyContinuation = Pin<Box<dyn Future<Output = ()> + Send>>;

struct PowerState {
    engine: PowerEngine,
    printer_line: Option<RelayLine>,
    light_line: Option<RelayLine>,
    startup_timer: DelayedTask,
    cooldown_timer: DelayedTask,
    pending_ready: Vec<ReadyContinuation>,
}

impl PowerState {
    fn line(&self, relay: Relay) -> Option<&RelayLine> {
        match relay {
            Relay::Printer => self.printer_line.as_ref(),
            Relay::Light => self.light_line.as_ref(),
        }
    }

    fn line_mut(&mut self, relay: Relay) -> &mut Option<RelayLine> {
        match relay {
            Relay::Printer => &mut self.printer_line,
            Relay::Light => &mut self.light_line,
        }
    }
}

struct Inner {
    state: Mutex<PowerState>,
    printer: Arc<dyn PrinterInterface>,
    gpio: Arc<dyn GpioBackend>,
    polling: PollConfig,
}

/// Owns the printer and light relays and sequences power on and off against
/// the printer link and nozzle temperature.
#[derive(Clone)]
pub struct PowerController {
    inner: Arc<Inner>,
}

impl PowerController {
    pub fn new(
        printer: Arc<dyn PrinterInterface>,
        gpio: Arc<dyn GpioBackend>,
        polling: PollConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(PowerState {
                    engine: PowerEngine::new(),
                    printer_line: None,
                    light_line: None,
                    startup_timer: DelayedTask::new("startup"),
                    cooldown_timer: DelayedTask::new("cooldown"),
                    pending_ready: Vec::new(),
                }),
                printer,
                gpio,
                polling,
            }),
        }
    }

    pub async fn snapshot(&self) -> PowerSnapshot {
        self.inner.state.lock().await.engine.snapshot()
    }

    pub async fn is_cooling_down(&self) -> bool {
        self.inner.state.lock().await.engine.is_cooling_down()
    }

    /// Switches the printer (and optionally the light) on, then connects once
    /// the boot delay has passed and runs `on_ready`. Whether the link really
    /// came up is for `on_ready` to find out.
    pub async fn start_up<F>(&self, on_ready: F, lights_on: bool)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.inner.state.lock().await;
        state.pending_ready.push(Box::pin(on_ready));

        let actions = state.engine.start_up(lights_on);
        info!(
            lights_on,
            delay_secs = state.engine.startup_time_secs(),
            "powering printer on"
        );
        let deferred = self.apply_locked(&mut state, actions);
        debug_assert!(deferred.is_empty());
    }

    /// Powers down once every tool is at or below the cooldown threshold,
    /// re-checking on a fixed cadence until then.
    pub async fn shut_down(&self) {
        let temperatures = self.inner.printer.current_temperatures();
        let deferred = {
            let mut state = self.inner.state.lock().await;
            let actions = state.engine.shut_down(&temperatures);
            log_shutdown_gate(&state.engine, &temperatures);
            self.apply_locked(&mut state, actions)
        };
        self.run_deferred(deferred).await;
    }

    pub async fn cancel_shut_down(&self) {
        let mut state = self.inner.state.lock().await;
        if !state.engine.is_shutting_down() {
            return;
        }
        let actions = state.engine.cancel_shut_down();
        info!("shutdown cancelled, printer stays on");
        let deferred = self.apply_locked(&mut state, actions);
        debug_assert!(deferred.is_empty());
    }

    pub async fn toggle_light(&self) {
        let mut state = self.inner.state.lock().await;
        let actions = state.engine.toggle_light();
        if actions.is_empty() {
            warn!("light relay has no line assigned");
            return;
        }
        let deferred = self.apply_locked(&mut state, actions);
        debug_assert!(deferred.is_empty());
    }

    /// Records that the printer link was observed operational.
    pub async fn confirm_connected(&self) {
        self.inner.state.lock().await.engine.connection_confirmed();
    }

    pub async fn set_startup_time(&self, value: &SettingValue) {
        let mut state = self.inner.state.lock().await;
        match state.engine.set_startup_time(value) {
            Ok(true) => info!(secs = state.engine.startup_time_secs(), "startup time updated"),
            Ok(false) => {}
            Err(err) => warn!(
                "{err}; keeping startup time at {}s",
                state.engine.startup_time_secs()
            ),
        }
    }

    pub async fn set_cooldown_threshold(&self, value: &SettingValue) {
        let mut state = self.inner.state.lock().await;
        match state.engine.set_cooldown_threshold(value) {
            Ok(true) => info!(
                celsius = state.engine.cooldown_threshold_c(),
                "cooldown threshold updated"
            ),
            Ok(false) => {}
            Err(err) => warn!(
                "{err}; keeping cooldown threshold at {}C",
                state.engine.cooldown_threshold_c()
            ),
        }
    }

    /// Moves `relay` to the line named by `value`. The previous line is
    /// released before the new one is claimed; a line that cannot be claimed
    /// leaves the relay unassigned.
    pub async fn assign_line(&self, relay: Relay, value: &SettingValue) {
        let field = match relay {
            Relay::Printer => "gpio.printer",
            Relay::Light => "gpio.light",
        };
        let line = match value.positive_integer(field) {
            Ok(number) => LineId(number),
            Err(err) => {
                warn!("{err}; keeping current {} line", relay.as_str());
                return;
            }
        };

        let mut state = self.inner.state.lock().await;
        if state.line(relay).is_some_and(|handle| handle.line() == line) {
            return;
        }

        if let Some(previous) = state.line_mut(relay).take() {
            debug!(relay = relay.as_str(), line = %previous.line(), "releasing relay line");
            drop(previous);
            state.engine.relay_released(relay);
        }

        match RelayLine::claim(Arc::clone(&self.inner.gpio), line) {
            Ok((handle, level)) => {
                state.engine.relay_claimed(relay, level);
                *state.line_mut(relay) = Some(handle);
                info!(
                    relay = relay.as_str(),
                    %line,
                    state = RelayState::from_level(level).as_str(),
                    "relay line claimed"
                );
            }
            Err(err) => error!(relay = relay.as_str(), "relay line unavailable: {err}"),
        }
    }

    pub async fn apply_settings(&self, settings: &AutoprintSettings) {
        self.assign_line(Relay::Printer, &settings.gpio.printer).await;
        self.assign_line(Relay::Light, &settings.gpio.light).await;
        self.set_startup_time(&settings.printer.startup_time).await;
        self.set_cooldown_threshold(&settings.nozzle.cooldown_temp).await;
    }

    /// Gives both lines back to the GPIO backend, leaving their levels as is.
    pub async fn release_lines(&self) {
        let mut state = self.inner.state.lock().await;
        for relay in [Relay::Printer, Relay::Light] {
            if state.line_mut(relay).take().is_some() {
                state.engine.relay_released(relay);
                debug!(relay = relay.as_str(), "relay line released");
            }
        }
    }

    /// Carries out everything that is safe under the state lock and hands
    /// back the printer-side actions, which must run after it is released.
    fn apply_locked(&self, state: &mut PowerState, actions: Vec<PowerAction>) -> Vec<PowerAction> {
        let mut deferred = Vec::new();

        for action in actions {
            match action {
                PowerAction::SetRelay(relay, on) => {
                    let Some(handle) = state.line(relay) else {
                        continue;
                    };
                    match handle.drive(on) {
                        Ok(()) => info!(
                            relay = relay.as_str(),
                            state = RelayState::from_level(on).as_str(),
                            "relay switched"
                        ),
                        Err(err) => error!(relay = relay.as_str(), "relay write failed: {err}"),
                    }
                }
                PowerAction::ArmStartupDelay(secs) => {
                    let this = self.clone();
                    state
                        .startup_timer
                        .arm(Duration::from_secs(secs), move |generation| async move {
                            this.on_startup_elapsed(generation).await;
                        });
                }
                PowerAction::CancelStartupDelay => {
                    state.startup_timer.cancel();
                    // Callers waiting on readiness still get to observe the link.
                    for continuation in state.pending_ready.drain(..) {
                        tokio::spawn(continuation);
                    }
                }
                PowerAction::ArmCooldownRetry(secs) => {
                    let this = self.clone();
                    state
                        .cooldown_timer
                        .arm(Duration::from_secs(secs), move |generation| async move {
                            this.on_cooldown_elapsed(generation).await;
                        });
                }
                PowerAction::CancelCooldownRetry => {
                    state.cooldown_timer.cancel();
                }
                PowerAction::Connect
                | PowerAction::Disconnect
                | PowerAction::AwaitClosed
                | PowerAction::CutPower => deferred.push(action),
            }
        }

        deferred
    }

    async fn run_deferred(&self, actions: Vec<PowerAction>) {
        for action in actions {
            match action {
                PowerAction::Connect => {
                    info!("connecting to printer");
                    if let Err(err) = self.inner.printer.connect() {
                        warn!("printer connect failed: {err:#}");
                    }
                }
                PowerAction::Disconnect => {
                    if let Err(err) = self.inner.printer.disconnect() {
                        warn!("printer disconnect failed: {err:#}");
                    }
                }
                PowerAction::AwaitClosed => {
                    let printer = &self.inner.printer;
                    let closed = poll_until(
                        self.inner.polling.interval(),
                        self.inner.polling.disconnect_polls(),
                        move || async move {
                            if printer.is_closed_or_error() {
                                Readiness::Ready
                            } else {
                                Readiness::NotYet
                            }
                        },
                    )
                    .await;
                    if closed != Readiness::Ready {
                        warn!(
                            timeout_secs = self.inner.polling.disconnect_timeout_secs,
                            "printer link did not close, cutting power anyway"
                        );
                    }
                }
                PowerAction::CutPower => {
                    let mut state = self.inner.state.lock().await;
                    let actions = state.engine.cut_power();
                    if actions.is_empty() {
                        debug!("power cut superseded");
                        continue;
                    }
                    info!("printer powered off");
                    let deferred = self.apply_locked(&mut state, actions);
                    debug_assert!(deferred.is_empty());
                }
                other => debug!(?other, "action does not touch the printer"),
            }
        }
    }

    async fn on_startup_elapsed(&self, generation: u64) {
        let (deferred, ready) = {
            let mut state = self.inner.state.lock().await;
            if !state.startup_timer.claim(generation) {
                return;
            }
            let actions = state.engine.startup_elapsed();
            let ready = std::mem::take(&mut state.pending_ready);
            (self.apply_locked(&mut state, actions), ready)
        };

        debug!("startup delay elapsed");
        self.run_deferred(deferred).await;
        for continuation in ready {
            tokio::spawn(continuation);
        }
    }

    async fn on_cooldown_elapsed(&self, generation: u64) {
        let temperatures = self.inner.printer.current_temperatures();
        let deferred = {
            let mut state = self.inner.state.lock().await;
            if !state.cooldown_timer.claim(generation) {
                return;
            }
            let actions = state.engine.cooldown_elapsed(&temperatures);
            log_shutdown_gate(&state.engine, &temperatures);
            self.apply_locked(&mut state, actions)
        };
        self.run_deferred(deferred).await;
    }
}

fn log_shutdown_gate(engine: &PowerEngine, temperatures: &TemperatureSnapshot) {
    if engine.is_cooling_down() {
        let (tool, celsius) = hottest_tool(temperatures).unwrap_or(("unknown", f64::NAN));
        info!(
            tool,
            celsius,
            threshold = engine.cooldown_threshold_c(),
            "waiting for nozzle to cool before power off"
        );
    } else {
        info!("nozzle cool, shutting printer down");
    }
}
