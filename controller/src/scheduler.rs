use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use autoprint_common::{
    ControllerStatus, JobRequest, JobSlot, JobSpec, JobView, Placement, PollConfig,
    ScheduleTooEarly, SchedulerPhase,
};

use crate::{
    power::PowerController,
    printer::{poll_until, FileMetadata, PrintEvent, PrintOutcome, PrinterInterface, Readiness},
    timer::DelayedTask,
};

/// Metadata location of files uploaded to the host.
const LOCAL_FILES: &str = "local";

/// Resolves the duration estimate for `request.file` and places the job.
pub fn build_job(
    request: JobRequest,
    metadata: &dyn FileMetadata,
    now: DateTime<Utc>,
) -> Result<JobSpec, ScheduleTooEarly> {
    let estimate = metadata
        .get_metadata(LOCAL_FILES, &request.file)
        .and_then(|record| record.estimated_print_secs());
    let file = request.file.clone();

    let job = JobSpec::create(request, estimate, now)
        .inspect_err(|err| warn!(file = %file, "job rejected: {err}"))?;

    if job.placement() == Placement::FinishBy {
        info!(
            file = %file,
            estimate_secs = ?estimate,
            target = %job.target_time(),
            start = %job.start_time(),
            "start pulled forward to finish on time"
        );
    }
    Ok(job)
}

struct SchedulerState {
    slot: JobSlot,
    start_timer: DelayedTask,
}

struct Inner {
    state: Mutex<SchedulerState>,
    power: PowerController,
    printer: Arc<dyn PrinterInterface>,
    polling: PollConfig,
}

/// Holds at most one print job and starts it at its start time: power up,
/// wait for the printer link, select the file. Calls into the power
/// controller are never made while the scheduler lock is held.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    pub fn new(
        power: PowerController,
        printer: Arc<dyn PrinterInterface>,
        polling: PollConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState {
                    slot: JobSlot::new(),
                    start_timer: DelayedTask::new("job-start"),
                }),
                power,
                printer,
                polling,
            }),
        }
    }

    /// Replaces whatever job was held and arms its start timer.
    pub async fn schedule_job(&self, job: JobSpec) {
        let delay = job.time_until_start(Utc::now());
        let file = job.file_path().to_string();
        let placement = job.placement();
        let start = job.start_time();

        let mut state = self.inner.state.lock().await;
        let (epoch, replaced) = state.slot.arm(job);
        if let Some(replaced) = replaced {
            info!(file = replaced.file_path(), "replacing previously scheduled job");
        }

        let this = self.clone();
        state
            .start_timer
            .arm(delay, move |generation| async move {
                this.on_start_timer(generation, epoch).await;
            });

        info!(
            file = %file,
            placement = placement.as_str(),
            start = %start,
            delay_secs = delay.as_secs(),
            "job scheduled"
        );
    }

    /// Drops a job that has not started printing. A running print is left
    /// alone.
    pub async fn cancel_job(&self) -> bool {
        let mut state = self.inner.state.lock().await;
        match state.slot.cancel() {
            Some(job) => {
                state.start_timer.cancel();
                info!(file = job.file_path(), "job cancelled");
                true
            }
            None => {
                debug!(phase = state.slot.phase().as_str(), "no cancellable job");
                false
            }
        }
    }

    pub async fn toggle_turn_off_after(&self) -> Option<bool> {
        let mut state = self.inner.state.lock().await;
        let turn_off_after = state.slot.toggle_turn_off_after()?;
        info!(turn_off_after, "turn off after print toggled");
        Some(turn_off_after)
    }

    pub async fn phase(&self) -> SchedulerPhase {
        self.inner.state.lock().await.slot.phase()
    }

    pub async fn job_view(&self) -> Option<JobView> {
        self.inner.state.lock().await.slot.view()
    }

    pub async fn status(&self) -> ControllerStatus {
        let job = self.job_view().await;
        let power = self.inner.power.snapshot().await;
        ControllerStatus::new(power, self.inner.printer.is_operational(), job)
    }

    /// Handles a print finished or failed notification. Only the end of the
    /// scheduled print counts.
    pub async fn process_print_job_end(&self, event: &PrintEvent) {
        let finished = self.inner.state.lock().await.slot.finish(&event.path);
        let Some(job) = finished else {
            debug!(
                file = %event.path,
                outcome = event.outcome.as_str(),
                "print end does not belong to a scheduled job"
            );
            return;
        };

        match event.outcome {
            PrintOutcome::Finished => info!(file = job.file_path(), "scheduled print finished"),
            PrintOutcome::Failed => warn!(file = job.file_path(), "scheduled print failed"),
        }

        if job.turn_off_after() {
            info!("turning printer off after print");
            self.inner.power.shut_down().await;
        }
    }

    async fn on_start_timer(&self, generation: u64, epoch: u64) {
        let job = {
            let mut state = self.inner.state.lock().await;
            if !state.start_timer.claim(generation) {
                return;
            }
            match state.slot.begin_start(epoch) {
                Some(job) => job,
                None => return,
            }
        };
        info!(file = job.file_path(), "start time reached");

        if self.inner.printer.is_operational() {
            self.inner.power.cancel_shut_down().await;
            self.select_and_print(epoch).await;
            return;
        }

        let this = self.clone();
        self.inner
            .power
            .start_up(
                async move { this.await_operational_then_print(epoch).await },
                job.start_with_lights(),
            )
            .await;
    }

    async fn await_operational_then_print(&self, epoch: u64) {
        let scheduler = self;
        let readiness = poll_until(
            self.inner.polling.interval(),
            self.inner.polling.operational_polls(),
            move || async move {
                if !scheduler.inner.state.lock().await.slot.is_starting(epoch) {
                    Readiness::Abandoned
                } else if scheduler.inner.printer.is_operational() {
                    Readiness::Ready
                } else {
                    Readiness::NotYet
                }
            },
        )
        .await;

        match readiness {
            Readiness::Ready => {
                self.inner.power.confirm_connected().await;
                self.select_and_print(epoch).await;
            }
            Readiness::Abandoned => debug!("job went away while waiting for the printer"),
            Readiness::NotYet => {
                error!(
                    timeout_secs = self.inner.polling.operational_timeout_secs,
                    "printer never became operational, dropping job"
                );
                self.inner.state.lock().await.slot.abandon_start(epoch);
            }
        }
    }

    async fn select_and_print(&self, epoch: u64) {
        let mut state = self.inner.state.lock().await;
        if !state.slot.is_starting(epoch) {
            debug!("job changed before file selection");
            return;
        }
        let Some(file) = state.slot.job().map(|job| job.file_path().to_string()) else {
            return;
        };

        match self.inner.printer.select_file(&file, true, true) {
            Ok(()) => {
                state.slot.start_printing(epoch);
                info!(file = %file, "print started");
            }
            Err(err) => {
                error!(file = %file, "file selection failed: {err:#}");
                state.slot.abandon_start(epoch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        relay::SimulatedGpio,
        sim::{Selection, SimConfig, SimulatedPrinter},
    };
    use autoprint_common::{AutoprintSettings, RelayState};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;

    struct Harness {
        scheduler: JobScheduler,
        power: PowerController,
        printer: Arc<SimulatedPrinter>,
    }

    async fn harness_with(
        config: SimConfig,
        polling: PollConfig,
        events: Option<UnboundedSender<PrintEvent>>,
    ) -> Harness {
        let mut printer = SimulatedPrinter::new(config);
        if let Some(events) = events {
            printer = printer.with_events(events);
        }
        let printer = Arc::new(printer);
        let gpio = Arc::new(SimulatedGpio::new());
        let power = PowerController::new(printer.clone(), gpio, polling.clone());
        power.apply_settings(&AutoprintSettings::default()).await;
        let scheduler = JobScheduler::new(power.clone(), printer.clone(), polling);
        Harness {
            scheduler,
            power,
            printer,
        }
    }

    async fn harness() -> Harness {
        harness_with(SimConfig::default(), PollConfig::default(), None).await
    }

    fn job_in(file: &str, secs: i64, turn_off_after: bool) -> JobSpec {
        let now = Utc::now();
        JobSpec::create(
            JobRequest {
                file: file.to_string(),
                placement: Placement::AtTime,
                target_time: now + chrono::Duration::seconds(secs),
                turn_off_after,
                start_with_lights: true,
            },
            None,
            now,
        )
        .unwrap()
    }

    fn asap(file: &str) -> JobSpec {
        let now = Utc::now();
        JobSpec::create(
            JobRequest {
                file: file.to_string(),
                placement: Placement::Asap,
                target_time: now,
                turn_off_after: false,
                start_with_lights: false,
            },
            None,
            now,
        )
        .unwrap()
    }

    fn sleep(secs: u64) -> tokio::time::Sleep {
        tokio::time::sleep(Duration::from_secs(secs))
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_job_powers_on_prints_and_powers_off() {
        let h = harness().await;
        h.scheduler.schedule_job(job_in("benchy.gcode", 10, true)).await;
        assert_eq!(h.scheduler.phase().await, SchedulerPhase::Armed);

        sleep(11).await;
        let status = h.scheduler.status().await;
        assert!(status.printer);
        assert!(status.light);
        assert!(!status.connected);
        assert_eq!(h.scheduler.phase().await, SchedulerPhase::Starting);

        sleep(10).await;
        assert_eq!(h.scheduler.phase().await, SchedulerPhase::Printing);
        assert_eq!(
            h.printer.selections(),
            vec![Selection {
                path: "benchy.gcode".to_string(),
                print_after_select: true,
                local: true,
            }]
        );
        assert!(h.scheduler.status().await.connected);

        h.printer.set_tool_temperature("tool0", Some(35.0));
        h.scheduler
            .process_print_job_end(&PrintEvent::finished("benchy.gcode"))
            .await;

        let status = h.scheduler.status().await;
        assert!(!status.printer);
        assert!(!status.light);
        assert!(!status.cooldown);
        assert!(status.job.is_none());
        assert_eq!(h.scheduler.phase().await, SchedulerPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_event_waits_for_nozzle_before_power_off() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let h = harness_with(
            SimConfig {
                print_time: Some(Duration::from_secs(30)),
                ..SimConfig::default()
            },
            PollConfig::default(),
            Some(tx),
        )
        .await;
        let forward = h.scheduler.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                forward.process_print_job_end(&event).await;
            }
        });

        h.scheduler.schedule_job(job_in("vase.gcode", 10, true)).await;

        sleep(56).await;
        assert_eq!(h.scheduler.phase().await, SchedulerPhase::Idle);
        assert!(h.power.is_cooling_down().await);
        assert_eq!(h.power.snapshot().await.printer, RelayState::On);

        sleep(60).await;
        let status = h.scheduler.status().await;
        assert!(!status.cooldown);
        assert!(!status.printer);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_fire_never_starts() {
        let h = harness().await;
        h.scheduler.schedule_job(job_in("a.gcode", 10, false)).await;

        assert!(h.scheduler.cancel_job().await);
        assert!(!h.scheduler.cancel_job().await);
        assert_eq!(h.scheduler.phase().await, SchedulerPhase::Idle);

        sleep(30).await;
        assert!(h.printer.selections().is_empty());
        assert_eq!(h.printer.connect_count(), 0);
        assert_eq!(h.power.snapshot().await.printer, RelayState::Off);

        h.scheduler.schedule_job(job_in("b.gcode", 5, false)).await;
        sleep(20).await;
        assert_eq!(h.scheduler.phase().await, SchedulerPhase::Printing);
        assert_eq!(h.printer.selections().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_pending_job() {
        let h = harness().await;
        h.scheduler.schedule_job(job_in("a.gcode", 10, false)).await;
        h.scheduler.schedule_job(job_in("b.gcode", 20, false)).await;

        sleep(15).await;
        assert_eq!(h.scheduler.phase().await, SchedulerPhase::Armed);
        assert_eq!(h.scheduler.job_view().await.unwrap().file, "b.gcode");

        sleep(20).await;
        let selected: Vec<String> = h
            .printer
            .selections()
            .into_iter()
            .map(|selection| selection.path)
            .collect();
        assert_eq!(selected, vec!["b.gcode".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn operational_printer_skips_power_up_and_cancels_cooldown() {
        let h = harness().await;
        h.power.start_up(async {}, true).await;
        sleep(10).await;
        assert!(h.printer.is_operational());
        h.printer.set_tool_temperature("tool0", Some(190.0));
        h.power.shut_down().await;
        assert!(h.power.is_cooling_down().await);

        h.scheduler.schedule_job(job_in("a.gcode", 3, false)).await;
        sleep(4).await;

        assert_eq!(h.scheduler.phase().await, SchedulerPhase::Printing);
        assert!(!h.power.is_cooling_down().await);
        assert_eq!(h.printer.connect_count(), 1);

        sleep(30).await;
        assert_eq!(h.power.snapshot().await.printer, RelayState::On);
    }

    #[tokio::test(start_paused = true)]
    async fn job_started_during_power_cut_wait_keeps_power() {
        let h = harness_with(
            SimConfig::default(),
            PollConfig {
                interval_ms: 500,
                operational_timeout_secs: 300,
                disconnect_timeout_secs: 20,
            },
            None,
        )
        .await;
        h.power.start_up(async {}, true).await;
        sleep(10).await;
        h.power.confirm_connected().await;
        h.printer.set_stuck_open(true);

        let power = h.power.clone();
        let shutdown = tokio::spawn(async move { power.shut_down().await });
        sleep(1).await;
        assert_eq!(h.power.snapshot().await.printer, RelayState::On);

        h.scheduler.schedule_job(asap("b.gcode")).await;
        sleep(1).await;
        assert_eq!(h.scheduler.phase().await, SchedulerPhase::Printing);

        shutdown.await.unwrap();
        sleep(30).await;

        let snapshot = h.power.snapshot().await;
        assert_eq!(snapshot.printer, RelayState::On);
        assert_eq!(snapshot.light, RelayState::On);
        assert_eq!(h.scheduler.phase().await, SchedulerPhase::Printing);
        assert_eq!(
            h.printer.current_temperatures()["tool0"].actual,
            Some(210.0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn end_event_for_other_file_changes_nothing() {
        let h = harness().await;
        h.scheduler.schedule_job(asap("a.gcode")).await;
        sleep(15).await;
        assert_eq!(h.scheduler.phase().await, SchedulerPhase::Printing);
        let before = h.scheduler.status().await;

        h.scheduler
            .process_print_job_end(&PrintEvent::finished("b.gcode"))
            .await;

        assert_eq!(h.scheduler.phase().await, SchedulerPhase::Printing);
        assert_eq!(h.scheduler.status().await, before);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_print_without_turn_off_keeps_power() {
        let h = harness().await;
        h.scheduler.schedule_job(asap("a.gcode")).await;
        sleep(15).await;

        h.scheduler
            .process_print_job_end(&PrintEvent::failed("a.gcode"))
            .await;

        assert_eq!(h.scheduler.phase().await, SchedulerPhase::Idle);
        assert_eq!(h.power.snapshot().await.printer, RelayState::On);
        assert_eq!(h.printer.disconnect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_starting_skips_file_selection() {
        let h = harness().await;
        h.scheduler.schedule_job(asap("a.gcode")).await;
        sleep(1).await;
        assert_eq!(h.scheduler.phase().await, SchedulerPhase::Starting);

        assert!(h.scheduler.cancel_job().await);
        sleep(30).await;

        assert_eq!(h.scheduler.phase().await, SchedulerPhase::Idle);
        assert!(h.printer.selections().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_timeout_drops_job() {
        let h = harness_with(
            SimConfig {
                link_up_delay: Duration::from_secs(3_600),
                ..SimConfig::default()
            },
            PollConfig {
                interval_ms: 500,
                operational_timeout_secs: 3,
                disconnect_timeout_secs: 60,
            },
            None,
        )
        .await;

        h.scheduler.schedule_job(asap("a.gcode")).await;
        sleep(20).await;

        assert_eq!(h.scheduler.phase().await, SchedulerPhase::Idle);
        assert!(h.printer.selections().is_empty());
        assert!(h.scheduler.job_view().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn turn_off_after_toggles_while_armed() {
        let h = harness().await;
        assert_eq!(h.scheduler.toggle_turn_off_after().await, None);

        h.scheduler.schedule_job(job_in("a.gcode", 60, false)).await;
        assert_eq!(h.scheduler.toggle_turn_off_after().await, Some(true));

        let view = h.scheduler.status().await.job.unwrap();
        assert!(view.turn_off_after_print);
        assert_eq!(view.state, "ARMED");
    }

    #[test]
    fn build_job_uses_file_estimate() {
        let printer = SimulatedPrinter::new(SimConfig::default());
        printer.set_estimate("cube.gcode", 90.0);
        let now = Utc::now();
        let target = now + chrono::Duration::hours(1);

        let job = build_job(
            JobRequest {
                file: "cube.gcode".to_string(),
                placement: Placement::FinishBy,
                target_time: target,
                turn_off_after: true,
                start_with_lights: true,
            },
            &printer,
            now,
        )
        .unwrap();

        assert_eq!(job.start_time(), target - chrono::Duration::seconds(120));
        assert_eq!(job.estimated_duration_secs(), Some(90));
    }

    #[test]
    fn build_job_rejects_past_start() {
        let printer = SimulatedPrinter::new(SimConfig::default());
        printer.set_estimate("cube.gcode", 3.0 * 3_600.0);
        let now = Utc::now();

        let err = build_job(
            JobRequest {
                file: "cube.gcode".to_string(),
                placement: Placement::FinishBy,
                target_time: now + chrono::Duration::minutes(60),
                turn_off_after: false,
                start_with_lights: true,
            },
            &printer,
            now,
        )
        .unwrap_err();

        assert_eq!(err.deficit_seconds(), 2 * 3_600);
        assert_eq!(err.to_string(), "print job would have had to start 2 hours ago");
    }
}
