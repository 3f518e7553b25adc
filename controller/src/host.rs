use std::{io::ErrorKind, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{info, warn};

use autoprint_common::{ControllerStatus, JobRequest, Placement, RuntimeConfig};

use crate::{
    power::PowerController,
    printer::PrintEvent,
    relay::SimulatedGpio,
    scheduler::{build_job, JobScheduler},
    sim::{SimConfig, SimulatedPrinter},
};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
}

/// A job requested on the command line environment, plus the estimate the
/// simulated printer should report for its file.
#[derive(Debug, Clone, PartialEq)]
struct EnvJob {
    request: JobRequest,
    estimate_secs: Option<f64>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let printer = Arc::new(SimulatedPrinter::new(SimConfig::default()).with_events(events_tx));
    let gpio = Arc::new(SimulatedGpio::new());

    let power = PowerController::new(printer.clone(), gpio, runtime.polling.clone());
    power.apply_settings(&runtime.settings).await;
    let scheduler = JobScheduler::new(power.clone(), printer.clone(), runtime.polling.clone());

    spawn_event_loop(scheduler.clone(), events_rx);
    spawn_status_log_loop(scheduler.clone());

    let turn_off_default = runtime.settings.defaults.turn_off_after_print;
    match job_from_env(|key| std::env::var(key).ok(), turn_off_default, Utc::now()) {
        Ok(Some(job)) => {
            if let Some(secs) = job.estimate_secs {
                printer.set_estimate(&job.request.file, secs);
            }
            match build_job(job.request, printer.as_ref(), Utc::now()) {
                Ok(job) => scheduler.schedule_job(job).await,
                Err(err) => warn!("not scheduling job: {err}"),
            }
        }
        Ok(None) => info!("no job requested, set AUTOPRINT_FILE to schedule one"),
        Err(err) => warn!("ignoring job request: {err:#}"),
    }

    info!("autoprint controller running");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutting down controller");
    scheduler.cancel_job().await;
    power.cancel_shut_down().await;
    power.release_lines().await;
    Ok(())
}

fn spawn_event_loop(scheduler: JobScheduler, mut events: UnboundedReceiver<PrintEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            scheduler.process_print_job_end(&event).await;
        }
    });
}

fn spawn_status_log_loop(scheduler: JobScheduler) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_LOG_INTERVAL);
        loop {
            interval.tick().await;

            let status = scheduler.status().await;
            match status_line(&status) {
                Ok(line) => info!("{line}"),
                Err(err) => warn!("status serialization failed: {err}"),
            }
        }
    });
}

fn status_line(status: &ControllerStatus) -> serde_json::Result<String> {
    serde_json::to_string(status).map(|body| format!("status {body}"))
}

fn job_from_env(
    lookup: impl Fn(&str) -> Option<String>,
    turn_off_default: bool,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<EnvJob>> {
    let Some(file) = lookup("AUTOPRINT_FILE").filter(|file| !file.trim().is_empty()) else {
        return Ok(None);
    };

    let placement = match lookup("AUTOPRINT_PLACEMENT") {
        Some(raw) => parse_placement(&raw)?,
        None => Placement::Asap,
    };

    let target_time = match lookup("AUTOPRINT_TIME") {
        Some(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .with_context(|| format!("AUTOPRINT_TIME {raw:?} is not an RFC 3339 timestamp"))?
            .with_timezone(&Utc),
        None if placement == Placement::Asap => now,
        None => return Err(anyhow!("AUTOPRINT_TIME is required for {}", placement.as_str())),
    };

    let estimate_secs = lookup("AUTOPRINT_ESTIMATE_SECS")
        .map(|raw| {
            raw.trim()
                .parse::<f64>()
                .with_context(|| format!("AUTOPRINT_ESTIMATE_SECS {raw:?} is not a number"))
        })
        .transpose()?;

    Ok(Some(EnvJob {
        request: JobRequest {
            file,
            placement,
            target_time,
            turn_off_after: parse_flag(&lookup, "AUTOPRINT_TURN_OFF", turn_off_default)?,
            start_with_lights: parse_flag(&lookup, "AUTOPRINT_LIGHTS", true)?,
        },
        estimate_secs,
    }))
}

fn parse_placement(raw: &str) -> anyhow::Result<Placement> {
    let raw = raw.trim().to_ascii_lowercase();
    [Placement::AtTime, Placement::FinishBy, Placement::Asap]
        .into_iter()
        .find(|placement| placement.as_str() == raw)
        .ok_or_else(|| anyhow!("AUTOPRINT_PLACEMENT must be start, finish or asap, got {raw:?}"))
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> anyhow::Result<bool> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<bool>()
            .with_context(|| format!("{key} must be true or false, got {raw:?}")),
        None => Ok(default),
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("AUTOPRINT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.autoprint"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("invalid {}", self.runtime_path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
    }

    #[test]
    fn status_line_is_the_serialized_status() {
        let status = ControllerStatus {
            printer: true,
            light: false,
            cooldown: false,
            connected: true,
            job: None,
        };

        assert_eq!(
            status_line(&status).unwrap(),
            r#"status {"printer":true,"light":false,"cooldown":false,"connected":true,"job":null}"#
        );
    }

    #[test]
    fn no_file_means_no_job() {
        assert_eq!(job_from_env(env(&[]), false, now()).unwrap(), None);
        assert_eq!(
            job_from_env(env(&[("AUTOPRINT_FILE", " ")]), false, now()).unwrap(),
            None
        );
    }

    #[test]
    fn file_alone_prints_asap_with_defaults() {
        let job = job_from_env(env(&[("AUTOPRINT_FILE", "cube.gcode")]), true, now())
            .unwrap()
            .unwrap();

        assert_eq!(job.request.placement, Placement::Asap);
        assert_eq!(job.request.target_time, now());
        assert!(job.request.turn_off_after);
        assert!(job.request.start_with_lights);
        assert_eq!(job.estimate_secs, None);
    }

    #[test]
    fn finish_by_job_reads_time_and_flags() {
        let job = job_from_env(
            env(&[
                ("AUTOPRINT_FILE", "vase.gcode"),
                ("AUTOPRINT_PLACEMENT", "Finish"),
                ("AUTOPRINT_TIME", "2026-03-14T18:30:00+01:00"),
                ("AUTOPRINT_TURN_OFF", "false"),
                ("AUTOPRINT_LIGHTS", "false"),
                ("AUTOPRINT_ESTIMATE_SECS", "5400"),
            ]),
            true,
            now(),
        )
        .unwrap()
        .unwrap();

        assert_eq!(job.request.placement, Placement::FinishBy);
        assert_eq!(
            job.request.target_time,
            Utc.with_ymd_and_hms(2026, 3, 14, 17, 30, 0).unwrap()
        );
        assert!(!job.request.turn_off_after);
        assert!(!job.request.start_with_lights);
        assert_eq!(job.estimate_secs, Some(5_400.0));
    }

    #[test]
    fn timed_job_without_time_is_rejected() {
        let err = job_from_env(
            env(&[("AUTOPRINT_FILE", "a.gcode"), ("AUTOPRINT_PLACEMENT", "start")]),
            false,
            now(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "AUTOPRINT_TIME is required for start");
    }

    #[test]
    fn malformed_values_are_rejected() {
        for pairs in [
            vec![("AUTOPRINT_FILE", "a.gcode"), ("AUTOPRINT_PLACEMENT", "later")],
            vec![("AUTOPRINT_FILE", "a.gcode"), ("AUTOPRINT_TIME", "tomorrow")],
            vec![("AUTOPRINT_FILE", "a.gcode"), ("AUTOPRINT_LIGHTS", "yes")],
        ] {
            assert!(job_from_env(env(&pairs), false, now()).is_err());
        }
    }
}
