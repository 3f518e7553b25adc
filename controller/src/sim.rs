use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::bail;
use tokio::{sync::mpsc::UnboundedSender, time::Instant};
use tracing::{debug, info};

use autoprint_common::{ChannelTemperature, TemperatureSnapshot};

use crate::printer::{FileAnalysis, FileMetadata, FileMetadataRecord, PrintEvent, PrinterInterface};

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Time between a connect request and the link turning operational.
    pub link_up_delay: Duration,
    /// When set, a started print finishes on its own after this long.
    pub print_time: Option<Duration>,
    pub hot_end_c: f64,
    pub ambient_c: f64,
    pub cool_rate_c_per_sec: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            link_up_delay: Duration::from_secs(3),
            print_time: Some(Duration::from_secs(60)),
            hot_end_c: 210.0,
            ambient_c: 22.0,
            cool_rate_c_per_sec: 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub path: String,
    pub print_after_select: bool,
    pub local: bool,
}

#[derive(Debug, Clone, Copy)]
enum Link {
    Closed,
    Connecting { ready_at: Instant },
    Operational,
}

#[derive(Debug)]
struct SimState {
    link: Link,
    stuck_open: bool,
    printing: Option<String>,
    last_print_end: Option<Instant>,
    tool_override: BTreeMap<String, Option<f64>>,
    estimates: HashMap<String, f64>,
    selections: Vec<Selection>,
    connects: u32,
    disconnects: u32,
}

/// Stand-in for the host's printer connection and file metadata.
pub struct SimulatedPrinter {
    config: SimConfig,
    state: Arc<Mutex<SimState>>,
    events: Option<UnboundedSender<PrintEvent>>,
}

impl SimulatedPrinter {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(SimState {
                link: Link::Closed,
                stuck_open: false,
                printing: None,
                last_print_end: None,
                tool_override: BTreeMap::new(),
                estimates: HashMap::new(),
                selections: Vec::new(),
                connects: 0,
                disconnects: 0,
            })),
            events: None,
        }
    }

    pub fn with_events(mut self, events: UnboundedSender<PrintEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn set_operational(&self, operational: bool) {
        self.lock().link = if operational {
            Link::Operational
        } else {
            Link::Closed
        };
    }

    /// Keeps the link open after a disconnect request.
    pub fn set_stuck_open(&self, stuck: bool) {
        self.lock().stuck_open = stuck;
    }

    /// Pins a tool reading; `None` simulates a missing sensor value.
    pub fn set_tool_temperature(&self, tool: &str, actual: Option<f64>) {
        self.lock().tool_override.insert(tool.to_string(), actual);
    }

    pub fn set_estimate(&self, path: &str, seconds: f64) {
        self.lock().estimates.insert(path.to_string(), seconds);
    }

    pub fn selections(&self) -> Vec<Selection> {
        self.lock().selections.clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.lock().connects
    }

    pub fn disconnect_count(&self) -> u32 {
        self.lock().disconnects
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        lock_state(&self.state)
    }

    fn modelled_tool_temp(&self, state: &SimState, now: Instant) -> f64 {
        if state.printing.is_some() {
            return self.config.hot_end_c;
        }
        match state.last_print_end {
            Some(ended) => {
                let cooled = self.config.cool_rate_c_per_sec * now.duration_since(ended).as_secs_f64();
                (self.config.hot_end_c - cooled).max(self.config.ambient_c)
            }
            None => self.config.ambient_c,
        }
    }

    fn spawn_print_completion(&self, path: String) {
        let (Some(events), Some(print_time)) = (self.events.clone(), self.config.print_time) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let state = Arc::clone(&self.state);
        runtime.spawn(async move {
            tokio::time::sleep(print_time).await;
            {
                let mut state = lock_state(&state);
                if state.printing.as_deref() != Some(path.as_str()) {
                    return;
                }
                state.printing = None;
                state.last_print_end = Some(Instant::now());
            }
            info!(file = %path, "simulated print done");
            if let Err(err) = events.send(PrintEvent::finished(path)) {
                debug!(file = %err.0.path, "print event dropped, receiver closed");
            }
        });
    }
}

fn lock_state(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PrinterInterface for SimulatedPrinter {
    fn connect(&self) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.connects += 1;
        if matches!(state.link, Link::Closed) {
            state.link = Link::Connecting {
                ready_at: Instant::now() + self.config.link_up_delay,
            };
        }
        Ok(())
    }

    fn disconnect(&self) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.disconnects += 1;
        if !state.stuck_open {
            state.link = Link::Closed;
            state.printing = None;
        }
        Ok(())
    }

    fn is_operational(&self) -> bool {
        let mut state = self.lock();
        match state.link {
            Link::Operational => true,
            Link::Connecting { ready_at } if Instant::now() >= ready_at => {
                state.link = Link::Operational;
                true
            }
            _ => false,
        }
    }

    fn is_closed_or_error(&self) -> bool {
        matches!(self.lock().link, Link::Closed)
    }

    fn select_file(&self, path: &str, print_after_select: bool, local: bool) -> anyhow::Result<()> {
        {
            let mut state = self.lock();
            if !matches!(state.link, Link::Operational) {
                bail!("cannot select {path}: printer is not operational");
            }
            state.selections.push(Selection {
                path: path.to_string(),
                print_after_select,
                local,
            });
            if !print_after_select {
                return Ok(());
            }
            state.printing = Some(path.to_string());
        }
        debug!(file = %path, "simulated print started");
        self.spawn_print_completion(path.to_string());
        Ok(())
    }

    fn current_temperatures(&self) -> TemperatureSnapshot {
        let state = self.lock();
        let mut snapshot = TemperatureSnapshot::new();
        snapshot.insert(
            "tool0".to_string(),
            ChannelTemperature {
                actual: Some(self.modelled_tool_temp(&state, Instant::now())),
                target: Some(if state.printing.is_some() { self.config.hot_end_c } else { 0.0 }),
            },
        );
        snapshot.insert(
            "bed".to_string(),
            ChannelTemperature {
                actual: Some(self.config.ambient_c),
                target: Some(0.0),
            },
        );
        for (tool, actual) in &state.tool_override {
            snapshot.insert(
                tool.clone(),
                ChannelTemperature {
                    actual: *actual,
                    target: None,
                },
            );
        }
        snapshot
    }
}

impl FileMetadata for SimulatedPrinter {
    fn get_metadata(&self, location: &str, path: &str) -> Option<FileMetadataRecord> {
        if location != "local" {
            return None;
        }
        let estimate = self.lock().estimates.get(path).copied();
        Some(FileMetadataRecord {
            analysis: Some(FileAnalysis {
                estimated_print_time: estimate,
            }),
        })
    }
}
