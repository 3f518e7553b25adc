use crate::{
    job::JobSpec,
    types::{JobView, SchedulerPhase},
};

/// Single-capacity job holder. The epoch changes whenever the held job is
/// replaced or dropped, so timer fires and start continuations that carry an
/// older epoch can tell they are stale.
#[derive(Debug, Clone, Default)]
pub struct JobSlot {
    job: Option<JobSpec>,
    phase: SchedulerPhase,
    epoch: u64,
}

impl JobSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub fn job(&self) -> Option<&JobSpec> {
        self.job.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn view(&self) -> Option<JobView> {
        self.job
            .as_ref()
            .map(|job| JobView::new(job, self.phase()))
    }

    /// Takes `job` and arms it, handing back whatever it displaced.
    pub fn arm(&mut self, job: JobSpec) -> (u64, Option<JobSpec>) {
        let replaced = self.clear();
        self.job = Some(job);
        self.phase = SchedulerPhase::Armed;
        (self.epoch, replaced)
    }

    /// Drops a job that has not started printing yet.
    pub fn cancel(&mut self) -> Option<JobSpec> {
        match self.phase() {
            SchedulerPhase::Armed | SchedulerPhase::Starting => self.clear(),
            SchedulerPhase::Idle | SchedulerPhase::Printing => None,
        }
    }

    pub fn begin_start(&mut self, epoch: u64) -> Option<JobSpec> {
        if epoch != self.epoch || self.phase() != SchedulerPhase::Armed {
            return None;
        }
        self.phase = SchedulerPhase::Starting;
        self.job.clone()
    }

    pub fn is_starting(&self, epoch: u64) -> bool {
        epoch == self.epoch && self.phase() == SchedulerPhase::Starting
    }

    pub fn start_printing(&mut self, epoch: u64) -> bool {
        if !self.is_starting(epoch) {
            return false;
        }
        self.phase = SchedulerPhase::Printing;
        true
    }

    pub fn abandon_start(&mut self, epoch: u64) -> Option<JobSpec> {
        if !self.is_starting(epoch) {
            return None;
        }
        self.clear()
    }

    /// Completes the printing job if `path` is the file it printed.
    pub fn finish(&mut self, path: &str) -> Option<JobSpec> {
        let matches = self.phase() == SchedulerPhase::Printing
            && self.job.as_ref().is_some_and(|job| job.file_path() == path);
        if !matches {
            return None;
        }
        self.clear()
    }

    /// Flips turn-off-after-print on a job that has not fired yet.
    pub fn toggle_turn_off_after(&mut self) -> Option<bool> {
        if self.phase() != SchedulerPhase::Armed {
            return None;
        }
        let job = self.job.as_mut()?;
        let turn_off_after = !job.turn_off_after();
        job.set_turn_off_after(turn_off_after);
        Some(turn_off_after)
    }

    fn clear(&mut self) -> Option<JobSpec> {
        self.epoch = self.epoch.wrapping_add(1);
        self.phase = SchedulerPhase::Idle;
        self.job.take()
    }
}
