use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;
use tracing::debug;

struct ArmedTask {
    generation: u64,
    handle: JoinHandle<()>,
}

/// A cancellable one-shot delayed task. The owner keeps it behind its own
/// lock; the fired body must `claim` its generation under that lock before
/// doing anything, which makes cancel-before-fire race free.
pub struct DelayedTask {
    label: &'static str,
    generation: u64,
    armed: Option<ArmedTask>,
}

impl DelayedTask {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            generation: 0,
            armed: None,
        }
    }

    /// Replaces any armed task. `body` receives the generation it has to claim.
    pub fn arm<F, Fut>(&mut self, delay: Duration, body: F) -> u64
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let fired = body(generation);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fired.await;
        });
        self.armed = Some(ArmedTask { generation, handle });

        debug!(
            timer = self.label,
            generation,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "timer armed"
        );
        generation
    }

    pub fn cancel(&mut self) -> bool {
        match self.armed.take() {
            Some(armed) => {
                armed.handle.abort();
                debug!(timer = self.label, generation = armed.generation, "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Marks the armed task as fired. Returns false for a stale or cancelled
    /// generation; a claimed task can no longer be aborted.
    pub fn claim(&mut self, generation: u64) -> bool {
        match &self.armed {
            Some(armed) if armed.generation == generation => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
