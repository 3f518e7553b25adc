use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};

use autoprint_common::TemperatureSnapshot;

/// The printer firmware link as exposed by the host application.
pub trait PrinterInterface: Send + Sync {
    fn connect(&self) -> anyhow::Result<()>;
    fn disconnect(&self) -> anyhow::Result<()>;
    fn is_operational(&self) -> bool;
    fn is_closed_or_error(&self) -> bool;
    fn select_file(&self, path: &str, print_after_select: bool, local: bool) -> anyhow::Result<()>;
    fn current_temperatures(&self) -> TemperatureSnapshot;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileAnalysis {
    #[serde(rename = "estimatedPrintTime", default)]
    pub estimated_print_time: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadataRecord {
    #[serde(default)]
    pub analysis: Option<FileAnalysis>,
}

impl FileMetadataRecord {
    /// Whole seconds, rounded up. Negative or non-finite estimates are unknown.
    pub fn estimated_print_secs(&self) -> Option<u64> {
        let estimate = self.analysis.as_ref()?.estimated_print_time?;
        if !estimate.is_finite() || estimate < 0.0 {
            return None;
        }
        Some(estimate.ceil() as u64)
    }
}

pub trait FileMetadata: Send + Sync {
    fn get_metadata(&self, location: &str, path: &str) -> Option<FileMetadataRecord>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrintOutcome {
    Finished,
    Failed,
}

impl PrintOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintEvent {
    pub outcome: PrintOutcome,
    pub path: String,
}

impl PrintEvent {
    pub fn finished(path: impl Into<String>) -> Self {
        Self {
            outcome: PrintOutcome::Finished,
            path: path.into(),
        }
    }

    pub fn failed(path: impl Into<String>) -> Self {
        Self {
            outcome: PrintOutcome::Failed,
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotYet,
    Abandoned,
}

/// Re-checks `check` every `interval`, at most `max_polls` times. Returns
/// `NotYet` when the budget runs out.
pub async fn poll_until<F, Fut>(interval: Duration, max_polls: u32, mut check: F) -> Readiness
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Readiness>,
{
    for _ in 0..max_polls {
        match check().await {
            Readiness::NotYet => tokio::time::sleep(interval).await,
            settled => return settled,
        }
    }
    check().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    #[test]
    fn estimate_rounds_up_and_rejects_garbage() {
        let record: FileMetadataRecord =
            serde_json::from_str(r#"{"analysis":{"estimatedPrintTime":3599.2}}"#).unwrap();
        assert_eq!(record.estimated_print_secs(), Some(3_600));

        let record: FileMetadataRecord = serde_json::from_str(r#"{"analysis":{}}"#).unwrap();
        assert_eq!(record.estimated_print_secs(), None);

        let record = FileMetadataRecord {
            analysis: Some(FileAnalysis {
                estimated_print_time: Some(-4.0),
            }),
        };
        assert_eq!(record.estimated_print_secs(), None);
        assert_eq!(FileMetadataRecord::default().estimated_print_secs(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_stops_when_ready() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let readiness = poll_until(Duration::from_millis(100), 10, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n >= 3 {
                    Readiness::Ready
                } else {
                    Readiness::NotYet
                }
            }
        })
        .await;

        assert_eq!(readiness, Readiness::Ready);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_gives_up_after_budget() {
        let started = tokio::time::Instant::now();
        let readiness =
            poll_until(Duration::from_secs(1), 5, || async { Readiness::NotYet }).await;

        assert_eq!(readiness, Readiness::NotYet);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn poll_reports_abandon() {
        let readiness =
            poll_until(Duration::from_secs(1), 5, || async { Readiness::Abandoned }).await;
        assert_eq!(readiness, Readiness::Abandoned);
    }
}
