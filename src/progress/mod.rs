//! Server-to-client job progress.
//!
//! Each job has a one-way event stream that ends with exactly one terminal
//! event (`Completed` or `Failed`). Subscribers that arrive after the end
//! get the terminal event straight away; subscribers that arrive mid-job get
//! the latest event first, then live updates.

use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace};

const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        job_id: String,
    },
    Progress {
        stage: String,
        percent: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Completed {
        output: String,
    },
    Failed {
        error: String,
    },
}

impl ProgressEvent {
    pub fn progress(stage: &str, percent: u8, message: Option<String>) -> Self {
        ProgressEvent::Progress {
            stage: stage.to_string(),
            percent: percent.min(100),
            message,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Completed { .. } | ProgressEvent::Failed { .. }
        )
    }

    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::Started { .. } => "started",
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::Completed { .. } => "completed",
            ProgressEvent::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug)]
struct JobChannel {
    // None once the terminal event went out
    tx: Option<broadcast::Sender<ProgressEvent>>,
    last: Option<ProgressEvent>,
}

/// Progress channels keyed by job id.
#[derive(Debug, Clone, Default)]
pub struct ProgressHub {
    jobs: Arc<Mutex<HashMap<String, JobChannel>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JobChannel>> {
        match self.jobs.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn create(&self, job_id: &str) {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        self.lock().insert(
            job_id.to_string(),
            JobChannel {
                tx: Some(tx),
                last: None,
            },
        );
    }

    /// Publishes `event`; returns false for unknown or already finished jobs.
    pub fn publish(&self, job_id: &str, event: ProgressEvent) -> bool {
        let mut jobs = self.lock();
        let Some(channel) = jobs.get_mut(job_id) else {
            return false;
        };
        let Some(tx) = channel.tx.as_ref() else {
            trace!(job_id, "event after terminal dropped");
            return false;
        };
        let terminal = event.is_terminal();
        // no receivers is fine; `last` keeps the event for late subscribers
        let _ = tx.send(event.clone());
        channel.last = Some(event);
        if terminal {
            channel.tx = None;
            debug!(job_id, "progress stream closed");
        }
        true
    }

    /// Event stream for `job_id`, or None if the job is unknown.
    pub fn subscribe(&self, job_id: &str) -> Option<BoxStream<'static, ProgressEvent>> {
        let jobs = self.lock();
        let channel = jobs.get(job_id)?;
        let replay = channel.last.clone();
        match &channel.tx {
            None => Some(stream::iter(replay).boxed()),
            Some(tx) => {
                let live = BroadcastStream::new(tx.subscribe())
                    .filter_map(|res| async move { res.ok() });
                Some(stream::iter(replay).chain(live).boxed())
            }
        }
    }

    /// Drops the job's channel; open subscriber streams end.
    pub fn forget(&self, job_id: &str) {
        if self.lock().remove(job_id).is_some() {
            debug!(job_id, "progress channel dropped");
        }
    }
}

/// Client reconnection policy advertised with the stream.
///
/// Exponential back-off: `base * factor^attempt`, capped at `max_delay`,
/// giving up after `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect number `attempt` (0-based); None once exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let mult = self.factor.checked_pow(attempt).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(mult).min(self.max_delay))
    }

    /// Every reconnect delay in milliseconds, in order; sent to clients with
    /// the job so they can back off without hard-coding the schedule.
    pub fn schedule_ms(&self) -> Vec<u64> {
        (0..)
            .map_while(|attempt| self.delay(attempt))
            .map(|d| d.as_millis() as u64)
            .collect()
    }
}
