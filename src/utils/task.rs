use std::future::Future;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::debug;

/// Owner of a periodic background task. Dropping it leaves the task
/// running; call `dispose` to stop it.
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TaskHandle {
    /// Stops the loop and waits for it to exit.
    pub async fn dispose(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
        debug!(task = self.name, "background task stopped");
    }
}

pub(crate) fn next_delay(interval: Duration, max_jitter: Duration) -> Duration {
    if max_jitter.is_zero() {
        return interval;
    }
    let jitter_ms = {
        use rand::Rng;
        rand::thread_rng().gen_range(0..=max_jitter.as_millis() as u64)
    };
    interval + Duration::from_millis(jitter_ms)
}

/// Runs `tick` every `interval` (+ up to `max_jitter`) until disposed.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    max_jitter: Duration,
    mut tick: F,
) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, mut rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        loop {
            let delay = next_delay(interval, max_jitter);
            tokio::select! {
                _ = &mut rx => break,
                _ = sleep(delay) => tick().await,
            }
        }
    });
    TaskHandle {
        name,
        shutdown: Some(tx),
        task,
    }
}
