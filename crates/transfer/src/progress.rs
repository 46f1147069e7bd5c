use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use pcs_protocol::TransferProgress;

use crate::TransferTask;

/// Default progress notification interval.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Callback invoked with a progress snapshot.
pub type ProgressCallback = Box<dyn Fn(TransferProgress) + Send + Sync>;

/// Tracks running transfers and fans their snapshots out to callbacks.
pub struct ProgressTracker {
    inner: Arc<RwLock<TrackerInner>>,
    stop: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

struct TrackerInner {
    callbacks: Vec<ProgressCallback>,
    tasks: HashMap<String, Arc<TransferTask>>,
    interval: Duration,
}

impl TrackerInner {
    fn emit(&self, task: &TransferTask) {
        if self.callbacks.is_empty() {
            return;
        }
        let progress = task.progress();
        for cb in &self.callbacks {
            cb(progress.clone());
        }
    }
}

impl ProgressTracker {
    /// Creates a tracker. If `interval` is `None`, defaults to 500 ms.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TrackerInner {
                callbacks: Vec::new(),
                tasks: HashMap::new(),
                interval: interval.unwrap_or(DEFAULT_INTERVAL),
            })),
            stop: Mutex::new(None),
        }
    }

    pub fn on_progress(&self, callback: ProgressCallback) {
        self.inner.write().unwrap().callbacks.push(callback);
    }

    /// Begins tracking a task.
    pub fn track(&self, task: Arc<TransferTask>) {
        let id = task.id();
        self.inner.write().unwrap().tasks.insert(id, task);
    }

    /// Stops tracking a task after emitting its final snapshot.
    pub fn finish(&self, task_id: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(task) = inner.tasks.remove(task_id) {
            inner.emit(&task);
        }
    }

    pub fn get_task(&self, task_id: &str) -> Option<Arc<TransferTask>> {
        self.inner.read().unwrap().tasks.get(task_id).cloned()
    }

    /// Snapshots of every tracked task.
    pub fn snapshot(&self) -> Vec<TransferProgress> {
        let inner = self.inner.read().unwrap();
        inner.tasks.values().map(|t| t.progress()).collect()
    }

    /// Sends a one-time notification for a task.
    pub fn notify(&self, task_id: &str) {
        let inner = self.inner.read().unwrap();
        if let Some(task) = inner.tasks.get(task_id) {
            inner.emit(task);
        }
    }

    /// Starts periodic notifications for active tasks in a background task.
    ///
    /// Call [`stop`](Self::stop) to cancel.
    pub fn start(&self) {
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        {
            let mut stop = self.stop.lock().unwrap();
            // Replacing the sender stops any previous ticker.
            *stop = Some(tx);
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let interval = inner.read().unwrap().interval;
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let i = inner.read().unwrap();
                        for task in i.tasks.values().filter(|t| t.is_active()) {
                            i.emit(task);
                        }
                    }
                    _ = &mut rx => break,
                }
            }
        });
    }

    /// Stops the periodic notification task.
    pub fn stop(&self) {
        // Dropping the sender signals the task to exit.
        drop(self.stop.lock().unwrap().take());
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

/// Transfer speed over a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<(Instant, u64)>,
    max_samples: usize,
    window: Duration,
}

impl SpeedCalculator {
    /// `window` defaults to 5 s, `max_samples` to 100.
    pub fn new(window: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100),
                window: window.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    /// Records `bytes` transferred now.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.inner.lock().unwrap();
        let now = Instant::now();
        s.samples.push((now, bytes));

        let window = s.window;
        s.samples
            .retain(|(at, _)| now.saturating_duration_since(*at) <= window);
        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Average bytes/second within the window; 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap();
        let (Some(first), Some(last)) = (s.samples.first(), s.samples.last()) else {
            return 0.0;
        };
        let elapsed = last.0.duration_since(first.0);
        if s.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        let total: u64 = s.samples.iter().map(|(_, b)| b).sum();
        total as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to transfer `remaining` bytes; `None` if speed is zero.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        (speed > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / speed))
    }

    pub fn reset(&self) {
        self.inner.lock().unwrap().samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChunkPlan;
    use pcs_protocol::{TransferKind, TransferStatus};
    use std::path::Path;

    fn sample_task() -> Arc<TransferTask> {
        Arc::new(TransferTask::new(
            TransferKind::Upload,
            "/remote/file",
            Path::new("/local/file"),
            ChunkPlan::new(1024, 256),
        ))
    }

    #[test]
    fn tracker_track_and_finish() {
        let tracker = ProgressTracker::new(None);
        let task = sample_task();
        let id = task.id();
        tracker.track(Arc::clone(&task));
        assert!(tracker.get_task(&id).is_some());
        assert_eq!(tracker.snapshot().len(), 1);

        tracker.finish(&id);
        assert!(tracker.get_task(&id).is_none());
    }

    #[test]
    fn notify_and_finish_call_callbacks() {
        let tracker = ProgressTracker::new(None);
        let received = Arc::new(Mutex::new(Vec::<TransferStatus>::new()));
        let r = Arc::clone(&received);
        tracker.on_progress(Box::new(move |p| {
            r.lock().unwrap().push(p.status);
        }));

        let task = sample_task();
        let id = task.id();
        task.start();
        tracker.track(Arc::clone(&task));
        tracker.notify(&id);
        task.complete();
        tracker.finish(&id);
        tracker.notify("nonexistent");

        let statuses = received.lock().unwrap();
        assert_eq!(
            *statuses,
            vec![TransferStatus::Running, TransferStatus::Completed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_notifications_until_stopped() {
        let tracker = ProgressTracker::new(Some(Duration::from_millis(100)));
        let count = Arc::new(Mutex::new(0usize));
        let c = Arc::clone(&count);
        tracker.on_progress(Box::new(move |_| *c.lock().unwrap() += 1));

        let task = sample_task();
        task.start();
        tracker.track(task);
        tracker.start();

        tokio::time::sleep(Duration::from_millis(350)).await;
        tracker.stop();
        let seen = *count.lock().unwrap();
        assert!(seen >= 3, "saw {seen} notifications");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(*count.lock().unwrap() <= seen + 1);
    }

    #[test]
    fn speed_without_samples() {
        let calc = SpeedCalculator::new(None, None);
        assert_eq!(calc.bytes_per_second(), 0.0);
        assert!(calc.eta(1000).is_none());
        calc.add_sample(100);
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn speed_and_eta_from_samples() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        calc.add_sample(500);
        std::thread::sleep(Duration::from_millis(50));
        calc.add_sample(500);

        assert!(calc.bytes_per_second() > 0.0);
        assert!(calc.eta(10_000).is_some_and(|d| d.as_secs_f64() > 0.0));

        calc.reset();
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn speed_sample_cap() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(60)), Some(5));
        for i in 0..20 {
            calc.add_sample(i * 10);
        }
        assert!(calc.inner.lock().unwrap().samples.len() <= 5);
    }
}
